//! Single-flight request scheduler.
//!
//! One actor task owns the [`QueueState`]. Callers talk to it through a
//! cloneable [`RequestScheduler`] handle; every command carries a oneshot
//! for the reply. The byte work of each job runs on the blocking pool and
//! reports back to the actor as a message, so a failing or panicking job
//! never unwinds into the actor.

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::executor::OperationExecutor;
use crate::request::{Job, JobId, QueuePolicy, SubmitOutcome};
use crate::state::{Admission, QueueState, SchedulerStatus};
use cryptfile_common::{Error, OperationKind, Progress, Result};
use cryptfile_container::ProgressReporter;

/// Capacity of the event broadcast channel.
const EVENT_CAPACITY: usize = 1024;

/// Details of a failed job, handed to failure listeners.
#[derive(Debug, Clone)]
pub struct FailureReport {
    pub id: JobId,
    pub kind: OperationKind,
    pub path: PathBuf,
    /// Stable error kind, e.g. `authentication_failed`.
    pub error_kind: &'static str,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Everything observable about the scheduler.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    Started {
        id: JobId,
        kind: OperationKind,
        path: PathBuf,
    },
    Progress {
        id: JobId,
        progress: Progress,
    },
    Completed {
        id: JobId,
        kind: OperationKind,
        path: PathBuf,
    },
    Failed(FailureReport),
    Paused,
    Resumed,
    /// Idle with nothing queued.
    Drained,
}

type FailureCallback = Arc<dyn Fn(&FailureReport) + Send + Sync>;
type ProgressCallback = Arc<dyn Fn(JobId, Progress) + Send + Sync>;

enum Command {
    Submit {
        job: Job,
        policy: QueuePolicy,
        reply: oneshot::Sender<SubmitOutcome>,
    },
    Pause(oneshot::Sender<()>),
    Resume(oneshot::Sender<()>),
    Status(oneshot::Sender<SchedulerStatus>),
    OnFailure(FailureCallback),
    OnProgress(ProgressCallback),
    Shutdown(oneshot::Sender<usize>),
}

enum WorkerMessage {
    Progress {
        id: JobId,
        progress: Progress,
    },
    Finished {
        id: JobId,
        kind: OperationKind,
        path: PathBuf,
        result: Result<()>,
    },
}

/// Handle to the scheduler actor.
#[derive(Clone)]
pub struct RequestScheduler {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<SchedulerEvent>,
}

impl RequestScheduler {
    /// Create a scheduler and the task that drives it.
    ///
    /// The returned [`SchedulerTask`] must be run (usually spawned) before
    /// any call on the handle can complete.
    pub fn new(executor: Arc<dyn OperationExecutor>) -> (Self, SchedulerTask) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let handle = Self {
            commands,
            events: events.clone(),
        };
        let task = SchedulerTask {
            executor,
            state: QueueState::new(),
            commands: command_rx,
            worker_tx,
            worker_rx,
            events,
            failure_callbacks: Vec::new(),
            progress_callbacks: Vec::new(),
            shutdown: None,
        };
        (handle, task)
    }

    /// Create a scheduler and spawn its task on the current runtime.
    pub fn spawn(executor: Arc<dyn OperationExecutor>) -> (Self, JoinHandle<()>) {
        let (handle, task) = Self::new(executor);
        (handle, tokio::spawn(task.run()))
    }

    /// Run `job` now if idle, otherwise queue or reject it per `policy`.
    ///
    /// Never waits for the job itself.
    pub async fn submit(&self, job: Job, policy: QueuePolicy) -> Result<SubmitOutcome> {
        self.request(|reply| Command::Submit { job, policy, reply })
            .await
    }

    /// Stop draining the queue. The running job is not interrupted.
    pub async fn pause(&self) -> Result<()> {
        self.request(Command::Pause).await
    }

    /// Resume draining; starts the next queued job if idle.
    pub async fn resume(&self) -> Result<()> {
        self.request(Command::Resume).await
    }

    pub async fn status(&self) -> Result<SchedulerStatus> {
        self.request(Command::Status).await
    }

    /// Receive every subsequent event.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    /// Call `callback` whenever a job fails.
    pub fn on_failure<F>(&self, callback: F) -> Result<()>
    where
        F: Fn(&FailureReport) + Send + Sync + 'static,
    {
        self.send(Command::OnFailure(Arc::new(callback)))
    }

    /// Call `callback` on every progress update of the running job.
    pub fn on_progress<F>(&self, callback: F) -> Result<()>
    where
        F: Fn(JobId, Progress) + Send + Sync + 'static,
    {
        self.send(Command::OnProgress(Arc::new(callback)))
    }

    /// Stop accepting work, wait for the running job and drop the queue.
    ///
    /// Returns the number of queued jobs that were discarded.
    pub async fn shutdown(&self) -> Result<usize> {
        self.request(Command::Shutdown).await
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::NotUsable("Scheduler is not running".to_string()))
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.send(command(reply))?;
        response
            .await
            .map_err(|_| Error::NotUsable("Scheduler stopped before replying".to_string()))
    }
}

/// The actor side of a [`RequestScheduler`].
pub struct SchedulerTask {
    executor: Arc<dyn OperationExecutor>,
    state: QueueState,
    commands: mpsc::UnboundedReceiver<Command>,
    worker_tx: mpsc::UnboundedSender<WorkerMessage>,
    worker_rx: mpsc::UnboundedReceiver<WorkerMessage>,
    events: broadcast::Sender<SchedulerEvent>,
    failure_callbacks: Vec<FailureCallback>,
    progress_callbacks: Vec<ProgressCallback>,
    /// Set once shutdown was requested; answered when the slot is free.
    shutdown: Option<oneshot::Sender<usize>>,
}

impl SchedulerTask {
    /// Process commands and worker messages until shutdown or until every
    /// handle is dropped.
    pub async fn run(mut self) {
        info!("Request scheduler started");

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("All scheduler handles dropped");
                        self.finish_shutdown_when_idle().await;
                        break;
                    }
                },
                Some(message) = self.worker_rx.recv() => self.handle_worker(message),
            }

            if self.shutdown.is_some() && self.state.is_idle() {
                let discarded = self.state.discard_queue();
                if let Some(reply) = self.shutdown.take() {
                    let _ = reply.send(discarded);
                }
                info!(discarded, "Request scheduler shutting down");
                break;
            }
        }
    }

    /// Wait for the running job before returning from `run`.
    async fn finish_shutdown_when_idle(&mut self) {
        while !self.state.is_idle() {
            match self.worker_rx.recv().await {
                Some(message) => self.handle_worker(message),
                None => break,
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Submit { job, policy, reply } => {
                let outcome = if self.shutdown.is_some() {
                    SubmitOutcome::Rejected(job)
                } else {
                    match self.state.admit(job, policy) {
                        Admission::Run(job) => {
                            let id = job.id();
                            self.launch(job);
                            SubmitOutcome::Started(id)
                        }
                        Admission::Queued { id, position } => {
                            debug!(job = %id, position, "Job queued");
                            SubmitOutcome::Queued { id, position }
                        }
                        Admission::Rejected(job) => {
                            debug!(job = %job.id(), "Job rejected, scheduler busy");
                            SubmitOutcome::Rejected(job)
                        }
                    }
                };
                let _ = reply.send(outcome);
            }
            Command::Pause(reply) => {
                if !self.state.is_paused() {
                    self.state.set_paused(true);
                    info!("Scheduler paused");
                    self.emit(SchedulerEvent::Paused);
                }
                let _ = reply.send(());
            }
            Command::Resume(reply) => {
                if self.state.is_paused() && self.shutdown.is_none() {
                    self.state.set_paused(false);
                    info!(queued = self.state.queued(), "Scheduler resumed");
                    self.emit(SchedulerEvent::Resumed);
                    self.pump();
                }
                let _ = reply.send(());
            }
            Command::Status(reply) => {
                let _ = reply.send(self.state.status());
            }
            Command::OnFailure(callback) => self.failure_callbacks.push(callback),
            Command::OnProgress(callback) => self.progress_callbacks.push(callback),
            Command::Shutdown(reply) => {
                self.state.set_paused(true);
                self.shutdown = Some(reply);
            }
        }
    }

    fn handle_worker(&mut self, message: WorkerMessage) {
        match message {
            WorkerMessage::Progress { id, progress } => {
                for callback in &self.progress_callbacks {
                    callback(id, progress);
                }
                self.emit(SchedulerEvent::Progress { id, progress });
            }
            WorkerMessage::Finished {
                id,
                kind,
                path,
                result,
            } => {
                match result {
                    Ok(()) => {
                        self.state.finish(true);
                        info!(job = %id, operation = %kind, path = %path.display(), "Operation completed");
                        self.emit(SchedulerEvent::Completed { id, kind, path });
                    }
                    Err(e) => {
                        self.state.finish(false);
                        error!(
                            job = %id,
                            operation = %kind,
                            path = %path.display(),
                            error_kind = e.kind(),
                            error = %e,
                            "Operation failed; queue paused"
                        );
                        let report = FailureReport {
                            id,
                            kind,
                            path,
                            error_kind: e.kind(),
                            message: e.to_string(),
                            at: Utc::now(),
                        };
                        for callback in &self.failure_callbacks {
                            callback(&report);
                        }
                        self.emit(SchedulerEvent::Failed(report));
                        if self.state.queued() > 0 {
                            self.emit(SchedulerEvent::Paused);
                        }
                    }
                }
                self.pump();
            }
        }
    }

    /// Start the next queued job if the slot is free and draining is on.
    fn pump(&mut self) {
        match self.state.next() {
            Some(job) => self.launch(job),
            None if self.state.is_idle() && self.state.queued() == 0 => {
                self.emit(SchedulerEvent::Drained);
            }
            None => {}
        }
    }

    fn launch(&mut self, job: Job) {
        let id = job.id();
        let kind = job.record().kind();
        let path = job.record().path().to_path_buf();

        info!(job = %id, operation = %kind, path = %path.display(), "Operation started");
        self.emit(SchedulerEvent::Started {
            id,
            kind,
            path: path.clone(),
        });

        let executor = self.executor.clone();
        let worker_tx = self.worker_tx.clone();
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let work = tokio::task::spawn_blocking(move || {
                executor.execute(&job, ProgressReporter::new(progress_tx))
            });

            // Ends once the worker drops its reporter, so every update is
            // forwarded before the completion message.
            while let Some(progress) = progress_rx.recv().await {
                let _ = worker_tx.send(WorkerMessage::Progress { id, progress });
            }

            let result = match work.await {
                Ok(result) => result,
                Err(e) => {
                    warn!(job = %id, error = %e, "Worker task did not complete");
                    Err(Error::NotUsable(format!("Worker task aborted: {}", e)))
                }
            };
            let _ = worker_tx.send(WorkerMessage::Finished {
                id,
                kind,
                path,
                result,
            });
        });
    }

    fn emit(&self, event: SchedulerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestRecord;
    use cryptfile_crypto::ProtectedSecret;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use zeroize::Zeroizing;

    fn job(name: &str) -> Job {
        let secret = ProtectedSecret::from_password(Zeroizing::new("pw".to_string())).unwrap();
        Job::new(RequestRecord::decrypt(name), secret).unwrap()
    }

    fn name_of(job: &Job) -> String {
        job.record().path().display().to_string()
    }

    /// Records execution order and the peak number of concurrent jobs.
    struct Recorder {
        order: Mutex<Vec<String>>,
        running: AtomicUsize,
        peak: AtomicUsize,
        fail: Vec<String>,
    }

    impl Recorder {
        fn new(fail: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                order: Mutex::new(Vec::new()),
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                fail: fail.iter().map(|s| s.to_string()).collect(),
            })
        }

        fn order(&self) -> Vec<String> {
            self.order.lock().unwrap().clone()
        }
    }

    impl OperationExecutor for Recorder {
        fn execute(&self, job: &Job, mut progress: ProgressReporter) -> Result<()> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let name = name_of(job);
            self.order.lock().unwrap().push(name.clone());
            std::thread::sleep(Duration::from_millis(20));
            progress.report(1, 2);
            progress.report(2, 2);

            self.running.fetch_sub(1, Ordering::SeqCst);
            if self.fail.contains(&name) {
                return Err(Error::AuthenticationFailed);
            }
            Ok(())
        }
    }

    async fn wait_for<F>(events: &mut broadcast::Receiver<SchedulerEvent>, mut pred: F) -> SchedulerEvent
    where
        F: FnMut(&SchedulerEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let event = events.recv().await.unwrap();
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_fifo_single_flight() {
        let recorder = Recorder::new(&[]);
        let (scheduler, task) = RequestScheduler::spawn(recorder.clone());
        let mut events = scheduler.subscribe();

        let r1 = scheduler.submit(job("r1"), QueuePolicy::Enqueue).await.unwrap();
        let r2 = scheduler.submit(job("r2"), QueuePolicy::Enqueue).await.unwrap();
        let r3 = scheduler.submit(job("r3"), QueuePolicy::Enqueue).await.unwrap();
        assert!(matches!(r1, SubmitOutcome::Started(_)));
        assert!(matches!(r2, SubmitOutcome::Queued { position: 0, .. }));
        assert!(matches!(r3, SubmitOutcome::Queued { position: 1, .. }));

        wait_for(&mut events, |e| matches!(e, SchedulerEvent::Drained)).await;

        assert_eq!(recorder.order(), vec!["r1", "r2", "r3"]);
        assert_eq!(recorder.peak.load(Ordering::SeqCst), 1);

        let status = scheduler.status().await.unwrap();
        assert_eq!(status.completed, 3);
        assert_eq!(status.queued, 0);

        assert_eq!(scheduler.shutdown().await.unwrap(), 0);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_pauses_and_resume_continues_with_next() {
        let recorder = Recorder::new(&["r1"]);
        let (scheduler, task) = RequestScheduler::spawn(recorder.clone());
        let mut events = scheduler.subscribe();

        let failures = Arc::new(AtomicUsize::new(0));
        let counter = failures.clone();
        scheduler
            .on_failure(move |report| {
                assert_eq!(report.error_kind, "authentication_failed");
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        scheduler.submit(job("r1"), QueuePolicy::Enqueue).await.unwrap();
        scheduler.submit(job("r2"), QueuePolicy::Enqueue).await.unwrap();
        scheduler.submit(job("r3"), QueuePolicy::Enqueue).await.unwrap();

        let failed = wait_for(&mut events, |e| matches!(e, SchedulerEvent::Failed(_))).await;
        match failed {
            SchedulerEvent::Failed(report) => assert_eq!(report.path, PathBuf::from("r1")),
            _ => unreachable!(),
        }

        let status = scheduler.status().await.unwrap();
        assert!(status.paused);
        assert_eq!(status.queued, 2);
        assert_eq!(recorder.order(), vec!["r1"]);
        assert_eq!(failures.load(Ordering::SeqCst), 1);

        scheduler.resume().await.unwrap();
        wait_for(&mut events, |e| matches!(e, SchedulerEvent::Drained)).await;

        // The failed job is not retried.
        assert_eq!(recorder.order(), vec!["r1", "r2", "r3"]);

        scheduler.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_reject_policy_hands_job_back() {
        let recorder = Recorder::new(&[]);
        let (scheduler, task) = RequestScheduler::spawn(recorder.clone());

        scheduler.submit(job("r1"), QueuePolicy::Reject).await.unwrap();
        match scheduler.submit(job("r2"), QueuePolicy::Reject).await.unwrap() {
            SubmitOutcome::Rejected(job) => assert_eq!(name_of(&job), "r2"),
            other => panic!("unexpected {:?}", other),
        }

        scheduler.shutdown().await.unwrap();
        task.await.unwrap();
        assert_eq!(recorder.order(), vec!["r1"]);
    }

    #[tokio::test]
    async fn test_pause_holds_queue_but_not_idle_submissions() {
        let recorder = Recorder::new(&[]);
        let (scheduler, task) = RequestScheduler::spawn(recorder.clone());
        let mut events = scheduler.subscribe();

        scheduler.pause().await.unwrap();
        let first = scheduler.submit(job("r1"), QueuePolicy::Enqueue).await.unwrap();
        assert!(matches!(first, SubmitOutcome::Started(_)));
        scheduler.submit(job("r2"), QueuePolicy::Enqueue).await.unwrap();

        wait_for(&mut events, |e| matches!(e, SchedulerEvent::Completed { .. })).await;
        let status = scheduler.status().await.unwrap();
        assert_eq!(status.queued, 1);
        assert_eq!(recorder.order(), vec!["r1"]);

        scheduler.resume().await.unwrap();
        wait_for(&mut events, |e| matches!(e, SchedulerEvent::Drained)).await;
        assert_eq!(recorder.order(), vec!["r1", "r2"]);

        scheduler.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_progress_precedes_completion() {
        let recorder = Recorder::new(&[]);
        let (scheduler, task) = RequestScheduler::spawn(recorder);
        let mut events = scheduler.subscribe();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        scheduler
            .on_progress(move |_, progress| sink.lock().unwrap().push(progress))
            .unwrap();

        scheduler.submit(job("r1"), QueuePolicy::Enqueue).await.unwrap();

        let mut progress_events = 0;
        wait_for(&mut events, |e| match e {
            SchedulerEvent::Progress { .. } => {
                progress_events += 1;
                false
            }
            SchedulerEvent::Completed { .. } => true,
            _ => false,
        })
        .await;

        assert_eq!(progress_events, 2);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Progress::new(1, 2), Progress::new(2, 2)]
        );

        scheduler.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_panicking_job_becomes_failure() {
        let executor = |_: &Job, _: ProgressReporter| -> Result<()> { panic!("boom") };
        let (scheduler, task) = RequestScheduler::spawn(Arc::new(executor));
        let mut events = scheduler.subscribe();

        scheduler.submit(job("r1"), QueuePolicy::Enqueue).await.unwrap();
        let event = wait_for(&mut events, |e| matches!(e, SchedulerEvent::Failed(_))).await;
        match event {
            SchedulerEvent::Failed(report) => assert_eq!(report.error_kind, "not_usable"),
            _ => unreachable!(),
        }
        assert!(scheduler.status().await.unwrap().paused);

        scheduler.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_discards_queue_and_rejects_new_work() {
        let recorder = Recorder::new(&[]);
        let (scheduler, task) = RequestScheduler::spawn(recorder.clone());

        scheduler.submit(job("r1"), QueuePolicy::Enqueue).await.unwrap();
        scheduler.submit(job("r2"), QueuePolicy::Enqueue).await.unwrap();
        scheduler.submit(job("r3"), QueuePolicy::Enqueue).await.unwrap();

        assert_eq!(scheduler.shutdown().await.unwrap(), 2);
        task.await.unwrap();
        assert_eq!(recorder.order(), vec!["r1"]);

        assert!(matches!(
            scheduler.status().await,
            Err(Error::NotUsable(_))
        ));
    }
}
