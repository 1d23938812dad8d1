//! Scheduler state: the single-flight slot, the pause flag and the queue.
//!
//! Owned by the actor task only. Everything here is synchronous so the
//! transitions can be tested without a runtime.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::request::{Job, JobId, QueuePolicy};

/// Whether an operation is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    Idle,
    Running,
}

/// Point-in-time view of the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    pub paused: bool,
    pub queued: usize,
    pub active: Option<JobId>,
    pub completed: u64,
    pub failed: u64,
}

/// Decision taken for a submitted job.
#[derive(Debug)]
pub(crate) enum Admission {
    Run(Job),
    Queued { id: JobId, position: usize },
    Rejected(Job),
}

#[derive(Debug, Default)]
pub(crate) struct QueueState {
    active: Option<JobId>,
    paused: bool,
    queue: VecDeque<Job>,
    completed: u64,
    failed: u64,
}

impl QueueState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Idle jobs run at once, even while paused; pause only holds the queue.
    pub(crate) fn admit(&mut self, job: Job, policy: QueuePolicy) -> Admission {
        if self.active.is_none() {
            self.active = Some(job.id());
            return Admission::Run(job);
        }
        match policy {
            QueuePolicy::Enqueue => {
                let id = job.id();
                let position = self.queue.len();
                self.queue.push_back(job);
                Admission::Queued { id, position }
            }
            QueuePolicy::Reject => Admission::Rejected(job),
        }
    }

    /// Record the end of the active job. A failure pauses draining.
    pub(crate) fn finish(&mut self, success: bool) {
        self.active = None;
        if success {
            self.completed += 1;
        } else {
            self.failed += 1;
            self.paused = true;
        }
    }

    /// Next job to run, if idle, not paused and something is queued.
    pub(crate) fn next(&mut self) -> Option<Job> {
        if self.active.is_some() || self.paused {
            return None;
        }
        let job = self.queue.pop_front()?;
        self.active = Some(job.id());
        Some(job)
    }

    pub(crate) fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.active.is_none()
    }

    pub(crate) fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Drop every queued job and return how many there were.
    pub(crate) fn discard_queue(&mut self) -> usize {
        let count = self.queue.len();
        self.queue.clear();
        count
    }

    pub(crate) fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            state: if self.active.is_some() {
                SchedulerState::Running
            } else {
                SchedulerState::Idle
            },
            paused: self.paused,
            queued: self.queue.len(),
            active: self.active,
            completed: self.completed,
            failed: self.failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestRecord;
    use cryptfile_crypto::ProtectedSecret;
    use zeroize::Zeroizing;

    fn job(name: &str) -> Job {
        let secret = ProtectedSecret::from_password(Zeroizing::new("pw".to_string())).unwrap();
        Job::new(RequestRecord::decrypt(name), secret).unwrap()
    }

    #[test]
    fn test_idle_runs_then_queues_in_order() {
        let mut state = QueueState::new();
        let first = job("r1");
        let second = job("r2");
        let third = job("r3");
        let (second_id, third_id) = (second.id(), third.id());

        assert!(matches!(state.admit(first, QueuePolicy::Enqueue), Admission::Run(_)));
        assert!(matches!(
            state.admit(second, QueuePolicy::Enqueue),
            Admission::Queued { position: 0, .. }
        ));
        assert!(matches!(
            state.admit(third, QueuePolicy::Enqueue),
            Admission::Queued { position: 1, .. }
        ));

        assert!(state.next().is_none(), "busy");
        state.finish(true);
        assert_eq!(state.next().unwrap().id(), second_id);
        state.finish(true);
        assert_eq!(state.next().unwrap().id(), third_id);
        state.finish(true);
        assert!(state.next().is_none());
        assert_eq!(state.status().completed, 3);
    }

    #[test]
    fn test_reject_policy_returns_job() {
        let mut state = QueueState::new();
        state.admit(job("r1"), QueuePolicy::Reject);
        let second = job("r2");
        let id = second.id();

        match state.admit(second, QueuePolicy::Reject) {
            Admission::Rejected(job) => assert_eq!(job.id(), id),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(state.queued(), 0);
    }

    #[test]
    fn test_failure_pauses_until_resumed() {
        let mut state = QueueState::new();
        state.admit(job("r1"), QueuePolicy::Enqueue);
        state.admit(job("r2"), QueuePolicy::Enqueue);

        state.finish(false);
        assert!(state.is_paused());
        assert!(state.is_idle());
        assert!(state.next().is_none());

        state.set_paused(false);
        assert!(state.next().is_some());
        assert_eq!(state.status().failed, 1);
    }

    #[test]
    fn test_paused_idle_scheduler_still_runs_submissions() {
        let mut state = QueueState::new();
        state.set_paused(true);
        assert!(matches!(state.admit(job("r1"), QueuePolicy::Enqueue), Admission::Run(_)));
        assert_eq!(state.status().state, SchedulerState::Running);
    }
}
