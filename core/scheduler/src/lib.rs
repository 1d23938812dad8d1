//! Request scheduling for cryptfile.
//!
//! At most one encrypt or decrypt operation runs at any instant. Requests
//! submitted while one is in flight wait in a FIFO queue. A failed
//! operation pauses the queue until the caller resumes it.

pub mod executor;
pub mod request;
pub mod scheduler;
pub mod state;

pub use executor::{OperationExecutor, PipelineExecutor};
pub use request::{Job, JobId, QueuePolicy, RequestRecord, SubmitOutcome};
pub use scheduler::{FailureReport, RequestScheduler, SchedulerEvent, SchedulerTask};
pub use state::{SchedulerState, SchedulerStatus};
