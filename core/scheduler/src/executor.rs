//! The seam between the scheduler and the work it runs.

use std::sync::Arc;

use crate::request::Job;
use cryptfile_common::{Error, OperationKind, Result};
use cryptfile_container::{CryptoPipeline, ProgressReporter};

/// Runs one job to completion on a blocking thread.
pub trait OperationExecutor: Send + Sync + 'static {
    fn execute(&self, job: &Job, progress: ProgressReporter) -> Result<()>;
}

impl<F> OperationExecutor for F
where
    F: Fn(&Job, ProgressReporter) -> Result<()> + Send + Sync + 'static,
{
    fn execute(&self, job: &Job, progress: ProgressReporter) -> Result<()> {
        self(job, progress)
    }
}

/// Executes jobs through a [`CryptoPipeline`].
pub struct PipelineExecutor {
    pipeline: Arc<CryptoPipeline>,
}

impl PipelineExecutor {
    pub fn new(pipeline: Arc<CryptoPipeline>) -> Self {
        Self { pipeline }
    }

    pub fn pipeline(&self) -> &CryptoPipeline {
        &self.pipeline
    }
}

impl OperationExecutor for PipelineExecutor {
    fn execute(&self, job: &Job, mut progress: ProgressReporter) -> Result<()> {
        let record = job.record();
        match record.kind() {
            OperationKind::Encrypt => {
                let contract = record.contract().ok_or_else(|| {
                    Error::InvalidArgument("Encryption request has no contract".to_string())
                })?;
                self.pipeline
                    .encrypt_with_header(record.path(), contract, job.secret(), &mut progress)?;
            }
            OperationKind::Decrypt => {
                self.pipeline
                    .decrypt(record.path(), job.secret(), &mut progress)?;
            }
        }
        Ok(())
    }
}
