//! Request records and queued jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use cryptfile_common::{Error, OperationKind, Result};
use cryptfile_crypto::{CryptoContract, ProtectedSecret};

/// Unique identifier of a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What to do with which file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRecord {
    kind: OperationKind,
    path: PathBuf,
    /// Present for encryption only.
    contract: Option<CryptoContract>,
}

impl RequestRecord {
    pub fn encrypt(path: impl Into<PathBuf>, contract: CryptoContract) -> Self {
        Self {
            kind: OperationKind::Encrypt,
            path: path.into(),
            contract: Some(contract),
        }
    }

    pub fn decrypt(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: OperationKind::Decrypt,
            path: path.into(),
            contract: None,
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contract(&self) -> Option<&CryptoContract> {
        self.contract.as_ref()
    }

    fn validate(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Err(Error::InvalidArgument("Request path is empty".to_string()));
        }
        if self.path.file_name().is_none() {
            return Err(Error::InvalidArgument(format!(
                "{} does not name a file",
                self.path.display()
            )));
        }
        Ok(())
    }
}

/// A request paired with the password it runs under.
///
/// Each job owns its own secret; nothing is shared between queued jobs.
pub struct Job {
    id: JobId,
    record: RequestRecord,
    secret: ProtectedSecret,
    submitted_at: DateTime<Utc>,
}

impl Job {
    /// # Errors
    /// - `InvalidArgument` if the record does not name a file
    pub fn new(record: RequestRecord, secret: ProtectedSecret) -> Result<Self> {
        record.validate()?;
        Ok(Self {
            id: JobId::new(),
            record,
            secret,
            submitted_at: Utc::now(),
        })
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn record(&self) -> &RequestRecord {
        &self.record
    }

    pub fn secret(&self) -> &ProtectedSecret {
        &self.secret
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("kind", &self.record.kind)
            .field("path", &self.record.path)
            .field("secret", &self.secret)
            .finish()
    }
}

/// What happens to a job submitted while another one is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueuePolicy {
    /// Append to the FIFO queue.
    #[default]
    Enqueue,
    /// Hand the job back to the caller.
    Reject,
}

/// Result of a submission.
#[derive(Debug)]
pub enum SubmitOutcome {
    /// The scheduler was idle and the job is now running.
    Started(JobId),
    /// The job waits behind `position` other queued jobs.
    Queued { id: JobId, position: usize },
    /// Busy and the policy said not to queue; the job is returned untouched.
    Rejected(Job),
}

impl SubmitOutcome {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, SubmitOutcome::Rejected(_))
    }
}
