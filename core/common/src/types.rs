//! Common types used throughout cryptfile.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which direction a crypto operation runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// Plaintext file becomes a container.
    Encrypt,
    /// Container becomes a plaintext file.
    Decrypt,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Encrypt => write!(f, "encrypt"),
            OperationKind::Decrypt => write!(f, "decrypt"),
        }
    }
}

/// Byte-count progress of a single operation.
///
/// `processed` never exceeds `total`; an empty input reports `1.0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub processed: u64,
    pub total: u64,
}

impl Progress {
    /// Create a progress value, clamping `processed` to `total`.
    pub fn new(processed: u64, total: u64) -> Self {
        Self {
            processed: processed.min(total),
            total,
        }
    }

    /// Completed fraction in `[0.0, 1.0]`.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.processed as f64 / self.total as f64
    }

    /// Completed percentage, rounded down.
    pub fn percent(&self) -> u8 {
        (self.fraction() * 100.0).floor() as u8
    }

    /// Whether all bytes have been processed.
    pub fn is_complete(&self) -> bool {
        self.processed == self.total
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}% ({}/{} bytes)", self.percent(), self.processed, self.total)
    }
}
