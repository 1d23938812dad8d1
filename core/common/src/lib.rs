//! Common types shared across the cryptfile crates.
//!
//! This module provides the error taxonomy used by every layer and the
//! small value types that cross crate boundaries.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{OperationKind, Progress};
