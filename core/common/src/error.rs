//! Common error types for cryptfile.

use thiserror::Error;

/// Top-level error type for cryptfile operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A caller-supplied value was rejected before any work started.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Key length is not supported by the selected cipher.
    #[error("Invalid key length: {0}")]
    InvalidKeyLength(String),

    /// IV, block size or another cipher property is inconsistent.
    #[error("Invalid cryptographic property: {0}")]
    InvalidCryptographicProperty(String),

    /// Header delimiters are missing or out of order.
    #[error("Corrupt header: {0}")]
    CorruptHeader(String),

    /// Header is present but its metadata blob is damaged.
    #[error("Corrupt metadata: {0}")]
    CorruptMetadata(String),

    /// The file does not carry a container header.
    #[error("Not an encrypted container: {0}")]
    NotAContainer(String),

    /// Tag mismatch, wrong password or tampered data.
    #[error("Authentication failed: wrong password or corrupted data")]
    AuthenticationFailed,

    /// Object used before it was configured.
    #[error("Not usable: {0}")]
    NotUsable(String),

    /// A computed count does not fit its integer representation.
    #[error("Integer overflow: {0}")]
    IntegerOverflow(String),

    /// Requested buffers cannot be allocated.
    #[error("Insufficient memory: {0}")]
    InsufficientMemory(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Short, stable name of the error kind for structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidArgument(_) => "invalid_argument",
            Error::InvalidKeyLength(_) => "invalid_key_length",
            Error::InvalidCryptographicProperty(_) => "invalid_cryptographic_property",
            Error::CorruptHeader(_) => "corrupt_header",
            Error::CorruptMetadata(_) => "corrupt_metadata",
            Error::NotAContainer(_) => "not_a_container",
            Error::AuthenticationFailed => "authentication_failed",
            Error::NotUsable(_) => "not_usable",
            Error::IntegerOverflow(_) => "integer_overflow",
            Error::InsufficientMemory(_) => "insufficient_memory",
            Error::Io(_) => "io",
        }
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
