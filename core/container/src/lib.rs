//! Encrypted file containers for cryptfile.
//!
//! This module provides:
//! - The plain-text container header codec (delimiters, JSON metadata, BOM)
//! - A streaming encrypt-then-MAC pipeline that replaces files atomically
//! - Non-blocking progress reporting
//! - Pipeline and command-line configuration
//!
//! # Container layout
//! `[optional BOM][header][ciphertext][optional tag]`. The tag is a keyed
//! hash over the header text and the ciphertext, and is verified before
//! any plaintext is written.

pub mod config;
pub mod header;
pub mod metadata;
pub mod pipeline;
pub mod progress;

pub use config::{CryptConfig, PipelineConfig, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
pub use header::{detect, generate, parse, read_header, ParsedHeader, MAX_HEADER_SIZE};
pub use metadata::{HeaderMetadata, FORMAT_VERSION};
pub use pipeline::CryptoPipeline;
pub use progress::ProgressReporter;
