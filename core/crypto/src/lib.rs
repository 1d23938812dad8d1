//! Cryptographic building blocks for cryptfile.
//!
//! This module provides:
//! - A pluggable capability provider (cipher, HMAC, secure RNG) with a
//!   RustCrypto-backed default
//! - Immutable crypto contracts describing one request's algorithm choices
//! - Calibrated key derivation (PBKDF2-HMAC-SHA256 and Argon2id)
//! - Key and password containers that zeroize on drop
//!
//! # Security Guarantees
//! - All key material is automatically zeroized on drop
//! - Passwords stay wrapped at rest and are only unwrapped inside a scope
//! - No plaintext or key material is ever logged

pub mod aead;
pub mod contract;
pub mod kdf;
pub mod keys;
pub mod provider;
pub mod secret;
pub mod stream;

pub use contract::{
    CipherKind, CipherMode, CipherSpec, ContractBuilder, CryptoContract, DerivationKind,
    HmacKind, PaddingKind, MAX_ARGON2_LANES, MAX_ARGON2_MEMORY_KIB,
};
pub use kdf::{calibrate, derive_key, Calibrator, KeyDerive, PerformanceProfile};
pub use keys::{Iv, KeyMaterial, Salt};
pub use provider::{CapabilityProvider, CipherTransform, MacTransform, RustCryptoProvider};
pub use secret::ProtectedSecret;
