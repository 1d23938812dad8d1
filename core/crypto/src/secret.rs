//! Passwords wrapped at rest.
//!
//! A [`ProtectedSecret`] never stores the password in the clear. The bytes
//! are sealed under a random per-instance key and only opened inside
//! [`ProtectedSecret::expose`], into a buffer that is zeroized when the
//! closure returns.

use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::aead::{self, WRAP_KEY_LENGTH};
use cryptfile_common::{Error, Result};

#[derive(Zeroize, ZeroizeOnDrop)]
struct WrapKey([u8; WRAP_KEY_LENGTH]);

/// Access-controlled password container.
pub struct ProtectedSecret {
    key: WrapKey,
    sealed: Vec<u8>,
    len: usize,
}

impl ProtectedSecret {
    /// Wrap password bytes.
    ///
    /// # Errors
    /// - `InvalidArgument` if the password is empty
    pub fn new(plaintext: Zeroizing<Vec<u8>>) -> Result<Self> {
        if plaintext.is_empty() {
            return Err(Error::InvalidArgument(
                "Password cannot be empty".to_string(),
            ));
        }

        let mut key = WrapKey([0u8; WRAP_KEY_LENGTH]);
        {
            use rand::RngCore;
            rand::rngs::OsRng.try_fill_bytes(&mut key.0).map_err(|e| {
                Error::Io(std::io::Error::other(format!(
                    "OS random generator unavailable: {}",
                    e
                )))
            })?;
        }

        let sealed = aead::seal(&key.0, &plaintext)?;
        Ok(Self {
            key,
            sealed,
            len: plaintext.len(),
        })
    }

    /// Wrap a UTF-8 password.
    pub fn from_password(password: Zeroizing<String>) -> Result<Self> {
        Self::new(Zeroizing::new(password.as_bytes().to_vec()))
    }

    /// Password length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false; empty secrets are rejected at construction.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Run `f` with the unwrapped password.
    ///
    /// The plaintext copy lives only for the duration of the call.
    pub fn expose<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let plaintext = aead::open(&self.key.0, &self.sealed)?;
        Ok(f(plaintext.as_slice()))
    }

    /// Re-wrap the same password under a fresh key.
    pub fn duplicate(&self) -> Result<Self> {
        let plaintext = aead::open(&self.key.0, &self.sealed)?;
        Self::new(plaintext)
    }
}

impl fmt::Debug for ProtectedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProtectedSecret([REDACTED])")
    }
}
