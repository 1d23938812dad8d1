//! Calibrated password-based key derivation.
//!
//! Two functions are supported: PBKDF2-HMAC-SHA256 and Argon2id. Both are
//! exposed as a continuous byte stream through [`KeyDerive`], so a caller
//! can take the cipher key first and the MAC key right after it without
//! stretching the password twice.
//!
//! The iteration count is not fixed. A [`Calibrator`] times a probe run on
//! the current machine and scales it to a target duration.

use argon2::{Algorithm, Argon2, Params, Version};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use zeroize::Zeroizing;

use crate::contract::DerivationKind;
use crate::keys::{KeyMaterial, Salt};
use crate::secret::ProtectedSecret;
use cryptfile_common::{Error, Result};

/// PBKDF2 block length (SHA-256 output).
const PBKDF2_BLOCK_LEN: usize = 32;

/// Length of the Argon2id pseudo-random key fed into HKDF.
const ARGON2_PRK_LEN: usize = 64;

/// Upper bound on the length of one derived stream.
pub const MAX_OUTPUT_LEN: usize = 255 * 32;

const HKDF_INFO: &[u8] = b"cryptfile key stream";

type HmacSha256 = Hmac<Sha256>;

enum Engine {
    Pbkdf2 {
        secret: ProtectedSecret,
        salt: Vec<u8>,
        iterations: u32,
        /// Output blocks computed so far.
        blocks: Zeroizing<Vec<u8>>,
    },
    Argon2 {
        prk: Zeroizing<[u8; ARGON2_PRK_LEN]>,
    },
}

/// Two-phase key derivation stream.
///
/// `new` creates an unusable instance; `configure` stretches the password
/// and makes it usable. Every `get_bytes` call continues where the last one
/// stopped.
pub struct KeyDerive {
    kind: DerivationKind,
    engine: Option<Engine>,
    cursor: usize,
}

impl KeyDerive {
    pub fn new(kind: DerivationKind) -> Self {
        Self {
            kind,
            engine: None,
            cursor: 0,
        }
    }

    pub fn kind(&self) -> DerivationKind {
        self.kind
    }

    pub fn is_usable(&self) -> bool {
        self.engine.is_some()
    }

    /// Bind password, salt and cost.
    ///
    /// For Argon2id the stretching happens here. PBKDF2 keeps its own copy
    /// of the wrapped password and stretches lazily, block by block.
    ///
    /// # Errors
    /// - `InvalidArgument` if `iterations` is zero or the salt is empty
    /// - `InvalidArgument` if Argon2 rejects its parameters
    pub fn configure(
        &mut self,
        secret: &ProtectedSecret,
        salt: &Salt,
        iterations: u32,
    ) -> Result<()> {
        if iterations == 0 {
            return Err(Error::InvalidArgument(
                "Iteration count must be at least 1".to_string(),
            ));
        }
        if salt.is_empty() {
            return Err(Error::InvalidArgument("Salt cannot be empty".to_string()));
        }
        self.kind.validate()?;

        let engine = match self.kind {
            DerivationKind::Pbkdf2Sha256 => Engine::Pbkdf2 {
                secret: secret.duplicate()?,
                salt: salt.as_bytes().to_vec(),
                iterations,
                blocks: Zeroizing::new(Vec::new()),
            },
            DerivationKind::Argon2id { memory_kib, lanes } => {
                let params = Params::new(memory_kib, iterations, lanes, Some(ARGON2_PRK_LEN))
                    .map_err(|e| {
                        Error::InvalidArgument(format!("Invalid Argon2 parameters: {}", e))
                    })?;
                let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

                let mut prk = Zeroizing::new([0u8; ARGON2_PRK_LEN]);
                secret.expose(|password| {
                    argon2
                        .hash_password_into(password, salt.as_bytes(), &mut prk[..])
                        .map_err(|e| {
                            Error::InvalidArgument(format!("Key derivation failed: {}", e))
                        })
                })??;
                Engine::Argon2 { prk }
            }
        };

        self.engine = Some(engine);
        self.cursor = 0;
        Ok(())
    }

    /// Next `n` bytes of the derived stream.
    ///
    /// # Errors
    /// - `NotUsable` before `configure`
    /// - `InvalidArgument` if the stream would exceed [`MAX_OUTPUT_LEN`]
    pub fn get_bytes(&mut self, n: usize) -> Result<KeyMaterial> {
        let engine = self.engine.as_mut().ok_or_else(|| {
            Error::NotUsable("Key derivation has not been configured".to_string())
        })?;

        let end = self
            .cursor
            .checked_add(n)
            .filter(|end| *end <= MAX_OUTPUT_LEN)
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "Derived stream is limited to {} bytes",
                    MAX_OUTPUT_LEN
                ))
            })?;

        let bytes = match engine {
            Engine::Pbkdf2 {
                secret,
                salt,
                iterations,
                blocks,
            } => {
                while blocks.len() < end {
                    let index = (blocks.len() / PBKDF2_BLOCK_LEN) as u32 + 1;
                    let block = secret.expose(|password| {
                        pbkdf2_block(password, salt, *iterations, index)
                    })??;
                    blocks.extend_from_slice(&block[..]);
                }
                blocks[self.cursor..end].to_vec()
            }
            Engine::Argon2 { prk } => {
                let hkdf = Hkdf::<Sha256>::from_prk(&prk[..]).map_err(|e| {
                    Error::InvalidKeyLength(format!("HKDF key rejected: {}", e))
                })?;
                let mut okm = Zeroizing::new(vec![0u8; end]);
                hkdf.expand(HKDF_INFO, &mut okm[..]).map_err(|e| {
                    Error::InvalidArgument(format!("HKDF expansion failed: {}", e))
                })?;
                okm[self.cursor..end].to_vec()
            }
        };

        self.cursor = end;
        Ok(KeyMaterial::from_bytes(bytes))
    }

    /// Rewind to the start of the stream. Stretching is not repeated.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }
}

/// One PBKDF2 output block: F(P, S, c, i) from RFC 8018.
fn pbkdf2_block(
    password: &[u8],
    salt: &[u8],
    iterations: u32,
    index: u32,
) -> Result<Zeroizing<[u8; PBKDF2_BLOCK_LEN]>> {
    let prf = <HmacSha256 as Mac>::new_from_slice(password)
        .map_err(|e| Error::InvalidKeyLength(format!("HMAC key rejected: {}", e)))?;

    let mut mac = prf.clone();
    mac.update(salt);
    mac.update(&index.to_be_bytes());

    let mut u = Zeroizing::new([0u8; PBKDF2_BLOCK_LEN]);
    u.copy_from_slice(&mac.finalize().into_bytes());
    let mut t = u.clone();

    for _ in 1..iterations {
        let mut mac = prf.clone();
        mac.update(&u[..]);
        u.copy_from_slice(&mac.finalize().into_bytes());
        for (acc, byte) in t.iter_mut().zip(u.iter()) {
            *acc ^= byte;
        }
    }

    Ok(t)
}

/// Derive `len` bytes in one call.
pub fn derive_key(
    kind: DerivationKind,
    secret: &ProtectedSecret,
    salt: &Salt,
    iterations: u32,
    len: usize,
) -> Result<KeyMaterial> {
    let mut kdf = KeyDerive::new(kind);
    kdf.configure(secret, salt, iterations)?;
    kdf.get_bytes(len)
}

/// Measured throughput of one derivation kind on this machine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerformanceProfile {
    pub kind: DerivationKind,
    pub iterations_per_ms: f64,
}

impl PerformanceProfile {
    pub fn new(kind: DerivationKind, iterations_per_ms: f64) -> Self {
        Self {
            kind,
            iterations_per_ms,
        }
    }

    /// Iteration count expected to take roughly `target`.
    ///
    /// Never returns less than the kind's minimum.
    ///
    /// # Errors
    /// - `IntegerOverflow` if the count does not fit in a `u32`
    pub fn iterations_for(&self, target: Duration) -> Result<u32> {
        let target_ms = target.as_secs_f64() * 1000.0;
        let count = (self.iterations_per_ms * target_ms).floor();

        if !count.is_finite() || count > u32::MAX as f64 {
            return Err(Error::IntegerOverflow(format!(
                "{} iterations per ms over {} ms exceeds the supported range",
                self.iterations_per_ms, target_ms
            )));
        }

        let count = count.max(0.0) as u32;
        Ok(count.max(self.kind.min_iterations()))
    }
}

/// Per-kind cache of performance profiles.
#[derive(Default)]
pub struct Calibrator {
    profiles: Mutex<HashMap<DerivationKind, PerformanceProfile>>,
}

impl Calibrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time a probe derivation for `kind`.
    pub fn measure(kind: DerivationKind) -> Result<PerformanceProfile> {
        let secret = ProtectedSecret::new(Zeroizing::new(b"calibration probe".to_vec()))?;
        let salt = Salt::from_bytes(vec![0x5A; 16]);
        let probe = kind.probe_iterations();

        let started = Instant::now();
        let mut kdf = KeyDerive::new(kind);
        kdf.configure(&secret, &salt, probe)?;
        kdf.get_bytes(PBKDF2_BLOCK_LEN)?;
        let elapsed = started.elapsed();

        // Guard against a zero reading on coarse clocks.
        let elapsed_ms = (elapsed.as_secs_f64() * 1000.0).max(0.001);
        let profile = PerformanceProfile::new(kind, probe as f64 / elapsed_ms);

        tracing::debug!(
            kind = %kind,
            probe_iterations = probe,
            elapsed_ms,
            iterations_per_ms = profile.iterations_per_ms,
            "Measured key derivation throughput"
        );
        Ok(profile)
    }

    /// Cached profile for `kind`, measuring on first use.
    pub fn profile(&self, kind: DerivationKind) -> Result<PerformanceProfile> {
        if let Some(profile) = self.lock().get(&kind) {
            return Ok(*profile);
        }
        let profile = Self::measure(kind)?;
        self.lock().insert(kind, profile);
        Ok(profile)
    }

    /// Seed the cache with a known profile.
    pub fn insert(&self, profile: PerformanceProfile) {
        self.lock().insert(profile.kind, profile);
    }

    /// Iteration count for `kind` that should take about `target`.
    pub fn iterations(&self, kind: DerivationKind, target: Duration) -> Result<u32> {
        self.profile(kind)?.iterations_for(target)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<DerivationKind, PerformanceProfile>> {
        self.profiles.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Measure `kind` and return the iteration count for `target`.
pub fn calibrate(kind: DerivationKind, target: Duration) -> Result<u32> {
    Calibrator::measure(kind)?.iterations_for(target)
}
