//! Crypto contracts: the algorithm choices of a single request.
//!
//! Every supported algorithm is a variant of a closed enum. A contract is
//! validated once at construction and is read-only afterwards.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use cryptfile_common::{Error, Result};

/// Smallest salt accepted by either derivation function.
pub const MIN_SALT_SIZE: usize = 8;

/// Largest salt a contract may ask for.
pub const MAX_SALT_SIZE: usize = 1024;

/// Largest Argon2 memory cost accepted, 1 GiB in KiB.
pub const MAX_ARGON2_MEMORY_KIB: u32 = 1024 * 1024;

/// Largest Argon2 lane count accepted.
pub const MAX_ARGON2_LANES: u32 = 64;

/// Supported block ciphers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CipherKind {
    /// AES (Rijndael with a 128-bit block).
    Aes,
}

impl CipherKind {
    /// Block size in bits.
    pub fn block_size_bits(&self) -> u32 {
        match self {
            CipherKind::Aes => 128,
        }
    }

    /// Key sizes in bits accepted by this cipher.
    pub fn key_sizes(&self) -> &'static [u32] {
        match self {
            CipherKind::Aes => &[128, 192, 256],
        }
    }

    /// Whether `bits` is a legal key size.
    pub fn is_valid_key_size(&self, bits: u32) -> bool {
        self.key_sizes().contains(&bits)
    }
}

impl fmt::Display for CipherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CipherKind::Aes => write!(f, "AES"),
        }
    }
}

/// Block cipher mode of operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CipherMode {
    Cbc,
}

/// Plaintext padding scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaddingKind {
    Pkcs7,
}

/// Keyed-hash used for the container authentication tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HmacKind {
    Sha256,
    Sha384,
    Sha512,
}

impl HmacKind {
    /// Length of the tag in bytes.
    pub fn output_len(&self) -> usize {
        match self {
            HmacKind::Sha256 => 32,
            HmacKind::Sha384 => 48,
            HmacKind::Sha512 => 64,
        }
    }

    /// Length of the derived MAC key in bytes.
    pub fn key_len(&self) -> usize {
        self.output_len()
    }
}

impl fmt::Display for HmacKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HmacKind::Sha256 => write!(f, "HMAC-SHA256"),
            HmacKind::Sha384 => write!(f, "HMAC-SHA384"),
            HmacKind::Sha512 => write!(f, "HMAC-SHA512"),
        }
    }
}

/// Password-stretching function and its fixed parameters.
///
/// The tunable cost (PBKDF2 iterations, Argon2 passes) is not part of the
/// kind; it is calibrated per request and stored in the container header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "id", rename_all = "snake_case")]
pub enum DerivationKind {
    /// PBKDF2 with HMAC-SHA256 as the PRF.
    Pbkdf2Sha256,
    /// Argon2id with fixed memory cost (KiB) and lane count.
    Argon2id { memory_kib: u32, lanes: u32 },
}

impl DerivationKind {
    /// Argon2id with a 64 MiB memory cost and a single lane.
    pub fn argon2id_default() -> Self {
        DerivationKind::Argon2id {
            memory_kib: 64 * 1024,
            lanes: 1,
        }
    }

    /// Smallest iteration count calibration will ever return.
    pub fn min_iterations(&self) -> u32 {
        match self {
            DerivationKind::Pbkdf2Sha256 => 10_000,
            DerivationKind::Argon2id { .. } => 1,
        }
    }

    /// Iteration count used when measuring throughput.
    pub fn probe_iterations(&self) -> u32 {
        match self {
            DerivationKind::Pbkdf2Sha256 => 20_000,
            DerivationKind::Argon2id { .. } => 2,
        }
    }

    /// Check the fixed parameters against the accepted ranges.
    ///
    /// Headers are untrusted input, so the Argon2 cost is bounded from
    /// above as well as below.
    pub fn validate(&self) -> Result<()> {
        if let DerivationKind::Argon2id { memory_kib, lanes } = *self {
            if !(1..=MAX_ARGON2_LANES).contains(&lanes) {
                return Err(Error::InvalidArgument(format!(
                    "Argon2 lanes must be between 1 and {}, got {}",
                    MAX_ARGON2_LANES, lanes
                )));
            }
            if memory_kib < 8 * lanes {
                return Err(Error::InvalidArgument(
                    "Argon2 memory cost must be at least 8 * lanes".to_string(),
                ));
            }
            if memory_kib > MAX_ARGON2_MEMORY_KIB {
                return Err(Error::InvalidArgument(format!(
                    "Argon2 memory cost of {} KiB exceeds {} KiB",
                    memory_kib, MAX_ARGON2_MEMORY_KIB
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for DerivationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DerivationKind::Pbkdf2Sha256 => write!(f, "PBKDF2-HMAC-SHA256"),
            DerivationKind::Argon2id { memory_kib, lanes } => {
                write!(f, "Argon2id (m={} KiB, p={})", memory_kib, lanes)
            }
        }
    }
}

/// The cipher triple a transform is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CipherSpec {
    pub cipher: CipherKind,
    pub mode: CipherMode,
    pub padding: PaddingKind,
}

impl Default for CipherSpec {
    fn default() -> Self {
        Self {
            cipher: CipherKind::Aes,
            mode: CipherMode::Cbc,
            padding: PaddingKind::Pkcs7,
        }
    }
}

/// Immutable description of how one file is encrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoContract {
    cipher: CipherKind,
    block_size_bits: u32,
    mode: CipherMode,
    padding: PaddingKind,
    key_size_bits: u32,
    iv_size_bits: u32,
    derivation: DerivationKind,
    target_derivation: Duration,
    salt_size: usize,
    hmac: Option<HmacKind>,
}

impl CryptoContract {
    /// Start building a contract from the recommended defaults.
    pub fn builder() -> ContractBuilder {
        ContractBuilder::default()
    }

    pub fn cipher(&self) -> CipherKind {
        self.cipher
    }

    pub fn block_size_bits(&self) -> u32 {
        self.block_size_bits
    }

    pub fn mode(&self) -> CipherMode {
        self.mode
    }

    pub fn padding(&self) -> PaddingKind {
        self.padding
    }

    pub fn key_size_bits(&self) -> u32 {
        self.key_size_bits
    }

    /// Key length in bytes.
    pub fn key_len(&self) -> usize {
        (self.key_size_bits / 8) as usize
    }

    pub fn iv_size_bits(&self) -> u32 {
        self.iv_size_bits
    }

    /// IV length in bytes.
    pub fn iv_len(&self) -> usize {
        (self.iv_size_bits / 8) as usize
    }

    pub fn derivation(&self) -> DerivationKind {
        self.derivation
    }

    pub fn target_derivation(&self) -> Duration {
        self.target_derivation
    }

    pub fn salt_size(&self) -> usize {
        self.salt_size
    }

    pub fn hmac(&self) -> Option<HmacKind> {
        self.hmac
    }

    pub fn cipher_spec(&self) -> CipherSpec {
        CipherSpec {
            cipher: self.cipher,
            mode: self.mode,
            padding: self.padding,
        }
    }
}

impl Default for CryptoContract {
    fn default() -> Self {
        let cipher = CipherKind::Aes;
        Self {
            cipher,
            block_size_bits: cipher.block_size_bits(),
            mode: CipherMode::Cbc,
            padding: PaddingKind::Pkcs7,
            key_size_bits: 256,
            iv_size_bits: cipher.block_size_bits(),
            derivation: DerivationKind::Pbkdf2Sha256,
            target_derivation: Duration::from_millis(2000),
            salt_size: 16,
            hmac: Some(HmacKind::Sha384),
        }
    }
}

/// Builder for [`CryptoContract`].
///
/// Block and IV sizes default to the cipher's block size when not set.
#[derive(Debug, Clone)]
pub struct ContractBuilder {
    cipher: CipherKind,
    block_size_bits: Option<u32>,
    mode: CipherMode,
    padding: PaddingKind,
    key_size_bits: u32,
    iv_size_bits: Option<u32>,
    derivation: DerivationKind,
    target_derivation: Duration,
    salt_size: usize,
    hmac: Option<HmacKind>,
}

impl Default for ContractBuilder {
    fn default() -> Self {
        let defaults = CryptoContract::default();
        Self {
            cipher: defaults.cipher,
            block_size_bits: None,
            mode: defaults.mode,
            padding: defaults.padding,
            key_size_bits: defaults.key_size_bits,
            iv_size_bits: None,
            derivation: defaults.derivation,
            target_derivation: defaults.target_derivation,
            salt_size: defaults.salt_size,
            hmac: defaults.hmac,
        }
    }
}

impl ContractBuilder {
    pub fn with_cipher(mut self, cipher: CipherKind) -> Self {
        self.cipher = cipher;
        self
    }

    pub fn with_block_size_bits(mut self, bits: u32) -> Self {
        self.block_size_bits = Some(bits);
        self
    }

    pub fn with_mode(mut self, mode: CipherMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_padding(mut self, padding: PaddingKind) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_key_size_bits(mut self, bits: u32) -> Self {
        self.key_size_bits = bits;
        self
    }

    pub fn with_iv_size_bits(mut self, bits: u32) -> Self {
        self.iv_size_bits = Some(bits);
        self
    }

    pub fn with_derivation(mut self, derivation: DerivationKind) -> Self {
        self.derivation = derivation;
        self
    }

    pub fn with_target_derivation(mut self, target: Duration) -> Self {
        self.target_derivation = target;
        self
    }

    pub fn with_salt_size(mut self, size: usize) -> Self {
        self.salt_size = size;
        self
    }

    pub fn with_hmac(mut self, hmac: Option<HmacKind>) -> Self {
        self.hmac = hmac;
        self
    }

    /// Validate the choices and freeze them into a contract.
    ///
    /// # Errors
    /// - `InvalidKeyLength` if the key size is not legal for the cipher
    /// - `InvalidCryptographicProperty` if block or IV size disagree with the cipher
    /// - `InvalidArgument` for an out-of-range salt or bad Argon2 parameters
    pub fn build(self) -> Result<CryptoContract> {
        let block_size_bits = self
            .block_size_bits
            .unwrap_or_else(|| self.cipher.block_size_bits());
        let iv_size_bits = self.iv_size_bits.unwrap_or(block_size_bits);

        if !self.cipher.is_valid_key_size(self.key_size_bits) {
            return Err(Error::InvalidKeyLength(format!(
                "{} does not support {}-bit keys (valid: {:?})",
                self.cipher,
                self.key_size_bits,
                self.cipher.key_sizes()
            )));
        }

        if block_size_bits != self.cipher.block_size_bits() {
            return Err(Error::InvalidCryptographicProperty(format!(
                "{} block size is {} bits, got {}",
                self.cipher,
                self.cipher.block_size_bits(),
                block_size_bits
            )));
        }

        if iv_size_bits != block_size_bits {
            return Err(Error::InvalidCryptographicProperty(format!(
                "IV size ({} bits) must equal block size ({} bits)",
                iv_size_bits, block_size_bits
            )));
        }

        if !(MIN_SALT_SIZE..=MAX_SALT_SIZE).contains(&self.salt_size) {
            return Err(Error::InvalidArgument(format!(
                "Salt size must be between {} and {} bytes, got {}",
                MIN_SALT_SIZE, MAX_SALT_SIZE, self.salt_size
            )));
        }

        self.derivation.validate()?;

        Ok(CryptoContract {
            cipher: self.cipher,
            block_size_bits,
            mode: self.mode,
            padding: self.padding,
            key_size_bits: self.key_size_bits,
            iv_size_bits,
            derivation: self.derivation,
            target_derivation: self.target_derivation,
            salt_size: self.salt_size,
            hmac: self.hmac,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_contract_is_valid() {
        let contract = CryptoContract::builder().build().unwrap();
        assert_eq!(contract, CryptoContract::default());
        assert_eq!(contract.key_len(), 32);
        assert_eq!(contract.iv_len(), 16);
        assert_eq!(contract.hmac(), Some(HmacKind::Sha384));
    }

    #[test]
    fn test_invalid_key_size_rejected() {
        let err = CryptoContract::builder()
            .with_key_size_bits(100)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidKeyLength(_)));
    }

    #[test]
    fn test_iv_must_match_block_size() {
        let err = CryptoContract::builder()
            .with_iv_size_bits(96)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidCryptographicProperty(_)));

        let err = CryptoContract::builder()
            .with_block_size_bits(64)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidCryptographicProperty(_)));
    }

    #[test]
    fn test_salt_bounds() {
        assert!(CryptoContract::builder().with_salt_size(4).build().is_err());
        assert!(CryptoContract::builder().with_salt_size(8).build().is_ok());
    }

    #[test]
    fn test_argon2_params_validated() {
        let bad = DerivationKind::Argon2id {
            memory_kib: 8,
            lanes: 4,
        };
        assert!(CryptoContract::builder().with_derivation(bad).build().is_err());

        let greedy = DerivationKind::Argon2id {
            memory_kib: MAX_ARGON2_MEMORY_KIB + 1,
            lanes: 1,
        };
        assert!(matches!(greedy.validate(), Err(Error::InvalidArgument(_))));
        let wide = DerivationKind::Argon2id {
            memory_kib: MAX_ARGON2_MEMORY_KIB,
            lanes: MAX_ARGON2_LANES + 1,
        };
        assert!(wide.validate().is_err());
        assert!(DerivationKind::Argon2id {
            memory_kib: MAX_ARGON2_MEMORY_KIB,
            lanes: MAX_ARGON2_LANES,
        }
        .validate()
        .is_ok());

        assert!(CryptoContract::builder()
            .with_derivation(DerivationKind::argon2id_default())
            .build()
            .is_ok());
    }

    #[test]
    fn test_derivation_kind_serialization() {
        let json = serde_json::to_string(&DerivationKind::Pbkdf2Sha256).unwrap();
        assert_eq!(json, r#"{"id":"pbkdf2_sha256"}"#);

        let argon = DerivationKind::Argon2id {
            memory_kib: 1024,
            lanes: 2,
        };
        let json = serde_json::to_string(&argon).unwrap();
        let restored: DerivationKind = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, argon);
    }

    #[test]
    fn test_hmac_lengths() {
        assert_eq!(HmacKind::Sha256.output_len(), 32);
        assert_eq!(HmacKind::Sha384.output_len(), 48);
        assert_eq!(HmacKind::Sha512.key_len(), 64);
    }
}
