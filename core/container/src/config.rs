//! Pipeline and application configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use cryptfile_common::{Error, Result};
use cryptfile_crypto::{CryptoContract, DerivationKind, HmacKind};

/// Default chunk window: 4 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Largest chunk window accepted: 1 GiB.
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024 * 1024;

/// Cipher block length every chunk must be a multiple of.
const CHUNK_ALIGNMENT: usize = 16;

/// Settings of the crypto pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Bytes read and transformed per step.
    pub chunk_size: usize,
    /// Reuse the measured derivation throughput across requests.
    pub cache_calibration: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            cache_calibration: true,
        }
    }
}

impl PipelineConfig {
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Check the chunk window before any file is touched.
    ///
    /// # Errors
    /// - `InvalidArgument` if the chunk size is zero or not block aligned
    /// - `InsufficientMemory` if the buffer is too large to allocate
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::InvalidArgument(
                "Chunk size cannot be zero".to_string(),
            ));
        }
        if self.chunk_size % CHUNK_ALIGNMENT != 0 {
            return Err(Error::InvalidArgument(format!(
                "Chunk size {} is not a multiple of the {} byte block size",
                self.chunk_size, CHUNK_ALIGNMENT
            )));
        }
        if self.chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::InsufficientMemory(format!(
                "Chunk size {} exceeds the {} byte limit",
                self.chunk_size, MAX_CHUNK_SIZE
            )));
        }

        let mut probe: Vec<u8> = Vec::new();
        probe.try_reserve_exact(self.chunk_size).map_err(|e| {
            Error::InsufficientMemory(format!(
                "Cannot allocate a {} byte chunk buffer: {}",
                self.chunk_size, e
            ))
        })?;
        Ok(())
    }
}

/// User configuration for the command-line front end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptConfig {
    pub key_size_bits: u32,
    pub hmac: Option<HmacKind>,
    pub derivation: DerivationKind,
    pub salt_size: usize,
    /// Target key derivation time in milliseconds.
    pub target_derivation_ms: u64,
    pub chunk_size: usize,
    /// Keep draining the queue after a failed request.
    pub resume_on_failure: bool,
}

impl Default for CryptConfig {
    fn default() -> Self {
        let contract = CryptoContract::default();
        Self {
            key_size_bits: contract.key_size_bits(),
            hmac: contract.hmac(),
            derivation: contract.derivation(),
            salt_size: contract.salt_size(),
            target_derivation_ms: contract.target_derivation().as_millis() as u64,
            chunk_size: DEFAULT_CHUNK_SIZE,
            resume_on_failure: false,
        }
    }
}

impl CryptConfig {
    /// `<config dir>/cryptfile/config.json`, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("cryptfile").join("config.json"))
    }

    /// Load from `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Write to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Serialize configuration to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::InvalidArgument(format!("Invalid configuration: {}", e)))
    }

    /// Deserialize configuration from JSON. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::InvalidArgument(format!("Invalid configuration: {}", e)))
    }

    /// Contract for new encryptions.
    pub fn contract(&self) -> Result<CryptoContract> {
        CryptoContract::builder()
            .with_key_size_bits(self.key_size_bits)
            .with_hmac(self.hmac)
            .with_derivation(self.derivation)
            .with_salt_size(self.salt_size)
            .with_target_derivation(Duration::from_millis(self.target_derivation_ms))
            .build()
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig::default().with_chunk_size(self.chunk_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_chunk_is_valid() {
        PipelineConfig::default().validate().unwrap();
    }

    #[test]
    fn test_chunk_size_validation() {
        let zero = PipelineConfig::default().with_chunk_size(0);
        assert!(matches!(zero.validate(), Err(Error::InvalidArgument(_))));

        let unaligned = PipelineConfig::default().with_chunk_size(1000);
        assert!(matches!(unaligned.validate(), Err(Error::InvalidArgument(_))));

        let huge = PipelineConfig::default().with_chunk_size(MAX_CHUNK_SIZE + 16);
        assert!(matches!(huge.validate(), Err(Error::InsufficientMemory(_))));
    }

    #[test]
    fn test_defaults_match_contract() {
        let config = CryptConfig::default();
        assert_eq!(config.key_size_bits, 256);
        assert_eq!(config.hmac, Some(HmacKind::Sha384));
        assert_eq!(config.derivation, DerivationKind::Pbkdf2Sha256);
        assert_eq!(config.target_derivation_ms, 2000);
        assert_eq!(config.chunk_size, 4 * 1024 * 1024);
        assert_eq!(config.contract().unwrap(), CryptoContract::default());
    }

    #[test]
    fn test_json_roundtrip_and_partial_input() {
        let mut config = CryptConfig::default();
        config.hmac = None;
        config.derivation = DerivationKind::argon2id_default();
        let restored = CryptConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(restored, config);

        let partial = CryptConfig::from_json(r#"{"key_size_bits": 128}"#).unwrap();
        assert_eq!(partial.key_size_bits, 128);
        assert_eq!(partial.chunk_size, DEFAULT_CHUNK_SIZE);

        assert!(matches!(
            CryptConfig::from_json("{not json"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = CryptConfig::default();
        config.target_derivation_ms = 500;
        config.save(&path).unwrap();

        assert_eq!(CryptConfig::load(&path).unwrap(), config);
    }
}
