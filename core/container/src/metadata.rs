//! Container metadata stored between the header delimiters.

use serde::{Deserialize, Serialize};

use cryptfile_common::{Error, Result};
use cryptfile_crypto::{
    CipherKind, CipherMode, CryptoContract, DerivationKind, HmacKind, Iv, PaddingKind, Salt,
};

/// Current container format version.
pub const FORMAT_VERSION: u32 = 1;

/// Everything needed to decrypt a container, except the password.
///
/// Field order is the serialization order and must not change. Every field
/// is required, `hmac` included, and unknown fields are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeaderMetadata {
    pub version: u32,
    pub cipher: CipherKind,
    pub mode: CipherMode,
    pub padding: PaddingKind,
    pub key_size_bits: u32,
    pub block_size_bits: u32,
    pub iv_size_bits: u32,
    pub iv: Iv,
    pub salt: Salt,
    pub derivation: DerivationKind,
    pub iterations: u32,
    #[serde(deserialize_with = "Option::deserialize")]
    pub hmac: Option<HmacKind>,
}

impl HeaderMetadata {
    /// Record a contract together with the per-file values chosen for it.
    pub fn from_parts(contract: &CryptoContract, iv: Iv, salt: Salt, iterations: u32) -> Self {
        Self {
            version: FORMAT_VERSION,
            cipher: contract.cipher(),
            mode: contract.mode(),
            padding: contract.padding(),
            key_size_bits: contract.key_size_bits(),
            block_size_bits: contract.block_size_bits(),
            iv_size_bits: contract.iv_size_bits(),
            iv,
            salt,
            derivation: contract.derivation(),
            iterations,
            hmac: contract.hmac(),
        }
    }

    /// Check that the stored fields agree with each other.
    ///
    /// # Errors
    /// - `CorruptMetadata` for an unknown version, a zero iteration count,
    ///   derivation parameters out of range or an IV whose length disagrees
    ///   with `iv_size_bits`
    pub fn validate(&self) -> Result<()> {
        if self.version != FORMAT_VERSION {
            return Err(Error::CorruptMetadata(format!(
                "Unsupported format version {}",
                self.version
            )));
        }
        if self.iterations == 0 {
            return Err(Error::CorruptMetadata(
                "Iteration count is zero".to_string(),
            ));
        }
        self.derivation
            .validate()
            .map_err(|e| Error::CorruptMetadata(e.to_string()))?;
        if self.iv.len() * 8 != self.iv_size_bits as usize {
            return Err(Error::CorruptMetadata(format!(
                "IV is {} bits but header declares {}",
                self.iv.len() * 8,
                self.iv_size_bits
            )));
        }
        self.to_contract().map(|_| ())
    }

    /// Rebuild the contract the container was written with.
    ///
    /// The derivation target is not stored; the stored iteration count is
    /// what decryption uses.
    pub fn to_contract(&self) -> Result<CryptoContract> {
        CryptoContract::builder()
            .with_cipher(self.cipher)
            .with_block_size_bits(self.block_size_bits)
            .with_mode(self.mode)
            .with_padding(self.padding)
            .with_key_size_bits(self.key_size_bits)
            .with_iv_size_bits(self.iv_size_bits)
            .with_derivation(self.derivation)
            .with_salt_size(self.salt.len())
            .with_hmac(self.hmac)
            .build()
            .map_err(|e| Error::CorruptMetadata(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> HeaderMetadata {
        HeaderMetadata::from_parts(
            &CryptoContract::default(),
            Iv::from_bytes(vec![1u8; 16]),
            Salt::from_bytes(vec![2u8; 16]),
            120_000,
        )
    }

    #[test]
    fn test_from_parts_then_to_contract() {
        let contract = CryptoContract::builder()
            .with_key_size_bits(128)
            .with_hmac(None)
            .with_derivation(DerivationKind::argon2id_default())
            .with_salt_size(32)
            .build()
            .unwrap();

        let meta = HeaderMetadata::from_parts(
            &contract,
            Iv::from_bytes(vec![0u8; 16]),
            Salt::from_bytes(vec![0u8; 32]),
            3,
        );
        meta.validate().unwrap();

        let rebuilt = meta.to_contract().unwrap();
        assert_eq!(rebuilt.key_size_bits(), 128);
        assert_eq!(rebuilt.hmac(), None);
        assert_eq!(rebuilt.derivation(), DerivationKind::argon2id_default());
        assert_eq!(rebuilt.salt_size(), 32);
    }

    #[test]
    fn test_json_field_order_is_fixed() {
        let json = serde_json::to_string(&sample()).unwrap();
        let keys = [
            "\"version\"",
            "\"cipher\"",
            "\"mode\"",
            "\"padding\"",
            "\"key_size_bits\"",
            "\"block_size_bits\"",
            "\"iv_size_bits\"",
            "\"iv\"",
            "\"salt\"",
            "\"derivation\"",
            "\"iterations\"",
            "\"hmac\"",
        ];
        let positions: Vec<usize> = keys.iter().map(|k| json.find(k).unwrap()).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{}", json);
    }

    #[test]
    fn test_validate_rejects_inconsistent_fields() {
        let mut meta = sample();
        meta.iv = Iv::from_bytes(vec![0u8; 12]);
        assert!(matches!(meta.validate(), Err(Error::CorruptMetadata(_))));

        let mut meta = sample();
        meta.iterations = 0;
        assert!(matches!(meta.validate(), Err(Error::CorruptMetadata(_))));

        let mut meta = sample();
        meta.version = 99;
        assert!(matches!(meta.validate(), Err(Error::CorruptMetadata(_))));

        let mut meta = sample();
        meta.key_size_bits = 100;
        assert!(matches!(meta.validate(), Err(Error::CorruptMetadata(_))));
    }

    #[test]
    fn test_hmac_field_cannot_be_dropped_or_renamed() {
        let json = serde_json::to_string(&sample()).unwrap();
        assert!(json.contains("\"hmac\":"));

        let renamed = json.replace("\"hmac\":", "\"hmab\":");
        assert!(serde_json::from_str::<HeaderMetadata>(&renamed).is_err());

        let at = json.rfind(",\"hmac\":").unwrap();
        let dropped = format!("{}}}", &json[..at]);
        assert!(serde_json::from_str::<HeaderMetadata>(&dropped).is_err());

        // An explicit null is still an untagged container.
        let mut untagged = sample();
        untagged.hmac = None;
        let json = serde_json::to_string(&untagged).unwrap();
        assert!(json.ends_with("\"hmac\":null}"));
        let meta: HeaderMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(meta.hmac, None);
    }

    #[test]
    fn test_parse_rejects_oversized_argon2_cost() {
        let mut meta = sample();
        meta.derivation = DerivationKind::Argon2id {
            memory_kib: 4_000_000_000,
            lanes: 1,
        };
        let text = crate::header::generate(&meta).unwrap();
        assert!(text.contains("\"memory_kib\":4000000000"));

        assert!(matches!(
            crate::header::parse(text.as_bytes()),
            Err(Error::CorruptMetadata(_))
        ));
    }
}
