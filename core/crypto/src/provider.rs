//! Capability provider: the seam between cryptfile and concrete primitives.
//!
//! The pipeline only ever talks to [`CapabilityProvider`]; swapping the
//! cipher library means providing another implementation of this trait.

use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use sha2::{Sha256, Sha384, Sha512};

use crate::contract::{CipherKind, CipherMode, CipherSpec, HmacKind, PaddingKind};
use crate::stream::{CbcDecryptStream, CbcEncryptStream};
use cryptfile_common::{Error, Result};

/// Incremental cipher transform.
pub trait CipherTransform: Send {
    /// Transform `input`, appending whatever output is ready to `out`.
    fn update(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<()>;

    /// Flush buffered state (padding) into `out`.
    fn finalize(self: Box<Self>, out: &mut Vec<u8>) -> Result<()>;
}

/// Incremental keyed hash.
pub trait MacTransform: Send {
    fn update(&mut self, data: &[u8]);

    fn finalize(self: Box<Self>) -> Vec<u8>;
}

/// Supplier of cipher, keyed-hash and randomness primitives.
pub trait CapabilityProvider: Send + Sync {
    /// Short identifier for logs.
    fn name(&self) -> &'static str;

    /// Whether `bits` is a usable key size for `cipher`.
    fn valid_key_size(&self, cipher: CipherKind, bits: u32) -> bool;

    /// Build a streaming encryptor.
    fn encryptor(&self, spec: CipherSpec, key: &[u8], iv: &[u8])
        -> Result<Box<dyn CipherTransform>>;

    /// Build a streaming decryptor.
    fn decryptor(&self, spec: CipherSpec, key: &[u8], iv: &[u8])
        -> Result<Box<dyn CipherTransform>>;

    /// Build a streaming keyed hash.
    fn mac(&self, kind: HmacKind, key: &[u8]) -> Result<Box<dyn MacTransform>>;

    /// Fill `buf` from a cryptographically secure source.
    fn secure_random(&self, buf: &mut [u8]) -> Result<()>;

    /// Encrypt a complete buffer.
    fn encrypt(&self, spec: CipherSpec, data: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
        let mut transform = self.encryptor(spec, key, iv)?;
        let mut out = Vec::with_capacity(data.len() + iv.len());
        transform.update(data, &mut out)?;
        transform.finalize(&mut out)?;
        Ok(out)
    }

    /// Decrypt a complete buffer.
    fn decrypt(&self, spec: CipherSpec, data: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
        let mut transform = self.decryptor(spec, key, iv)?;
        let mut out = Vec::with_capacity(data.len());
        transform.update(data, &mut out)?;
        transform.finalize(&mut out)?;
        Ok(out)
    }

    /// Keyed hash of a complete buffer.
    fn hmac(&self, kind: HmacKind, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        let mut mac = self.mac(kind, key)?;
        mac.update(data);
        Ok(mac.finalize())
    }
}

struct HmacStream<M>(M);

impl<M: Mac + Send> MacTransform for HmacStream<M> {
    fn update(&mut self, data: &[u8]) {
        Mac::update(&mut self.0, data);
    }

    fn finalize(self: Box<Self>) -> Vec<u8> {
        self.0.finalize().into_bytes().to_vec()
    }
}

fn new_hmac<M>(key: &[u8]) -> Result<Box<dyn MacTransform>>
where
    M: Mac + hmac::digest::KeyInit + Send + 'static,
{
    let mac = <M as Mac>::new_from_slice(key)
        .map_err(|e| Error::InvalidKeyLength(format!("HMAC key rejected: {}", e)))?;
    Ok(Box::new(HmacStream(mac)))
}

/// Default provider backed by the RustCrypto crates and the OS RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct RustCryptoProvider;

impl RustCryptoProvider {
    pub fn new() -> Self {
        Self
    }

    fn check(&self, spec: CipherSpec, key: &[u8]) -> Result<()> {
        // Only the AES/CBC/PKCS7 triple exists today; the match keeps new
        // variants from slipping through unhandled.
        match (spec.cipher, spec.mode, spec.padding) {
            (CipherKind::Aes, CipherMode::Cbc, PaddingKind::Pkcs7) => {}
        }
        let bits = (key.len() * 8) as u32;
        if !self.valid_key_size(spec.cipher, bits) {
            return Err(Error::InvalidKeyLength(format!(
                "Invalid key length of {}",
                bits
            )));
        }
        Ok(())
    }
}

impl CapabilityProvider for RustCryptoProvider {
    fn name(&self) -> &'static str {
        "rustcrypto"
    }

    fn valid_key_size(&self, cipher: CipherKind, bits: u32) -> bool {
        cipher.is_valid_key_size(bits)
    }

    fn encryptor(
        &self,
        spec: CipherSpec,
        key: &[u8],
        iv: &[u8],
    ) -> Result<Box<dyn CipherTransform>> {
        self.check(spec, key)?;
        Ok(Box::new(CbcEncryptStream::new(key, iv)?))
    }

    fn decryptor(
        &self,
        spec: CipherSpec,
        key: &[u8],
        iv: &[u8],
    ) -> Result<Box<dyn CipherTransform>> {
        self.check(spec, key)?;
        Ok(Box::new(CbcDecryptStream::new(key, iv)?))
    }

    fn mac(&self, kind: HmacKind, key: &[u8]) -> Result<Box<dyn MacTransform>> {
        match kind {
            HmacKind::Sha256 => new_hmac::<Hmac<Sha256>>(key),
            HmacKind::Sha384 => new_hmac::<Hmac<Sha384>>(key),
            HmacKind::Sha512 => new_hmac::<Hmac<Sha512>>(key),
        }
    }

    fn secure_random(&self, buf: &mut [u8]) -> Result<()> {
        OsRng
            .try_fill_bytes(buf)
            .map_err(|e| Error::Io(std::io::Error::other(format!("OS random generator unavailable: {}", e))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let provider = RustCryptoProvider::new();
        let key = [42u8; 32];
        let iv = [1u8; 16];
        let plaintext = b"Hello, World!";

        let ct = provider
            .encrypt(CipherSpec::default(), plaintext, &key, &iv)
            .unwrap();
        assert_eq!(ct.len(), 16);
        let pt = provider.decrypt(CipherSpec::default(), &ct, &key, &iv).unwrap();
        assert_eq!(pt, plaintext);
    }

    #[test]
    fn test_wrong_key_fails_or_differs() {
        let provider = RustCryptoProvider::new();
        let iv = [1u8; 16];
        let ct = provider
            .encrypt(CipherSpec::default(), b"Secret data", &[1u8; 32], &iv)
            .unwrap();

        match provider.decrypt(CipherSpec::default(), &ct, &[2u8; 32], &iv) {
            Ok(pt) => assert_ne!(pt, b"Secret data"),
            Err(e) => assert!(matches!(e, Error::AuthenticationFailed)),
        }
    }

    #[test]
    fn test_invalid_key_length() {
        let provider = RustCryptoProvider::new();
        let result = provider.encrypt(CipherSpec::default(), b"data", &[0u8; 15], &[0u8; 16]);
        assert!(matches!(result, Err(Error::InvalidKeyLength(_))));
        assert!(!provider.valid_key_size(CipherKind::Aes, 120));
        assert!(provider.valid_key_size(CipherKind::Aes, 192));
    }

    #[test]
    fn test_hmac_lengths_and_determinism() {
        let provider = RustCryptoProvider::new();
        for kind in [HmacKind::Sha256, HmacKind::Sha384, HmacKind::Sha512] {
            let a = provider.hmac(kind, b"key", b"data").unwrap();
            let b = provider.hmac(kind, b"key", b"data").unwrap();
            assert_eq!(a.len(), kind.output_len());
            assert_eq!(a, b);
            assert_ne!(a, provider.hmac(kind, b"other", b"data").unwrap());
        }
    }

    #[test]
    fn test_hmac_incremental_matches_one_shot() {
        let provider = RustCryptoProvider::new();
        let mut mac = provider.mac(HmacKind::Sha256, b"key").unwrap();
        mac.update(b"hello ");
        mac.update(b"world");
        assert_eq!(
            mac.finalize(),
            provider.hmac(HmacKind::Sha256, b"key", b"hello world").unwrap()
        );
    }

    #[test]
    fn test_secure_random_fills() {
        let provider = RustCryptoProvider::new();
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        provider.secure_random(&mut a).unwrap();
        provider.secure_random(&mut b).unwrap();
        assert_ne!(a, b);
    }
}
