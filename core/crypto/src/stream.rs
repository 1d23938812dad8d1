//! Streaming AES-CBC transforms.
//!
//! The transforms accept input in arbitrary windows and keep at most one
//! block of carry-over between calls, so callers can feed a file chunk by
//! chunk without ever holding it whole. Chaining state lives inside the
//! `cbc` encryptor, so consecutive windows produce exactly the ciphertext a
//! single-shot encryption would.

use aes::{Aes128, Aes192, Aes256};
use cbc::cipher::{
    block_padding::{Padding, Pkcs7},
    consts::U16,
    generic_array::GenericArray,
    BlockDecryptMut, BlockEncryptMut, KeyIvInit,
};
use zeroize::Zeroizing;

use crate::provider::CipherTransform;
use cryptfile_common::{Error, Result};

/// AES block length in bytes.
pub const BLOCK_LEN: usize = 16;

type Block = GenericArray<u8, U16>;

fn key_error(key_len: usize) -> Error {
    Error::InvalidKeyLength(format!(
        "AES key must be 16, 24 or 32 bytes, got {}",
        key_len
    ))
}

fn check_iv(iv: &[u8]) -> Result<()> {
    if iv.len() != BLOCK_LEN {
        return Err(Error::InvalidCryptographicProperty(format!(
            "IV length (bits: {}) must be equal to block size length {}",
            iv.len() * 8,
            BLOCK_LEN * 8
        )));
    }
    Ok(())
}

enum CbcEncryptor {
    Aes128(cbc::Encryptor<Aes128>),
    Aes192(cbc::Encryptor<Aes192>),
    Aes256(cbc::Encryptor<Aes256>),
}

impl CbcEncryptor {
    fn new(key: &[u8], iv: &[u8]) -> Result<Self> {
        check_iv(iv)?;
        let cipher = match key.len() {
            16 => cbc::Encryptor::<Aes128>::new_from_slices(key, iv).map(Self::Aes128),
            24 => cbc::Encryptor::<Aes192>::new_from_slices(key, iv).map(Self::Aes192),
            32 => cbc::Encryptor::<Aes256>::new_from_slices(key, iv).map(Self::Aes256),
            n => return Err(key_error(n)),
        };
        cipher.map_err(|_| key_error(key.len()))
    }

    fn encrypt_block(&mut self, block: &mut [u8]) {
        let block: &mut Block = GenericArray::from_mut_slice(block);
        match self {
            Self::Aes128(c) => c.encrypt_block_mut(block),
            Self::Aes192(c) => c.encrypt_block_mut(block),
            Self::Aes256(c) => c.encrypt_block_mut(block),
        }
    }
}

enum CbcDecryptor {
    Aes128(cbc::Decryptor<Aes128>),
    Aes192(cbc::Decryptor<Aes192>),
    Aes256(cbc::Decryptor<Aes256>),
}

impl CbcDecryptor {
    fn new(key: &[u8], iv: &[u8]) -> Result<Self> {
        check_iv(iv)?;
        let cipher = match key.len() {
            16 => cbc::Decryptor::<Aes128>::new_from_slices(key, iv).map(Self::Aes128),
            24 => cbc::Decryptor::<Aes192>::new_from_slices(key, iv).map(Self::Aes192),
            32 => cbc::Decryptor::<Aes256>::new_from_slices(key, iv).map(Self::Aes256),
            n => return Err(key_error(n)),
        };
        cipher.map_err(|_| key_error(key.len()))
    }

    fn decrypt_block(&mut self, block: &mut [u8]) {
        let block: &mut Block = GenericArray::from_mut_slice(block);
        match self {
            Self::Aes128(c) => c.decrypt_block_mut(block),
            Self::Aes192(c) => c.decrypt_block_mut(block),
            Self::Aes256(c) => c.decrypt_block_mut(block),
        }
    }
}

/// AES-CBC encryption with PKCS#7 padding applied on finalize.
pub struct CbcEncryptStream {
    cipher: CbcEncryptor,
    /// Plaintext tail shorter than one block.
    pending: Zeroizing<Vec<u8>>,
}

impl CbcEncryptStream {
    /// Create an encrypting transform.
    ///
    /// # Errors
    /// - `InvalidKeyLength` unless the key is 16, 24 or 32 bytes
    /// - `InvalidCryptographicProperty` unless the IV is one block long
    pub fn new(key: &[u8], iv: &[u8]) -> Result<Self> {
        Ok(Self {
            cipher: CbcEncryptor::new(key, iv)?,
            pending: Zeroizing::new(Vec::with_capacity(BLOCK_LEN)),
        })
    }
}

impl CipherTransform for CbcEncryptStream {
    fn update(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<()> {
        self.pending.extend_from_slice(input);
        let ready = self.pending.len() - self.pending.len() % BLOCK_LEN;
        if ready == 0 {
            return Ok(());
        }

        let start = out.len();
        out.extend_from_slice(&self.pending[..ready]);
        for block in out[start..].chunks_exact_mut(BLOCK_LEN) {
            self.cipher.encrypt_block(block);
        }
        self.pending.drain(..ready);
        Ok(())
    }

    fn finalize(mut self: Box<Self>, out: &mut Vec<u8>) -> Result<()> {
        let used = self.pending.len();
        let mut block = Zeroizing::new([0u8; BLOCK_LEN]);
        block[..used].copy_from_slice(&self.pending);
        <Pkcs7 as Padding<U16>>::pad(GenericArray::from_mut_slice(&mut block[..]), used);
        self.cipher.encrypt_block(&mut block[..]);
        out.extend_from_slice(&block[..]);
        Ok(())
    }
}

/// AES-CBC decryption; the final block is held back until finalize so the
/// padding can be checked and stripped.
pub struct CbcDecryptStream {
    cipher: CbcDecryptor,
    pending: Vec<u8>,
}

impl CbcDecryptStream {
    /// Create a decrypting transform.
    pub fn new(key: &[u8], iv: &[u8]) -> Result<Self> {
        Ok(Self {
            cipher: CbcDecryptor::new(key, iv)?,
            pending: Vec::with_capacity(BLOCK_LEN),
        })
    }
}

impl CipherTransform for CbcDecryptStream {
    fn update(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<()> {
        self.pending.extend_from_slice(input);
        if self.pending.len() <= BLOCK_LEN {
            return Ok(());
        }

        // Keep between 1 and BLOCK_LEN bytes back for finalize.
        let keep = match self.pending.len() % BLOCK_LEN {
            0 => BLOCK_LEN,
            rem => rem,
        };
        let ready = self.pending.len() - keep;

        let start = out.len();
        out.extend_from_slice(&self.pending[..ready]);
        for block in out[start..].chunks_exact_mut(BLOCK_LEN) {
            self.cipher.decrypt_block(block);
        }
        self.pending.drain(..ready);
        Ok(())
    }

    fn finalize(mut self: Box<Self>, out: &mut Vec<u8>) -> Result<()> {
        if self.pending.len() != BLOCK_LEN {
            return Err(Error::AuthenticationFailed);
        }

        let mut block = Zeroizing::new([0u8; BLOCK_LEN]);
        block.copy_from_slice(&self.pending);
        self.cipher.decrypt_block(&mut block[..]);

        let plaintext = <Pkcs7 as Padding<U16>>::unpad(GenericArray::from_slice(&block[..]))
            .map_err(|_| Error::AuthenticationFailed)?;
        out.extend_from_slice(plaintext);
        Ok(())
    }
}
