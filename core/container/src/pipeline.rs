//! Streaming encrypt-then-MAC pipeline over whole files.
//!
//! Encryption writes `header ‖ ciphertext ‖ tag` to a temporary sibling and
//! renames it over the source. New containers always carry a tag; untagged
//! ones are still read. Decryption verifies the tag over the stored header
//! text and ciphertext before a single plaintext byte is produced, then
//! decrypts from the same open handle to a temporary sibling and renames it
//! over the source.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::config::PipelineConfig;
use crate::header::{self, ParsedHeader};
use crate::metadata::HeaderMetadata;
use crate::progress::ProgressReporter;
use cryptfile_common::{Error, Result};
use cryptfile_crypto::{
    calibrate, Calibrator, CapabilityProvider, CryptoContract, HmacKind, Iv, KeyDerive,
    KeyMaterial, ProtectedSecret, RustCryptoProvider, Salt,
};

/// Keys for one container, taken from a single derived stream.
struct ContainerKeys {
    cipher: KeyMaterial,
    mac: Option<(HmacKind, KeyMaterial)>,
}

/// File-level encryption and decryption.
pub struct CryptoPipeline {
    provider: Arc<dyn CapabilityProvider>,
    calibrator: Calibrator,
    config: PipelineConfig,
}

impl CryptoPipeline {
    /// Pipeline backed by the default provider.
    ///
    /// # Errors
    /// - Any error of [`PipelineConfig::validate`]
    pub fn new(config: PipelineConfig) -> Result<Self> {
        Self::with_provider(Arc::new(RustCryptoProvider::new()), config)
    }

    pub fn with_provider(
        provider: Arc<dyn CapabilityProvider>,
        config: PipelineConfig,
    ) -> Result<Self> {
        config.validate()?;
        debug!(
            provider = provider.name(),
            chunk_size = config.chunk_size,
            "Crypto pipeline configured"
        );
        Ok(Self {
            provider,
            calibrator: Calibrator::new(),
            config,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn provider(&self) -> &dyn CapabilityProvider {
        self.provider.as_ref()
    }

    pub fn calibrator(&self) -> &Calibrator {
        &self.calibrator
    }

    /// Whether the file at `path` starts with a container header.
    pub fn has_header(&self, path: &Path) -> Result<bool> {
        Ok(header::detect(&header::read_prefix(path)?))
    }

    /// Read the header without touching the payload.
    pub fn inspect(&self, path: &Path) -> Result<ParsedHeader> {
        header::read_header(path)
    }

    /// Encrypt the file at `path` in place.
    ///
    /// # Errors
    /// - `InvalidArgument` if `path` is not a regular file or the contract
    ///   has no HMAC kind
    /// - `InvalidKeyLength` if the provider rejects the contract's key size
    /// - `IntegerOverflow` if calibration cannot produce an iteration count
    /// - `Io` on read or write failure; the source is left untouched
    pub fn encrypt_with_header(
        &self,
        path: &Path,
        contract: &CryptoContract,
        secret: &ProtectedSecret,
        progress: &mut ProgressReporter,
    ) -> Result<HeaderMetadata> {
        let source = fs::metadata(path)?;
        if !source.is_file() {
            return Err(Error::InvalidArgument(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        if contract.hmac().is_none() {
            return Err(Error::InvalidArgument(
                "New containers must carry an authentication tag".to_string(),
            ));
        }
        if !self
            .provider
            .valid_key_size(contract.cipher(), contract.key_size_bits())
        {
            return Err(Error::InvalidKeyLength(format!(
                "{} rejects {}-bit {} keys",
                self.provider.name(),
                contract.key_size_bits(),
                contract.cipher()
            )));
        }
        if self.has_header(path)? {
            warn!(path = %path.display(), "File already carries a container header");
        }

        info!(path = %path.display(), "Encrypting file");

        let salt = Salt::generate(self.provider(), contract.salt_size())?;
        let iv = Iv::generate(self.provider(), contract.iv_len())?;
        let iterations = self.iterations_for(contract)?;
        debug!(
            derivation = %contract.derivation(),
            iterations,
            "Deriving container keys"
        );

        let keys = self.derive_keys(contract, secret, &salt, iterations)?;
        let metadata = HeaderMetadata::from_parts(contract, iv, salt, iterations);
        let header_text = header::generate(&metadata)?;
        let total = source.len();

        self.replace_atomically(path, |out| {
            out.write_all(header_text.as_bytes())?;

            let mut mac = match &keys.mac {
                Some((kind, key)) => Some(self.provider.mac(*kind, key.as_bytes())?),
                None => None,
            };
            if let Some(mac) = mac.as_mut() {
                mac.update(header_text.as_bytes());
            }

            let mut cipher = self.provider.encryptor(
                contract.cipher_spec(),
                keys.cipher.as_bytes(),
                metadata.iv.as_bytes(),
            )?;

            let mut ciphertext = Vec::with_capacity(self.config.chunk_size + 16);
            let mut emit = |ciphertext: &[u8], out: &mut BufWriter<File>| -> Result<()> {
                if let Some(mac) = mac.as_mut() {
                    mac.update(ciphertext);
                }
                out.write_all(ciphertext)?;
                Ok(())
            };

            let mut buf = Zeroizing::new(vec![0u8; self.config.chunk_size]);
            let processed = for_each_chunk(File::open(path)?, &mut buf, |chunk, done| {
                ciphertext.clear();
                cipher.update(chunk, &mut ciphertext)?;
                emit(&ciphertext[..], out)?;
                progress.report(done, total);
                Ok(())
            })?;
            if processed == 0 {
                progress.report(0, total);
            }

            ciphertext.clear();
            cipher.finalize(&mut ciphertext)?;
            emit(&ciphertext[..], out)?;

            if let Some(mac) = mac {
                out.write_all(&mac.finalize())?;
            }
            Ok(())
        })?;

        info!(path = %path.display(), bytes = total, "File encrypted");
        Ok(metadata)
    }

    /// Decrypt the container at `path` in place, reading its header first.
    ///
    /// # Errors
    /// - `NotAContainer` if the file has no header
    /// - Any error of [`CryptoPipeline::decrypt_with_header`]
    pub fn decrypt(
        &self,
        path: &Path,
        secret: &ProtectedSecret,
        progress: &mut ProgressReporter,
    ) -> Result<HeaderMetadata> {
        if !self.has_header(path)? {
            return Err(Error::NotAContainer(path.display().to_string()));
        }
        let parsed = header::read_header(path)?;
        self.decrypt_with_header(path, &parsed, secret, progress)?;
        Ok(parsed.metadata)
    }

    /// Decrypt the container at `path` using its already parsed header.
    ///
    /// Keys are re-derived from the stored salt and iteration count. When
    /// the container carries a tag it is checked in constant time before
    /// any output is written.
    ///
    /// # Errors
    /// - `AuthenticationFailed` on a wrong password, a tag mismatch, a
    ///   truncated payload or bad padding; the source is left untouched
    pub fn decrypt_with_header(
        &self,
        path: &Path,
        parsed: &ParsedHeader,
        secret: &ProtectedSecret,
        progress: &mut ProgressReporter,
    ) -> Result<()> {
        let mut source = File::open(path)?;
        self.decrypt_source(path, &mut source, parsed, secret, progress)
    }

    /// Both passes read `source`, so the bytes decrypted are the bytes
    /// whose tag was checked.
    fn decrypt_source(
        &self,
        path: &Path,
        source: &mut File,
        parsed: &ParsedHeader,
        secret: &ProtectedSecret,
        progress: &mut ProgressReporter,
    ) -> Result<()> {
        let metadata = &parsed.metadata;
        let contract = metadata.to_contract()?;
        let block_len = contract.block_size_bits() as u64 / 8;

        let file_len = source.metadata()?.len();
        let tag_len = metadata.hmac.map(|kind| kind.output_len()).unwrap_or(0) as u64;
        let body_start = parsed.header_len as u64;
        let body_len = file_len
            .checked_sub(body_start + tag_len)
            .filter(|len| *len > 0 && len % block_len == 0)
            .ok_or(Error::AuthenticationFailed)?;

        info!(path = %path.display(), "Decrypting file");

        let keys = self.derive_keys(&contract, secret, &metadata.salt, metadata.iterations)?;
        let total = if keys.mac.is_some() {
            body_len * 2
        } else {
            body_len
        };
        let mut buf = Zeroizing::new(vec![0u8; self.config.chunk_size]);

        let mut verified = 0;
        match &keys.mac {
            Some((kind, key)) => {
                self.verify_tag(
                    path, source, parsed, *kind, key, body_len, &mut buf, progress,
                )?;
                verified = body_len;
            }
            None => warn!(path = %path.display(), "Container has no tag, skipping verification"),
        }

        self.replace_atomically(path, |out| {
            let mut cipher = self.provider.decryptor(
                contract.cipher_spec(),
                keys.cipher.as_bytes(),
                metadata.iv.as_bytes(),
            )?;

            source.seek(SeekFrom::Start(body_start))?;

            let mut plaintext = Zeroizing::new(Vec::with_capacity(self.config.chunk_size));
            for_each_chunk((&mut *source).take(body_len), &mut buf, |chunk, done| {
                plaintext.clear();
                cipher.update(chunk, &mut plaintext)?;
                out.write_all(&plaintext)?;
                progress.report(verified + done, total);
                Ok(())
            })?;

            plaintext.clear();
            cipher.finalize(&mut plaintext)?;
            out.write_all(&plaintext)?;
            Ok(())
        })?;

        info!(path = %path.display(), bytes = body_len, "File decrypted");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn verify_tag(
        &self,
        path: &Path,
        source: &mut File,
        parsed: &ParsedHeader,
        kind: HmacKind,
        key: &KeyMaterial,
        body_len: u64,
        buf: &mut [u8],
        progress: &mut ProgressReporter,
    ) -> Result<()> {
        let total = body_len * 2;
        let mut mac = self.provider.mac(kind, key.as_bytes())?;

        source.seek(SeekFrom::Start(parsed.bom_len() as u64))?;
        let mut header_text = vec![0u8; parsed.text_len()];
        source.read_exact(&mut header_text)?;
        mac.update(&header_text);

        for_each_chunk((&mut *source).take(body_len), buf, |chunk, done| {
            mac.update(chunk);
            progress.report(done, total);
            Ok(())
        })?;

        let mut stored = vec![0u8; kind.output_len()];
        source.read_exact(&mut stored)?;

        let expected = mac.finalize();
        if !bool::from(expected.as_slice().ct_eq(stored.as_slice())) {
            warn!(path = %path.display(), "Container tag mismatch");
            return Err(Error::AuthenticationFailed);
        }
        debug!(path = %path.display(), "Container tag verified");
        Ok(())
    }

    fn iterations_for(&self, contract: &CryptoContract) -> Result<u32> {
        if self.config.cache_calibration {
            self.calibrator
                .iterations(contract.derivation(), contract.target_derivation())
        } else {
            calibrate(contract.derivation(), contract.target_derivation())
        }
    }

    /// Cipher key first, then the MAC key from the same stream.
    fn derive_keys(
        &self,
        contract: &CryptoContract,
        secret: &ProtectedSecret,
        salt: &Salt,
        iterations: u32,
    ) -> Result<ContainerKeys> {
        let mut kdf = KeyDerive::new(contract.derivation());
        kdf.configure(secret, salt, iterations)?;

        let cipher = kdf.get_bytes(contract.key_len())?;
        let mac = match contract.hmac() {
            Some(kind) => Some((kind, kdf.get_bytes(kind.key_len())?)),
            None => None,
        };
        Ok(ContainerKeys { cipher, mac })
    }

    /// Write a replacement for `target` next to it and rename it into place.
    ///
    /// The temporary file is removed if `write` fails. The parent directory
    /// is synced after the rename.
    fn replace_atomically<F>(&self, target: &Path, write: F) -> Result<()>
    where
        F: FnOnce(&mut BufWriter<File>) -> Result<()>,
    {
        let temp = temp_sibling(target)?;
        let result = (|| -> Result<()> {
            let file = OpenOptions::new().write(true).create_new(true).open(&temp)?;
            let mut out = BufWriter::new(file);
            write(&mut out)?;
            out.flush()?;
            let file = out.into_inner().map_err(|e| Error::Io(e.into_error()))?;
            file.sync_all()?;
            drop(file);

            fs::set_permissions(&temp, fs::metadata(target)?.permissions())?;
            fs::rename(&temp, target)?;
            Ok(())
        })();

        if result.is_err() {
            if let Err(e) = fs::remove_file(&temp) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %temp.display(), error = %e, "Failed to remove temporary file");
                }
            }
        }
        result?;
        sync_parent_dir(target)
    }
}

/// Flush the directory entry of `path` to disk.
#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    File::open(parent)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> Result<()> {
    Ok(())
}

/// `.<name>.<uuid>.tmp` in the same directory as `target`.
fn temp_sibling(target: &Path) -> Result<PathBuf> {
    let name = target
        .file_name()
        .ok_or_else(|| Error::InvalidArgument(format!("{} has no file name", target.display())))?;
    let temp_name = format!(
        ".{}.{}.tmp",
        name.to_string_lossy(),
        uuid::Uuid::new_v4().simple()
    );
    Ok(target.with_file_name(temp_name))
}

/// Fill `buf` from `reader`, stopping early only at end of input.
fn read_chunk<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

/// Feed `reader` to `f` one full chunk at a time.
///
/// `f` receives the chunk and the byte count consumed so far including it.
/// Returns the total byte count.
fn for_each_chunk<R, F>(mut reader: R, buf: &mut [u8], mut f: F) -> Result<u64>
where
    R: Read,
    F: FnMut(&[u8], u64) -> Result<()>,
{
    let mut done = 0u64;
    loop {
        let n = read_chunk(&mut reader, buf)?;
        if n == 0 {
            return Ok(done);
        }
        done += n as u64;
        f(&buf[..n], done)?;
        if n < buf.len() {
            return Ok(done);
        }
    }
}
