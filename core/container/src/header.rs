//! Container header codec.
//!
//! Layout: `[optional BOM][START_DELIMITER][metadata JSON][END_DELIMITER]`,
//! followed directly by the ciphertext. The header is plain text so a
//! container can be recognized with any text viewer.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::metadata::HeaderMetadata;
use cryptfile_common::{Error, Result};

/// Marks the start of the header.
pub const START_DELIMITER: &str = "BEGIN ENCRYPTION HEADER STRING";

/// Marks the end of the header.
pub const END_DELIMITER: &str = "END ENCRYPTION HEADER STRING";

/// UTF-8 byte order mark some editors prepend.
pub const BOM: [u8; 3] = [0xEF, 0xBB, 0xBF];

/// Headers never grow beyond this many bytes.
pub const MAX_HEADER_SIZE: usize = 5 * 1024;

/// Result of parsing a header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedHeader {
    pub metadata: HeaderMetadata,
    /// Bytes from the start of the file to the first ciphertext byte.
    pub header_len: usize,
    pub has_bom: bool,
}

impl ParsedHeader {
    /// Length of the header text, excluding any BOM.
    pub fn text_len(&self) -> usize {
        self.header_len - self.bom_len()
    }

    pub fn bom_len(&self) -> usize {
        if self.has_bom {
            BOM.len()
        } else {
            0
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn bom_offset(bytes: &[u8]) -> usize {
    if bytes.starts_with(&BOM) {
        BOM.len()
    } else {
        0
    }
}

/// Locate the metadata blob. Returns `(bom_len, blob_start, blob_end)`.
fn locate(bytes: &[u8]) -> Result<(usize, usize, usize)> {
    let window = &bytes[..bytes.len().min(MAX_HEADER_SIZE)];
    let offset = bom_offset(window);

    if !window[offset..].starts_with(START_DELIMITER.as_bytes()) {
        return Err(Error::CorruptHeader(
            "Start delimiter not found at the beginning of the file".to_string(),
        ));
    }

    let blob_start = offset + START_DELIMITER.len();
    let blob_len = find(&window[blob_start..], END_DELIMITER.as_bytes()).ok_or_else(|| {
        Error::CorruptHeader(format!(
            "End delimiter not found within {} bytes",
            MAX_HEADER_SIZE
        ))
    })?;

    Ok((offset, blob_start, blob_start + blob_len))
}

/// Render the header text for `metadata`.
///
/// Identical metadata always yields identical text.
///
/// # Errors
/// - `InvalidArgument` if the header would exceed [`MAX_HEADER_SIZE`]
pub fn generate(metadata: &HeaderMetadata) -> Result<String> {
    let json = serde_json::to_string(metadata)
        .map_err(|e| Error::CorruptMetadata(format!("Failed to serialize metadata: {}", e)))?;

    let text = format!("{}{}{}", START_DELIMITER, json, END_DELIMITER);
    if text.len() > MAX_HEADER_SIZE {
        return Err(Error::InvalidArgument(format!(
            "Header of {} bytes exceeds the {} byte limit",
            text.len(),
            MAX_HEADER_SIZE
        )));
    }
    Ok(text)
}

/// Parse the header at the start of `bytes`.
///
/// `bytes` may contain trailing ciphertext; only the header is consumed.
///
/// # Errors
/// - `CorruptHeader` if a delimiter is missing or misplaced
/// - `CorruptMetadata` if the blob is not UTF-8, not valid JSON, or
///   describes an inconsistent container
pub fn parse(bytes: &[u8]) -> Result<ParsedHeader> {
    let (bom_len, blob_start, blob_end) = locate(bytes)?;

    let blob = std::str::from_utf8(&bytes[blob_start..blob_end])
        .map_err(|e| Error::CorruptMetadata(format!("Metadata is not UTF-8: {}", e)))?;
    let metadata: HeaderMetadata = serde_json::from_str(blob)
        .map_err(|e| Error::CorruptMetadata(format!("Invalid metadata: {}", e)))?;
    metadata.validate()?;

    Ok(ParsedHeader {
        metadata,
        header_len: blob_end + END_DELIMITER.len(),
        has_bom: bom_len > 0,
    })
}

/// Whether `prefix` starts with a delimited header.
///
/// Only the first [`MAX_HEADER_SIZE`] bytes are inspected. The metadata
/// itself is not validated.
pub fn detect(prefix: &[u8]) -> bool {
    locate(prefix).is_ok()
}

/// Read at most [`MAX_HEADER_SIZE`] bytes from the start of `path`.
pub fn read_prefix(path: &Path) -> Result<Vec<u8>> {
    let file = File::open(path)?;
    let mut prefix = Vec::with_capacity(MAX_HEADER_SIZE);
    file.take(MAX_HEADER_SIZE as u64).read_to_end(&mut prefix)?;
    Ok(prefix)
}

/// Read and parse the header of the file at `path`.
///
/// # Errors
/// - `NotAContainer` if the file has no header
/// - Any error of [`parse`]
pub fn read_header(path: &Path) -> Result<ParsedHeader> {
    let prefix = read_prefix(path)?;
    if !detect(&prefix) {
        return Err(Error::NotAContainer(path.display().to_string()));
    }
    parse(&prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cryptfile_crypto::{CryptoContract, DerivationKind, HmacKind, Iv, Salt};
    use proptest::prelude::*;
    use std::io::Write;

    fn sample() -> HeaderMetadata {
        HeaderMetadata::from_parts(
            &CryptoContract::default(),
            Iv::from_bytes(vec![7u8; 16]),
            Salt::from_bytes(vec![9u8; 16]),
            250_000,
        )
    }

    #[test]
    fn test_generate_is_delimited_and_deterministic() {
        let text = generate(&sample()).unwrap();
        assert!(text.starts_with(START_DELIMITER));
        assert!(text.ends_with(END_DELIMITER));
        assert_eq!(text, generate(&sample()).unwrap());
    }

    #[test]
    fn test_parse_ignores_trailing_ciphertext() {
        let text = generate(&sample()).unwrap();
        let mut bytes = text.as_bytes().to_vec();
        bytes.extend_from_slice(&[0xAB; 64]);

        let parsed = parse(&bytes).unwrap();
        assert_eq!(parsed.metadata, sample());
        assert_eq!(parsed.header_len, text.len());
        assert!(!parsed.has_bom);
    }

    #[test]
    fn test_bom_prefixed_header() {
        let text = generate(&sample()).unwrap();
        let plain = parse(text.as_bytes()).unwrap();

        let mut with_bom = BOM.to_vec();
        with_bom.extend_from_slice(text.as_bytes());
        let bommed = parse(&with_bom).unwrap();

        assert_eq!(bommed.metadata, plain.metadata);
        assert_eq!(bommed.header_len, plain.header_len + 3);
        assert_eq!(bommed.text_len(), plain.text_len());
        assert!(bommed.has_bom);
        assert!(detect(&with_bom));
    }

    #[test]
    fn test_missing_delimiters_are_corrupt_header() {
        let text = generate(&sample()).unwrap();

        let no_end = &text.as_bytes()[..text.len() - 3];
        assert!(matches!(parse(no_end), Err(Error::CorruptHeader(_))));

        let shifted = format!("x{}", text);
        assert!(matches!(
            parse(shifted.as_bytes()),
            Err(Error::CorruptHeader(_))
        ));

        let swapped = format!("{}{{}}{}", END_DELIMITER, START_DELIMITER);
        assert!(matches!(
            parse(swapped.as_bytes()),
            Err(Error::CorruptHeader(_))
        ));
    }

    #[test]
    fn test_bad_blob_is_corrupt_metadata() {
        let not_json = format!("{}not json{}", START_DELIMITER, END_DELIMITER);
        assert!(matches!(
            parse(not_json.as_bytes()),
            Err(Error::CorruptMetadata(_))
        ));

        let mut not_utf8 = START_DELIMITER.as_bytes().to_vec();
        not_utf8.extend_from_slice(&[0xFF, 0xFE]);
        not_utf8.extend_from_slice(END_DELIMITER.as_bytes());
        assert!(matches!(parse(&not_utf8), Err(Error::CorruptMetadata(_))));

        let missing_field = format!("{}{{\"version\":1}}{}", START_DELIMITER, END_DELIMITER);
        assert!(matches!(
            parse(missing_field.as_bytes()),
            Err(Error::CorruptMetadata(_))
        ));
    }

    #[test]
    fn test_detect() {
        assert!(detect(generate(&sample()).unwrap().as_bytes()));
        assert!(!detect(b"just some plaintext"));
        assert!(!detect(b""));
        assert!(!detect(START_DELIMITER.as_bytes()));
    }

    #[test]
    fn test_detect_is_bounded() {
        let mut bytes = START_DELIMITER.as_bytes().to_vec();
        bytes.extend(std::iter::repeat(b' ').take(MAX_HEADER_SIZE));
        bytes.extend_from_slice(END_DELIMITER.as_bytes());
        assert!(!detect(&bytes));
    }

    #[test]
    fn test_read_header_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(generate(&sample()).unwrap().as_bytes()).unwrap();
        file.write_all(&[0u8; 10_000]).unwrap();
        file.flush().unwrap();

        let parsed = read_header(file.path()).unwrap();
        assert_eq!(parsed.metadata, sample());

        let mut plain = tempfile::NamedTempFile::new().unwrap();
        plain.write_all(b"hello").unwrap();
        plain.flush().unwrap();
        assert!(matches!(
            read_header(plain.path()),
            Err(Error::NotAContainer(_))
        ));
    }

    fn arb_metadata() -> impl Strategy<Value = HeaderMetadata> {
        (
            prop::sample::select(vec![128u32, 192, 256]),
            prop::collection::vec(any::<u8>(), 16),
            prop::collection::vec(any::<u8>(), 8..256),
            1u32..,
            prop::option::of(prop::sample::select(vec![
                HmacKind::Sha256,
                HmacKind::Sha384,
                HmacKind::Sha512,
            ])),
            any::<bool>(),
        )
            .prop_map(|(key_bits, iv, salt, iterations, hmac, argon)| {
                let derivation = if argon {
                    DerivationKind::argon2id_default()
                } else {
                    DerivationKind::Pbkdf2Sha256
                };
                let contract = CryptoContract::builder()
                    .with_key_size_bits(key_bits)
                    .with_hmac(hmac)
                    .with_derivation(derivation)
                    .with_salt_size(salt.len())
                    .build()
                    .unwrap();
                HeaderMetadata::from_parts(
                    &contract,
                    Iv::from_bytes(iv),
                    Salt::from_bytes(salt),
                    iterations,
                )
            })
    }

    proptest! {
        #[test]
        fn prop_generate_parse_roundtrip(meta in arb_metadata()) {
            let text = generate(&meta).unwrap();
            let parsed = parse(text.as_bytes()).unwrap();
            prop_assert_eq!(parsed.header_len, text.len());
            prop_assert_eq!(parsed.metadata, meta);
        }
    }
}
