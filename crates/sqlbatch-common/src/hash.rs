//! Content hashing for ledgers
//!
//! SHA-256, hex encoded. The run ledger fingerprints SQL text with it and the
//! load history fingerprints partition files.

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// Hash raw bytes
pub fn hash_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Hash a UTF-8 string, e.g. the text of a query definition
pub fn hash_text(text: &str) -> String {
    hash_bytes(text.as_bytes())
}

/// Hash any readable source without loading it into memory
pub fn hash_reader<R: Read>(reader: &mut R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Hash a file on disk
pub fn hash_file(path: impl AsRef<Path>) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    hash_reader(&mut file)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use tempfile::NamedTempFile;

    #[test]
    fn test_hash_text_known_value() {
        assert_eq!(
            hash_text("hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_hash_reader_matches_bytes() {
        let data = b"select * from dual";
        let mut cursor = Cursor::new(data);
        assert_eq!(hash_reader(&mut cursor).unwrap(), hash_bytes(data));
    }

    #[test]
    fn test_hash_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"test data").unwrap();
        temp_file.flush().unwrap();

        assert_eq!(
            hash_file(temp_file.path()).unwrap(),
            "916f0027a575074ce72a331777c3478d6513f786a591bd892da1a577bf2335f9"
        );
    }

    #[test]
    fn test_hash_changes_with_whitespace() {
        assert_ne!(hash_text("select 1"), hash_text("select 1 "));
    }
}
