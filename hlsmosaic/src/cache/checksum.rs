//! SHA-256 checksums for cached assets.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

/// Buffer size for streaming file reads (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// Lowercase hex SHA-256 of an in-memory payload.
pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Lowercase hex SHA-256 of a file's contents, read in 64KB blocks.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or read.
pub fn file_sha256(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Returns true if the file exists and hashes to `expected` (case-insensitive).
pub fn file_matches(path: &Path, expected: &str) -> bool {
    file_sha256(path)
        .map(|actual| actual.eq_ignore_ascii_case(expected))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    const HELLO_WORLD: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";
    const EMPTY: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_sha256_hex() {
        assert_eq!(sha256_hex(b"hello world"), HELLO_WORLD);
        assert_eq!(sha256_hex(b""), EMPTY);
    }

    #[test]
    fn test_file_sha256_matches_in_memory() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("band.tif");
        // Larger than one read buffer.
        let data = vec![0xABu8; 100_000];
        File::create(&path).unwrap().write_all(&data).unwrap();

        assert_eq!(file_sha256(&path).unwrap(), sha256_hex(&data));
    }

    #[test]
    fn test_file_matches() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("a.tif");
        File::create(&path).unwrap().write_all(b"hello world").unwrap();

        assert!(file_matches(&path, HELLO_WORLD));
        assert!(file_matches(&path, &HELLO_WORLD.to_uppercase()));
        assert!(!file_matches(&path, EMPTY));
        assert!(!file_matches(&temp.path().join("missing.tif"), HELLO_WORLD));
    }
}
