use std::io::Read;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::error::{io_err, Result};

/// `sha256:` + 64 lowercase hex chars. Nothing else is a valid stored hash.
static HASH_FORMAT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^sha256:[a-f0-9]{64}$").expect("hash format regex"));

/// Streaming buffer size for file hashing. Bounds memory for large scans.
const FILE_BUF_BYTES: usize = 64 * 1024;

/// Hash raw bytes into the canonical `sha256:<hex>` form.
pub fn compute_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Hash a string's UTF-8 bytes. No normalization is applied; callers must
/// canonicalize before hashing (see the per-type canonical forms).
pub fn compute_hash_str(text: &str) -> String {
    compute_hash(text.as_bytes())
}

/// Hash a file's raw bytes, streamed in fixed buffers.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path).map_err(io_err(path))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; FILE_BUF_BYTES];
    loop {
        let n = file.read(&mut buf).map_err(io_err(path))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

pub fn is_valid_hash_format(s: &str) -> bool {
    HASH_FORMAT.is_match(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashes_known_vector() {
        // sha256("") is the canonical empty digest.
        assert_eq!(
            compute_hash_str(""),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            compute_hash_str("hello"),
            "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn string_and_byte_hashing_agree() {
        assert_eq!(compute_hash("corpus".as_bytes()), compute_hash_str("corpus"));
    }

    #[test]
    fn file_hash_matches_byte_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.bin");
        let payload = vec![0xABu8; FILE_BUF_BYTES * 2 + 17]; // spans several read buffers
        std::fs::write(&path, &payload).unwrap();
        assert_eq!(hash_file(&path).unwrap(), compute_hash(&payload));
    }

    #[test]
    fn missing_file_is_file_not_found() {
        let err = hash_file(Path::new("/nonexistent/corpus.pdf")).unwrap_err();
        assert_eq!(err.kind(), "FILE_NOT_FOUND");
    }

    #[test]
    fn format_validation_is_strict() {
        assert!(is_valid_hash_format(&compute_hash_str("x")));
        assert!(!is_valid_hash_format("sha256:XYZ"));
        assert!(!is_valid_hash_format("sha256:abc"));
        assert!(!is_valid_hash_format(
            // uppercase hex is rejected
            "sha256:E3B0C44298FC1C149AFBF4C8996FB92427AE41E4649B934CA495991B7852B855"
        ));
        assert!(!is_valid_hash_format("md5:d41d8cd98f00b204e9800998ecf8427e"));
    }
}
