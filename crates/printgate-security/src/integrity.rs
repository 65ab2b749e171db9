// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// SHA-256 fingerprints for spooled documents and IPP token secrets.

use std::io::Read;
use std::path::Path;

use printgate_core::error::PrintgateError;
use ring::rand::{SecureRandom, SystemRandom};
use sha2::{Digest, Sha256};

/// Bytes of entropy in a generated token secret.
const TOKEN_SECRET_BYTES: usize = 32;

/// Compute the SHA-256 hash of `data` and return it as a lowercase hex string.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Hash a file without loading it into memory.
pub fn hash_file(path: impl AsRef<Path>) -> Result<String, PrintgateError> {
    let mut file = std::fs::File::open(path.as_ref())?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Verify that the file at `path` still has the expected SHA-256 hex digest.
pub fn verify_hash(path: impl AsRef<Path>, expected_hex: &str) -> Result<(), PrintgateError> {
    let path = path.as_ref();
    let actual = hash_file(path)?;
    if actual == expected_hex {
        Ok(())
    } else {
        Err(PrintgateError::Spool(format!(
            "{} does not match its recorded digest: expected {expected_hex}, got {actual}",
            path.display()
        )))
    }
}

/// Digest under which an IPP token secret is stored and looked up.
pub fn hash_secret(secret: &str) -> String {
    hash_bytes(secret.as_bytes())
}

/// Generate a fresh token secret (64 hex characters) from the system CSPRNG.
///
/// The caller hands this to the account owner once; only
/// [`hash_secret`] of it is ever persisted.
pub fn generate_token_secret() -> Result<String, PrintgateError> {
    let mut bytes = [0u8; TOKEN_SECRET_BYTES];
    SystemRandom::new()
        .fill(&mut bytes)
        .map_err(|_| PrintgateError::Io(std::io::Error::other("system RNG unavailable")))?;
    Ok(hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// SHA-256 of the empty byte slice (well-known constant).
    const EMPTY_SHA256: &str =
        "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn hash_empty_input() {
        assert_eq!(hash_bytes(b""), EMPTY_SHA256);
    }

    #[test]
    fn hash_known_value() {
        let expected = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
        assert_eq!(hash_bytes(b"hello"), expected);
        assert_eq!(hash_secret("hello"), expected);
    }

    #[test]
    fn file_hash_matches_in_memory_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.bin");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        assert_eq!(hash_file(&path).unwrap(), hash_bytes(&data));
    }

    #[test]
    fn verify_mismatched_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.bin");
        std::fs::write(&path, b"a").unwrap();

        assert!(verify_hash(&path, &hash_bytes(b"a")).is_ok());
        let err = verify_hash(&path, &hash_bytes(b"b")).unwrap_err();
        assert!(matches!(err, PrintgateError::Spool(_)));
        assert!(err.to_string().contains("recorded digest"));
        assert!(matches!(
            verify_hash(dir.path().join("absent.bin"), EMPTY_SHA256),
            Err(PrintgateError::Io(_))
        ));
    }

    #[test]
    fn generated_secrets_are_unique_hex() {
        let a = generate_token_secret().unwrap();
        let b = generate_token_secret().unwrap();
        assert_eq!(a.len(), TOKEN_SECRET_BYTES * 2);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
