//! SHA-256 digests and published checksum lists.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::bundle::StageError;

/// Compute the hex SHA-256 digest of a file.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub fn sha256_file(path: &Path) -> Result<String, StageError> {
    let mut file = std::fs::File::open(path).map_err(|e| StageError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;

    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(|e| StageError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Parse a `sha256sum`-format list into `file name -> digest`.
///
/// Lines are `<hex digest>  <name>`; the name may carry a leading `./` or
/// directory component, which is stripped.
#[must_use]
pub fn parse_sums(text: &str) -> HashMap<String, String> {
    text.lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let digest = parts.next()?;
            let name = parts.next()?;
            let name = name.rsplit('/').next()?;
            Some((name.to_string(), digest.to_lowercase()))
        })
        .collect()
}

/// Verify a file against the published digest for `name`.
///
/// # Errors
///
/// Returns [`StageError::MissingChecksum`] if the list has no entry and
/// [`StageError::Integrity`] on a digest mismatch.
pub fn verify_against(
    sums: &HashMap<String, String>,
    name: &str,
    path: &Path,
) -> Result<(), StageError> {
    let expected = sums
        .get(name)
        .ok_or_else(|| StageError::MissingChecksum(name.to_string()))?;

    let actual = sha256_file(path)?;
    if &actual == expected {
        Ok(())
    } else {
        Err(StageError::Integrity {
            artifact: name.to_string(),
            expected: expected.clone(),
            actual,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_sha256_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"forge lab").unwrap();

        let digest = sha256_file(file.path()).unwrap();
        assert_eq!(digest.len(), 64);
        // Stable digest of the fixed content.
        assert_eq!(digest, sha256_hex(b"forge lab"));
    }

    fn sha256_hex(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    #[test]
    fn test_parse_sums_strips_directories() {
        let sums = parse_sums(
            "abc123  k3s\n\
             def456  ./k3s-airgap-images-amd64.tar.zst\n\
             malformed-line\n",
        );
        assert_eq!(sums.get("k3s").unwrap(), "abc123");
        assert_eq!(
            sums.get("k3s-airgap-images-amd64.tar.zst").unwrap(),
            "def456"
        );
        assert_eq!(sums.len(), 2);
    }

    #[test]
    fn test_verify_against_mismatch() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"tampered").unwrap();

        let mut sums = HashMap::new();
        sums.insert("k3s".to_string(), sha256_hex(b"genuine"));

        let err = verify_against(&sums, "k3s", file.path()).unwrap_err();
        assert!(matches!(err, StageError::Integrity { .. }));
    }

    #[test]
    fn test_verify_against_match() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"genuine").unwrap();

        let mut sums = HashMap::new();
        sums.insert("k3s".to_string(), sha256_hex(b"genuine"));

        verify_against(&sums, "k3s", file.path()).unwrap();
    }

    #[test]
    fn test_verify_against_missing_entry() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let sums = HashMap::new();
        let err = verify_against(&sums, "k3s", file.path()).unwrap_err();
        assert!(matches!(err, StageError::MissingChecksum(_)));
    }
}
