// src/hash.rs

//! Checksums for buildcache blobs and DAG hashes for specs
//!
//! Blob identity on a mirror is `(checksum algorithm, checksum)`; this module
//! owns the algorithm names that appear in manifests and the streaming
//! hasher used to checksum tarballs without loading them into memory.
//!
//! | Use | Algorithm |
//! |-----|-----------|
//! | Blob checksums (manifests, legacy spec files) | SHA-256 (default) or SHA-512 |
//! | DAG hashes | first 32 hex characters of SHA-256 |

use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;

/// Length of a DAG hash in characters
pub const DAG_HASH_LEN: usize = 32;

/// Hash algorithm selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HashAlgorithm {
    /// SHA-256, the algorithm every mirror writes today
    #[default]
    Sha256,

    /// SHA-512, accepted when reading manifests produced elsewhere
    Sha512,
}

impl HashAlgorithm {
    /// Get the hash output length in bytes
    #[inline]
    pub const fn output_len(&self) -> usize {
        match self {
            Self::Sha256 => 32,
            Self::Sha512 => 64,
        }
    }

    /// Get the hash output length as a hex string
    #[inline]
    pub const fn hex_len(&self) -> usize {
        self.output_len() * 2
    }

    /// Name as written in manifests (`checksumAlgorithm`)
    #[inline]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(Self::Sha256),
            "sha512" | "sha-512" => Ok(Self::Sha512),
            _ => Err(HashError::UnknownAlgorithm(s.to_string())),
        }
    }
}

/// Hash computation errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashError {
    /// Unknown hash algorithm name
    UnknownAlgorithm(String),
    /// Hash string has wrong length for algorithm
    InvalidLength { expected: usize, got: usize },
    /// Hash string contains invalid hex characters
    InvalidHex(String),
}

impl fmt::Display for HashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownAlgorithm(name) => write!(f, "unknown hash algorithm: {}", name),
            Self::InvalidLength { expected, got } => {
                write!(f, "invalid hash length: expected {}, got {}", expected, got)
            }
            Self::InvalidHex(s) => write!(f, "invalid hex in hash: {}", s),
        }
    }
}

impl std::error::Error for HashError {}

/// Check that `value` is a well-formed digest for `algorithm`
pub fn validate_checksum(algorithm: HashAlgorithm, value: &str) -> Result<(), HashError> {
    if value.len() != algorithm.hex_len() {
        return Err(HashError::InvalidLength {
            expected: algorithm.hex_len(),
            got: value.len(),
        });
    }
    if !value.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(HashError::InvalidHex(value.to_string()));
    }
    Ok(())
}

/// Hasher that can compute hashes using any supported algorithm
pub struct Hasher {
    algorithm: HashAlgorithm,
    state: HasherState,
}

enum HasherState {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    /// Create a new hasher with the specified algorithm
    pub fn new(algorithm: HashAlgorithm) -> Self {
        let state = match algorithm {
            HashAlgorithm::Sha256 => HasherState::Sha256(Sha256::new()),
            HashAlgorithm::Sha512 => HasherState::Sha512(Sha512::new()),
        };
        Self { algorithm, state }
    }

    /// Update the hasher with more data
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            HasherState::Sha256(hasher) => hasher.update(data),
            HasherState::Sha512(hasher) => hasher.update(data),
        }
    }

    /// Finalize and return the lowercase hex digest
    pub fn finalize(self) -> String {
        match self.state {
            HasherState::Sha256(hasher) => hex::encode(hasher.finalize()),
            HasherState::Sha512(hasher) => hex::encode(hasher.finalize()),
        }
    }

    /// Get the algorithm being used
    #[inline]
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }
}

/// Compute hash of a byte slice
pub fn hash_bytes(algorithm: HashAlgorithm, data: &[u8]) -> String {
    let mut hasher = Hasher::new(algorithm);
    hasher.update(data);
    hasher.finalize()
}

/// Compute hash of data from a reader
pub fn hash_reader<R: Read>(algorithm: HashAlgorithm, reader: &mut R) -> io::Result<String> {
    let mut hasher = Hasher::new(algorithm);
    let mut buffer = [0u8; 64 * 1024];

    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finalize())
}

/// Checksum a file, streaming its content
pub fn checksum_file(algorithm: HashAlgorithm, path: &Path) -> io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    hash_reader(algorithm, &mut file)
}

/// Compute SHA-256 hash
#[inline]
pub fn sha256(data: &[u8]) -> String {
    hash_bytes(HashAlgorithm::Sha256, data)
}

/// DAG hash of canonical node content
pub fn dag_hash(canonical: &[u8]) -> String {
    let mut digest = sha256(canonical);
    digest.truncate(DAG_HASH_LEN);
    digest
}

/// Whether a string looks like a DAG hash
pub fn is_dag_hash(s: &str) -> bool {
    s.len() == DAG_HASH_LEN
        && s
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hash() {
        let hash = hash_bytes(HashAlgorithm::Sha256, b"Hello, World!");
        assert_eq!(
            hash,
            "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f"
        );
    }

    #[test]
    fn test_sha512_length() {
        let hash = hash_bytes(HashAlgorithm::Sha512, b"Hello, World!");
        assert_eq!(hash.len(), HashAlgorithm::Sha512.hex_len());
    }

    #[test]
    fn test_streaming_matches_oneshot() {
        let data = vec![7u8; 200_000];
        let streamed = hash_reader(HashAlgorithm::Sha256, &mut data.as_slice()).unwrap();
        assert_eq!(streamed, sha256(&data));
    }

    #[test]
    fn test_checksum_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, b"Hello, World!").unwrap();
        assert_eq!(
            checksum_file(HashAlgorithm::Sha256, &path).unwrap(),
            sha256(b"Hello, World!")
        );
    }

    #[test]
    fn test_algorithm_parse() {
        assert_eq!("SHA256".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha256);
        assert_eq!("sha-512".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha512);
        assert!("md5".parse::<HashAlgorithm>().is_err());
    }

    #[test]
    fn test_validate_checksum() {
        let good = sha256(b"x");
        assert!(validate_checksum(HashAlgorithm::Sha256, &good).is_ok());
        assert_eq!(
            validate_checksum(HashAlgorithm::Sha256, "abc"),
            Err(HashError::InvalidLength { expected: 64, got: 3 })
        );
        let bad = "z".repeat(64);
        assert!(matches!(
            validate_checksum(HashAlgorithm::Sha256, &bad),
            Err(HashError::InvalidHex(_))
        ));
    }

    #[test]
    fn test_dag_hash_shape() {
        let h = dag_hash(b"{\"name\":\"zlib\"}");
        assert_eq!(h.len(), DAG_HASH_LEN);
        assert!(is_dag_hash(&h));
        assert!(!is_dag_hash("ABC"));
    }
}
