// src/hash.rs

//! Configurable hashing for file integrity and archive identity
//!
//! Two algorithms are supported:
//! - **SHA-256**: cryptographic, used for per-file checksums, the
//!   aggregate archive checksum, and repository artifact verification
//! - **XXH128**: non-cryptographic, fast; used where only collision
//!   resistance against accidents matters (workspace dedup checks)

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;
use xxhash_rust::xxh3::xxh3_128;

/// Hash algorithm selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HashAlgorithm {
    /// SHA-256, cryptographic. The default for anything that guards
    /// package integrity.
    #[default]
    Sha256,
    /// XXH128, non-cryptographic but very fast.
    Xxh128,
}

impl HashAlgorithm {
    /// Hex string length for this algorithm's output
    #[inline]
    pub const fn hex_len(&self) -> usize {
        match self {
            Self::Sha256 => 64,
            Self::Xxh128 => 32,
        }
    }

    #[inline]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Xxh128 => "xxh128",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(Self::Sha256),
            "xxh128" | "xxhash" | "xxh3" => Ok(Self::Xxh128),
            _ => Err(Error::Validation(format!("unknown hash algorithm: {s}"))),
        }
    }
}

/// Compute the hash of a byte slice as a lowercase hex string
pub fn hash_bytes(algorithm: HashAlgorithm, data: &[u8]) -> String {
    match algorithm {
        HashAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            hasher.update(data);
            format!("{:x}", hasher.finalize())
        }
        HashAlgorithm::Xxh128 => format!("{:032x}", xxh3_128(data)),
    }
}

/// Compute SHA-256 of a byte slice (convenience)
#[inline]
pub fn sha256(data: &[u8]) -> String {
    hash_bytes(HashAlgorithm::Sha256, data)
}

/// Compute the hash of data from a reader, streaming in 8 KiB blocks
pub fn hash_reader<R: Read>(algorithm: HashAlgorithm, reader: &mut R) -> Result<String> {
    match algorithm {
        HashAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            let mut buffer = [0u8; 8192];
            loop {
                let n = reader.read(&mut buffer)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
            }
            Ok(format!("{:x}", hasher.finalize()))
        }
        HashAlgorithm::Xxh128 => {
            // XXH3 has no incremental API here; buffer the input
            let mut data = Vec::new();
            reader.read_to_end(&mut data)?;
            Ok(format!("{:032x}", xxh3_128(&data)))
        }
    }
}

/// Compute the hash of a file without loading it whole into memory
pub fn hash_file(algorithm: HashAlgorithm, path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    hash_reader(algorithm, &mut file)
}

/// Verify a file against an expected hash
pub fn verify_file(path: &Path, expected: &str, algorithm: HashAlgorithm) -> Result<()> {
    let actual = hash_file(algorithm, path)?;
    if actual == expected.to_lowercase() {
        Ok(())
    } else {
        Err(Error::Integrity {
            path: path.display().to_string(),
            expected: expected.to_string(),
            actual,
        })
    }
}

/// Compute the aggregate checksum over (path, per-file-hash) pairs.
///
/// Pairs are sorted by path before hashing, so the result identifies the
/// archive contents independent of internal storage order.
pub fn aggregate(pairs: &[(String, String)]) -> String {
    let mut sorted: Vec<&(String, String)> = pairs.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hasher = Sha256::new();
    for (path, hash) in sorted {
        hasher.update(path.as_bytes());
        hasher.update(b":");
        hasher.update(hash.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}
