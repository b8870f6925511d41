//! Content digests for backup files.
//!
//! A digest is always rendered with its algorithm tag (`sha256:<hex>`,
//! `blake3:<hex>`). Recorded digests are re-derived with the algorithm named
//! in their tag, so changing the configured algorithm never invalidates
//! historical backups. A tag this build does not know is reported as
//! [`Verification::Unverifiable`], not as a mismatch.

use crate::error::{io_at, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::str::FromStr;

/// Buffer size for streaming reads (64KB)
const BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    #[default]
    Sha256,
    Blake3,
}

impl DigestAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Blake3 => "blake3",
        }
    }
}

impl FromStr for DigestAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(Self::Sha256),
            "blake3" => Ok(Self::Blake3),
            other => Err(format!("unknown digest algorithm '{other}'")),
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tagged content digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    pub algorithm: DigestAlgorithm,
    pub hex: String,
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl FromStr for Checksum {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (tag, hex) = s
            .split_once(':')
            .ok_or_else(|| format!("digest '{s}' has no algorithm tag"))?;
        let algorithm = tag.parse::<DigestAlgorithm>()?;
        if hex.is_empty() || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(format!("digest '{s}' is not hex encoded"));
        }
        Ok(Self {
            algorithm,
            hex: hex.to_ascii_lowercase(),
        })
    }
}

/// Outcome of checking a file against a recorded digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Verification {
    Verified,
    Mismatch { expected: String, actual: String },
    Unverifiable { reason: String },
}

impl Verification {
    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Verified)
    }
}

/// Computes and compares digests with a configured algorithm.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChecksumVerifier {
    algorithm: DigestAlgorithm,
}

impl ChecksumVerifier {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        Self { algorithm }
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// Digest `path` with the configured algorithm.
    pub fn digest(&self, path: &Path) -> Result<Checksum> {
        digest_with(self.algorithm, path)
    }

    /// Recompute the digest of `path` with the algorithm of `expected` and
    /// compare. A mismatch is `Ok(false)`; only I/O failures are errors.
    pub fn verify(&self, path: &Path, expected: &Checksum) -> Result<bool> {
        let actual = digest_with(expected.algorithm, path)?;
        Ok(actual.hex == expected.hex)
    }

    /// Check `path` against a recorded, possibly absent or foreign, digest tag.
    pub fn check_recorded(&self, path: &Path, recorded: Option<&str>) -> Verification {
        let Some(recorded) = recorded else {
            return Verification::Unverifiable {
                reason: "no digest was recorded for this backup".into(),
            };
        };
        let expected = match recorded.parse::<Checksum>() {
            Ok(c) => c,
            Err(reason) => return Verification::Unverifiable { reason },
        };
        match digest_with(expected.algorithm, path) {
            Ok(actual) if actual.hex == expected.hex => Verification::Verified,
            Ok(actual) => Verification::Mismatch {
                expected: expected.to_string(),
                actual: actual.to_string(),
            },
            Err(e) => Verification::Unverifiable {
                reason: e.to_string(),
            },
        }
    }
}

/// Stream `path` through `algorithm`.
pub fn digest_with(algorithm: DigestAlgorithm, path: &Path) -> Result<Checksum> {
    let file = File::open(path).map_err(io_at(path))?;
    let mut reader = BufReader::with_capacity(BUFFER_SIZE, file);
    let mut buffer = vec![0u8; BUFFER_SIZE];

    let hex = match algorithm {
        DigestAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            loop {
                let n = reader.read(&mut buffer).map_err(io_at(path))?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
            }
            hex::encode(hasher.finalize())
        }
        DigestAlgorithm::Blake3 => {
            let mut hasher = blake3::Hasher::new();
            loop {
                let n = reader.read(&mut buffer).map_err(io_at(path))?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
            }
            hasher.finalize().to_hex().to_string()
        }
    };

    Ok(Checksum { algorithm, hex })
}
