//! Checksum computation for the in-process verification pass.
//!
//! This module provides:
//! - Several checksum algorithms (MD5, SHA-256, BLAKE3)
//! - Streaming file checksums
//! - Source/destination content comparison

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::EngineError;

/// Supported checksum algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    /// MD5 (matches what most cloud remotes report)
    Md5,
    /// SHA-256 (cryptographic, 256-bit)
    Sha256,
    /// BLAKE3 (modern, fast, 256-bit)
    Blake3,
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Md5 => write!(f, "md5"),
            Self::Sha256 => write!(f, "sha256"),
            Self::Blake3 => write!(f, "blake3"),
        }
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "md5" => Ok(Self::Md5),
            "sha256" => Ok(Self::Sha256),
            "blake3" => Ok(Self::Blake3),
            other => Err(format!("unknown checksum algorithm '{}'", other)),
        }
    }
}

/// A computed checksum value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumValue {
    algorithm: ChecksumAlgorithm,
    hex: String,
}

impl ChecksumValue {
    pub fn new(algorithm: ChecksumAlgorithm, hex: String) -> Self {
        ChecksumValue { algorithm, hex }
    }
}

impl fmt::Display for ChecksumValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

enum Hasher {
    Md5(md5::Context),
    Sha256(sha2::Sha256),
    Blake3(Box<blake3::Hasher>),
}

impl Hasher {
    fn new(algorithm: ChecksumAlgorithm) -> Self {
        match algorithm {
            ChecksumAlgorithm::Md5 => Hasher::Md5(md5::Context::new()),
            ChecksumAlgorithm::Sha256 => Hasher::Sha256(<sha2::Sha256 as sha2::Digest>::new()),
            ChecksumAlgorithm::Blake3 => Hasher::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(ctx) => ctx.consume(data),
            Hasher::Sha256(h) => sha2::Digest::update(h, data),
            Hasher::Blake3(h) => {
                h.update(data);
            }
        }
    }

    fn finalize(self) -> ChecksumValue {
        match self {
            Hasher::Md5(ctx) => {
                ChecksumValue::new(ChecksumAlgorithm::Md5, format!("{:x}", ctx.compute()))
            }
            Hasher::Sha256(h) => ChecksumValue::new(
                ChecksumAlgorithm::Sha256,
                format!("{:x}", sha2::Digest::finalize(h)),
            ),
            Hasher::Blake3(h) => {
                ChecksumValue::new(ChecksumAlgorithm::Blake3, h.finalize().to_hex().to_string())
            }
        }
    }
}

/// Compute the checksum of a file, streaming it in 64 KiB chunks.
pub fn compute_file_checksum(
    path: &Path,
    algorithm: ChecksumAlgorithm,
) -> Result<ChecksumValue, EngineError> {
    let read_error = |source| EngineError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut file = File::open(path).map_err(read_error)?;
    let mut hasher = Hasher::new(algorithm);
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => hasher.update(&buffer[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(read_error(e)),
        }
    }

    Ok(hasher.finalize())
}

/// Compare the content of two files.
///
/// Sizes are compared first so differing files are rejected without hashing.
pub fn files_match(
    source: &Path,
    dest: &Path,
    algorithm: ChecksumAlgorithm,
) -> Result<bool, EngineError> {
    let len = |path: &Path| {
        std::fs::metadata(path)
            .map(|m| m.len())
            .map_err(|source| EngineError::Io {
                path: path.to_path_buf(),
                source,
            })
    };
    if len(source)? != len(dest)? {
        return Ok(false);
    }

    let source_sum = compute_file_checksum(source, algorithm)?;
    let dest_sum = compute_file_checksum(dest, algorithm)?;
    Ok(source_sum == dest_sum)
}
