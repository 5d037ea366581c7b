//! Content fingerprints.
//!
//! Files are identified by a hex-encoded cryptographic digest of their bytes.
//! SPECs historically declare `sha1sum`; `sha256sum` is accepted as well. The
//! hasher streams the file in fixed-size chunks and never caches results.

use std::collections::BTreeSet;
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use serde::Serialize;
use sha1::Sha1;
use sha2::{Digest, Sha256};

const CHUNK_SIZE: usize = 64 * 1024;

/// Digest algorithm behind a fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
}

impl HashAlgorithm {
    /// The SPEC input field that carries a digest of this algorithm.
    pub fn field_name(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha1 => "sha1sum",
            HashAlgorithm::Sha256 => "sha256sum",
        }
    }

    fn hex_len(&self) -> usize {
        match self {
            HashAlgorithm::Sha1 => 40,
            HashAlgorithm::Sha256 => 64,
        }
    }
}

/// A content fingerprint: algorithm plus lowercase hex digest.
///
/// Cache entries are named by [`Fingerprint::as_str`] alone; the algorithm is
/// implied by the digest length.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Fingerprint {
    algorithm: HashAlgorithm,
    hex: String,
}

impl Fingerprint {
    pub fn new(algorithm: HashAlgorithm, hex: impl AsRef<str>) -> Self {
        Self {
            algorithm,
            hex: hex.as_ref().trim().to_ascii_lowercase(),
        }
    }

    /// Infers the algorithm from a bare hex digest, as found in cache entry names.
    pub fn from_hex(hex: &str) -> Option<Self> {
        let hex = hex.trim();
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        [HashAlgorithm::Sha1, HashAlgorithm::Sha256]
            .into_iter()
            .find(|alg| alg.hex_len() == hex.len())
            .map(|alg| Self::new(alg, hex))
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn as_str(&self) -> &str {
        &self.hex
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex)
    }
}

enum Hasher {
    Sha1(Sha1),
    Sha256(Sha256),
}

impl Hasher {
    fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Sha1 => Hasher::Sha1(Sha1::new()),
            HashAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
        }
    }

    fn update(&mut self, chunk: &[u8]) {
        match self {
            Hasher::Sha1(h) => h.update(chunk),
            Hasher::Sha256(h) => h.update(chunk),
        }
    }

    fn finish(self) -> Fingerprint {
        match self {
            Hasher::Sha1(h) => Fingerprint::new(HashAlgorithm::Sha1, to_hex(&h.finalize())),
            Hasher::Sha256(h) => Fingerprint::new(HashAlgorithm::Sha256, to_hex(&h.finalize())),
        }
    }
}

fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

/// Fingerprints a file with a single algorithm.
pub fn hash_file(path: &Path, algorithm: HashAlgorithm) -> io::Result<Fingerprint> {
    let mut digests = hash_file_with(path, &BTreeSet::from([algorithm]))?;
    digests
        .pop()
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "no digest produced"))
}

/// Fingerprints a file with every requested algorithm in one pass over its bytes.
pub fn hash_file_with(
    path: &Path,
    algorithms: &BTreeSet<HashAlgorithm>,
) -> io::Result<Vec<Fingerprint>> {
    let mut file = File::open(path)?;
    let mut hashers: Vec<Hasher> = algorithms.iter().map(|a| Hasher::new(*a)).collect();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        for hasher in &mut hashers {
            hasher.update(&buf[..n]);
        }
    }
    Ok(hashers.into_iter().map(Hasher::finish).collect())
}
