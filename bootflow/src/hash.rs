//! # Hash Algorithms and PCR Extension
//!
//! Hash factories keyed by TPM algorithm identifier, plus the fundamental
//! extend operation:
//!
//! `PCR_new = H(PCR_old || measurement)`

use crate::Digest;
use digest::DynDigest;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Sha256, Sha384, Sha512};
use std::fmt;
use std::str::FromStr;

/// Hash algorithms a PCR bank may use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    /// All algorithms this crate can compute
    pub const ALL: [HashAlgorithm; 4] = [
        HashAlgorithm::Sha1,
        HashAlgorithm::Sha256,
        HashAlgorithm::Sha384,
        HashAlgorithm::Sha512,
    ];

    /// TPM_ALG_ID of this algorithm
    pub const fn tpm_alg_id(self) -> u16 {
        match self {
            HashAlgorithm::Sha1 => 0x0004,
            HashAlgorithm::Sha256 => 0x000B,
            HashAlgorithm::Sha384 => 0x000C,
            HashAlgorithm::Sha512 => 0x000D,
        }
    }

    pub fn from_tpm_alg_id(id: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.tpm_alg_id() == id)
    }

    /// Digest size in bytes
    pub const fn digest_size(self) -> usize {
        match self {
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
            HashAlgorithm::Sha512 => 64,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha384 => "sha384",
            HashAlgorithm::Sha512 => "sha512",
        }
    }

    /// Create a streaming hasher
    pub fn hasher(self) -> Box<dyn DynDigest> {
        match self {
            HashAlgorithm::Sha1 => Box::new(Sha1::default()),
            HashAlgorithm::Sha256 => Box::new(Sha256::default()),
            HashAlgorithm::Sha384 => Box::new(Sha384::default()),
            HashAlgorithm::Sha512 => Box::new(Sha512::default()),
        }
    }

    /// Hash a single buffer
    pub fn hash(self, data: &[u8]) -> Digest {
        self.hash_parts([data])
    }

    /// Hash the concatenation of several buffers without copying them
    pub fn hash_parts<'a>(self, parts: impl IntoIterator<Item = &'a [u8]>) -> Digest {
        let mut hasher = self.hasher();
        for part in parts {
            hasher.update(part);
        }
        Digest(hasher.finalize().into_vec())
    }

    /// Extend a PCR value with a measurement
    ///
    /// PCR_new = H(PCR_old || measurement)
    pub fn extend(self, current: &Digest, measurement: &Digest) -> Digest {
        self.hash_parts([current.as_bytes(), measurement.as_bytes()])
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(['-', '_'], "").as_str() {
            "sha1" => Ok(HashAlgorithm::Sha1),
            "sha256" => Ok(HashAlgorithm::Sha256),
            "sha384" => Ok(HashAlgorithm::Sha384),
            "sha512" => Ok(HashAlgorithm::Sha512),
            other => Err(format!("unknown hash algorithm: {}", other)),
        }
    }
}

/// Constant-time comparison of digests
pub fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_known_vectors() {
        assert_eq!(
            HashAlgorithm::Sha1.hash(b"abc").as_bytes(),
            hex!("a9993e364706816aba3e25717850c26c9cd0d89d")
        );
        assert_eq!(
            HashAlgorithm::Sha256.hash(b"abc").as_bytes(),
            hex!("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
    }

    #[test]
    fn test_digest_sizes_match_output() {
        for algo in HashAlgorithm::ALL {
            assert_eq!(algo.hash(b"x").len(), algo.digest_size());
        }
    }

    #[test]
    fn test_hash_parts_equals_concatenation() {
        let joined = HashAlgorithm::Sha256.hash(b"helloworld");
        let parts = HashAlgorithm::Sha256.hash_parts([&b"hello"[..], &b"world"[..]]);
        assert_eq!(joined, parts);
    }

    #[test]
    fn test_extend_is_order_sensitive() {
        let algo = HashAlgorithm::Sha256;
        let zero = Digest::zero(32);
        let d1 = algo.hash(b"one");
        let d2 = algo.hash(b"two");
        let a = algo.extend(&algo.extend(&zero, &d1), &d2);
        let b = algo.extend(&algo.extend(&zero, &d2), &d1);
        assert_ne!(a, b);
    }

    #[test]
    fn test_tpm_alg_ids() {
        assert_eq!(HashAlgorithm::from_tpm_alg_id(0x000B), Some(HashAlgorithm::Sha256));
        assert_eq!(HashAlgorithm::from_tpm_alg_id(0x0012), None);
        assert_eq!("SHA-256".parse::<HashAlgorithm>(), Ok(HashAlgorithm::Sha256));
    }

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare(b"abc", b"abc"));
        assert!(!constant_time_compare(b"abc", b"abd"));
        assert!(!constant_time_compare(b"abc", b"ab"));
    }
}
