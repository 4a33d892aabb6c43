//! Content addresses.
//!
//! Every blob in a repository is addressed by a 32-byte message
//! authentication code. Two blobs with the same MAC are assumed
//! byte-identical; the storage layer never recomputes a MAC, it only
//! carries the one it was given.

use std::fmt;
use std::str::FromStr;

use blake2::digest::{Update, VariableOutput};
use blake2::Blake2bVar;
use serde::{Deserialize, Serialize};

/// A 32-byte content address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Mac(pub [u8; 32]);

impl Mac {
    /// Number of bytes in a MAC.
    pub const SIZE: usize = 32;

    /// Computes the keyed MAC of `data` under `key`.
    pub fn compute(key: &[u8], data: &[u8]) -> Self {
        let mut hasher = Blake2bVar::new(Self::SIZE).expect("32 is a valid Blake2b output size");
        hasher.update(key);
        hasher.update(data);
        let mut out = [0u8; Self::SIZE];
        hasher
            .finalize_variable(&mut out)
            .expect("output buffer matches requested size");
        Mac(out)
    }

    /// Returns a cryptographically random MAC, used for lock identifiers
    /// and repository ids.
    pub fn random() -> Self {
        use rand::RngCore;
        let mut out = [0u8; Self::SIZE];
        rand::thread_rng().fill_bytes(&mut out);
        Mac(out)
    }

    /// Raw byte view.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase 64-character hex encoding.
    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(64);
        for b in self.0 {
            s.push_str(&format!("{b:02x}"));
        }
        s
    }

    /// Hex of the first four bytes, for log lines.
    pub fn short(&self) -> String {
        format!(
            "{:02x}{:02x}{:02x}{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }

    /// Parses a 64-character hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 64 || !s.is_ascii() {
            return None;
        }
        let mut out = [0u8; Self::SIZE];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hi = (chunk[0] as char).to_digit(16)?;
            let lo = (chunk[1] as char).to_digit(16)?;
            out[i] = ((hi << 4) | lo) as u8;
        }
        Some(Mac(out))
    }
}

impl fmt::Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mac({})", self.short())
    }
}

impl FromStr for Mac {
    type Err = crate::error::StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Mac::from_hex(s).ok_or_else(|| crate::error::StorageError::InvalidMac {
            value: s.to_string(),
        })
    }
}

impl From<[u8; 32]> for Mac {
    fn from(bytes: [u8; 32]) -> Self {
        Mac(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_round_trip() {
        let mac = Mac::random();
        let hex = mac.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(Mac::from_hex(&hex), Some(mac));
    }

    #[test]
    fn test_from_hex_rejects_bad_input() {
        assert_eq!(Mac::from_hex(""), None);
        assert_eq!(Mac::from_hex("abcd"), None);
        assert_eq!(Mac::from_hex(&"g".repeat(64)), None);
        assert_eq!(Mac::from_hex(&"a".repeat(63)), None);
        assert_eq!(Mac::from_hex(&"a".repeat(65)), None);
    }

    #[test]
    fn test_compute_is_keyed() {
        let a = Mac::compute(b"key-a", b"payload");
        let b = Mac::compute(b"key-b", b"payload");
        let c = Mac::compute(b"key-a", b"payload");
        assert_ne!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn test_compute_differs_by_data() {
        let a = Mac::compute(b"key", b"one");
        let b = Mac::compute(b"key", b"two");
        assert_ne!(a, b);
    }

    #[test]
    fn test_display_matches_to_hex() {
        let mac = Mac::compute(b"k", b"d");
        assert_eq!(format!("{mac}"), mac.to_hex());
    }

    #[test]
    fn test_ordering_is_stable_for_map_keys() {
        let mut macs = vec![Mac([3u8; 32]), Mac([1u8; 32]), Mac([2u8; 32])];
        macs.sort();
        assert_eq!(macs[0], Mac([1u8; 32]));
        assert_eq!(macs[2], Mac([3u8; 32]));
    }

    #[test]
    fn test_serde_round_trip() {
        let mac = Mac::random();
        let bytes = rmp_serde::to_vec(&mac).unwrap();
        let back: Mac = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(mac, back);
    }
}
