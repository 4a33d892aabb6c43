//! AEAD encryption, passphrase key derivation and the canary check.
//!
//! The repository key is derived from the user passphrase with a salted,
//! iterated HKDF-SHA256 whose parameters live in the CONFIG descriptor.
//! Passphrase correctness is proven by decrypting the stored canary, the
//! AEAD encryption of a fixed plaintext.

use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{RepositoryError, RepositoryResult};

/// AEAD nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// Known plaintext sealed into the configuration at create time.
pub const CANARY: &[u8] = b"coffre-canary-v1";

/// 256-bit repository key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey(pub [u8; 32]);

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncryptionKey([REDACTED])")
    }
}

/// AEAD cipher selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EncryptionAlgorithm {
    /// AES-256-GCM, hardware accelerated where AES-NI is present.
    #[default]
    AesGcm256,
    /// ChaCha20-Poly1305, constant time on any hardware.
    ChaCha20Poly1305,
}

/// Passphrase stretching parameters stored in the CONFIG descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Random per-repository salt.
    pub salt: Vec<u8>,
    /// HKDF stretching rounds.
    pub iterations: u32,
}

impl KdfParams {
    /// Fresh parameters with a random 16-byte salt.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut salt = vec![0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        KdfParams {
            salt,
            iterations: 100_000,
        }
    }
}

/// Derives the repository key from a passphrase.
pub fn derive_key(params: &KdfParams, passphrase: &[u8]) -> EncryptionKey {
    let mut okm = [0u8; 32];
    // seed round
    let hk = Hkdf::<Sha256>::new(Some(&params.salt), passphrase);
    hk.expand(b"coffre-passphrase-key", &mut okm)
        .expect("32 bytes is a valid HKDF output length");
    // stretching rounds
    for _ in 1..params.iterations.max(1) {
        let hk = Hkdf::<Sha256>::new(Some(&params.salt), &okm);
        hk.expand(b"coffre-passphrase-key", &mut okm)
            .expect("32 bytes is a valid HKDF output length");
    }
    EncryptionKey(okm)
}

/// Derives a subkey for a named purpose from the repository key.
pub fn derive_subkey(key: &EncryptionKey, purpose: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(None, &key.0);
    let mut okm = [0u8; 32];
    hk.expand(purpose, &mut okm)
        .expect("32 bytes is a valid HKDF output length");
    okm
}

fn random_nonce() -> [u8; NONCE_LEN] {
    use rand::RngCore;
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Encrypts `plaintext`, returning `nonce || ciphertext`.
pub fn encrypt(
    plaintext: &[u8],
    key: &EncryptionKey,
    algo: EncryptionAlgorithm,
) -> RepositoryResult<Vec<u8>> {
    let nonce = random_nonce();
    let ciphertext = match algo {
        EncryptionAlgorithm::AesGcm256 => {
            let cipher = Aes256Gcm::new_from_slice(&key.0)
                .map_err(|e| RepositoryError::Corrupt(e.to_string()))?;
            cipher
                .encrypt(aes_gcm::Nonce::from_slice(&nonce), plaintext)
                .map_err(|e| RepositoryError::Corrupt(e.to_string()))?
        }
        EncryptionAlgorithm::ChaCha20Poly1305 => {
            use chacha20poly1305::aead::Aead as _;
            use chacha20poly1305::KeyInit as _;
            let cipher = ChaCha20Poly1305::new_from_slice(&key.0)
                .map_err(|e| RepositoryError::Corrupt(e.to_string()))?;
            cipher
                .encrypt(chacha20poly1305::Nonce::from_slice(&nonce), plaintext)
                .map_err(|e| RepositoryError::Corrupt(e.to_string()))?
        }
    };
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypts a `nonce || ciphertext` blob. Tampering or a wrong key fails
/// authentication.
pub fn decrypt(
    blob: &[u8],
    key: &EncryptionKey,
    algo: EncryptionAlgorithm,
) -> RepositoryResult<Vec<u8>> {
    if blob.len() < NONCE_LEN {
        return Err(RepositoryError::Corrupt("truncated encrypted blob".into()));
    }
    let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
    match algo {
        EncryptionAlgorithm::AesGcm256 => {
            let cipher = Aes256Gcm::new_from_slice(&key.0)
                .map_err(|e| RepositoryError::Corrupt(e.to_string()))?;
            cipher
                .decrypt(aes_gcm::Nonce::from_slice(nonce), ciphertext)
                .map_err(|_| RepositoryError::BadPassphrase)
        }
        EncryptionAlgorithm::ChaCha20Poly1305 => {
            use chacha20poly1305::aead::Aead as _;
            use chacha20poly1305::KeyInit as _;
            let cipher = ChaCha20Poly1305::new_from_slice(&key.0)
                .map_err(|e| RepositoryError::Corrupt(e.to_string()))?;
            cipher
                .decrypt(chacha20poly1305::Nonce::from_slice(nonce), ciphertext)
                .map_err(|_| RepositoryError::BadPassphrase)
        }
    }
}

/// Seals the canary under `key`.
pub fn seal_canary(key: &EncryptionKey, algo: EncryptionAlgorithm) -> RepositoryResult<Vec<u8>> {
    encrypt(CANARY, key, algo)
}

/// Whether `key` decrypts the stored canary back to the known plaintext.
pub fn verify_canary(canary: &[u8], key: &EncryptionKey, algo: EncryptionAlgorithm) -> bool {
    matches!(decrypt(canary, key, algo), Ok(plain) if plain == CANARY)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> EncryptionKey {
        EncryptionKey([42u8; 32])
    }

    #[test]
    fn test_encrypt_decrypt_round_trip_both_ciphers() {
        for algo in [
            EncryptionAlgorithm::AesGcm256,
            EncryptionAlgorithm::ChaCha20Poly1305,
        ] {
            let key = test_key();
            let blob = encrypt(b"secret payload", &key, algo).unwrap();
            assert_eq!(decrypt(&blob, &key, algo).unwrap(), b"secret payload");
        }
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = test_key();
        let mut blob = encrypt(b"data", &key, EncryptionAlgorithm::AesGcm256).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xff;
        assert!(decrypt(&blob, &key, EncryptionAlgorithm::AesGcm256).is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let blob = encrypt(b"data", &test_key(), EncryptionAlgorithm::AesGcm256).unwrap();
        let other = EncryptionKey([7u8; 32]);
        assert!(decrypt(&blob, &other, EncryptionAlgorithm::AesGcm256).is_err());
    }

    #[test]
    fn test_derive_key_is_deterministic() {
        let params = KdfParams {
            salt: vec![1, 2, 3, 4],
            iterations: 10,
        };
        let a = derive_key(&params, b"hunter2");
        let b = derive_key(&params, b"hunter2");
        assert_eq!(a.0, b.0);
    }

    #[test]
    fn test_derive_key_depends_on_salt_and_passphrase() {
        let params_a = KdfParams {
            salt: vec![1; 16],
            iterations: 10,
        };
        let params_b = KdfParams {
            salt: vec![2; 16],
            iterations: 10,
        };
        assert_ne!(
            derive_key(&params_a, b"pw").0,
            derive_key(&params_b, b"pw").0
        );
        assert_ne!(
            derive_key(&params_a, b"pw").0,
            derive_key(&params_a, b"other").0
        );
    }

    #[test]
    fn test_canary_round_trip() {
        let key = test_key();
        let canary = seal_canary(&key, EncryptionAlgorithm::AesGcm256).unwrap();
        assert!(verify_canary(&canary, &key, EncryptionAlgorithm::AesGcm256));
        let wrong = EncryptionKey([9u8; 32]);
        assert!(!verify_canary(&canary, &wrong, EncryptionAlgorithm::AesGcm256));
    }

    #[test]
    fn test_subkeys_differ_by_purpose() {
        let key = test_key();
        assert_ne!(
            derive_subkey(&key, b"purpose-a"),
            derive_subkey(&key, b"purpose-b")
        );
    }

    #[test]
    fn test_key_debug_is_redacted() {
        assert_eq!(format!("{:?}", test_key()), "EncryptionKey([REDACTED])");
    }
}
