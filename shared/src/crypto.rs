//! At-rest sealing for data the device keeps between sessions.
//!
//! Envelope layout: `magic(4) | version(1) | nonce(24) | ciphertext+tag`.

use aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use secrecy::{ExposeSecret, Secret};
use thiserror::Error;
use zeroize::Zeroize;

const ENVELOPE_MAGIC: [u8; 4] = *b"HDSL";
const CURRENT_VERSION: u8 = 1;
const NONCE_SIZE: usize = 24;
const TAG_SIZE: usize = 16;
const HEADER_SIZE: usize = 4 + 1 + NONCE_SIZE;
pub const KEY_SIZE: usize = 32;
const MAX_PLAINTEXT: usize = 32 * 1024 * 1024;
const MAX_AAD_FIELD: usize = 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("randomness unavailable")]
    RandomUnavailable,

    #[error("plaintext too large: {size} > {max}")]
    PlaintextTooLarge { size: usize, max: usize },

    #[error("aad required but empty")]
    AadRequired,

    #[error("aad field too large: {field} has {size} > {max}")]
    AadFieldTooLarge {
        field: &'static str,
        size: usize,
        max: usize,
    },

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("malformed envelope")]
    MalformedEnvelope,

    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u8),

    #[error("authentication failed")]
    AuthenticationFailed,
}

pub trait CryptoProvider: Send + Sync {
    fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError>;
    fn open(&self, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

pub trait RandomSource: Send + Sync {
    fn fill(&self, out: &mut [u8]) -> Result<(), CryptoError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn fill(&self, out: &mut [u8]) -> Result<(), CryptoError> {
        getrandom::getrandom(out).map_err(|_| CryptoError::RandomUnavailable)
    }
}

/// XChaCha20-Poly1305 under a single device key held by the shell's keystore.
pub struct DeviceKeyCipher<R: RandomSource = OsRandom> {
    key: Secret<[u8; KEY_SIZE]>,
    rng: R,
}

impl<R: RandomSource> std::fmt::Debug for DeviceKeyCipher<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceKeyCipher").finish_non_exhaustive()
    }
}

impl DeviceKeyCipher<OsRandom> {
    pub fn new(key_bytes: &[u8]) -> Result<Self, CryptoError> {
        Self::with_rng(key_bytes, OsRandom)
    }

    /// A fresh random key, returned raw so the shell can store it.
    pub fn generate_key() -> Result<Secret<[u8; KEY_SIZE]>, CryptoError> {
        let mut key = [0u8; KEY_SIZE];
        OsRandom.fill(&mut key)?;
        let secret = Secret::new(key);
        key.zeroize();
        Ok(secret)
    }
}

impl<R: RandomSource> DeviceKeyCipher<R> {
    pub fn with_rng(key_bytes: &[u8], rng: R) -> Result<Self, CryptoError> {
        let key: [u8; KEY_SIZE] =
            key_bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: KEY_SIZE,
                    actual: key_bytes.len(),
                })?;
        Ok(Self {
            key: Secret::new(key),
            rng,
        })
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(Key::from_slice(self.key.expose_secret()))
    }
}

impl<R: RandomSource> CryptoProvider for DeviceKeyCipher<R> {
    fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if aad.is_empty() {
            return Err(CryptoError::AadRequired);
        }
        if plaintext.len() > MAX_PLAINTEXT {
            return Err(CryptoError::PlaintextTooLarge {
                size: plaintext.len(),
                max: MAX_PLAINTEXT,
            });
        }

        let mut nonce = [0u8; NONCE_SIZE];
        self.rng.fill(&mut nonce)?;

        let ciphertext = self
            .cipher()
            .encrypt(XNonce::from_slice(&nonce), Payload { msg: plaintext, aad })
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut out = Vec::with_capacity(HEADER_SIZE + ciphertext.len());
        out.extend_from_slice(&ENVELOPE_MAGIC);
        out.push(CURRENT_VERSION);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn open(&self, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if aad.is_empty() {
            return Err(CryptoError::AadRequired);
        }
        if sealed.len() < HEADER_SIZE + TAG_SIZE || sealed[..4] != ENVELOPE_MAGIC {
            return Err(CryptoError::MalformedEnvelope);
        }
        if sealed[4] != CURRENT_VERSION {
            return Err(CryptoError::UnsupportedVersion(sealed[4]));
        }

        let nonce = XNonce::from_slice(&sealed[5..HEADER_SIZE]);
        self.cipher()
            .decrypt(
                nonce,
                Payload {
                    msg: &sealed[HEADER_SIZE..],
                    aad,
                },
            )
            .map_err(|_| CryptoError::AuthenticationFailed)
    }
}

/// Length-prefixed associated data binding a sealed blob to its store and owner.
pub fn build_aad(
    store_name: &str,
    schema_version: u32,
    user_id: &str,
) -> Result<Vec<u8>, CryptoError> {
    let mut aad = Vec::with_capacity(2 + store_name.len() + 4 + 2 + user_id.len());
    for (field, value) in [("store_name", store_name), ("user_id", user_id)] {
        if value.len() > MAX_AAD_FIELD {
            return Err(CryptoError::AadFieldTooLarge {
                field,
                size: value.len(),
                max: MAX_AAD_FIELD,
            });
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    aad.extend_from_slice(&(store_name.len() as u16).to_le_bytes());
    aad.extend_from_slice(store_name.as_bytes());
    aad.extend_from_slice(&schema_version.to_le_bytes());
    #[allow(clippy::cast_possible_truncation)]
    aad.extend_from_slice(&(user_id.len() as u16).to_le_bytes());
    aad.extend_from_slice(user_id.as_bytes());
    Ok(aad)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU8, Ordering};

    struct SequentialRng(AtomicU8);

    impl RandomSource for SequentialRng {
        fn fill(&self, out: &mut [u8]) -> Result<(), CryptoError> {
            let start = self.0.fetch_add(1, Ordering::SeqCst);
            for (i, b) in out.iter_mut().enumerate() {
                *b = start.wrapping_add(i as u8);
            }
            Ok(())
        }
    }

    fn cipher() -> DeviceKeyCipher<SequentialRng> {
        DeviceKeyCipher::with_rng(&[7u8; KEY_SIZE], SequentialRng(AtomicU8::new(0))).unwrap()
    }

    fn aad() -> Vec<u8> {
        build_aad("outbox", 1, "u1").unwrap()
    }

    #[test]
    fn roundtrip() {
        let c = cipher();
        let sealed = c.seal(b"pending reply", &aad()).unwrap();
        assert_eq!(sealed.len(), HEADER_SIZE + 13 + TAG_SIZE);
        assert_eq!(c.open(&sealed, &aad()).unwrap(), b"pending reply");
    }

    #[test]
    fn nonces_differ_between_seals() {
        let c = cipher();
        let a = c.seal(b"x", &aad()).unwrap();
        let b = c.seal(b"x", &aad()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_aad_fails() {
        let c = cipher();
        let sealed = c.seal(b"x", &aad()).unwrap();
        let other = build_aad("outbox", 1, "u2").unwrap();
        assert_eq!(c.open(&sealed, &other), Err(CryptoError::AuthenticationFailed));
    }

    #[test]
    fn tampering_detected() {
        let c = cipher();
        let mut sealed = c.seal(b"hello", &aad()).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 1;
        assert_eq!(c.open(&sealed, &aad()), Err(CryptoError::AuthenticationFailed));

        sealed[0] = b'X';
        assert_eq!(c.open(&sealed, &aad()), Err(CryptoError::MalformedEnvelope));
    }

    #[test]
    fn version_checked() {
        let c = cipher();
        let mut sealed = c.seal(b"hello", &aad()).unwrap();
        sealed[4] = 9;
        assert_eq!(c.open(&sealed, &aad()), Err(CryptoError::UnsupportedVersion(9)));
    }

    #[test]
    fn key_length_and_aad_enforced() {
        assert!(matches!(
            DeviceKeyCipher::new(&[0u8; 16]),
            Err(CryptoError::InvalidKeyLength { actual: 16, .. })
        ));
        assert_eq!(cipher().seal(b"x", &[]), Err(CryptoError::AadRequired));
        assert!(build_aad(&"s".repeat(MAX_AAD_FIELD + 1), 1, "u").is_err());
    }

    #[test]
    fn generated_key_usable() {
        let key = DeviceKeyCipher::generate_key().unwrap();
        let c = DeviceKeyCipher::new(key.expose_secret()).unwrap();
        let sealed = c.seal(b"x", &aad()).unwrap();
        assert_eq!(c.open(&sealed, &aad()).unwrap(), b"x");
    }
}
