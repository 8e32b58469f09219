//! Versioned, checksummed CBOR envelope for data that must survive restarts.
//!
//! The payload is CBOR, hashed with blake3, wrapped with magic bytes and a
//! schema version, and then optionally sealed with a [`CryptoProvider`].

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::crypto::{build_aad, CryptoError, CryptoProvider};
use crate::{AppError, ErrorKind};

pub const CURRENT_SCHEMA_VERSION: u32 = 1;
const STORE_MAGIC: [u8; 4] = *b"HDOB";
const MAX_STORE_BYTES: usize = 64 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupted store: {reason}")]
    Corrupted { reason: &'static str },

    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    #[error("schema version {found} is newer than supported {max}")]
    FutureSchema { found: u32, max: u32 },

    #[error("unknown schema version: {0}")]
    UnknownSchema(u32),

    #[error("store too large: {size} bytes, max {max}")]
    StoreTooLarge { size: usize, max: usize },
}

impl From<ciborium::de::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        let kind = match err {
            StoreError::StoreTooLarge { .. } => ErrorKind::Storage,
            _ => ErrorKind::Serialization,
        };
        Self::new(kind, "Saved offline data could not be read or written")
            .with_internal(err.to_string())
    }
}

/// Binds sealed data to one user on one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreContext {
    store_name: String,
    user_id: String,
}

impl StoreContext {
    pub fn new(store_name: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            store_name: store_name.into(),
            user_id: user_id.into(),
        }
    }

    fn to_aad(&self) -> Result<Vec<u8>, CryptoError> {
        build_aad(&self.store_name, CURRENT_SCHEMA_VERSION, &self.user_id)
    }
}

#[derive(Serialize, Deserialize, Debug)]
struct StoreEnvelope {
    magic: [u8; 4],
    schema_version: u32,
    checksum: [u8; 32],
    #[serde(with = "serde_bytes")]
    payload: Vec<u8>,
}

#[derive(Clone)]
pub struct EnvelopeCodec {
    sealing: Option<(Arc<dyn CryptoProvider>, StoreContext)>,
}

impl std::fmt::Debug for EnvelopeCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeCodec")
            .field("sealed", &self.sealing.is_some())
            .finish()
    }
}

impl EnvelopeCodec {
    #[must_use]
    pub const fn plain() -> Self {
        Self { sealing: None }
    }

    #[must_use]
    pub fn sealed(crypto: Arc<dyn CryptoProvider>, context: StoreContext) -> Self {
        Self {
            sealing: Some((crypto, context)),
        }
    }

    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, StoreError> {
        let mut payload = Vec::new();
        ciborium::into_writer(value, &mut payload)?;

        let envelope = StoreEnvelope {
            magic: STORE_MAGIC,
            schema_version: CURRENT_SCHEMA_VERSION,
            checksum: *blake3::hash(&payload).as_bytes(),
            payload,
        };

        let mut bytes = Vec::new();
        ciborium::into_writer(&envelope, &mut bytes)?;

        match &self.sealing {
            Some((crypto, context)) => Ok(crypto.seal(&bytes, &context.to_aad()?)?),
            None => Ok(bytes),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, StoreError> {
        if bytes.is_empty() {
            return Err(StoreError::Corrupted { reason: "empty store" });
        }
        if bytes.len() > MAX_STORE_BYTES {
            return Err(StoreError::StoreTooLarge {
                size: bytes.len(),
                max: MAX_STORE_BYTES,
            });
        }

        let opened;
        let envelope_bytes = match &self.sealing {
            Some((crypto, context)) => {
                opened = crypto.open(bytes, &context.to_aad()?)?;
                &opened[..]
            }
            None => bytes,
        };

        let envelope: StoreEnvelope = ciborium::from_reader(envelope_bytes)?;
        if envelope.magic != STORE_MAGIC {
            return Err(StoreError::Corrupted {
                reason: "invalid magic bytes",
            });
        }
        if envelope.schema_version > CURRENT_SCHEMA_VERSION {
            return Err(StoreError::FutureSchema {
                found: envelope.schema_version,
                max: CURRENT_SCHEMA_VERSION,
            });
        }
        if envelope.schema_version < CURRENT_SCHEMA_VERSION {
            // no older layouts exist yet
            return Err(StoreError::UnknownSchema(envelope.schema_version));
        }

        let actual = blake3::hash(&envelope.payload);
        if actual.as_bytes() != &envelope.checksum {
            return Err(StoreError::IntegrityCheckFailed {
                expected: hex::encode(envelope.checksum),
                actual: hex::encode(actual.as_bytes()),
            });
        }

        Ok(ciborium::from_reader(&envelope.payload[..])?)
    }
}
