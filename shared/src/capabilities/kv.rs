//! Namespaced client-local key/value storage.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::{AppError, ErrorKind};

pub const MAX_KEY_LENGTH: usize = 512;
pub const MAX_VALUE_SIZE: usize = 10 * 1024 * 1024;
pub const MAX_PREFIX_LENGTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KvKey {
    namespace: KeyNamespace,
    key: String,
}

impl KvKey {
    pub fn new(namespace: KeyNamespace, key: impl Into<String>) -> Result<Self, KvError> {
        let key = key.into();
        Self::validate_key(&key)?;
        Ok(Self { namespace, key })
    }

    #[must_use]
    pub fn raw(&self) -> String {
        format!("{}:{}", self.namespace.prefix(), self.key)
    }

    #[must_use]
    pub const fn namespace(&self) -> &KeyNamespace {
        &self.namespace
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    fn validate_key(key: &str) -> Result<(), KvError> {
        let invalid = |reason: &str| KvError::InvalidKey {
            key: key.chars().take(50).collect(),
            reason: reason.to_string(),
        };

        if key.trim().is_empty() {
            return Err(invalid("key cannot be empty"));
        }
        if key.len() > MAX_KEY_LENGTH {
            return Err(invalid("key exceeds maximum length"));
        }
        if key.contains("..") {
            return Err(invalid("key cannot contain path traversal sequences"));
        }
        if key.starts_with('/') || key.starts_with('\\') {
            return Err(invalid("key cannot start with path separator"));
        }
        if key.chars().any(|c| c.is_control() && c != '\t') {
            return Err(invalid("key contains control characters"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyNamespace {
    Cache,
    Outbox,
    Session,
    Settings,
    Custom(String),
}

impl KeyNamespace {
    #[must_use]
    pub fn prefix(&self) -> &str {
        match self {
            Self::Cache => "cache",
            Self::Outbox => "outbox",
            Self::Session => "session",
            Self::Settings => "settings",
            Self::Custom(s) => s.as_str(),
        }
    }

    pub fn custom(prefix: impl Into<String>) -> Result<Self, KvError> {
        let prefix = prefix.into();
        if prefix.is_empty()
            || prefix.len() > MAX_PREFIX_LENGTH
            || !prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(KvError::InvalidKey {
                key: prefix,
                reason: "invalid custom namespace".to_string(),
            });
        }
        Ok(Self::Custom(prefix))
    }
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum KvError {
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("value too large: {size} bytes exceeds maximum of {max} bytes")]
    ValueTooLarge { size: usize, max: usize },

    #[error("storage error: {message} (code: {code:?}, retryable: {retryable})")]
    Storage {
        code: StorageErrorCode,
        message: String,
        retryable: bool,
    },

    #[error("serialization error: {message}")]
    Serialization { message: String, key: Option<String> },

    #[error("quota exceeded: {used}/{limit} bytes")]
    QuotaExceeded { used: u64, limit: u64 },

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl KvError {
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Storage { retryable, .. } => *retryable,
            _ => false,
        }
    }

    pub fn storage(code: StorageErrorCode, message: impl Into<String>) -> Self {
        Self::Storage {
            code,
            message: message.into(),
            retryable: code.is_retryable(),
        }
    }
}

impl From<KvError> for AppError {
    fn from(err: KvError) -> Self {
        let kind = match &err {
            KvError::InvalidKey { .. } | KvError::ValueTooLarge { .. } => ErrorKind::Validation,
            KvError::Serialization { .. } => ErrorKind::Serialization,
            KvError::Storage { .. } | KvError::QuotaExceeded { .. } | KvError::Unavailable(_) => {
                ErrorKind::Storage
            }
        };
        Self::new(kind, "Local storage operation failed").with_internal(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageErrorCode {
    Unknown,
    ConnectionFailed,
    Corrupted,
    DiskFull,
    PermissionDenied,
    Busy,
    Locked,
}

impl StorageErrorCode {
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::ConnectionFailed | Self::Busy | Self::Locked)
    }
}

/// Byte-level storage the shell provides (browser storage, SQLite, memory).
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError>;
    async fn set(&self, key: &KvKey, value: Vec<u8>) -> Result<(), KvError>;
    /// Returns whether the key existed.
    async fn delete(&self, key: &KvKey) -> Result<bool, KvError>;
    /// Keys (without namespace prefix) stored under `namespace`.
    async fn list_keys(&self, namespace: &KeyNamespace) -> Result<Vec<String>, KvError>;
}

fn check_value_size(value: &[u8]) -> Result<(), KvError> {
    if value.len() > MAX_VALUE_SIZE {
        return Err(KvError::ValueTooLarge {
            size: value.len(),
            max: MAX_VALUE_SIZE,
        });
    }
    Ok(())
}

/// In-process store with an optional byte quota, mirroring browser storage limits.
#[derive(Debug)]
pub struct MemoryKvStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
    quota_bytes: Option<u64>,
    enabled: AtomicBool,
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKvStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            quota_bytes: None,
            enabled: AtomicBool::new(true),
        }
    }

    #[must_use]
    pub fn with_quota(quota_bytes: u64) -> Self {
        Self {
            quota_bytes: Some(quota_bytes),
            ..Self::new()
        }
    }

    /// A disabled store fails every call, like storage blocked in private browsing.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    fn ensure_enabled(&self) -> Result<(), KvError> {
        if self.enabled.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(KvError::Unavailable("storage is disabled".into()))
        }
    }
}

#[async_trait]
impl KeyValueStore for MemoryKvStore {
    async fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError> {
        self.ensure_enabled()?;
        Ok(self.entries.read().await.get(&key.raw()).cloned())
    }

    async fn set(&self, key: &KvKey, value: Vec<u8>) -> Result<(), KvError> {
        self.ensure_enabled()?;
        check_value_size(&value)?;
        let raw = key.raw();
        let mut entries = self.entries.write().await;

        if let Some(limit) = self.quota_bytes {
            let used: u64 = entries
                .iter()
                .filter(|(k, _)| **k != raw)
                .map(|(k, v)| (k.len() + v.len()) as u64)
                .sum();
            let needed = used + (raw.len() + value.len()) as u64;
            if needed > limit {
                return Err(KvError::QuotaExceeded {
                    used: needed,
                    limit,
                });
            }
        }

        entries.insert(raw, value);
        Ok(())
    }

    async fn delete(&self, key: &KvKey) -> Result<bool, KvError> {
        self.ensure_enabled()?;
        Ok(self.entries.write().await.remove(&key.raw()).is_some())
    }

    async fn list_keys(&self, namespace: &KeyNamespace) -> Result<Vec<String>, KvError> {
        self.ensure_enabled()?;
        let prefix = format!("{}:", namespace.prefix());
        let mut keys: Vec<String> = self
            .entries
            .read()
            .await
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix).map(str::to_owned))
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(not(target_arch = "wasm32"))]
pub use sqlite::SqliteKvStore;

#[cfg(not(target_arch = "wasm32"))]
mod sqlite {
    use super::{check_value_size, KeyNamespace, KeyValueStore, KvError, KvKey, StorageErrorCode};
    use async_trait::async_trait;
    use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
    use std::path::Path;
    use std::sync::Mutex;

    /// Durable store for native shells.
    pub struct SqliteKvStore {
        conn: Mutex<Connection>,
    }

    impl std::fmt::Debug for SqliteKvStore {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("SqliteKvStore").finish_non_exhaustive()
        }
    }

    fn map_sqlite(err: &rusqlite::Error) -> KvError {
        let code = match err {
            rusqlite::Error::SqliteFailure(e, _) => match e.code {
                ErrorCode::DatabaseBusy => StorageErrorCode::Busy,
                ErrorCode::DatabaseLocked => StorageErrorCode::Locked,
                ErrorCode::DiskFull => StorageErrorCode::DiskFull,
                ErrorCode::PermissionDenied | ErrorCode::ReadOnly => {
                    StorageErrorCode::PermissionDenied
                }
                ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => {
                    StorageErrorCode::Corrupted
                }
                ErrorCode::CannotOpen => StorageErrorCode::ConnectionFailed,
                _ => StorageErrorCode::Unknown,
            },
            _ => StorageErrorCode::Unknown,
        };
        KvError::storage(code, err.to_string())
    }

    impl SqliteKvStore {
        pub fn open(path: impl AsRef<Path>) -> Result<Self, KvError> {
            let conn = Connection::open(path).map_err(|e| map_sqlite(&e))?;
            Self::init(conn)
        }

        pub fn open_in_memory() -> Result<Self, KvError> {
            let conn = Connection::open_in_memory().map_err(|e| map_sqlite(&e))?;
            Self::init(conn)
        }

        fn init(conn: Connection) -> Result<Self, KvError> {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS kv (
                     key TEXT PRIMARY KEY NOT NULL,
                     value BLOB NOT NULL,
                     updated_at INTEGER NOT NULL
                 );",
            )
            .map_err(|e| map_sqlite(&e))?;
            Ok(Self {
                conn: Mutex::new(conn),
            })
        }

        fn with_conn<T>(
            &self,
            f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
        ) -> Result<T, KvError> {
            let conn = self
                .conn
                .lock()
                .map_err(|_| KvError::storage(StorageErrorCode::Locked, "connection poisoned"))?;
            f(&conn).map_err(|e| map_sqlite(&e))
        }
    }

    #[async_trait]
    impl KeyValueStore for SqliteKvStore {
        async fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError> {
            let raw = key.raw();
            self.with_conn(|conn| {
                conn.query_row("SELECT value FROM kv WHERE key = ?1", params![raw], |row| {
                    row.get(0)
                })
                .optional()
            })
        }

        async fn set(&self, key: &KvKey, value: Vec<u8>) -> Result<(), KvError> {
            check_value_size(&value)?;
            let raw = key.raw();
            let now = i64::try_from(crate::get_current_time_ms()).unwrap_or(i64::MAX);
            self.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                                    updated_at = excluded.updated_at",
                    params![raw, value, now],
                )
                .map(|_| ())
            })
        }

        async fn delete(&self, key: &KvKey) -> Result<bool, KvError> {
            let raw = key.raw();
            self.with_conn(|conn| {
                conn.execute("DELETE FROM kv WHERE key = ?1", params![raw])
                    .map(|n| n > 0)
            })
        }

        async fn list_keys(&self, namespace: &KeyNamespace) -> Result<Vec<String>, KvError> {
            let prefix = format!("{}:", namespace.prefix());
            let keys: Vec<String> = self.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT key FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
                )?;
                let rows = stmt.query_map(params![prefix], |row| row.get::<_, String>(0))?;
                rows.collect()
            })?;
            Ok(keys
                .into_iter()
                .filter_map(|k| k.strip_prefix(&prefix).map(str::to_owned))
                .collect())
        }
    }
}

/// JSON-typed view over one namespace of a [`KeyValueStore`].
#[derive(Debug, Clone)]
pub struct TypedKv<T> {
    namespace: KeyNamespace,
    _phantom: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> TypedKv<T> {
    #[must_use]
    pub const fn new(namespace: KeyNamespace) -> Self {
        Self {
            namespace,
            _phantom: PhantomData,
        }
    }

    pub async fn get(&self, store: &dyn KeyValueStore, key: &str) -> Result<Option<T>, KvError> {
        let key = KvKey::new(self.namespace.clone(), key)?;
        match store.get(&key).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| KvError::Serialization {
                    message: e.to_string(),
                    key: Some(key.raw()),
                }),
            None => Ok(None),
        }
    }

    pub async fn set(
        &self,
        store: &dyn KeyValueStore,
        key: &str,
        value: &T,
    ) -> Result<(), KvError> {
        let key = KvKey::new(self.namespace.clone(), key)?;
        let bytes = serde_json::to_vec(value).map_err(|e| KvError::Serialization {
            message: e.to_string(),
            key: Some(key.raw()),
        })?;
        store.set(&key, bytes).await
    }

    pub async fn delete(&self, store: &dyn KeyValueStore, key: &str) -> Result<bool, KvError> {
        let key = KvKey::new(self.namespace.clone(), key)?;
        store.delete(&key).await
    }
}
