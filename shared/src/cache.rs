//! Disposable per-case snapshot cache.
//!
//! An in-memory LRU front over the client KV store. Any storage failure turns
//! into a miss or a no-op; the server can always rebuild what was lost.

use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::capabilities::{KeyNamespace, KeyValueStore, KvKey};
use crate::config::CacheConfig;
use crate::model::{Attachment, CaseId, ThreadItem};
use crate::{Clock, UnixTimeMs};

/// Bumped whenever the snapshot layout changes; older snapshots read as absent.
pub const SNAPSHOT_SCHEMA: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale,
}

impl Freshness {
    #[must_use]
    pub const fn is_stale(self) -> bool {
        matches!(self, Self::Stale)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CachedThreadSnapshot {
    pub schema: u32,
    pub case_id: CaseId,
    pub items: Vec<ThreadItem>,
    #[serde(default)]
    pub case_attachments: Vec<Attachment>,
    pub captured_at: UnixTimeMs,
    pub ttl_ms: u64,
}

impl CachedThreadSnapshot {
    /// Stale once the snapshot is strictly older than its TTL.
    #[must_use]
    pub const fn freshness(&self, now: UnixTimeMs) -> Freshness {
        if now.elapsed_since(self.captured_at) > self.ttl_ms {
            Freshness::Stale
        } else {
            Freshness::Fresh
        }
    }

    #[must_use]
    pub const fn age_ms(&self, now: UnixTimeMs) -> u64 {
        now.elapsed_since(self.captured_at)
    }
}

pub struct ThreadCache {
    kv: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
    front: Mutex<LruCache<CaseId, CachedThreadSnapshot>>,
}

impl std::fmt::Debug for ThreadCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadCache")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ThreadCache {
    pub fn new(kv: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, config: CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_cases).unwrap_or(NonZeroUsize::MIN);
        Self {
            kv,
            clock,
            config,
            front: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn key(case_id: &CaseId) -> Option<KvKey> {
        match KvKey::new(KeyNamespace::Cache, format!("thread:{case_id}")) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(case_id = %case_id, error = %e, "Case id not usable as cache key");
                None
            }
        }
    }

    pub async fn get(&self, case_id: &CaseId) -> Option<CachedThreadSnapshot> {
        if let Some(hit) = self.front.lock().await.get(case_id) {
            return Some(hit.clone());
        }

        let key = Self::key(case_id)?;
        let bytes = match self.kv.get(&key).await {
            Ok(bytes) => bytes?,
            Err(e) => {
                warn!(case_id = %case_id, error = %e, "Cache read failed");
                return None;
            }
        };

        let snapshot: CachedThreadSnapshot = match serde_json::from_slice(&bytes) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(case_id = %case_id, error = %e, "Discarding undecodable snapshot");
                return None;
            }
        };
        if snapshot.schema != SNAPSHOT_SCHEMA || &snapshot.case_id != case_id {
            debug!(
                case_id = %case_id,
                schema = snapshot.schema,
                "Ignoring snapshot from another schema"
            );
            return None;
        }

        self.front
            .lock()
            .await
            .put(case_id.clone(), snapshot.clone());
        Some(snapshot)
    }

    /// Writes a snapshot stamped with the current time. Never fails.
    pub async fn set(
        &self,
        case_id: &CaseId,
        items: Vec<ThreadItem>,
        case_attachments: Vec<Attachment>,
    ) -> CachedThreadSnapshot {
        let now = self.clock.now();
        self.set_at(case_id, items, case_attachments, now).await
    }

    /// Like [`set`](Self::set) but keeps the capture time of data that was
    /// last synced earlier.
    pub async fn set_at(
        &self,
        case_id: &CaseId,
        items: Vec<ThreadItem>,
        case_attachments: Vec<Attachment>,
        captured_at: UnixTimeMs,
    ) -> CachedThreadSnapshot {
        let ttl_ms = u64::try_from(self.config.ttl.as_millis()).unwrap_or(u64::MAX);
        let snapshot = CachedThreadSnapshot {
            schema: SNAPSHOT_SCHEMA,
            case_id: case_id.clone(),
            items,
            case_attachments,
            captured_at,
            ttl_ms,
        };

        self.front
            .lock()
            .await
            .put(case_id.clone(), snapshot.clone());

        if let Some(key) = Self::key(case_id) {
            match serde_json::to_vec(&snapshot) {
                Ok(bytes) => {
                    if let Err(e) = self.kv.set(&key, bytes).await {
                        warn!(case_id = %case_id, error = %e, "Cache write failed");
                    }
                }
                Err(e) => warn!(case_id = %case_id, error = %e, "Snapshot not serializable"),
            }
        }

        snapshot
    }

    pub async fn invalidate(&self, case_id: &CaseId) {
        self.front.lock().await.pop(case_id);
        if let Some(key) = Self::key(case_id) {
            if let Err(e) = self.kv.delete(&key).await {
                warn!(case_id = %case_id, error = %e, "Cache invalidation failed");
            }
        }
    }

    #[must_use]
    pub fn now(&self) -> UnixTimeMs {
        self.clock.now()
    }
}
