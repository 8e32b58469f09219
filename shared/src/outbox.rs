//! Durable queue of messages the user sent while the backend was unreachable.
//!
//! Unlike the thread cache this is not disposable: every write is persisted
//! before the call returns, and persistence failures reach the caller.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{error, info, instrument, warn};

use crate::capabilities::{KeyNamespace, KeyValueStore, KvError, KvKey};
use crate::config::OutboxConfig;
use crate::model::{
    CaseId, ItemId, ItemKind, MessageDraft, NewNote, NewReply, ThreadItem, UserId, UserRole,
};
use crate::offline_store::{EnvelopeCodec, StoreError};
use crate::{AppError, ErrorKind, UnixTimeMs};

const QUEUE_KEY: &str = "queue";
const QUARANTINE_KEY: &str = "quarantine";

#[derive(Error, Debug)]
pub enum OutboxError {
    #[error("outbox full: max {0} entries")]
    Full(usize),

    #[error("duplicate entry: {0}")]
    Duplicate(String),

    #[error("entry not found: {0}")]
    NotFound(String),

    #[error("invalid transition for {temp_id}: {from} -> {to}")]
    InvalidTransition {
        temp_id: String,
        from: &'static str,
        to: &'static str,
    },

    #[error("persistence error: {0}")]
    Persistence(#[from] KvError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl From<OutboxError> for AppError {
    fn from(err: OutboxError) -> Self {
        let internal = err.to_string();
        match err {
            OutboxError::Persistence(kv) => kv.into(),
            OutboxError::Store(store) => store.into(),
            OutboxError::Full(_) => AppError::new(
                ErrorKind::Storage,
                "Too many unsent messages are waiting; reconnect to send them",
            )
            .with_internal(internal),
            OutboxError::NotFound(_) => {
                AppError::new(ErrorKind::NotFound, "Unsent message not found")
                    .with_internal(internal)
            }
            OutboxError::InvalidConfig(_) => {
                AppError::validation("Invalid outbox configuration").with_internal(internal)
            }
            OutboxError::Duplicate(_) | OutboxError::InvalidTransition { .. } => {
                AppError::new(ErrorKind::InvalidState, "Unsent message is in an unexpected state")
                    .with_internal(internal)
            }
        }
    }
}

/// Everything needed to resubmit a message exactly as the user wrote it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PendingMessage {
    pub temp_id: ItemId,
    pub author_id: UserId,
    pub author_role: UserRole,
    pub draft: MessageDraft,
    pub created_at: UnixTimeMs,
}

impl PendingMessage {
    #[must_use]
    pub fn new(
        temp_id: ItemId,
        author_id: UserId,
        author_role: UserRole,
        draft: MessageDraft,
        created_at: UnixTimeMs,
    ) -> Self {
        Self {
            temp_id,
            author_id,
            author_role,
            draft,
            created_at,
        }
    }

    #[must_use]
    pub const fn case_id(&self) -> &CaseId {
        &self.draft.case_id
    }

    /// Idempotency key sent with every submission of this message.
    #[must_use]
    pub fn client_ref(&self) -> &str {
        self.temp_id.as_str()
    }

    #[must_use]
    pub fn optimistic_item(&self) -> ThreadItem {
        self.draft
            .optimistic_item(&self.temp_id, &self.author_id, self.created_at)
    }

    #[must_use]
    pub fn new_reply(&self) -> NewReply {
        NewReply {
            case_id: self.draft.case_id.clone(),
            user_id: self.author_id.clone(),
            content: self.draft.content.clone(),
            is_internal: self.draft.is_internal,
            client_ref: self.client_ref().to_string(),
        }
    }

    #[must_use]
    pub fn new_note(&self) -> NewNote {
        NewNote {
            case_id: self.draft.case_id.clone(),
            user_id: self.author_id.clone(),
            content: self.draft.content.clone(),
            client_ref: self.client_ref().to_string(),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ItemKind {
        self.draft.kind
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureReason {
    MaxAttemptsExceeded,
    NonRetryableError,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum EntryState {
    Pending,
    InFlight { started_at: UnixTimeMs },
    Retrying { next_attempt_at: UnixTimeMs },
    Failed { reason: FailureReason, failed_at: UnixTimeMs },
}

impl EntryState {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight { .. } => "in_flight",
            Self::Retrying { .. } => "retrying",
            Self::Failed { .. } => "failed",
        }
    }

    #[must_use]
    pub const fn is_due(&self, now: UnixTimeMs) -> bool {
        match self {
            Self::Pending => true,
            Self::Retrying { next_attempt_at } => next_attempt_at.0 <= now.0,
            Self::InFlight { .. } | Self::Failed { .. } => false,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct OutboxEntry {
    pub message: PendingMessage,
    pub state: EntryState,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub enqueued_at: UnixTimeMs,
}

impl OutboxEntry {
    #[must_use]
    pub const fn temp_id(&self) -> &ItemId {
        &self.message.temp_id
    }

    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self.state, EntryState::Failed { .. })
    }
}

#[derive(Serialize, Deserialize, Default)]
struct PersistedQueue {
    entries: Vec<OutboxEntry>,
}

pub struct Outbox {
    kv: Arc<dyn KeyValueStore>,
    codec: EnvelopeCodec,
    config: OutboxConfig,
    entries: RwLock<HashMap<String, OutboxEntry>>,
}

impl std::fmt::Debug for Outbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbox")
            .field("codec", &self.codec)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Outbox {
    /// Loads the persisted queue. Entries left `InFlight` by a previous run are
    /// made due again. Unreadable data is moved aside, never overwritten.
    #[instrument(skip(kv, codec, config))]
    pub async fn open(
        kv: Arc<dyn KeyValueStore>,
        codec: EnvelopeCodec,
        config: OutboxConfig,
    ) -> Result<Self, OutboxError> {
        config
            .validate()
            .map_err(|e| OutboxError::InvalidConfig(e.message))?;

        let key = Self::key(QUEUE_KEY)?;
        let mut entries = HashMap::new();

        if let Some(bytes) = kv.get(&key).await? {
            match codec.decode::<PersistedQueue>(&bytes) {
                Ok(queue) => {
                    for mut entry in queue.entries {
                        if matches!(entry.state, EntryState::InFlight { .. }) {
                            entry.state = EntryState::Pending;
                        }
                        entries.insert(entry.temp_id().as_str().to_string(), entry);
                    }
                }
                Err(e @ StoreError::FutureSchema { .. }) => return Err(e.into()),
                Err(e) => {
                    warn!(error = %e, "Outbox unreadable, moving it to quarantine");
                    kv.set(&Self::key(QUARANTINE_KEY)?, bytes).await?;
                    kv.delete(&key).await?;
                }
            }
        }

        info!(entries = entries.len(), "Outbox opened");

        Ok(Self {
            kv,
            codec,
            config,
            entries: RwLock::new(entries),
        })
    }

    fn key(name: &str) -> Result<KvKey, OutboxError> {
        Ok(KvKey::new(KeyNamespace::Outbox, name)?)
    }

    async fn persist(&self, entries: &HashMap<String, OutboxEntry>) -> Result<(), OutboxError> {
        let queue = PersistedQueue {
            entries: entries.values().cloned().collect(),
        };
        let bytes = self.codec.encode(&queue)?;
        self.kv.set(&Self::key(QUEUE_KEY)?, bytes).await?;
        Ok(())
    }

    /// Persists `updated` in place of its entry. On a failed write the previous
    /// entry is restored, with `InFlight` read back as `Pending` the same way
    /// `open` treats it, so the entry stays due.
    async fn commit(
        &self,
        entries: &mut HashMap<String, OutboxEntry>,
        updated: OutboxEntry,
    ) -> Result<OutboxEntry, OutboxError> {
        let id = updated.temp_id().as_str().to_string();
        let previous = entries.insert(id.clone(), updated.clone());

        if let Err(e) = self.persist(entries).await {
            if let Some(mut previous) = previous {
                if matches!(previous.state, EntryState::InFlight { .. }) {
                    previous.state = EntryState::Pending;
                }
                entries.insert(id, previous);
            }
            error!(error = %e, "Failed to persist outbox entry");
            return Err(e);
        }
        Ok(updated)
    }

    #[instrument(
        skip(self, message),
        fields(temp_id = %message.temp_id, case_id = %message.case_id())
    )]
    pub async fn enqueue(
        &self,
        message: PendingMessage,
        now: UnixTimeMs,
    ) -> Result<(), OutboxError> {
        let mut entries = self.entries.write().await;
        let id = message.temp_id.as_str().to_string();

        if entries.contains_key(&id) {
            return Err(OutboxError::Duplicate(id));
        }
        if entries.len() >= self.config.max_entries {
            return Err(OutboxError::Full(self.config.max_entries));
        }

        entries.insert(
            id.clone(),
            OutboxEntry {
                message,
                state: EntryState::Pending,
                attempts: 0,
                last_error: None,
                enqueued_at: now,
            },
        );

        if let Err(e) = self.persist(&entries).await {
            entries.remove(&id);
            error!(error = %e, "Failed to persist outbox entry");
            return Err(e);
        }

        info!("Message queued for later delivery");
        Ok(())
    }

    /// Queued messages for one case, oldest first.
    pub async fn entries_for_case(&self, case_id: &CaseId) -> Vec<OutboxEntry> {
        let entries = self.entries.read().await;
        let mut found: Vec<_> = entries
            .values()
            .filter(|e| e.message.case_id() == case_id)
            .cloned()
            .collect();
        found.sort_by_key(|e| e.message.created_at);
        found
    }

    pub async fn due_entries(&self, now: UnixTimeMs) -> Vec<OutboxEntry> {
        let entries = self.entries.read().await;
        let mut due: Vec<_> = entries
            .values()
            .filter(|e| e.state.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|e| e.message.created_at);
        due
    }

    pub async fn get(&self, temp_id: &ItemId) -> Option<OutboxEntry> {
        self.entries.read().await.get(temp_id.as_str()).cloned()
    }

    /// Claims a due entry for one delivery attempt.
    #[instrument(skip(self), fields(temp_id = %temp_id))]
    pub async fn mark_in_flight(
        &self,
        temp_id: &ItemId,
        now: UnixTimeMs,
    ) -> Result<OutboxEntry, OutboxError> {
        let mut entries = self.entries.write().await;
        let mut entry = entries
            .get(temp_id.as_str())
            .cloned()
            .ok_or_else(|| OutboxError::NotFound(temp_id.to_string()))?;

        if !entry.state.is_due(now) {
            return Err(OutboxError::InvalidTransition {
                temp_id: temp_id.to_string(),
                from: entry.state.name(),
                to: "in_flight",
            });
        }

        entry.state = EntryState::InFlight { started_at: now };
        entry.attempts = entry.attempts.saturating_add(1);
        self.commit(&mut entries, entry).await
    }

    /// Delivered: the entry leaves the queue.
    #[instrument(skip(self), fields(temp_id = %temp_id))]
    pub async fn complete(&self, temp_id: &ItemId) -> Result<OutboxEntry, OutboxError> {
        let mut entries = self.entries.write().await;
        let removed = entries
            .remove(temp_id.as_str())
            .ok_or_else(|| OutboxError::NotFound(temp_id.to_string()))?;

        if let Err(e) = self.persist(&entries).await {
            entries.insert(temp_id.as_str().to_string(), removed);
            return Err(e);
        }

        info!(attempts = removed.attempts, "Queued message delivered");
        Ok(removed)
    }

    /// Records a failed attempt: schedules a retry with backoff, or marks the
    /// entry permanently failed when attempts run out or the error is final.
    #[instrument(skip(self, error), fields(temp_id = %temp_id))]
    pub async fn mark_failed(
        &self,
        temp_id: &ItemId,
        error: &AppError,
        now: UnixTimeMs,
    ) -> Result<OutboxEntry, OutboxError> {
        let mut entries = self.entries.write().await;
        let mut entry = entries
            .get(temp_id.as_str())
            .cloned()
            .ok_or_else(|| OutboxError::NotFound(temp_id.to_string()))?;

        entry.last_error = Some(error.user_facing_message());

        entry.state = if !error.is_retryable() {
            EntryState::Failed {
                reason: FailureReason::NonRetryableError,
                failed_at: now,
            }
        } else if entry.attempts >= self.config.max_attempts {
            EntryState::Failed {
                reason: FailureReason::MaxAttemptsExceeded,
                failed_at: now,
            }
        } else {
            let jitter = if self.config.max_jitter_ms == 0 {
                0
            } else {
                rand::thread_rng().gen_range(0..=self.config.max_jitter_ms)
            };
            EntryState::Retrying {
                next_attempt_at: now.add_millis(self.backoff_ms(entry.attempts, jitter)),
            }
        };

        let updated = self.commit(&mut entries, entry).await?;

        warn!(
            attempts = updated.attempts,
            state = updated.state.name(),
            code = error.code(),
            "Queued message delivery failed"
        );
        Ok(updated)
    }

    /// User-requested retry of a permanently failed entry.
    pub async fn requeue(&self, temp_id: &ItemId) -> Result<OutboxEntry, OutboxError> {
        let mut entries = self.entries.write().await;
        let mut entry = entries
            .get(temp_id.as_str())
            .cloned()
            .ok_or_else(|| OutboxError::NotFound(temp_id.to_string()))?;

        if matches!(entry.state, EntryState::InFlight { .. }) {
            return Err(OutboxError::InvalidTransition {
                temp_id: temp_id.to_string(),
                from: entry.state.name(),
                to: "pending",
            });
        }

        entry.state = EntryState::Pending;
        entry.attempts = 0;
        self.commit(&mut entries, entry).await
    }

    /// Discards an entry the user gave up on.
    pub async fn remove(&self, temp_id: &ItemId) -> Result<bool, OutboxError> {
        let mut entries = self.entries.write().await;
        let Some(removed) = entries.remove(temp_id.as_str()) else {
            return Ok(false);
        };

        if let Err(e) = self.persist(&entries).await {
            entries.insert(temp_id.as_str().to_string(), removed);
            return Err(e);
        }
        Ok(true)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// `base * 2^(attempts-1)`, capped, plus jitter.
    #[must_use]
    pub fn backoff_ms(&self, attempts: u32, jitter_ms: u64) -> u64 {
        let exponent = attempts.saturating_sub(1).min(16);
        self.config
            .base_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.config.max_backoff_ms)
            .saturating_add(jitter_ms.min(self.config.max_jitter_ms))
    }
}
