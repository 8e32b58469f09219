#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

use helpdesk_shared::capabilities::{
    KeyValueStore, MemoryKvStore, ObjectStorage, StoragePath, ThreadBackend,
};
use helpdesk_shared::capabilities::Notifier;
use helpdesk_shared::model::{AttachmentId, NewAttachment, NewNote, NewReply};
use helpdesk_shared::notify::NotificationRequest;
use helpdesk_shared::offline_store::EnvelopeCodec;
use helpdesk_shared::{
    AppError, AppResult, Attachment, CacheConfig, Capabilities, CaseId, Clock, ErrorKind, ItemId,
    ManualClock, Note, Outbox, OutboxConfig, Reply, RetryPolicy, SyncConfig, ThreadCache,
    ThreadSynchronizer, UnixTimeMs, Viewer,
};

pub const START: UnixTimeMs = UnixTimeMs(1_700_000_000_000);

#[derive(Default)]
struct Tables {
    replies: Vec<Reply>,
    notes: Vec<Note>,
    attachments: Vec<Attachment>,
}

/// In-memory stand-in for the hosted tables, with failure switches.
pub struct FakeBackend {
    clock: ManualClock,
    tables: Mutex<Tables>,
    next_id: AtomicU64,
    pub offline: AtomicBool,
    /// Store the insert but report a network error, as if the response was lost.
    pub lose_next_response: AtomicBool,
    /// After a lost response the connection stays down until `set_offline(false)`.
    pub stay_down_after_loss: AtomicBool,
    pub reply_fetches: AtomicU32,
    pub note_fetches: AtomicU32,
    pub reply_inserts: AtomicU32,
    insert_gate: Option<Arc<Semaphore>>,
    slow_cases: Mutex<HashMap<CaseId, Duration>>,
}

impl FakeBackend {
    pub fn new(clock: ManualClock) -> Self {
        Self {
            clock,
            tables: Mutex::new(Tables::default()),
            next_id: AtomicU64::new(1),
            offline: AtomicBool::new(false),
            lose_next_response: AtomicBool::new(false),
            stay_down_after_loss: AtomicBool::new(false),
            reply_fetches: AtomicU32::new(0),
            note_fetches: AtomicU32::new(0),
            reply_inserts: AtomicU32::new(0),
            insert_gate: None,
            slow_cases: Mutex::new(HashMap::new()),
        }
    }

    /// Inserts wait for a permit on the returned semaphore.
    pub fn gated(clock: ManualClock) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let backend = Self {
            insert_gate: Some(gate.clone()),
            ..Self::new(clock)
        };
        (backend, gate)
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Reply fetches for `case_id` take `delay` before answering.
    pub fn slow_fetch(&self, case_id: &str, delay: Duration) {
        self.slow_cases
            .lock()
            .unwrap()
            .insert(CaseId::new(case_id), delay);
    }

    pub fn replies(&self) -> Vec<Reply> {
        self.tables.lock().unwrap().replies.clone()
    }

    pub fn notes(&self) -> Vec<Note> {
        self.tables.lock().unwrap().notes.clone()
    }

    pub fn attachments(&self) -> Vec<Attachment> {
        self.tables.lock().unwrap().attachments.clone()
    }

    fn check_online(&self) -> AppResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(AppError::network("connection refused"))
        } else {
            Ok(())
        }
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{prefix}{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn wait_gate(&self) {
        if let Some(gate) = &self.insert_gate {
            gate.acquire().await.unwrap().forget();
        }
    }

    fn after_store<T>(&self, value: T) -> AppResult<T> {
        if self.lose_next_response.swap(false, Ordering::SeqCst) {
            if self.stay_down_after_loss.load(Ordering::SeqCst) {
                self.set_offline(true);
            }
            return Err(AppError::network("connection reset"));
        }
        Ok(value)
    }
}

#[async_trait]
impl ThreadBackend for FakeBackend {
    async fn fetch_replies(&self, case_id: &CaseId) -> AppResult<Vec<Reply>> {
        self.reply_fetches.fetch_add(1, Ordering::SeqCst);
        let delay = self.slow_cases.lock().unwrap().get(case_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check_online()?;
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .replies
            .iter()
            .filter(|r| &r.case_id == case_id)
            .cloned()
            .collect())
    }

    async fn fetch_notes(&self, case_id: &CaseId) -> AppResult<Vec<Note>> {
        self.note_fetches.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .notes
            .iter()
            .filter(|n| &n.case_id == case_id)
            .cloned()
            .collect())
    }

    async fn fetch_attachments(&self, case_id: &CaseId) -> AppResult<Vec<Attachment>> {
        self.check_online()?;
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .attachments
            .iter()
            .filter(|a| &a.case_id == case_id)
            .cloned()
            .collect())
    }

    async fn insert_reply(&self, reply: &NewReply) -> AppResult<Reply> {
        self.wait_gate().await;
        self.reply_inserts.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;

        let stored = {
            let mut tables = self.tables.lock().unwrap();
            if tables
                .replies
                .iter()
                .any(|r| r.client_ref.as_deref() == Some(reply.client_ref.as_str()))
            {
                return Err(AppError::new(ErrorKind::Conflict, "duplicate client_ref"));
            }
            let stored = Reply {
                id: ItemId::new(self.next_id("r")),
                case_id: reply.case_id.clone(),
                author_id: reply.user_id.clone(),
                content: reply.content.clone(),
                created_at: self.clock.now(),
                is_internal: reply.is_internal,
                attachments: vec![],
                client_ref: Some(reply.client_ref.clone()),
            };
            tables.replies.push(stored.clone());
            stored
        };
        self.after_store(stored)
    }

    async fn insert_note(&self, note: &NewNote) -> AppResult<Note> {
        self.wait_gate().await;
        self.check_online()?;

        let stored = {
            let mut tables = self.tables.lock().unwrap();
            if tables
                .notes
                .iter()
                .any(|n| n.client_ref.as_deref() == Some(note.client_ref.as_str()))
            {
                return Err(AppError::new(ErrorKind::Conflict, "duplicate client_ref"));
            }
            let stored = Note {
                id: ItemId::new(self.next_id("n")),
                case_id: note.case_id.clone(),
                author_id: note.user_id.clone(),
                content: note.content.clone(),
                created_at: self.clock.now(),
                attachments: vec![],
                client_ref: Some(note.client_ref.clone()),
            };
            tables.notes.push(stored.clone());
            stored
        };
        self.after_store(stored)
    }

    async fn insert_attachment(&self, attachment: &NewAttachment) -> AppResult<Attachment> {
        self.check_online()?;
        let stored = Attachment {
            id: AttachmentId::new(self.next_id("a")),
            case_id: attachment.case_id.clone(),
            reply_id: attachment.reply_id.clone(),
            file_name: attachment.file_name.clone(),
            storage_path: attachment.file_path.clone(),
            content_type: attachment.content_type.clone(),
            size_bytes: attachment.file_size,
            created_by: attachment.created_by.clone(),
            created_at: self.clock.now(),
        };
        self.tables.lock().unwrap().attachments.push(stored.clone());
        Ok(stored)
    }
}

/// Object storage that refuses the file names it is told to.
#[derive(Default)]
pub struct FakeStorage {
    pub uploaded: Mutex<Vec<String>>,
    pub reject: Mutex<HashSet<String>>,
}

impl FakeStorage {
    pub fn reject(&self, file_name: &str) {
        self.reject.lock().unwrap().insert(file_name.to_string());
    }
}

#[async_trait]
impl ObjectStorage for FakeStorage {
    async fn upload(
        &self,
        path: &StoragePath,
        _content_type: &str,
        _data: Bytes,
    ) -> AppResult<String> {
        let rejected = self
            .reject
            .lock()
            .unwrap()
            .iter()
            .any(|name| path.as_str().ends_with(name.as_str()));
        if rejected {
            return Err(AppError::new(ErrorKind::Unavailable, "bucket unavailable"));
        }
        self.uploaded.lock().unwrap().push(path.to_string());
        Ok(path.to_string())
    }

    async fn signed_url(&self, path: &str, ttl: Duration) -> AppResult<String> {
        Ok(format!("https://files.example.com/{path}?ttl={}", ttl.as_secs()))
    }
}

#[derive(Default)]
pub struct FakeNotifier {
    pub sent: Mutex<Vec<NotificationRequest>>,
}

#[async_trait]
impl Notifier for FakeNotifier {
    async fn notify(&self, request: &NotificationRequest) -> AppResult<()> {
        self.sent.lock().unwrap().push(request.clone());
        Ok(())
    }
}

/// Retry timing small enough for paused-clock tests.
pub fn fast_sync_config() -> SyncConfig {
    SyncConfig {
        retry: RetryPolicy::default()
            .with_initial_delay(Duration::from_millis(10))
            .with_max_jitter(Duration::ZERO)
            .with_max_total_delay(Duration::from_millis(100)),
        ..SyncConfig::default()
    }
}

pub fn outbox_config() -> OutboxConfig {
    OutboxConfig {
        max_jitter_ms: 0,
        ..OutboxConfig::default()
    }
}

/// Shared collaborators; several synchronizers can sit on one world.
pub struct World {
    pub clock: ManualClock,
    pub backend: Arc<FakeBackend>,
    pub storage: Arc<FakeStorage>,
    pub notifier: Arc<FakeNotifier>,
    pub kv: Arc<dyn KeyValueStore>,
}

impl World {
    pub fn new() -> Self {
        let clock = ManualClock::new(START);
        Self::with_backend(clock.clone(), FakeBackend::new(clock))
    }

    pub fn with_backend(clock: ManualClock, backend: FakeBackend) -> Self {
        Self {
            clock,
            backend: Arc::new(backend),
            storage: Arc::new(FakeStorage::default()),
            notifier: Arc::new(FakeNotifier::default()),
            kv: Arc::new(MemoryKvStore::new()),
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            backend: self.backend.clone(),
            storage: self.storage.clone(),
            notifier: self.notifier.clone(),
            kv: self.kv.clone(),
        }
    }

    pub async fn outbox(&self) -> Arc<Outbox> {
        self.outbox_with(EnvelopeCodec::plain()).await
    }

    pub async fn outbox_with(&self, codec: EnvelopeCodec) -> Arc<Outbox> {
        Arc::new(
            Outbox::open(self.kv.clone(), codec, outbox_config())
                .await
                .unwrap(),
        )
    }

    pub fn cache(&self) -> Arc<ThreadCache> {
        Arc::new(ThreadCache::new(
            self.kv.clone(),
            Arc::new(self.clock.clone()),
            CacheConfig::default(),
        ))
    }

    pub async fn synchronizer(&self, viewer: &Viewer) -> ThreadSynchronizer {
        let outbox = self.outbox().await;
        self.synchronizer_with(viewer, outbox)
    }

    pub fn synchronizer_with(&self, viewer: &Viewer, outbox: Arc<Outbox>) -> ThreadSynchronizer {
        ThreadSynchronizer::new(
            self.capabilities(),
            self.cache(),
            outbox,
            Arc::new(self.clock.clone()),
            viewer.clone(),
            fast_sync_config(),
        )
        .unwrap()
    }
}

pub fn user() -> Viewer {
    Viewer::new("u1", helpdesk_shared::UserRole::User)
}

pub fn consultant() -> Viewer {
    Viewer::new("k1", helpdesk_shared::UserRole::Consultant)
}

