//! The case discussion thread: fetch with retry, cached fallback, optimistic
//! sends reconciled against the server, and replay of queued messages.

mod state;
mod view;

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

pub use self::state::{
    Notice, NoticeAction, NoticeKind, PendingStatus, RefreshTrigger, SyncPhase, ThreadEntry,
};
pub use self::view::{ItemView, ThreadView};

use self::state::ThreadState;
use crate::cache::ThreadCache;
use crate::capabilities::{Capabilities, StoragePath};
use crate::config::SyncConfig;
use crate::model::{
    group_attachments, merge_thread, Attachment, CaseId, ItemId, ItemKind, MessageDraft,
    NewAttachment, ThreadItem, UploadFile, Viewer,
};
use crate::notify::notification_for;
use crate::outbox::{Outbox, PendingMessage};
use crate::retry::RetryPolicy;
use crate::{AppError, AppResult, Clock, ErrorKind};

/// A file that did not make it. `stored_path` is set when the bytes were
/// uploaded but the attachment record was not written.
#[derive(Debug, Clone)]
pub struct FailedUpload {
    pub file_name: String,
    pub stored_path: Option<String>,
    pub error: AppError,
}

#[derive(Debug, Clone, Default)]
pub struct UploadReport {
    pub uploaded: Vec<Attachment>,
    pub failed: Vec<FailedUpload>,
}

impl UploadReport {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone)]
pub enum SendOutcome {
    /// Stored by the server and shown in place of the optimistic entry.
    Confirmed {
        item: ThreadItem,
        uploads: UploadReport,
    },
    /// Kept in the outbox for a later replay.
    Queued { temp_id: ItemId, error: AppError },
}

#[derive(Debug, Clone, Default)]
pub struct ReplayReport {
    pub delivered: Vec<ItemId>,
    pub rescheduled: Vec<ItemId>,
    pub failed: Vec<ItemId>,
}

enum Delivery {
    Stored { item: ThreadItem, uploads: UploadReport },
    /// The server already holds this `client_ref`.
    AlreadyStored,
}

struct Inner {
    caps: Capabilities,
    cache: Arc<ThreadCache>,
    outbox: Arc<Outbox>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    author: Viewer,
    state: Mutex<ThreadState>,
    debounce: Mutex<Option<JoinHandle<()>>>,
}

/// Owns the thread of the open case for one signed-in user. Cheap to clone.
#[derive(Clone)]
pub struct ThreadSynchronizer {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ThreadSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadSynchronizer")
            .field("author", &self.inner.author)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl ThreadSynchronizer {
    pub fn new(
        caps: Capabilities,
        cache: Arc<ThreadCache>,
        outbox: Arc<Outbox>,
        clock: Arc<dyn Clock>,
        author: Viewer,
        config: SyncConfig,
    ) -> AppResult<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                caps,
                cache,
                outbox,
                clock,
                config,
                author,
                state: Mutex::new(ThreadState::default()),
                debounce: Mutex::new(None),
            }),
        })
    }

    /// Tears down the previous case, shows cached and queued items right
    /// away, then fetches.
    #[instrument(skip(self), fields(case_id = %case_id))]
    pub async fn open_case(&self, case_id: CaseId) -> SyncPhase {
        self.inner.cancel_debounce().await;

        let snapshot = self.inner.cache.get(&case_id).await;
        let queued = self.inner.outbox.entries_for_case(&case_id).await;
        let now = self.inner.clock.now();

        {
            let mut state = self.inner.state.lock().await;
            state.switch_to(Some(case_id));
            if let Some(snapshot) = &snapshot {
                state.apply_snapshot(snapshot, now);
            }
            state.restore_queued(&queued);
        }

        self.inner.refresh(RefreshTrigger::Mount).await
    }

    /// Trailing debounce: a burst of calls turns into one fetch after the
    /// quiet period.
    pub async fn request_refresh(&self) {
        let mut slot = self.inner.debounce.lock().await;
        if let Some(previous) = slot.take() {
            debug!("Coalescing refresh request");
            previous.abort();
        }

        let inner = Arc::clone(&self.inner);
        let delay = inner.config.debounce;
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.refresh(RefreshTrigger::UserRefresh).await;
        }));
    }

    pub async fn refresh_now(&self, trigger: RefreshTrigger) -> SyncPhase {
        self.inner.cancel_debounce().await;
        self.inner.refresh(trigger).await
    }

    /// Cancels timers and makes in-flight responses stale.
    pub async fn close(&self) {
        self.inner.cancel_debounce().await;
        self.inner.state.lock().await.switch_to(None);
    }

    pub async fn view(&self, viewer: &Viewer) -> ThreadView {
        let now = self.inner.clock.now();
        view::render(&*self.inner.state.lock().await, viewer, now)
    }

    pub async fn phase(&self) -> SyncPhase {
        self.inner.state.lock().await.phase
    }

    pub async fn dismiss_notice(&self) {
        self.inner.state.lock().await.notice = None;
    }

    pub async fn send_reply(&self, draft: MessageDraft) -> AppResult<SendOutcome> {
        if draft.kind != ItemKind::Reply {
            return Err(AppError::validation("Expected a reply draft"));
        }
        self.inner.submit(draft).await
    }

    pub async fn add_note(&self, draft: MessageDraft) -> AppResult<SendOutcome> {
        if draft.kind != ItemKind::Note {
            return Err(AppError::validation("Expected a note draft"));
        }
        self.inner.submit(draft).await
    }

    pub async fn upload_attachments(
        &self,
        case_id: &CaseId,
        reply_id: Option<&ItemId>,
        files: Vec<UploadFile>,
    ) -> UploadReport {
        let report = self
            .inner
            .upload_files(case_id, reply_id, files, &self.inner.config.retry)
            .await;
        self.inner.record_uploads(case_id, &report).await;
        report
    }

    /// One pass over the due outbox entries, each tried once; the outbox
    /// schedules the next attempt.
    pub async fn retry_pending(&self) -> ReplayReport {
        self.inner.replay().await
    }
}

impl Inner {
    async fn cancel_debounce(&self) {
        if let Some(handle) = self.debounce.lock().await.take() {
            handle.abort();
        }
    }

    #[instrument(skip(self))]
    async fn refresh(&self, trigger: RefreshTrigger) -> SyncPhase {
        let (case_id, generation) = {
            let mut state = self.state.lock().await;
            let Some(case_id) = state.case_id.clone() else {
                return state.phase;
            };
            (case_id, state.begin_fetch())
        };

        let result = self.fetch(&case_id).await;
        let now = self.clock.now();

        match result {
            Ok((items, case_attachments)) => {
                {
                    let mut state = self.state.lock().await;
                    if !state.is_current(&case_id, generation) {
                        debug!(case_id = %case_id, generation, "Discarding superseded response");
                        return state.phase;
                    }
                    state.apply_server(items.clone(), case_attachments.clone(), now);
                }
                info!(case_id = %case_id, items = items.len(), "Thread synced");
                self.cache.set(&case_id, items, case_attachments).await;
                SyncPhase::Live
            }
            Err(err) => {
                let snapshot = self.cache.get(&case_id).await;
                let mut state = self.state.lock().await;
                if !state.is_current(&case_id, generation) {
                    debug!(case_id = %case_id, generation, "Discarding superseded failure");
                    return state.phase;
                }

                let phase = match &snapshot {
                    Some(snapshot) => {
                        state.apply_snapshot(snapshot, now);
                        SyncPhase::Offline
                    }
                    None => SyncPhase::Empty,
                };
                state.phase = phase;

                if trigger.is_user_initiated() {
                    error!(case_id = %case_id, code = err.code(), "Thread fetch failed");
                    let message = if snapshot.is_some() {
                        "Couldn't reach the server. Showing saved messages."
                    } else {
                        "Couldn't load messages."
                    };
                    state.notice = Some(
                        Notice::new(NoticeKind::FetchFailed, message)
                            .with_action(NoticeAction::Refresh),
                    );
                } else {
                    warn!(
                        case_id = %case_id,
                        code = err.code(),
                        ?trigger,
                        "Background fetch failed, using cache"
                    );
                }
                state.phase
            }
        }
    }

    /// Replies and attachments for everyone; notes only for privileged viewers.
    async fn fetch(&self, case_id: &CaseId) -> AppResult<(Vec<ThreadItem>, Vec<Attachment>)> {
        let privileged = self.author.role.is_privileged();
        let backend = &self.caps.backend;

        let (mut replies, notes, attachments) = self
            .config
            .retry
            .run_app(move |_| async move {
                if privileged {
                    tokio::try_join!(
                        backend.fetch_replies(case_id),
                        backend.fetch_notes(case_id),
                        backend.fetch_attachments(case_id),
                    )
                } else {
                    tokio::try_join!(
                        backend.fetch_replies(case_id),
                        backend.fetch_attachments(case_id),
                    )
                    .map(|(replies, attachments)| (replies, Vec::new(), attachments))
                }
            })
            .await?;

        let case_attachments = group_attachments(&mut replies, attachments);
        Ok((merge_thread(replies, notes), case_attachments))
    }

    #[instrument(skip(self, draft), fields(case_id = %draft.case_id, kind = ?draft.kind))]
    async fn submit(&self, draft: MessageDraft) -> AppResult<SendOutcome> {
        draft.validate(self.author.role)?;

        let temp_id = ItemId::temporary();
        let message = PendingMessage::new(
            temp_id.clone(),
            self.author.user_id.clone(),
            self.author.role,
            draft,
            self.clock.now(),
        );
        let case_id = message.case_id().clone();

        {
            let mut state = self.state.lock().await;
            if state.is_open(&case_id) {
                state.insert_pending(temp_id.clone(), message.optimistic_item());
            }
        }

        match self.deliver(&message, &self.config.retry).await {
            Ok(Delivery::Stored { item, uploads }) => {
                self.confirm(&case_id, &temp_id, item.clone()).await;
                self.after_upload_notice(&case_id, &uploads).await;
                Ok(SendOutcome::Confirmed { item, uploads })
            }
            Ok(Delivery::AlreadyStored) => {
                self.state.lock().await.remove_pending(&temp_id);
                self.refresh(RefreshTrigger::Background).await;
                let echoed = self
                    .state
                    .lock()
                    .await
                    .confirmed_items()
                    .into_iter()
                    .find(|item| item.client_ref() == Some(temp_id.as_str()));
                match echoed {
                    Some(item) => Ok(SendOutcome::Confirmed {
                        item,
                        uploads: UploadReport::default(),
                    }),
                    None => Err(AppError::new(ErrorKind::Conflict, "Message was already sent")),
                }
            }
            Err(err) if err.is_retryable() => self.queue(message, err).await,
            Err(err) => {
                error!(code = err.code(), "Send rejected");
                self.mark_failed(&case_id, &temp_id, &err).await;
                Err(err)
            }
        }
    }

    async fn queue(&self, message: PendingMessage, err: AppError) -> AppResult<SendOutcome> {
        let temp_id = message.temp_id.clone();
        let case_id = message.case_id().clone();

        if let Err(outbox_err) = self.outbox.enqueue(message, self.clock.now()).await {
            error!(error = %outbox_err, "Could not save unsent message");
            self.mark_failed(&case_id, &temp_id, &err).await;
            return Err(outbox_err.into());
        }

        let mut state = self.state.lock().await;
        if state.is_open(&case_id) {
            state.set_pending_status(&temp_id, PendingStatus::Queued);
            state.notice = Some(
                Notice::new(
                    NoticeKind::SendQueued,
                    "You're offline. The message will be sent when the connection is back.",
                )
                .with_action(NoticeAction::RetryPending),
            );
        }
        warn!(temp_id = %temp_id, code = err.code(), "Message queued for replay");
        Ok(SendOutcome::Queued { temp_id, error: err })
    }

    async fn mark_failed(&self, case_id: &CaseId, temp_id: &ItemId, err: &AppError) {
        let mut state = self.state.lock().await;
        if state.is_open(case_id) {
            state.set_pending_status(temp_id, PendingStatus::Failed);
            state.notice = Some(Notice::new(
                NoticeKind::SendFailed,
                format!("Message not sent: {}", err.user_facing_message()),
            ));
        }
    }

    /// The cache write keeps the capture time of the list being extended, so
    /// a stale list does not come back from the cache as fresh.
    async fn confirm(&self, case_id: &CaseId, temp_id: &ItemId, item: ThreadItem) {
        let (items, case_attachments, captured_at) = {
            let mut state = self.state.lock().await;
            if !state.is_open(case_id) {
                return;
            }
            state.confirm(temp_id, item);
            let Some(synced_at) = state.last_synced_at else {
                return;
            };
            (state.confirmed_items(), state.case_attachments.clone(), synced_at)
        };
        self.cache
            .set_at(case_id, items, case_attachments, captured_at)
            .await;
    }

    /// Inserts the row (with `client_ref` as idempotency key), uploads its
    /// files and requests a notification.
    async fn deliver(&self, message: &PendingMessage, policy: &RetryPolicy) -> AppResult<Delivery> {
        let backend = &self.caps.backend;
        let inserted = match message.kind() {
            ItemKind::Reply => {
                let row = &message.new_reply();
                policy
                    .run_app(move |_| async move {
                        backend.insert_reply(row).await.map(ThreadItem::Reply)
                    })
                    .await
            }
            ItemKind::Note => {
                let row = &message.new_note();
                policy
                    .run_app(move |_| async move {
                        backend.insert_note(row).await.map(ThreadItem::Note)
                    })
                    .await
            }
        };

        let mut item = match inserted {
            Ok(item) => item,
            Err(err) if err.kind == ErrorKind::Conflict => {
                info!(temp_id = %message.temp_id, "Server already has this message");
                return Ok(Delivery::AlreadyStored);
            }
            Err(err) => return Err(err),
        };

        let uploads = if message.draft.files.is_empty() {
            UploadReport::default()
        } else {
            self.upload_files(
                message.case_id(),
                Some(item.id()),
                message.draft.files.clone(),
                policy,
            )
            .await
        };
        item.attachments_mut().extend(uploads.uploaded.iter().cloned());

        if self.config.notify_on_reply {
            if let Some(request) = notification_for(&item, message.author_role) {
                if let Err(err) = self.caps.notifier.notify(&request).await {
                    warn!(code = err.code(), "Notification request failed");
                }
            }
        }

        Ok(Delivery::Stored { item, uploads })
    }

    /// Each file is uploaded and recorded on its own; one failure never
    /// discards the others.
    async fn upload_files(
        &self,
        case_id: &CaseId,
        reply_id: Option<&ItemId>,
        files: Vec<UploadFile>,
        policy: &RetryPolicy,
    ) -> UploadReport {
        let mut report = UploadReport::default();
        let owner = &self.author.user_id;

        for file in files {
            let stamp = self.clock.now();
            let path = match reply_id {
                Some(_) => StoragePath::for_reply(owner, case_id, &file.file_name, stamp),
                None => StoragePath::for_case(owner, case_id, &file.file_name, stamp),
            };
            let data = &Bytes::from(file.data.clone());
            let (path, content_type) = (&path, file.content_type.as_str());
            let storage = &self.caps.storage;

            let stored = policy
                .run_app(move |_| {
                    let data = data.clone();
                    async move { storage.upload(path, content_type, data).await }
                })
                .await;
            let stored_path = match stored {
                Ok(stored_path) => stored_path,
                Err(error) => {
                    warn!(file = %file.file_name, code = error.code(), "Upload failed");
                    report.failed.push(FailedUpload {
                        file_name: file.file_name,
                        stored_path: None,
                        error,
                    });
                    continue;
                }
            };

            let record = NewAttachment {
                case_id: case_id.clone(),
                reply_id: reply_id.cloned(),
                file_name: file.file_name.clone(),
                file_path: stored_path.clone(),
                content_type: file.content_type.clone(),
                file_size: file.size_bytes(),
                created_by: owner.clone(),
            };
            let (backend, record) = (&self.caps.backend, &record);
            match policy
                .run_app(move |_| async move { backend.insert_attachment(record).await })
                .await
            {
                Ok(attachment) => report.uploaded.push(attachment),
                Err(error) => {
                    warn!(file = %file.file_name, code = error.code(), "Attachment record failed");
                    report.failed.push(FailedUpload {
                        file_name: file.file_name,
                        stored_path: Some(stored_path),
                        error,
                    });
                }
            }
        }

        info!(
            uploaded = report.uploaded.len(),
            failed = report.failed.len(),
            "Uploads finished"
        );
        report
    }

    async fn record_uploads(&self, case_id: &CaseId, report: &UploadReport) {
        {
            let mut state = self.state.lock().await;
            if state.is_open(case_id) {
                state.attach(report.uploaded.clone());
            }
        }
        self.after_upload_notice(case_id, report).await;
    }

    async fn after_upload_notice(&self, case_id: &CaseId, report: &UploadReport) {
        if report.is_complete() {
            return;
        }
        let names: Vec<&str> = report.failed.iter().map(|f| f.file_name.as_str()).collect();
        let mut state = self.state.lock().await;
        if state.is_open(case_id) {
            state.notice = Some(Notice::new(
                NoticeKind::UploadIncomplete,
                format!("Some files were not attached: {}", names.join(", ")),
            ));
        }
    }

    #[instrument(skip(self))]
    async fn replay(&self) -> ReplayReport {
        let mut report = ReplayReport::default();
        let mut refresh_needed = false;
        let once = RetryPolicy::once().with_attempt_timeout(self.config.retry.attempt_timeout);

        for entry in self.outbox.due_entries(self.clock.now()).await {
            let temp_id = entry.temp_id().clone();
            let case_id = entry.message.case_id().clone();

            if let Err(e) = self.outbox.mark_in_flight(&temp_id, self.clock.now()).await {
                warn!(temp_id = %temp_id, error = %e, "Skipping outbox entry");
                continue;
            }
            self.set_status(&case_id, &temp_id, PendingStatus::Sending).await;

            match self.deliver(&entry.message, &once).await {
                Ok(delivery) => {
                    if let Err(e) = self.outbox.complete(&temp_id).await {
                        warn!(temp_id = %temp_id, error = %e, "Delivered entry left in outbox");
                    }
                    match delivery {
                        Delivery::Stored { item, uploads } => {
                            self.confirm(&case_id, &temp_id, item).await;
                            self.after_upload_notice(&case_id, &uploads).await;
                        }
                        Delivery::AlreadyStored => {
                            self.state.lock().await.remove_pending(&temp_id);
                            refresh_needed = true;
                        }
                    }
                    report.delivered.push(temp_id);
                }
                Err(err) => {
                    let failed = match self
                        .outbox
                        .mark_failed(&temp_id, &err, self.clock.now())
                        .await
                    {
                        Ok(updated) => updated.is_failed(),
                        Err(e) => {
                            warn!(
                                temp_id = %temp_id,
                                error = %e,
                                "Could not record replay failure"
                            );
                            false
                        }
                    };
                    if failed {
                        self.mark_failed(&case_id, &temp_id, &err).await;
                        report.failed.push(temp_id);
                    } else {
                        self.set_status(&case_id, &temp_id, PendingStatus::Queued).await;
                        report.rescheduled.push(temp_id);
                    }
                }
            }
        }

        if refresh_needed {
            self.refresh(RefreshTrigger::Reconnect).await;
        }

        info!(
            delivered = report.delivered.len(),
            rescheduled = report.rescheduled.len(),
            failed = report.failed.len(),
            "Outbox replay finished"
        );
        report
    }

    async fn set_status(&self, case_id: &CaseId, temp_id: &ItemId, status: PendingStatus) {
        let mut state = self.state.lock().await;
        if state.is_open(case_id) {
            state.set_pending_status(temp_id, status);
        }
    }
}
