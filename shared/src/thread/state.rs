use serde::{Deserialize, Serialize};

use crate::cache::{CachedThreadSnapshot, Freshness};
use crate::model::{Attachment, CaseId, ItemId, ThreadItem};
use crate::outbox::OutboxEntry;
use crate::UnixTimeMs;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Fetching,
    Live,
    Offline,
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshTrigger {
    Mount,
    UserRefresh,
    Background,
    Reconnect,
}

impl RefreshTrigger {
    /// Failures of these are shown to the user; the rest fall back silently.
    #[must_use]
    pub const fn is_user_initiated(self) -> bool {
        matches!(self, Self::Mount | Self::UserRefresh)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PendingStatus {
    Sending,
    /// Saved in the outbox, waiting for replay.
    Queued,
    Failed,
}

/// A thread item as the client knows it: either awaiting the server or confirmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadEntry {
    Pending {
        temp_id: ItemId,
        item: ThreadItem,
        status: PendingStatus,
    },
    Confirmed(ThreadItem),
}

impl ThreadEntry {
    #[must_use]
    pub const fn item(&self) -> &ThreadItem {
        match self {
            Self::Pending { item, .. } | Self::Confirmed(item) => item,
        }
    }

    #[must_use]
    pub const fn is_optimistic(&self) -> bool {
        matches!(self, Self::Pending { .. })
    }

    #[must_use]
    pub const fn temp_id(&self) -> Option<&ItemId> {
        match self {
            Self::Pending { temp_id, .. } => Some(temp_id),
            Self::Confirmed(_) => None,
        }
    }

    #[must_use]
    pub const fn pending_status(&self) -> Option<PendingStatus> {
        match self {
            Self::Pending { status, .. } => Some(*status),
            Self::Confirmed(_) => None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    FetchFailed,
    SendQueued,
    SendFailed,
    UploadIncomplete,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NoticeAction {
    Refresh,
    RetryPending,
}

/// Dismissible message for the user, optionally offering a retry.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub message: String,
    pub action: Option<NoticeAction>,
}

impl Notice {
    pub fn new(kind: NoticeKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            action: None,
        }
    }

    #[must_use]
    pub const fn with_action(mut self, action: NoticeAction) -> Self {
        self.action = Some(action);
        self
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ThreadState {
    pub case_id: Option<CaseId>,
    pub generation: u64,
    pub phase: SyncPhase,
    pub entries: Vec<ThreadEntry>,
    pub case_attachments: Vec<Attachment>,
    pub freshness: Option<Freshness>,
    pub last_synced_at: Option<UnixTimeMs>,
    pub notice: Option<Notice>,
}

impl Default for ThreadState {
    fn default() -> Self {
        Self {
            case_id: None,
            generation: 0,
            phase: SyncPhase::Idle,
            entries: Vec::new(),
            case_attachments: Vec::new(),
            freshness: None,
            last_synced_at: None,
            notice: None,
        }
    }
}

impl ThreadState {
    /// Forgets the previous case; the generation keeps counting so late
    /// responses for it are recognised as superseded.
    pub fn switch_to(&mut self, case_id: Option<CaseId>) -> u64 {
        let generation = self.generation.wrapping_add(1);
        *self = Self {
            case_id,
            generation,
            ..Self::default()
        };
        generation
    }

    pub fn begin_fetch(&mut self) -> u64 {
        self.generation = self.generation.wrapping_add(1);
        self.phase = SyncPhase::Fetching;
        self.generation
    }

    pub fn is_current(&self, case_id: &CaseId, generation: u64) -> bool {
        self.generation == generation && self.case_id.as_ref() == Some(case_id)
    }

    pub fn is_open(&self, case_id: &CaseId) -> bool {
        self.case_id.as_ref() == Some(case_id)
    }

    fn pending(&self) -> impl Iterator<Item = &ThreadEntry> {
        self.entries.iter().filter(|e| e.is_optimistic())
    }

    fn replace_confirmed(&mut self, items: Vec<ThreadItem>, case_attachments: Vec<Attachment>) {
        let echoed = |entry: &ThreadEntry| {
            entry.temp_id().is_some_and(|temp| {
                items
                    .iter()
                    .any(|item| item.client_ref() == Some(temp.as_str()))
            })
        };

        let pending: Vec<ThreadEntry> = self
            .pending()
            .filter(|entry| !echoed(entry))
            .cloned()
            .collect();

        self.entries = items.into_iter().map(ThreadEntry::Confirmed).collect();
        self.entries.extend(pending);
        self.case_attachments = case_attachments;
    }

    /// Server data wins; local entries the server already echoes are dropped.
    pub fn apply_server(
        &mut self,
        items: Vec<ThreadItem>,
        case_attachments: Vec<Attachment>,
        now: UnixTimeMs,
    ) {
        self.replace_confirmed(items, case_attachments);
        self.phase = SyncPhase::Live;
        self.freshness = Some(Freshness::Fresh);
        self.last_synced_at = Some(now);
        if self
            .notice
            .as_ref()
            .is_some_and(|n| n.kind == NoticeKind::FetchFailed)
        {
            self.notice = None;
        }
    }

    pub fn apply_snapshot(&mut self, snapshot: &CachedThreadSnapshot, now: UnixTimeMs) {
        self.replace_confirmed(snapshot.items.clone(), snapshot.case_attachments.clone());
        self.freshness = Some(snapshot.freshness(now));
        self.last_synced_at = Some(snapshot.captured_at);
    }

    /// Shows queued outbox messages that are not displayed yet.
    pub fn restore_queued(&mut self, queued: &[OutboxEntry]) {
        for entry in queued {
            let temp_id = entry.temp_id();
            let shown = self.entries.iter().any(|e| {
                e.temp_id() == Some(temp_id) || e.item().client_ref() == Some(temp_id.as_str())
            });
            if shown {
                continue;
            }
            let status = if entry.is_failed() {
                PendingStatus::Failed
            } else {
                PendingStatus::Queued
            };
            self.entries.push(ThreadEntry::Pending {
                temp_id: temp_id.clone(),
                item: entry.message.optimistic_item(),
                status,
            });
        }
    }

    pub fn insert_pending(&mut self, temp_id: ItemId, item: ThreadItem) {
        self.entries.push(ThreadEntry::Pending {
            temp_id,
            item,
            status: PendingStatus::Sending,
        });
    }

    pub fn set_pending_status(&mut self, temp_id: &ItemId, status: PendingStatus) {
        for entry in &mut self.entries {
            if let ThreadEntry::Pending {
                temp_id: id,
                status: current,
                ..
            } = entry
            {
                if id == temp_id {
                    *current = status;
                }
            }
        }
    }

    /// Swaps the pending entry for the server item in the same slot. If a
    /// refresh already delivered the server item, the pending entry just goes.
    pub fn confirm(&mut self, temp_id: &ItemId, item: ThreadItem) {
        let already = self
            .entries
            .iter()
            .any(|e| !e.is_optimistic() && e.item().id() == item.id());
        let position = self
            .entries
            .iter()
            .position(|e| e.temp_id() == Some(temp_id));

        match (position, already) {
            (Some(index), false) => self.entries[index] = ThreadEntry::Confirmed(item),
            (Some(index), true) => {
                self.entries.remove(index);
            }
            (None, false) => self.entries.push(ThreadEntry::Confirmed(item)),
            (None, true) => {}
        }
    }

    pub fn remove_pending(&mut self, temp_id: &ItemId) {
        self.entries.retain(|e| e.temp_id() != Some(temp_id));
    }

    pub fn attach(&mut self, attachments: Vec<Attachment>) {
        for attachment in attachments {
            let target = attachment.reply_id.clone().and_then(|reply_id| {
                self.entries
                    .iter_mut()
                    .find(|e| !e.is_optimistic() && e.item().id() == &reply_id)
            });
            match target {
                Some(ThreadEntry::Confirmed(item)) => item.attachments_mut().push(attachment),
                _ => {
                    if attachment.is_case_level() {
                        self.case_attachments.push(attachment);
                    }
                }
            }
        }
    }

    pub fn confirmed_items(&self) -> Vec<ThreadItem> {
        self.entries
            .iter()
            .filter_map(|e| match e {
                ThreadEntry::Confirmed(item) => Some(item.clone()),
                ThreadEntry::Pending { .. } => None,
            })
            .collect()
    }
}
