use serde::{Deserialize, Serialize};

use super::state::{Notice, PendingStatus, SyncPhase, ThreadState};
use crate::model::{Attachment, CaseId, ItemId, ItemKind, UserId, Viewer};
use crate::{format_time_ago, UnixTimeMs};

/// One row of the rendered thread.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ItemView {
    pub id: ItemId,
    pub kind: ItemKind,
    pub author_id: UserId,
    pub is_own: bool,
    pub content: String,
    pub created_at: UnixTimeMs,
    pub time_ago: String,
    pub is_internal: bool,
    pub attachments: Vec<Attachment>,
    pub is_optimistic: bool,
    pub pending: Option<PendingStatus>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ThreadView {
    pub case_id: Option<CaseId>,
    pub phase: SyncPhase,
    pub items: Vec<ItemView>,
    pub case_attachments: Vec<Attachment>,
    pub is_offline: bool,
    pub is_stale: bool,
    pub last_synced: Option<String>,
    pub notice: Option<Notice>,
}

impl ThreadView {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.items.iter().filter(|i| i.is_optimistic).count()
    }
}

/// Sorted and filtered for `viewer` on every call; the stored entries are
/// shared by every role.
pub(crate) fn render(state: &ThreadState, viewer: &Viewer, now: UnixTimeMs) -> ThreadView {
    let mut visible: Vec<_> = state
        .entries
        .iter()
        .filter(|entry| viewer.can_see(entry.item()))
        .collect();
    visible.sort_by_key(|entry| entry.item().created_at());

    let items = visible
        .into_iter()
        .map(|entry| {
            let item = entry.item();
            ItemView {
                id: item.id().clone(),
                kind: item.kind(),
                author_id: item.author_id().clone(),
                is_own: item.author_id() == &viewer.user_id,
                content: item.content().to_string(),
                created_at: item.created_at(),
                time_ago: format_time_ago(item.created_at().0, now.0),
                is_internal: item.is_internal(),
                attachments: item.attachments().to_vec(),
                is_optimistic: entry.is_optimistic(),
                pending: entry.pending_status(),
            }
        })
        .collect();

    ThreadView {
        case_id: state.case_id.clone(),
        phase: state.phase,
        items,
        case_attachments: state.case_attachments.clone(),
        is_offline: matches!(state.phase, SyncPhase::Offline | SyncPhase::Empty),
        is_stale: state.freshness.is_some_and(|f| f.is_stale()),
        last_synced: state
            .last_synced_at
            .map(|at| format_time_ago(at.0, now.0)),
        notice: state.notice.clone(),
    }
}
