use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::{
    AppError, AppResult, ErrorKind, UnixTimeMs, MAX_CONTENT_LENGTH, MAX_FILES_PER_MESSAGE,
    MAX_FILE_BYTES, MAX_FILE_NAME_LENGTH,
};

/// Prefix of client-minted identifiers that the server has not confirmed yet.
pub const TEMP_ID_PREFIX: &str = "temp-";

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

typed_id!(CaseId);
typed_id!(UserId);
typed_id!(ItemId);
typed_id!(AttachmentId);

impl ItemId {
    /// Mints a client-side id; it doubles as the idempotency key sent with the insert.
    #[must_use]
    pub fn temporary() -> Self {
        Self(format!("{TEMP_ID_PREFIX}{}", Uuid::new_v4()))
    }

    #[must_use]
    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMP_ID_PREFIX)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    #[default]
    User,
    Consultant,
}

impl UserRole {
    #[must_use]
    pub const fn is_privileged(self) -> bool {
        matches!(self, Self::Consultant)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Consultant => "consultant",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CasePriority {
    Low,
    Medium,
    High,
}

impl CasePriority {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    New,
    Ongoing,
    Resolved,
    Completed,
    Draft,
}

impl CaseStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Ongoing => "ongoing",
            Self::Resolved => "resolved",
            Self::Completed => "completed",
            Self::Draft => "draft",
        }
    }
}

/// A stored file reference. Without a `reply_id` it belongs to the case itself.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Attachment {
    pub id: AttachmentId,
    pub case_id: CaseId,
    pub reply_id: Option<ItemId>,
    pub file_name: String,
    pub storage_path: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub created_by: UserId,
    pub created_at: UnixTimeMs,
}

impl Attachment {
    #[must_use]
    pub const fn is_case_level(&self) -> bool {
        self.reply_id.is_none()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    pub id: ItemId,
    pub case_id: CaseId,
    pub author_id: UserId,
    pub content: String,
    pub created_at: UnixTimeMs,
    pub is_internal: bool,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub client_ref: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Note {
    pub id: ItemId,
    pub case_id: CaseId,
    pub author_id: UserId,
    pub content: String,
    pub created_at: UnixTimeMs,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub client_ref: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Reply,
    Note,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ThreadItem {
    Reply(Reply),
    Note(Note),
}

impl ThreadItem {
    #[must_use]
    pub const fn kind(&self) -> ItemKind {
        match self {
            Self::Reply(_) => ItemKind::Reply,
            Self::Note(_) => ItemKind::Note,
        }
    }

    #[must_use]
    pub const fn id(&self) -> &ItemId {
        match self {
            Self::Reply(r) => &r.id,
            Self::Note(n) => &n.id,
        }
    }

    #[must_use]
    pub const fn case_id(&self) -> &CaseId {
        match self {
            Self::Reply(r) => &r.case_id,
            Self::Note(n) => &n.case_id,
        }
    }

    #[must_use]
    pub const fn author_id(&self) -> &UserId {
        match self {
            Self::Reply(r) => &r.author_id,
            Self::Note(n) => &n.author_id,
        }
    }

    #[must_use]
    pub fn content(&self) -> &str {
        match self {
            Self::Reply(r) => &r.content,
            Self::Note(n) => &n.content,
        }
    }

    #[must_use]
    pub const fn created_at(&self) -> UnixTimeMs {
        match self {
            Self::Reply(r) => r.created_at,
            Self::Note(n) => n.created_at,
        }
    }

    /// Notes are internal by definition.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        match self {
            Self::Reply(r) => r.is_internal,
            Self::Note(_) => true,
        }
    }

    #[must_use]
    pub fn attachments(&self) -> &[Attachment] {
        match self {
            Self::Reply(r) => &r.attachments,
            Self::Note(n) => &n.attachments,
        }
    }

    pub fn attachments_mut(&mut self) -> &mut Vec<Attachment> {
        match self {
            Self::Reply(r) => &mut r.attachments,
            Self::Note(n) => &mut n.attachments,
        }
    }

    #[must_use]
    pub fn client_ref(&self) -> Option<&str> {
        match self {
            Self::Reply(r) => r.client_ref.as_deref(),
            Self::Note(n) => n.client_ref.as_deref(),
        }
    }
}

/// Merges replies and notes into one list in ascending creation order.
#[must_use]
pub fn merge_thread(replies: Vec<Reply>, notes: Vec<Note>) -> Vec<ThreadItem> {
    let mut items: Vec<ThreadItem> = replies
        .into_iter()
        .map(ThreadItem::Reply)
        .chain(notes.into_iter().map(ThreadItem::Note))
        .collect();
    sort_chronologically(&mut items);
    items
}

/// Stable, so items sharing a timestamp keep their relative order.
pub fn sort_chronologically(items: &mut [ThreadItem]) {
    items.sort_by_key(ThreadItem::created_at);
}

/// Hangs reply attachments off their replies and returns the case-level ones.
/// Attachments of replies missing from `replies` are dropped.
pub fn group_attachments(replies: &mut [Reply], attachments: Vec<Attachment>) -> Vec<Attachment> {
    let mut case_level = Vec::new();
    for attachment in attachments {
        match &attachment.reply_id {
            None => case_level.push(attachment),
            Some(reply_id) => {
                if let Some(reply) = replies.iter_mut().find(|r| &r.id == reply_id) {
                    reply.attachments.push(attachment);
                }
            }
        }
    }
    for reply in replies.iter_mut() {
        reply.attachments.sort_by_key(|a| a.created_at);
    }
    case_level.sort_by_key(|a| a.created_at);
    case_level
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Viewer {
    pub user_id: UserId,
    pub role: UserRole,
}

impl Viewer {
    pub fn new(user_id: impl Into<String>, role: UserRole) -> Self {
        Self {
            user_id: UserId::new(user_id),
            role,
        }
    }

    /// Display filter only; row-level security on the server is the real boundary.
    #[must_use]
    pub const fn can_see(&self, item: &ThreadItem) -> bool {
        self.role.is_privileged() || !item.is_internal()
    }
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct UploadFile {
    pub file_name: String,
    pub content_type: String,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

impl UploadFile {
    pub fn new(
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        data: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: content_type.into(),
            data: data.into(),
        }
    }

    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.data.len() as u64
    }
}

impl fmt::Debug for UploadFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadFile")
            .field("file_name", &self.file_name)
            .field("content_type", &self.content_type)
            .field("len", &self.data.len())
            .finish()
    }
}

/// User input for a reply or note before it reaches the network.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct MessageDraft {
    pub kind: ItemKind,
    pub case_id: CaseId,
    pub content: String,
    pub is_internal: bool,
    #[serde(default)]
    pub files: Vec<UploadFile>,
}

impl MessageDraft {
    pub fn reply(case_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            kind: ItemKind::Reply,
            case_id: CaseId::new(case_id),
            content: content.into(),
            is_internal: false,
            files: Vec::new(),
        }
    }

    pub fn note(case_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            kind: ItemKind::Note,
            case_id: CaseId::new(case_id),
            content: content.into(),
            is_internal: true,
            files: Vec::new(),
        }
    }

    #[must_use]
    pub fn internal(mut self) -> Self {
        self.is_internal = true;
        self
    }

    #[must_use]
    pub fn with_file(mut self, file: UploadFile) -> Self {
        self.files.push(file);
        self
    }

    /// Rejects drafts that must never reach the network.
    pub fn validate(&self, author_role: UserRole) -> AppResult<()> {
        let trimmed = self.content.trim();

        match self.kind {
            ItemKind::Note => {
                if !author_role.is_privileged() {
                    return Err(AppError::new(
                        ErrorKind::Authorization,
                        "Only consultants can add notes",
                    ));
                }
                if trimmed.is_empty() {
                    return Err(AppError::validation("Note cannot be empty"));
                }
                if !self.files.is_empty() {
                    return Err(AppError::validation("Notes cannot carry attachments"));
                }
            }
            ItemKind::Reply => {
                if self.is_internal && !author_role.is_privileged() {
                    return Err(AppError::new(
                        ErrorKind::Authorization,
                        "Only consultants can post internal replies",
                    ));
                }
                if trimmed.is_empty() && self.files.is_empty() {
                    return Err(AppError::validation(
                        "Reply cannot be empty without attachments",
                    ));
                }
            }
        }

        if self.case_id.as_str().is_empty() {
            return Err(AppError::validation("Case id is required"));
        }

        let chars = self.content.chars().count();
        if chars > MAX_CONTENT_LENGTH {
            return Err(AppError::validation(format!(
                "Message is too long ({chars} characters, max {MAX_CONTENT_LENGTH})"
            )));
        }

        if self.files.len() > MAX_FILES_PER_MESSAGE {
            return Err(AppError::validation(format!(
                "Too many attachments (max {MAX_FILES_PER_MESSAGE})"
            )));
        }

        for file in &self.files {
            if file.file_name.trim().is_empty() || file.file_name.len() > MAX_FILE_NAME_LENGTH {
                return Err(AppError::validation("Attachment has an invalid file name"));
            }
            if file.data.is_empty() {
                return Err(AppError::validation(format!(
                    "Attachment {} is empty",
                    file.file_name
                )));
            }
            if file.data.len() > MAX_FILE_BYTES {
                return Err(AppError::validation(format!(
                    "Attachment {} exceeds the size limit",
                    file.file_name
                )));
            }
        }

        Ok(())
    }

    /// The item shown locally while the insert is in flight.
    #[must_use]
    pub fn optimistic_item(
        &self,
        temp_id: &ItemId,
        author_id: &UserId,
        now: UnixTimeMs,
    ) -> ThreadItem {
        match self.kind {
            ItemKind::Reply => ThreadItem::Reply(Reply {
                id: temp_id.clone(),
                case_id: self.case_id.clone(),
                author_id: author_id.clone(),
                content: self.content.clone(),
                created_at: now,
                is_internal: self.is_internal,
                attachments: Vec::new(),
                client_ref: Some(temp_id.0.clone()),
            }),
            ItemKind::Note => ThreadItem::Note(Note {
                id: temp_id.clone(),
                case_id: self.case_id.clone(),
                author_id: author_id.clone(),
                content: self.content.clone(),
                created_at: now,
                attachments: Vec::new(),
                client_ref: Some(temp_id.0.clone()),
            }),
        }
    }
}

/// Insert payload for the `replies` table.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct NewReply {
    pub case_id: CaseId,
    pub user_id: UserId,
    pub content: String,
    pub is_internal: bool,
    pub client_ref: String,
}

/// Insert payload for the `notes` table.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct NewNote {
    pub case_id: CaseId,
    pub user_id: UserId,
    pub content: String,
    pub client_ref: String,
}

/// Insert payload for the `case_attachments` table.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct NewAttachment {
    pub case_id: CaseId,
    pub reply_id: Option<ItemId>,
    pub file_name: String,
    pub file_path: String,
    pub content_type: String,
    pub file_size: u64,
    pub created_by: UserId,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply_at(id: &str, t: u64, internal: bool) -> Reply {
        Reply {
            id: ItemId::new(id),
            case_id: CaseId::new("c1"),
            author_id: UserId::new("u1"),
            content: format!("reply {id}"),
            created_at: UnixTimeMs(t),
            is_internal: internal,
            attachments: vec![],
            client_ref: None,
        }
    }

    fn note_at(id: &str, t: u64) -> Note {
        Note {
            id: ItemId::new(id),
            case_id: CaseId::new("c1"),
            author_id: UserId::new("k1"),
            content: format!("note {id}"),
            created_at: UnixTimeMs(t),
            attachments: vec![],
            client_ref: None,
        }
    }

    fn attachment(id: &str, reply: Option<&str>, t: u64) -> Attachment {
        Attachment {
            id: AttachmentId::new(id),
            case_id: CaseId::new("c1"),
            reply_id: reply.map(ItemId::new),
            file_name: format!("{id}.pdf"),
            storage_path: format!("u1/c1/reply/{id}.pdf"),
            content_type: "application/pdf".into(),
            size_bytes: 10,
            created_by: UserId::new("u1"),
            created_at: UnixTimeMs(t),
        }
    }

    #[test]
    fn test_merge_orders_by_created_at() {
        let merged = merge_thread(
            vec![reply_at("r1", 5, false), reply_at("r2", 1, false)],
            vec![note_at("n1", 3)],
        );
        let ids: Vec<&str> = merged.iter().map(|i| i.id().as_str()).collect();
        assert_eq!(ids, vec!["r2", "n1", "r1"]);
    }

    #[test]
    fn test_visibility_filter() {
        let items = vec![
            ThreadItem::Note(note_at("n1", 1)),
            ThreadItem::Reply(reply_at("r1", 2, true)),
        ];
        let user = Viewer::new("u1", UserRole::User);
        let consultant = Viewer::new("k1", UserRole::Consultant);

        assert_eq!(items.iter().filter(|i| user.can_see(i)).count(), 0);
        assert_eq!(items.iter().filter(|i| consultant.can_see(i)).count(), 2);
    }

    #[test]
    fn test_public_reply_visible_to_user() {
        let user = Viewer::new("u1", UserRole::User);
        assert!(user.can_see(&ThreadItem::Reply(reply_at("r1", 1, false))));
    }

    #[test]
    fn test_temporary_ids() {
        let id = ItemId::temporary();
        assert!(id.is_temporary());
        assert_ne!(id, ItemId::temporary());
        assert!(!ItemId::new("42").is_temporary());
    }

    #[test]
    fn test_thread_item_serde_tag() {
        let item = ThreadItem::Note(note_at("n1", 3));
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["kind"], "note");
        let back: ThreadItem = serde_json::from_value(json).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn test_enum_wire_names() {
        assert_eq!(serde_json::to_string(&CaseStatus::Ongoing).unwrap(), "\"ongoing\"");
        assert_eq!(serde_json::to_string(&CasePriority::High).unwrap(), "\"high\"");
        assert_eq!(serde_json::to_string(&UserRole::Consultant).unwrap(), "\"consultant\"");
    }

    #[test]
    fn test_group_attachments() {
        let mut replies = vec![reply_at("r1", 1, false), reply_at("r2", 2, false)];
        let case_level = group_attachments(
            &mut replies,
            vec![
                attachment("a2", Some("r1"), 9),
                attachment("a1", Some("r1"), 4),
                attachment("a3", None, 1),
                attachment("a4", Some("gone"), 1),
            ],
        );

        assert_eq!(case_level.len(), 1);
        assert!(case_level[0].is_case_level());
        let ids: Vec<&str> = replies[0].attachments.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["a1", "a2"]);
        assert!(replies[1].attachments.is_empty());
    }

    mod draft_validation {
        use super::*;

        #[test]
        fn test_empty_reply_rejected() {
            let err = MessageDraft::reply("c1", "   ").validate(UserRole::User).unwrap_err();
            assert_eq!(err.kind, ErrorKind::Validation);
        }

        #[test]
        fn test_empty_reply_with_file_allowed() {
            let draft = MessageDraft::reply("c1", "")
                .with_file(UploadFile::new("log.txt", "text/plain", b"boom".to_vec()));
            assert!(draft.validate(UserRole::User).is_ok());
        }

        #[test]
        fn test_too_long_rejected() {
            let draft = MessageDraft::reply("c1", "x".repeat(MAX_CONTENT_LENGTH + 1));
            assert!(draft.validate(UserRole::Consultant).is_err());
            let draft = MessageDraft::reply("c1", "x".repeat(MAX_CONTENT_LENGTH));
            assert!(draft.validate(UserRole::Consultant).is_ok());
        }

        #[test]
        fn test_note_requires_consultant() {
            let err = MessageDraft::note("c2", "internal only")
                .validate(UserRole::User)
                .unwrap_err();
            assert_eq!(err.kind, ErrorKind::Authorization);
            assert!(MessageDraft::note("c2", "internal only")
                .validate(UserRole::Consultant)
                .is_ok());
        }

        #[test]
        fn test_internal_reply_requires_consultant() {
            let draft = MessageDraft::reply("c1", "psst").internal();
            assert_eq!(
                draft.validate(UserRole::User).unwrap_err().kind,
                ErrorKind::Authorization
            );
        }

        #[test]
        fn test_empty_file_rejected() {
            let draft = MessageDraft::reply("c1", "see file")
                .with_file(UploadFile::new("a.txt", "text/plain", vec![]));
            assert!(draft.validate(UserRole::User).is_err());
        }

        #[test]
        fn test_optimistic_item_carries_client_ref() {
            let temp = ItemId::temporary();
            let item = MessageDraft::reply("c1", "Hello").optimistic_item(
                &temp,
                &UserId::new("u1"),
                UnixTimeMs(7),
            );
            assert_eq!(item.id(), &temp);
            assert_eq!(item.client_ref(), Some(temp.as_str()));
            assert!(!item.is_internal());
            assert_eq!(item.content(), "Hello");
        }
    }
}
