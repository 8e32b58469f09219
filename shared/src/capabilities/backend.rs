use async_trait::async_trait;

use crate::model::{Attachment, CaseId, NewAttachment, NewNote, NewReply, Note, Reply};
use crate::AppResult;

/// Reads and writes the thread tables of the relational store. Row-level
/// security decides what the signed-in user may see.
#[async_trait]
pub trait ThreadBackend: Send + Sync {
    async fn fetch_replies(&self, case_id: &CaseId) -> AppResult<Vec<Reply>>;
    async fn fetch_notes(&self, case_id: &CaseId) -> AppResult<Vec<Note>>;
    async fn fetch_attachments(&self, case_id: &CaseId) -> AppResult<Vec<Attachment>>;

    /// A duplicate `client_ref` must fail with `ErrorKind::Conflict`.
    async fn insert_reply(&self, reply: &NewReply) -> AppResult<Reply>;
    async fn insert_note(&self, note: &NewNote) -> AppResult<Note>;
    async fn insert_attachment(&self, attachment: &NewAttachment) -> AppResult<Attachment>;
}
