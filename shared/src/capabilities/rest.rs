//! Capability implementations on top of the hosted backend's HTTP interfaces:
//! the REST table API, the storage API and edge functions.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use super::http::{HttpRequest, HttpResponse, HttpTransport, ValidatedUrl};
use super::notifier::Notifier;
use super::storage::{clamp_signed_url_ttl, ObjectStorage, StoragePath};
use super::ThreadBackend;
use crate::config::BackendConfig;
use crate::model::{
    Attachment, AttachmentId, CaseId, ItemId, NewAttachment, NewNote, NewReply, Note, Reply,
    UserId,
};
use crate::notify::NotificationRequest;
use crate::{AppError, AppResult, ErrorKind, UnixTimeMs};

const REPLIES: &str = "replies";
const NOTES: &str = "notes";
const ATTACHMENTS: &str = "case_attachments";

fn to_unix_ms(at: DateTime<Utc>) -> UnixTimeMs {
    UnixTimeMs(u64::try_from(at.timestamp_millis()).unwrap_or(0))
}

#[derive(Debug, Deserialize)]
struct ReplyRow {
    id: String,
    case_id: String,
    user_id: String,
    #[serde(default)]
    content: Option<String>,
    created_at: DateTime<Utc>,
    #[serde(default)]
    is_internal: Option<bool>,
    #[serde(default)]
    client_ref: Option<String>,
}

impl From<ReplyRow> for Reply {
    fn from(row: ReplyRow) -> Self {
        Self {
            id: ItemId(row.id),
            case_id: CaseId(row.case_id),
            author_id: UserId(row.user_id),
            content: row.content.unwrap_or_default(),
            created_at: to_unix_ms(row.created_at),
            is_internal: row.is_internal.unwrap_or(false),
            attachments: Vec::new(),
            client_ref: row.client_ref,
        }
    }
}

#[derive(Debug, Deserialize)]
struct NoteRow {
    id: String,
    case_id: String,
    user_id: String,
    #[serde(default)]
    content: Option<String>,
    created_at: DateTime<Utc>,
    #[serde(default)]
    client_ref: Option<String>,
}

impl From<NoteRow> for Note {
    fn from(row: NoteRow) -> Self {
        Self {
            id: ItemId(row.id),
            case_id: CaseId(row.case_id),
            author_id: UserId(row.user_id),
            content: row.content.unwrap_or_default(),
            created_at: to_unix_ms(row.created_at),
            attachments: Vec::new(),
            client_ref: row.client_ref,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AttachmentRow {
    id: String,
    case_id: String,
    #[serde(default)]
    reply_id: Option<String>,
    file_name: String,
    file_path: String,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    file_size: Option<i64>,
    created_by: String,
    created_at: DateTime<Utc>,
}

impl From<AttachmentRow> for Attachment {
    fn from(row: AttachmentRow) -> Self {
        Self {
            id: AttachmentId(row.id),
            case_id: CaseId(row.case_id),
            reply_id: row.reply_id.map(ItemId),
            file_name: row.file_name,
            storage_path: row.file_path,
            content_type: row
                .content_type
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            size_bytes: row.file_size.and_then(|s| u64::try_from(s).ok()).unwrap_or(0),
            created_by: UserId(row.created_by),
            created_at: to_unix_ms(row.created_at),
        }
    }
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(rename = "Key", default)]
    key: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SignRequest {
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct SignResponse {
    #[serde(rename = "signedURL")]
    signed_url: String,
}

/// Talks to the hosted backend through a shell-provided [`HttpTransport`].
pub struct RestBackend<T> {
    transport: Arc<T>,
    config: BackendConfig,
    access_token: RwLock<Option<SecretString>>,
}

impl<T> std::fmt::Debug for RestBackend<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestBackend")
            .field("api_url", &self.config.api_url.as_str())
            .finish_non_exhaustive()
    }
}

impl<T: HttpTransport> RestBackend<T> {
    pub fn new(transport: Arc<T>, config: BackendConfig) -> AppResult<Self> {
        config.validate()?;
        Ok(Self {
            transport,
            config,
            access_token: RwLock::new(None),
        })
    }

    /// Requests run as the signed-in user once a token is set, anonymously otherwise.
    pub async fn set_access_token(&self, token: Option<SecretString>) {
        *self.access_token.write().await = token;
    }

    async fn authorize(&self, request: HttpRequest) -> AppResult<HttpRequest> {
        let token = self.access_token.read().await;
        let bearer = token.as_ref().map_or_else(
            || self.config.anon_key.expose_secret().clone(),
            |t| t.expose_secret().clone(),
        );
        Ok(request
            .with_header("apikey", self.config.anon_key.expose_secret().as_str())?
            .with_header("Authorization", format!("Bearer {bearer}"))?
            .with_timeout(self.config.request_timeout)?)
    }

    fn table_url(&self, table: &str) -> AppResult<ValidatedUrl> {
        Ok(self.config.api_url.join_path(&format!("rest/v1/{table}"))?)
    }

    async fn send(&self, request: HttpRequest) -> AppResult<HttpResponse> {
        let request = self.authorize(request).await?;
        let method = request.method().as_str();
        let response = self.transport.execute(request).await?;
        debug!(method, status = response.status(), "backend response");
        response.error_for_status()
    }

    async fn select_by_case<R: DeserializeOwned + Send>(
        &self,
        table: &str,
        case_id: &CaseId,
    ) -> AppResult<Vec<R>> {
        let filter = format!("eq.{case_id}");
        let url = self.table_url(table)?.with_query([
            ("select", "*"),
            ("case_id", filter.as_str()),
            ("order", "created_at.asc"),
        ])?;
        let request = HttpRequest::get(url).with_header("Accept", "application/json")?;
        Ok(self.send(request).await?.json()?)
    }

    async fn insert_row<B: Serialize + Sync, R: DeserializeOwned + Send>(
        &self,
        table: &str,
        body: &B,
    ) -> AppResult<R> {
        let request = HttpRequest::post(self.table_url(table)?)
            .with_header("Prefer", "return=representation")?
            .with_json(body)?;
        let rows: Vec<R> = self.send(request).await?.json()?;
        rows.into_iter().next().ok_or_else(|| {
            AppError::new(ErrorKind::Serialization, "Insert returned no row")
                .with_context("table", table)
        })
    }

    fn storage_url(&self, prefix: &str, path: &str) -> AppResult<ValidatedUrl> {
        Ok(self.config.api_url.join_path(&format!(
            "storage/v1/{prefix}/{}/{path}",
            self.config.storage_bucket
        ))?)
    }
}

#[async_trait]
impl<T: HttpTransport> ThreadBackend for RestBackend<T> {
    #[instrument(skip(self), fields(case_id = %case_id))]
    async fn fetch_replies(&self, case_id: &CaseId) -> AppResult<Vec<Reply>> {
        let rows: Vec<ReplyRow> = self.select_by_case(REPLIES, case_id).await?;
        Ok(rows.into_iter().map(Reply::from).collect())
    }

    #[instrument(skip(self), fields(case_id = %case_id))]
    async fn fetch_notes(&self, case_id: &CaseId) -> AppResult<Vec<Note>> {
        let rows: Vec<NoteRow> = self.select_by_case(NOTES, case_id).await?;
        Ok(rows.into_iter().map(Note::from).collect())
    }

    #[instrument(skip(self), fields(case_id = %case_id))]
    async fn fetch_attachments(&self, case_id: &CaseId) -> AppResult<Vec<Attachment>> {
        let rows: Vec<AttachmentRow> = self.select_by_case(ATTACHMENTS, case_id).await?;
        Ok(rows.into_iter().map(Attachment::from).collect())
    }

    #[instrument(skip(self, reply), fields(case_id = %reply.case_id))]
    async fn insert_reply(&self, reply: &NewReply) -> AppResult<Reply> {
        let row: ReplyRow = self.insert_row(REPLIES, reply).await?;
        Ok(row.into())
    }

    #[instrument(skip(self, note), fields(case_id = %note.case_id))]
    async fn insert_note(&self, note: &NewNote) -> AppResult<Note> {
        let row: NoteRow = self.insert_row(NOTES, note).await?;
        Ok(row.into())
    }

    #[instrument(skip(self, attachment), fields(case_id = %attachment.case_id))]
    async fn insert_attachment(&self, attachment: &NewAttachment) -> AppResult<Attachment> {
        let row: AttachmentRow = self.insert_row(ATTACHMENTS, attachment).await?;
        Ok(row.into())
    }
}

#[async_trait]
impl<T: HttpTransport> ObjectStorage for RestBackend<T> {
    #[instrument(skip(self, data), fields(path = %path, len = data.len()))]
    async fn upload(
        &self,
        path: &StoragePath,
        content_type: &str,
        data: Bytes,
    ) -> AppResult<String> {
        let request = HttpRequest::post(self.storage_url("object", path.as_str())?)
            .with_header("Content-Type", content_type)?
            .with_header("x-upsert", "false")?
            .with_body(data)?;
        let response: UploadResponse = self.send(request).await?.json()?;
        let bucket_prefix = format!("{}/", self.config.storage_bucket);
        Ok(response
            .key
            .map(|k| k.strip_prefix(&bucket_prefix).map_or(k.clone(), str::to_owned))
            .unwrap_or_else(|| path.as_str().to_owned()))
    }

    async fn signed_url(&self, path: &str, ttl: Duration) -> AppResult<String> {
        let ttl = clamp_signed_url_ttl(ttl);
        let request =
            HttpRequest::post(self.storage_url("object/sign", path)?).with_json(&SignRequest {
                expires_in: ttl.as_secs(),
            })?;
        let response: SignResponse = self.send(request).await?.json()?;
        Ok(format!(
            "{}/storage/v1{}",
            self.config.api_url.as_str().trim_end_matches('/'),
            response.signed_url
        ))
    }
}

#[async_trait]
impl<T: HttpTransport> Notifier for RestBackend<T> {
    #[instrument(skip(self, request), fields(case_id = %request.case_id))]
    async fn notify(&self, request: &NotificationRequest) -> AppResult<()> {
        let url = self
            .config
            .api_url
            .join_path(&format!("functions/v1/{}", self.config.notify_function))?;
        self.send(HttpRequest::post(url).with_json(request)?).await?;
        Ok(())
    }
}
