use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::model::{CaseId, UserId};
use crate::{AppResult, UnixTimeMs, MAX_FILE_NAME_LENGTH};

pub const MIN_SIGNED_URL_TTL: Duration = Duration::from_secs(60);
pub const MAX_SIGNED_URL_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageScope {
    Reply,
    Case,
}

impl StorageScope {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Reply => "reply",
            Self::Case => "case",
        }
    }
}

/// Object key of the form `{owner}/{case}/{reply|case}/{stamp}_{file}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoragePath(String);

impl StoragePath {
    #[must_use]
    pub fn new(
        owner: &UserId,
        case_id: &CaseId,
        scope: StorageScope,
        file_name: &str,
        stamp: UnixTimeMs,
    ) -> Self {
        Self(format!(
            "{}/{}/{}/{}_{}",
            sanitize_segment(owner.as_str()),
            sanitize_segment(case_id.as_str()),
            scope.as_str(),
            stamp.0,
            sanitize_file_name(file_name)
        ))
    }

    #[must_use]
    pub fn for_reply(owner: &UserId, case_id: &CaseId, file_name: &str, stamp: UnixTimeMs) -> Self {
        Self::new(owner, case_id, StorageScope::Reply, file_name, stamp)
    }

    #[must_use]
    pub fn for_case(owner: &UserId, case_id: &CaseId, file_name: &str, stamp: UnixTimeMs) -> Self {
        Self::new(owner, case_id, StorageScope::Case, file_name, stamp)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StoragePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn sanitize_segment(segment: &str) -> String {
    let cleaned: String = segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

/// Keeps ASCII letters, digits, `.`, `-` and `_`; never yields a dot-only name.
#[must_use]
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let mut cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    cleaned.truncate(MAX_FILE_NAME_LENGTH);
    if cleaned.trim_matches('.').is_empty() {
        return "file".to_string();
    }
    cleaned
}

#[must_use]
pub fn clamp_signed_url_ttl(requested: Duration) -> Duration {
    requested.clamp(MIN_SIGNED_URL_TTL, MAX_SIGNED_URL_TTL)
}

/// Bucket-backed file storage.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Stores the bytes and returns the stable opaque path.
    async fn upload(&self, path: &StoragePath, content_type: &str, data: Bytes)
        -> AppResult<String>;

    /// `ttl` has already been clamped to the supported range.
    async fn signed_url(&self, path: &str, ttl: Duration) -> AppResult<String>;
}
