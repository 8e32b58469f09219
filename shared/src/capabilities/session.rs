use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::model::{UserId, UserRole};
use crate::{AppResult, UnixTimeMs};

/// An authenticated session issued by the identity provider.
#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: UserId,
    pub role: UserRole,
    pub access_token: SecretString,
    pub refresh_token: SecretString,
    pub expires_at: UnixTimeMs,
}

impl Session {
    #[must_use]
    pub fn is_expired(&self, now: UnixTimeMs) -> bool {
        now >= self.expires_at
    }

    /// True when the session expires within `margin_ms` of `now`.
    #[must_use]
    pub fn expires_within(&self, now: UnixTimeMs, margin_ms: u64) -> bool {
        now.add_millis(margin_ms) >= self.expires_at
    }

    #[must_use]
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token.expose_secret())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignOutScope {
    /// This device only.
    Local,
    /// Every device holding a refresh token for the user.
    Global,
}

#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// The stored session, if any, without contacting the provider.
    async fn current_session(&self) -> AppResult<Option<Session>>;
    async fn refresh_session(&self, refresh_token: &SecretString) -> AppResult<Session>;
    async fn sign_out(&self, scope: SignOutScope) -> AppResult<()>;
}
