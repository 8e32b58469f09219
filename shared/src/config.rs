//! Tunables for the thread core. One set of defaults, documented in one place.

use secrecy::SecretString;
use std::time::Duration;

use crate::capabilities::ValidatedUrl;
use crate::retry::RetryPolicy;
use crate::{AppError, AppResult};

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);
pub const DEFAULT_STORAGE_BUCKET: &str = "case-attachments";
pub const DEFAULT_NOTIFY_FUNCTION: &str = "send-notification";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub retry: RetryPolicy,
    /// Quiet period before a burst of refresh requests turns into one fetch.
    pub debounce: Duration,
    pub notify_on_reply: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            debounce: DEFAULT_DEBOUNCE,
            notify_on_reply: true,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> AppResult<()> {
        self.retry.validate()?;
        if self.debounce > Duration::from_secs(5) {
            return Err(AppError::validation("debounce must be at most 5s"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub ttl: Duration,
    /// Snapshots kept in the in-memory front.
    pub max_cases: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_CACHE_TTL,
            max_cases: 50,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> AppResult<()> {
        if self.ttl.is_zero() {
            return Err(AppError::validation("cache ttl must be > 0"));
        }
        if self.max_cases == 0 {
            return Err(AppError::validation("cache max_cases must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxConfig {
    pub max_entries: usize,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_jitter_ms: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            max_entries: 200,
            max_attempts: 5,
            base_backoff_ms: 2_000,
            max_backoff_ms: 300_000,
            max_jitter_ms: 1_000,
        }
    }
}

impl OutboxConfig {
    pub fn validate(&self) -> AppResult<()> {
        if self.max_entries == 0 {
            return Err(AppError::validation("outbox max_entries must be > 0"));
        }
        if self.max_attempts == 0 {
            return Err(AppError::validation("outbox max_attempts must be > 0"));
        }
        if self.base_backoff_ms == 0 {
            return Err(AppError::validation("outbox base_backoff_ms must be > 0"));
        }
        if self.max_backoff_ms < self.base_backoff_ms {
            return Err(AppError::validation(
                "outbox max_backoff_ms must be >= base_backoff_ms",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardConfig {
    /// Initializations allowed within `init_window` before the breaker trips.
    pub max_inits: usize,
    pub init_window: Duration,
    pub max_consecutive_errors: u32,
    pub breaker_duration: Duration,
    /// A success this recent clears the breaker and suppresses tripping.
    pub success_grace: Duration,
    /// Sessions expiring within this margin are refreshed ahead of time.
    pub refresh_margin: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            max_inits: 5,
            init_window: Duration::from_secs(10),
            max_consecutive_errors: 3,
            breaker_duration: Duration::from_secs(60),
            success_grace: Duration::from_secs(30),
            refresh_margin: Duration::from_secs(60),
        }
    }
}

impl GuardConfig {
    pub fn validate(&self) -> AppResult<()> {
        if self.max_inits == 0 || self.max_consecutive_errors == 0 {
            return Err(AppError::validation("guard thresholds must be > 0"));
        }
        if self.init_window.is_zero() || self.breaker_duration.is_zero() {
            return Err(AppError::validation("guard windows must be > 0"));
        }
        Ok(())
    }
}

/// Connection settings for the hosted backend.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub api_url: ValidatedUrl,
    pub anon_key: SecretString,
    /// Public app URL used to build `{case_link}`.
    pub app_url: Option<ValidatedUrl>,
    pub storage_bucket: String,
    pub notify_function: String,
    pub request_timeout: Duration,
}

impl BackendConfig {
    pub fn new(api_url: &str, anon_key: impl Into<String>) -> AppResult<Self> {
        Ok(Self {
            api_url: ValidatedUrl::new(api_url)?,
            anon_key: SecretString::new(anon_key.into()),
            app_url: None,
            storage_bucket: DEFAULT_STORAGE_BUCKET.to_string(),
            notify_function: DEFAULT_NOTIFY_FUNCTION.to_string(),
            request_timeout: crate::retry::DEFAULT_ATTEMPT_TIMEOUT,
        })
    }

    /// Reads `HELPDESK_API_URL`, `HELPDESK_ANON_KEY`, `HELPDESK_APP_URL`,
    /// `HELPDESK_STORAGE_BUCKET`, `HELPDESK_NOTIFY_FUNCTION` and
    /// `HELPDESK_REQUEST_TIMEOUT_MS`.
    pub fn from_env() -> AppResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> AppResult<Self> {
        let required = |name: &str| {
            lookup(name)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| AppError::validation(format!("{name} is not set")))
        };

        let mut config = Self::new(&required("HELPDESK_API_URL")?, required("HELPDESK_ANON_KEY")?)?;

        if let Some(app_url) = lookup("HELPDESK_APP_URL").filter(|v| !v.trim().is_empty()) {
            config.app_url = Some(ValidatedUrl::new(app_url)?);
        }
        if let Some(bucket) = lookup("HELPDESK_STORAGE_BUCKET").filter(|v| !v.trim().is_empty()) {
            config.storage_bucket = bucket;
        }
        if let Some(function) =
            lookup("HELPDESK_NOTIFY_FUNCTION").filter(|v| !v.trim().is_empty())
        {
            config.notify_function = function;
        }
        if let Some(ms) =
            lookup("HELPDESK_REQUEST_TIMEOUT_MS").and_then(|v| v.parse::<u64>().ok())
        {
            config.request_timeout = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AppResult<()> {
        let valid_name = |s: &str| {
            !s.is_empty()
                && s.chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        };
        if !valid_name(&self.storage_bucket) {
            return Err(AppError::validation("storage bucket name is invalid"));
        }
        if !valid_name(&self.notify_function) {
            return Err(AppError::validation("notify function name is invalid"));
        }
        if self.request_timeout.is_zero() {
            return Err(AppError::validation("request timeout must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(SyncConfig::default().validate().is_ok());
        assert!(CacheConfig::default().validate().is_ok());
        assert!(OutboxConfig::default().validate().is_ok());
        assert!(GuardConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_configs() {
        let cache = CacheConfig {
            ttl: Duration::ZERO,
            ..CacheConfig::default()
        };
        assert!(cache.validate().is_err());

        let outbox = OutboxConfig {
            max_backoff_ms: 1,
            ..OutboxConfig::default()
        };
        assert!(outbox.validate().is_err());

        let guard = GuardConfig {
            max_inits: 0,
            ..GuardConfig::default()
        };
        assert!(guard.validate().is_err());
    }

    #[test]
    fn test_backend_from_lookup() {
        let config = BackendConfig::from_lookup(lookup(&[
            ("HELPDESK_API_URL", "https://abc.example.co"),
            ("HELPDESK_ANON_KEY", "anon"),
            ("HELPDESK_APP_URL", "https://helpdesk.example.com"),
            ("HELPDESK_REQUEST_TIMEOUT_MS", "2500"),
        ]))
        .unwrap();

        assert_eq!(config.api_url.host(), "abc.example.co");
        assert_eq!(config.anon_key.expose_secret(), "anon");
        assert_eq!(config.storage_bucket, DEFAULT_STORAGE_BUCKET);
        assert_eq!(config.request_timeout, Duration::from_millis(2500));
        assert!(config.app_url.is_some());
    }

    #[test]
    fn test_backend_missing_vars() {
        let err = BackendConfig::from_lookup(lookup(&[("HELPDESK_ANON_KEY", "anon")])).unwrap_err();
        assert!(err.message.contains("HELPDESK_API_URL"));

        let err = BackendConfig::from_lookup(lookup(&[
            ("HELPDESK_API_URL", "https://abc.example.co"),
            ("HELPDESK_ANON_KEY", "anon"),
            ("HELPDESK_STORAGE_BUCKET", "bad bucket"),
        ]))
        .unwrap_err();
        assert!(err.message.contains("bucket"));
    }
}
