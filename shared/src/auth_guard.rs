//! Guards the auth subsystem against init loops and repeated failures.
//!
//! The guard keeps a sliding window of initializations, a consecutive error
//! count and the last success. When either threshold is crossed it opens a
//! time-boxed [`CircuitBreaker`]. Its own bookkeeping never blocks sign-in:
//! storage problems are logged and the attempt proceeds.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{KeyNamespace, KeyValueStore, Session, SessionProvider, TypedKv};
use crate::config::GuardConfig;
use crate::{AppError, AppResult, ErrorKind, UnixTimeMs};

/// Bump to discard health data written by older guard logic.
pub const AUTH_HEALTH_SCHEMA: u32 = 2;
const HEALTH_KEY: &str = "auth_health";

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerStatus {
    Inactive,
    Active { reason: String, remaining_seconds: u64 },
}

impl BreakerStatus {
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct CircuitBreakerState {
    pub active: bool,
    pub expires_at: UnixTimeMs,
    pub reason: String,
    pub activated_at: UnixTimeMs,
}

/// Time-boxed suppression that expires on its own.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct CircuitBreaker {
    state: CircuitBreakerState,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activate(&mut self, reason: impl Into<String>, duration: Duration, now: UnixTimeMs) {
        self.state = CircuitBreakerState {
            active: true,
            expires_at: now.add_millis(millis(duration)),
            reason: reason.into(),
            activated_at: now,
        };
    }

    #[must_use]
    pub fn status(&self, now: UnixTimeMs) -> BreakerStatus {
        if !self.state.active || now >= self.state.expires_at {
            return BreakerStatus::Inactive;
        }
        let remaining_ms = self.state.expires_at.elapsed_since(now);
        BreakerStatus::Active {
            reason: self.state.reason.clone(),
            remaining_seconds: remaining_ms.div_ceil(1000),
        }
    }

    pub fn clear(&mut self) {
        self.state = CircuitBreakerState::default();
    }

    #[must_use]
    pub const fn state(&self) -> &CircuitBreakerState {
        &self.state
    }
}

/// Persisted auth bookkeeping.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AuthHealth {
    pub schema: u32,
    pub init_times: VecDeque<UnixTimeMs>,
    pub consecutive_errors: u32,
    pub last_success: Option<UnixTimeMs>,
    pub breaker: CircuitBreaker,
}

impl Default for AuthHealth {
    fn default() -> Self {
        Self {
            schema: AUTH_HEALTH_SCHEMA,
            init_times: VecDeque::new(),
            consecutive_errors: 0,
            last_success: None,
            breaker: CircuitBreaker::new(),
        }
    }
}

/// Constructed once by the shell and shared by `Arc`.
pub struct AuthSessionGuard {
    kv: Arc<dyn KeyValueStore>,
    store: TypedKv<AuthHealth>,
    config: GuardConfig,
    health: Mutex<Option<AuthHealth>>,
}

impl std::fmt::Debug for AuthSessionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSessionGuard")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AuthSessionGuard {
    pub fn new(kv: Arc<dyn KeyValueStore>, config: GuardConfig) -> Self {
        Self {
            kv,
            store: TypedKv::new(KeyNamespace::Session),
            config,
            health: Mutex::new(None),
        }
    }

    async fn load(&self) -> AuthHealth {
        match self.store.get(self.kv.as_ref(), HEALTH_KEY).await {
            Ok(Some(health)) if health.schema == AUTH_HEALTH_SCHEMA => health,
            Ok(Some(health)) => {
                info!(found = health.schema, "Auth health schema changed, starting clean");
                AuthHealth::default()
            }
            Ok(None) => AuthHealth::default(),
            Err(e) => {
                warn!(error = %e, "Auth health unreadable, starting clean");
                AuthHealth::default()
            }
        }
    }

    async fn save(&self, health: &AuthHealth) {
        if let Err(e) = self.store.set(self.kv.as_ref(), HEALTH_KEY, health).await {
            warn!(error = %e, "Failed to persist auth health");
        }
    }

    /// Runs `f` against the loaded health and persists the result.
    async fn update<T>(&self, f: impl FnOnce(&mut AuthHealth) -> T) -> T {
        let mut slot = self.health.lock().await;
        if slot.is_none() {
            *slot = Some(self.load().await);
        }
        let health = slot.get_or_insert_with(AuthHealth::default);
        let out = f(health);
        self.save(health).await;
        out
    }

    fn recently_succeeded(&self, health: &AuthHealth, now: UnixTimeMs) -> bool {
        health
            .last_success
            .is_some_and(|at| now.elapsed_since(at) < millis(self.config.success_grace))
    }

    fn prune(&self, health: &mut AuthHealth, now: UnixTimeMs) {
        let window = millis(self.config.init_window);
        while let Some(front) = health.init_times.front() {
            if now.elapsed_since(*front) >= window {
                health.init_times.pop_front();
            } else {
                break;
            }
        }
    }

    /// False only while the breaker is open and no recent success overrides it.
    pub async fn should_attempt(&self, now: UnixTimeMs) -> bool {
        self.update(|health| {
            if self.recently_succeeded(health, now) {
                health.breaker.clear();
                return true;
            }
            !health.breaker.status(now).is_active()
        })
        .await
    }

    pub async fn record_init(&self, now: UnixTimeMs) -> BreakerStatus {
        self.update(|health| {
            self.prune(health, now);
            health.init_times.push_back(now);

            if health.init_times.len() > self.config.max_inits
                && !self.recently_succeeded(health, now)
                && !health.breaker.status(now).is_active()
            {
                let reason = format!(
                    "Authentication restarted {} times in {}s",
                    health.init_times.len(),
                    self.config.init_window.as_secs()
                );
                warn!(%reason, "Auth circuit breaker tripped");
                health
                    .breaker
                    .activate(reason, self.config.breaker_duration, now);
            }
            health.breaker.status(now)
        })
        .await
    }

    pub async fn record_error(&self, now: UnixTimeMs) -> BreakerStatus {
        self.update(|health| {
            health.consecutive_errors = health.consecutive_errors.saturating_add(1);

            if health.consecutive_errors >= self.config.max_consecutive_errors
                && !self.recently_succeeded(health, now)
                && !health.breaker.status(now).is_active()
            {
                let reason = format!(
                    "Authentication failed {} times in a row",
                    health.consecutive_errors
                );
                warn!(%reason, "Auth circuit breaker tripped");
                health
                    .breaker
                    .activate(reason, self.config.breaker_duration, now);
            }
            health.breaker.status(now)
        })
        .await
    }

    pub async fn record_success(&self, now: UnixTimeMs) {
        self.update(|health| {
            if health.breaker.status(now).is_active() {
                info!("Auth circuit breaker cleared by successful sign-in");
            }
            health.consecutive_errors = 0;
            health.last_success = Some(now);
            health.breaker.clear();
        })
        .await;
    }

    pub async fn breaker_status(&self, now: UnixTimeMs) -> BreakerStatus {
        self.update(|health| health.breaker.status(now)).await
    }

    pub async fn health(&self) -> AuthHealth {
        self.update(|health| health.clone()).await
    }

    pub async fn reset(&self) {
        let mut slot = self.health.lock().await;
        *slot = Some(AuthHealth::default());
        if let Err(e) = self.store.delete(self.kv.as_ref(), HEALTH_KEY).await {
            warn!(error = %e, "Failed to clear auth health");
        }
    }

    /// Guarded session check: refuses while the breaker is open, refreshes
    /// sessions close to expiry, and records the outcome.
    #[instrument(skip(self, provider))]
    pub async fn ensure_session(
        &self,
        provider: &dyn SessionProvider,
        now: UnixTimeMs,
    ) -> AppResult<Option<Session>> {
        if !self.should_attempt(now).await {
            return Err(self.circuit_open_error(now).await);
        }

        if let BreakerStatus::Active { .. } = self.record_init(now).await {
            return Err(self.circuit_open_error(now).await);
        }

        let session = match provider.current_session().await {
            Ok(Some(session)) => session,
            Ok(None) => {
                debug!("No stored session");
                return Ok(None);
            }
            Err(e) => {
                self.record_error(now).await;
                return Err(e);
            }
        };

        if !session.expires_within(now, millis(self.config.refresh_margin)) {
            self.record_success(now).await;
            return Ok(Some(session));
        }

        debug!(expired = session.is_expired(now), "Refreshing session");
        match provider.refresh_session(&session.refresh_token).await {
            Ok(refreshed) => {
                self.record_success(now).await;
                Ok(Some(refreshed))
            }
            Err(e) => {
                self.record_error(now).await;
                Err(e)
            }
        }
    }

    async fn circuit_open_error(&self, now: UnixTimeMs) -> AppError {
        match self.breaker_status(now).await {
            BreakerStatus::Active {
                reason,
                remaining_seconds,
            } => AppError::new(
                ErrorKind::CircuitOpen,
                format!("Sign-in paused: {reason}. Try again in {remaining_seconds}s"),
            )
            .with_retry_after(remaining_seconds.saturating_mul(1000)),
            BreakerStatus::Inactive => AppError::new(ErrorKind::CircuitOpen, "Sign-in paused"),
        }
    }
}
