use async_trait::async_trait;

use crate::notify::NotificationRequest;
use crate::AppResult;

/// Hands notification requests to the email function; delivery is its concern.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, request: &NotificationRequest) -> AppResult<()>;
}
