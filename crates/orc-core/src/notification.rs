//! Push-notification delivery is an out-of-scope external collaborator
//! (SPEC_FULL §1, §7): the kernel calls a fire-and-forget sink at every
//! call site the source names (consecutive-failure alerts, auto-retry,
//! worker recovery) but never builds actual delivery, mirroring
//! `original_source/backend/notification.py`'s silent no-op contract
//! when no subscription is configured.

use async_trait::async_trait;

#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Send a notification. Implementations must never surface failures
    /// upstream; callers do not check the result.
    async fn notify(&self, title: &str, body: &str, meta: serde_json::Value);
}

/// Default sink: logs at `info` and nothing else.
pub struct LoggingSink;

#[async_trait]
impl NotificationSink for LoggingSink {
    async fn notify(&self, title: &str, body: &str, meta: serde_json::Value) {
        tracing::info!(title, body, %meta, "push notification (no delivery backend configured)");
    }
}
