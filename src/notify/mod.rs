//! Outbound alerts.
//!
//! Defines the `Notifier` trait, a log-only fallback, and the best-effort
//! `Notifications` wrapper the engine talks to. Nothing a notifier does can
//! fail the caller: errors and timeouts are logged and reported as `false`.

pub mod telegram;

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, warn};

/// A transport that can deliver a text alert.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, text: &str) -> Result<()>;
}

/// Notifier used when no transport is configured: messages are only logged.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, text: &str) -> Result<()> {
        info!(message = text, "[LOG ONLY] notification");
        Ok(())
    }
}

/// Best-effort, time-bounded front end over a `Notifier`.
pub struct Notifications {
    inner: Box<dyn Notifier>,
    timeout: Duration,
}

impl Notifications {
    pub fn new(inner: Box<dyn Notifier>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    /// Deliver `text`. Returns whether delivery succeeded; never errors.
    pub async fn send(&self, text: &str) -> bool {
        match tokio::time::timeout(self.timeout, self.inner.send(text)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(error = %e, "Notification failed");
                false
            }
            Err(_) => {
                warn!(timeout_secs = self.timeout.as_secs(), "Notification timed out");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowNotifier;

    #[async_trait]
    impl Notifier for SlowNotifier {
        async fn send(&self, _text: &str) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failure_is_swallowed() {
        let mut mock = MockNotifier::new();
        mock.expect_send()
            .times(1)
            .returning(|_| Err(anyhow::anyhow!("telegram down")));
        let notes = Notifications::new(Box::new(mock), Duration::from_secs(1));
        assert!(!notes.send("hello").await);
    }

    #[tokio::test]
    async fn test_success_reported() {
        let notes = Notifications::new(Box::new(LogNotifier), Duration::from_secs(1));
        assert!(notes.send("hello").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_swallowed() {
        let notes = Notifications::new(Box::new(SlowNotifier), Duration::from_secs(5));
        assert!(!notes.send("hello").await);
    }
}
