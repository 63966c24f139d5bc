//! Notification sink used by the binary.

use anyhow::Result;
use async_trait::async_trait;

use autotown_core::merge::Notifier;

/// Records notifications in the log instead of delivering them.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, subject: &str, body: &str) -> Result<()> {
        tracing::info!(subject, body, "notification");
        Ok(())
    }
}
