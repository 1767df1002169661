use async_trait::async_trait;
use sfm_storage::OutboxStore;
use tracing::info;

use crate::{Notifier, NotifyError, WelcomeMessage};

/// Drops each message as JSON into an outbox directory for a mail relay to pick up.
#[derive(Debug, Clone)]
pub struct OutboxNotifier {
    store: OutboxStore,
}

impl OutboxNotifier {
    pub fn new(store: OutboxStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Notifier for OutboxNotifier {
    async fn send(&self, message: &WelcomeMessage) -> Result<(), NotifyError> {
        let bytes = serde_json::to_vec_pretty(message)?;
        let entry = self
            .store
            .enqueue(message.created_at.date_naive(), &bytes)
            .await?;
        info!(
            to = %message.to,
            path = %entry.path.display(),
            deduplicated = entry.deduplicated,
            "queued welcome message"
        );
        Ok(())
    }
}
