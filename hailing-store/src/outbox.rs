use hailing_core::messaging::MessageBus;
use hailing_core::repository::OutboxStore;
use hailing_core::CoreResult;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::app_config::OutboxConfig;

/// Moves committed events from the outbox table to the bus
pub struct OutboxPublisher {
    store: Arc<dyn OutboxStore>,
    bus: Arc<dyn MessageBus>,
    config: OutboxConfig,
}

impl OutboxPublisher {
    pub fn new(store: Arc<dyn OutboxStore>, bus: Arc<dyn MessageBus>, config: OutboxConfig) -> Self {
        Self { store, bus, config }
    }

    /// One claim/publish/commit round. Returns the number of events moved.
    ///
    /// A failed publish leaves the whole batch in the outbox for the next
    /// round, so events published before the failure are sent again.
    pub async fn drain_once(&self) -> CoreResult<usize> {
        let batch = self
            .store
            .claim_events(&self.config.topic_prefixes, self.config.max_messages)
            .await?;
        if batch.is_empty() {
            return Ok(0);
        }

        for event in &batch {
            self.bus.publish(event).await?;
        }
        self.store.commit_events(&batch).await?;

        debug!("Published {} outbox events", batch.len());
        Ok(batch.len())
    }

    /// Polls until `cancel` fires, then signals `done`. A drain in progress
    /// keeps claiming batches until the outbox is empty.
    pub async fn run(self, cancel: CancellationToken, done: oneshot::Sender<()>) {
        info!(
            "Outbox publisher started: every {:?}, up to {} events, prefixes {:?}",
            self.config.poll_interval(),
            self.config.max_messages,
            self.config.topic_prefixes
        );

        'poll: loop {
            tokio::select! {
                _ = cancel.cancelled() => break 'poll,
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }

            loop {
                match self.drain_once().await {
                    Ok(0) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("Outbox publish failed, retrying next poll: {}", e);
                        break;
                    }
                }
            }
        }

        info!("Outbox publisher stopped");
        let _ = done.send(());
    }
}
