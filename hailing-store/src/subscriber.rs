use hailing_core::messaging::{Delivery, EventHandler, Subscription};
use hailing_core::repository::DeadLetterSink;
use hailing_core::DispatchError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::app_config::{DeadLetterPolicy, SubscriberConfig};

const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Routes each received message to the first handler that accepts it and
/// settles the delivery according to the outcome.
pub struct SubscriptionDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
    dead_letters: Arc<dyn DeadLetterSink>,
    config: SubscriberConfig,
}

impl SubscriptionDispatcher {
    pub fn new(
        handlers: Vec<Arc<dyn EventHandler>>,
        dead_letters: Arc<dyn DeadLetterSink>,
        config: SubscriberConfig,
    ) -> Self {
        Self { handlers, dead_letters, config }
    }

    /// Receives until `cancel` fires or the bus closes, then waits for every
    /// in-flight handler to finish.
    pub async fn run(self, mut subscription: Box<dyn Subscription>, cancel: CancellationToken) {
        let workers = self.config.workers;
        let semaphore = Arc::new(Semaphore::new(workers));
        let this = Arc::new(self);
        info!("Subscription dispatcher started with {} workers", workers);

        loop {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = subscription.receive() => received,
            };

            match received {
                Ok(Some(delivery)) => {
                    let this = this.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        this.dispatch(delivery, &cancel).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    info!("Subscription closed");
                    break;
                }
                Err(e) => {
                    error!("Failed to receive message: {}", e);
                    tokio::time::sleep(RECEIVE_ERROR_BACKOFF).await;
                }
            }
        }

        // all permits back means no handler is running
        let _ = semaphore.acquire_many(workers as u32).await;
        info!("Subscription dispatcher stopped");
    }

    /// Handles a single delivery to completion
    pub async fn dispatch(&self, delivery: Delivery, cancel: &CancellationToken) {
        let Some(handler) = self.handlers.iter().find(|h| h.accept(&delivery.event)) else {
            let reason = format!("no handler accepts topic {}", delivery.event.topic);
            self.dead_letter(delivery, &reason).await;
            return;
        };

        let event_id = delivery.event.id;
        match handler.process(&delivery.event, cancel).await {
            Ok(()) => {
                debug!("{} handled {} ({})", handler.name(), event_id, delivery.event.topic);
                if let Err(e) = delivery.ack().await {
                    warn!("Failed to ack {}: {}", event_id, e);
                }
            }
            Err(DispatchError::Cancelled) => {
                // never settled: Kafka redelivers from the uncommitted offset on
                // restart, the in-memory bus drops it with the process
                debug!("{} interrupted while handling {}", handler.name(), event_id);
            }
            Err(e) if !e.is_retryable() => {
                let reason = format!("{}: {}", handler.name(), e);
                self.dead_letter(delivery, &reason).await;
            }
            Err(e) if delivery.attempt >= self.config.max_delivery_attempts => {
                let reason = format!("{} gave up after {} attempts: {}", handler.name(), delivery.attempt, e);
                self.dead_letter(delivery, &reason).await;
            }
            Err(e) => {
                warn!(
                    "{} failed on {} (attempt {}/{}): {}",
                    handler.name(),
                    event_id,
                    delivery.attempt,
                    self.config.max_delivery_attempts,
                    e
                );
                if let Err(e) = delivery.nack().await {
                    error!("Failed to nack {}: {}", event_id, e);
                }
            }
        }
    }

    async fn dead_letter(&self, delivery: Delivery, reason: &str) {
        let (id, topic, attempt) = (delivery.event.id, delivery.event.topic.clone(), delivery.attempt);
        match self.config.dead_letter {
            DeadLetterPolicy::Discard => {
                warn!("Discarding {} ({}) after attempt {}: {}", id, topic, attempt, reason);
            }
            DeadLetterPolicy::Store => {
                if let Err(e) = self.dead_letters.store_dead_letter(&delivery.event, attempt, reason).await {
                    error!("Failed to store dead letter {}: {}", id, e);
                    if let Err(e) = delivery.nack().await {
                        error!("Failed to nack {}: {}", id, e);
                    }
                    return;
                }
                warn!("Dead-lettered {} ({}): {}", id, topic, reason);
            }
        }
        if let Err(e) = delivery.ack().await {
            warn!("Failed to ack {}: {}", id, e);
        }
    }
}
