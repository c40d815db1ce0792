use async_trait::async_trait;
use chrono::Utc;
use hailing_core::messaging::{Acknowledger, Delivery, MessageBus, Subscription};
use hailing_core::{CoreResult, DispatchError, Event};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender};
use tracing::debug;

#[derive(Debug, Clone)]
struct Envelope {
    event: Event,
    attempt: u32,
}

/// Channel-backed bus for a single process. Delayed events become visible
/// `delay_seconds` after their creation time.
#[derive(Clone)]
pub struct MemoryBus {
    sender: UnboundedSender<Envelope>,
}

pub struct MemorySubscription {
    receiver: UnboundedReceiver<Envelope>,
    sender: WeakUnboundedSender<Envelope>,
    redelivery_delay: Duration,
}

/// The subscription sees `None` once every `MemoryBus` clone is dropped
pub fn memory_bus(redelivery_delay: Duration) -> (MemoryBus, MemorySubscription) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let subscription = MemorySubscription {
        receiver,
        sender: sender.downgrade(),
        redelivery_delay,
    };
    (MemoryBus { sender }, subscription)
}

fn deliver_after(sender: UnboundedSender<Envelope>, envelope: Envelope, wait: Duration) -> CoreResult<()> {
    if wait.is_zero() {
        return sender
            .send(envelope)
            .map_err(|_| DispatchError::External("memory bus closed".into()));
    }
    tokio::spawn(async move {
        tokio::time::sleep(wait).await;
        let _ = sender.send(envelope);
    });
    Ok(())
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, event: &Event) -> CoreResult<()> {
        let wait = (event.visible_at() - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        debug!("Publishing {} ({}) visible in {:?}", event.id, event.topic, wait);
        deliver_after(
            self.sender.clone(),
            Envelope { event: event.clone(), attempt: 1 },
            wait,
        )
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn receive(&mut self) -> CoreResult<Option<Delivery>> {
        let Some(envelope) = self.receiver.recv().await else {
            return Ok(None);
        };
        let acker = MemoryAcker {
            sender: self.sender.clone(),
            envelope: envelope.clone(),
            redelivery_delay: self.redelivery_delay,
        };
        Ok(Some(Delivery::new(envelope.event, envelope.attempt, Box::new(acker))))
    }
}

struct MemoryAcker {
    sender: WeakUnboundedSender<Envelope>,
    envelope: Envelope,
    redelivery_delay: Duration,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(self: Box<Self>) -> CoreResult<()> {
        Ok(())
    }

    async fn nack(self: Box<Self>) -> CoreResult<()> {
        let sender = self
            .sender
            .upgrade()
            .ok_or_else(|| DispatchError::External("memory bus closed".into()))?;
        let envelope = Envelope {
            event: self.envelope.event,
            attempt: self.envelope.attempt + 1,
        };
        deliver_after(sender, envelope, self.redelivery_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hailing_shared::topics;

    fn event(delay_seconds: i64) -> Event {
        Event::new(topics::USER_NOTIFICATION, &serde_json::json!({"n": 1}), delay_seconds, Utc::now()).unwrap()
    }

    #[tokio::test]
    async fn test_nack_redelivers_with_next_attempt() {
        let (bus, mut subscription) = memory_bus(Duration::ZERO);
        let sent = event(0);
        bus.publish(&sent).await.unwrap();

        let first = subscription.receive().await.unwrap().unwrap();
        assert_eq!(first.attempt, 1);
        assert_eq!(first.event, sent);
        first.nack().await.unwrap();

        let second = subscription.receive().await.unwrap().unwrap();
        assert_eq!(second.attempt, 2);
        assert_eq!(second.event.id, sent.id);
        second.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_delayed_event_arrives_after_immediate_one() {
        let (bus, mut subscription) = memory_bus(Duration::ZERO);
        let delayed = event(1);
        let immediate = event(0);
        bus.publish(&delayed).await.unwrap();
        bus.publish(&immediate).await.unwrap();

        let first = subscription.receive().await.unwrap().unwrap();
        assert_eq!(first.event.id, immediate.id);
        let second = subscription.receive().await.unwrap().unwrap();
        assert_eq!(second.event.id, delayed.id);
    }

    #[tokio::test]
    async fn test_unsettled_delivery_is_not_redelivered() {
        let (bus, mut subscription) = memory_bus(Duration::ZERO);
        let dropped = event(0);
        let next = event(0);
        bus.publish(&dropped).await.unwrap();

        drop(subscription.receive().await.unwrap().unwrap());
        bus.publish(&next).await.unwrap();

        let received = subscription.receive().await.unwrap().unwrap();
        assert_eq!(received.event.id, next.id);
        assert_eq!(received.attempt, 1);
    }

    #[tokio::test]
    async fn test_closed_when_bus_dropped() {
        let (bus, mut subscription) = memory_bus(Duration::ZERO);
        drop(bus);
        assert!(subscription.receive().await.unwrap().is_none());
    }
}
