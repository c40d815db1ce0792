use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{CoreResult, Event};

/// Producer side of the message bus
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Returns once the bus has durably accepted the event
    async fn publish(&self, event: &Event) -> CoreResult<()>;
}

/// Transport-specific settlement of one delivery
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(self: Box<Self>) -> CoreResult<()>;

    /// Schedules redelivery with the attempt counter incremented
    async fn nack(self: Box<Self>) -> CoreResult<()>;
}

/// A received message together with its settlement handle
pub struct Delivery {
    pub event: Event,
    /// 1 on first delivery
    pub attempt: u32,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(event: Event, attempt: u32, acker: Box<dyn Acknowledger>) -> Self {
        Self { event, attempt, acker }
    }

    pub async fn ack(self) -> CoreResult<()> {
        self.acker.ack().await
    }

    pub async fn nack(self) -> CoreResult<()> {
        self.acker.nack().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("event", &self.event)
            .field("attempt", &self.attempt)
            .finish()
    }
}

#[async_trait]
pub trait Subscription: Send {
    /// Blocks until the next visible message. `None` once the bus is closed.
    async fn receive(&mut self) -> CoreResult<Option<Delivery>>;
}

/// Consumer of one family of topics
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn accept(&self, event: &Event) -> bool;

    /// Must return `DispatchError::Cancelled` if interrupted by `cancel`
    async fn process(&self, event: &Event, cancel: &CancellationToken) -> CoreResult<()>;
}
