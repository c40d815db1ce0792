use async_trait::async_trait;
use hailing_core::messaging::EventHandler;
use hailing_core::services::{PushService, SettlementService};
use hailing_core::{CoreResult, DispatchError, Event};
use hailing_shared::models::events::{DriverNotification, SettlementRequest, UserNotification};
use hailing_shared::topics;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Forwards rider and driver notifications to the push service
pub struct NotificationHandler {
    push: Arc<dyn PushService>,
}

impl NotificationHandler {
    pub fn new(push: Arc<dyn PushService>) -> Self {
        Self { push }
    }
}

#[async_trait]
impl EventHandler for NotificationHandler {
    fn name(&self) -> &'static str {
        "taxi-call-notification"
    }

    fn accept(&self, event: &Event) -> bool {
        event.topic == topics::USER_NOTIFICATION || event.topic == topics::DRIVER_NOTIFICATION
    }

    async fn process(&self, event: &Event, _cancel: &CancellationToken) -> CoreResult<()> {
        match event.topic.as_str() {
            topics::USER_NOTIFICATION => {
                let notification: UserNotification = event.decode()?;
                debug!("Notifying rider {} ({:?})", notification.rider_id, notification.kind);
                self.push.send_to_user(&notification).await
            }
            topics::DRIVER_NOTIFICATION => {
                let notification: DriverNotification = event.decode()?;
                debug!("Notifying driver {} ({:?})", notification.driver_id, notification.kind);
                self.push.send_to_driver(&notification).await
            }
            other => Err(DispatchError::InvalidOperation(format!("unexpected topic {}", other))),
        }
    }
}

/// Hands completed trips to the downstream settlement service
pub struct SettlementRequestHandler {
    settlement: Arc<dyn SettlementService>,
}

impl SettlementRequestHandler {
    pub fn new(settlement: Arc<dyn SettlementService>) -> Self {
        Self { settlement }
    }
}

#[async_trait]
impl EventHandler for SettlementRequestHandler {
    fn name(&self) -> &'static str {
        "settlement-request"
    }

    fn accept(&self, event: &Event) -> bool {
        event.topic == topics::SETTLEMENT_REQUEST
    }

    async fn process(&self, event: &Event, _cancel: &CancellationToken) -> CoreResult<()> {
        let request: SettlementRequest = event.decode()?;
        self.settlement.request_settlement(&request).await
    }
}
