use chrono::{DateTime, Duration, Utc};
use hailing_shared::models::events::{DriverNotification, ProcessEvent, SettlementRequest, UserNotification};
use hailing_shared::topics;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{CoreResult, DispatchError};

/// Durable, at-least-once fact waiting in the outbox
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: Uuid,
    pub topic: String,
    pub payload: serde_json::Value,
    pub delay_seconds: i64,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn new<T: Serialize>(topic: &str, payload: &T, delay_seconds: i64, now: DateTime<Utc>) -> CoreResult<Self> {
        Ok(Self {
            id: Uuid::new_v4(),
            topic: topic.to_string(),
            payload: serde_json::to_value(payload)?,
            delay_seconds: delay_seconds.max(0),
            created_at: now,
        })
    }

    /// Process event; delay rounds up so the bus never delivers early
    pub fn process(event: &ProcessEvent, now: DateTime<Utc>) -> CoreResult<Self> {
        let wait = event.desired_process_time - now;
        let delay_seconds = if wait <= Duration::zero() {
            0
        } else {
            (wait.num_milliseconds() + 999) / 1000
        };
        Self::new(topics::TAXI_CALL_PROCESS, event, delay_seconds, now)
    }

    pub fn user_notification(notification: &UserNotification, now: DateTime<Utc>) -> CoreResult<Self> {
        Self::new(topics::USER_NOTIFICATION, notification, 0, now)
    }

    pub fn driver_notification(notification: &DriverNotification, now: DateTime<Utc>) -> CoreResult<Self> {
        Self::new(topics::DRIVER_NOTIFICATION, notification, 0, now)
    }

    pub fn settlement_request(request: &SettlementRequest, now: DateTime<Utc>) -> CoreResult<Self> {
        Self::new(topics::SETTLEMENT_REQUEST, request, 0, now)
    }

    /// Malformed payloads never become valid, so decoding fails permanently
    pub fn decode<T: DeserializeOwned>(&self) -> CoreResult<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            DispatchError::InvalidOperation(format!("malformed payload on {}: {}", self.topic, e))
        })
    }

    pub fn visible_at(&self) -> DateTime<Utc> {
        self.created_at + Duration::seconds(self.delay_seconds)
    }

    pub fn has_topic_prefix(&self, prefix: &str) -> bool {
        topics::matches_prefix(&self.topic, prefix)
    }
}
