use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::TripState;

/// Re-invokes the state machine for one trip request at `desired_process_time`.
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq)]
pub struct ProcessEvent {
    pub trip_request_id: Uuid,
    pub state: TripState,
    pub event_time: DateTime<Utc>,
    pub desired_process_time: DateTime<Utc>,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserNotificationKind {
    Searching,
    DriverAssigned,
    DriverArrived,
    TripCompleted,
    DriverCancelled,
    NoDriverAvailable,
    Failed,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq)]
pub struct UserNotification {
    pub rider_id: String,
    pub trip_request_id: Uuid,
    pub kind: UserNotificationKind,
    pub state: TripState,
    pub driver_id: Option<String>,
    /// Current search range, only meaningful while searching
    pub search_radius_minutes: Option<i32>,
    pub additional_price: i64,
    pub event_time: DateTime<Utc>,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriverNotificationKind {
    NewTicket,
    UserCancelled,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq)]
pub struct DriverNotification {
    pub driver_id: String,
    pub trip_request_id: Uuid,
    pub kind: DriverNotificationKind,
    pub ticket_id: Option<Uuid>,
    pub departure_address: String,
    pub arrival_address: String,
    pub base_price: i64,
    pub additional_price: i64,
    pub event_time: DateTime<Utc>,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq)]
pub struct SettlementRequest {
    pub settlement_id: Uuid,
    pub trip_request_id: Uuid,
    pub rider_id: String,
    pub driver_id: String,
    pub amount: i64,
    pub requested_at: DateTime<Utc>,
}
