use async_trait::async_trait;
use hailing_shared::models::events::{DriverNotification, SettlementRequest, UserNotification};
use serde::{Deserialize, Serialize};

use crate::geo::Point;
use crate::CoreResult;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Route {
    pub price: i64,
    pub distance_meters: i64,
    pub eta_seconds: i64,
}

/// Route/fare lookup
#[async_trait]
pub trait RouteService: Send + Sync {
    async fn get_route(&self, from: Point, to: Point) -> CoreResult<Route>;
}

/// Reverse geocoding
#[async_trait]
pub trait AddressService: Send + Sync {
    async fn get_address(&self, point: Point) -> CoreResult<String>;
}

/// Push delivery; content rendering happens behind this trait
#[async_trait]
pub trait PushService: Send + Sync {
    async fn send_to_user(&self, notification: &UserNotification) -> CoreResult<()>;

    async fn send_to_driver(&self, notification: &DriverNotification) -> CoreResult<()>;
}

/// Downstream settlement/payout
#[async_trait]
pub trait SettlementService: Send + Sync {
    async fn request_settlement(&self, request: &SettlementRequest) -> CoreResult<()>;
}
