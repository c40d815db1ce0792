use async_trait::async_trait;
use hailing_core::services::{AddressService, PushService, Route, RouteService, SettlementService};
use hailing_core::{CoreResult, DispatchError, Point};
use hailing_shared::models::events::{DriverNotification, SettlementRequest, UserNotification};
use hailing_store::app_config::FareConfig;
use tracing::info;

/// Fare and ETA from the great-circle distance
pub struct StraightLineRouteService {
    fare: FareConfig,
}

impl StraightLineRouteService {
    pub fn new(fare: FareConfig) -> Self {
        Self { fare }
    }
}

#[async_trait]
impl RouteService for StraightLineRouteService {
    async fn get_route(&self, from: Point, to: Point) -> CoreResult<Route> {
        if !from.is_valid() || !to.is_valid() {
            return Err(DispatchError::InvalidOperation("invalid coordinates".into()));
        }
        let meters = from.distance_meters(&to);
        let price = self.fare.base_fare + (meters / 1000.0 * self.fare.per_kilometer as f64).round() as i64;
        let meters_per_second = self.fare.average_speed_kmh * 1000.0 / 3600.0;

        Ok(Route {
            price,
            distance_meters: meters.round() as i64,
            eta_seconds: (meters / meters_per_second).ceil() as i64,
        })
    }
}

pub struct CoordinateAddressService;

#[async_trait]
impl AddressService for CoordinateAddressService {
    async fn get_address(&self, point: Point) -> CoreResult<String> {
        Ok(format!("{:.5}, {:.5}", point.latitude, point.longitude))
    }
}

pub struct LogPushService;

#[async_trait]
impl PushService for LogPushService {
    async fn send_to_user(&self, notification: &UserNotification) -> CoreResult<()> {
        info!(
            "push rider={} trip={} kind={:?} state={}",
            notification.rider_id, notification.trip_request_id, notification.kind, notification.state
        );
        Ok(())
    }

    async fn send_to_driver(&self, notification: &DriverNotification) -> CoreResult<()> {
        info!(
            "push driver={} trip={} kind={:?} ticket={:?}",
            notification.driver_id, notification.trip_request_id, notification.kind, notification.ticket_id
        );
        Ok(())
    }
}

pub struct LogSettlementService;

#[async_trait]
impl SettlementService for LogSettlementService {
    async fn request_settlement(&self, request: &SettlementRequest) -> CoreResult<()> {
        info!(
            "settlement {} for trip {}: {} to driver {}",
            request.settlement_id, request.trip_request_id, request.amount, request.driver_id
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_straight_line_fare() {
        let routes = StraightLineRouteService::new(FareConfig {
            base_fare: 4800,
            per_kilometer: 1000,
            average_speed_kmh: 36.0,
        });
        let from = Point::new(37.0, 127.0);
        // one hundredth of a degree of latitude is about 1.1km
        let to = Point::new(37.01, 127.0);

        let route = routes.get_route(from, to).await.unwrap();
        assert!((1100..1120).contains(&route.distance_meters));
        assert_eq!(route.price, 4800 + 1112);
        assert!((110..=112).contains(&route.eta_seconds));

        assert!(routes.get_route(Point::new(91.0, 0.0), to).await.is_err());
    }
}
