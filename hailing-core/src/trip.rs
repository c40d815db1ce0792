use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geo::Point;
use crate::services::Route;
use crate::{CoreResult, DispatchError, TripState};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Location {
    pub point: Point,
    pub address: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouteSummary {
    pub distance_meters: i64,
    pub eta_seconds: i64,
}

/// Upper bound of the rider's additional price range
pub const MAX_ADDITIONAL_PRICE: i64 = 100_000_000;

/// One customer trip intent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TripRequest {
    pub id: Uuid,
    pub rider_id: String,
    pub driver_id: Option<String>,
    pub departure: Location,
    pub arrival: Location,
    pub route: RouteSummary,
    pub base_price: i64,
    pub min_additional_price: i64,
    pub max_additional_price: i64,
    pub additional_price: i64,
    pub state: TripState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TripRequest {
    pub fn new(
        rider_id: String,
        departure: Location,
        arrival: Location,
        route: &Route,
        min_additional_price: i64,
        max_additional_price: i64,
        now: DateTime<Utc>,
    ) -> CoreResult<Self> {
        if min_additional_price < 0
            || max_additional_price < min_additional_price
            || max_additional_price > MAX_ADDITIONAL_PRICE
        {
            return Err(DispatchError::InvalidOperation(format!(
                "invalid additional price range {}..{}",
                min_additional_price, max_additional_price
            )));
        }
        if !departure.point.is_valid() || !arrival.point.is_valid() {
            return Err(DispatchError::InvalidOperation("invalid coordinates".to_string()));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            rider_id,
            driver_id: None,
            departure,
            arrival,
            route: RouteSummary {
                distance_meters: route.distance_meters,
                eta_seconds: route.eta_seconds,
            },
            base_price: route.price,
            min_additional_price,
            max_additional_price,
            additional_price: min_additional_price,
            state: TripState::Requested,
            created_at: now,
            updated_at: now,
        })
    }

    /// Move along one edge of the state table
    pub fn transition(&mut self, next: TripState, now: DateTime<Utc>) -> CoreResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(DispatchError::InvalidOperation(format!(
                "invalid state transition from {} to {}",
                self.state, next
            )));
        }
        self.state = next;
        self.updated_at = now;
        Ok(())
    }

    /// Accepted ticket: bind the driver and lock in the offered price
    pub fn assign_driver(&mut self, driver_id: &str, additional_price: i64, now: DateTime<Utc>) -> CoreResult<()> {
        if additional_price > self.max_additional_price {
            return Err(DispatchError::InvalidOperation(format!(
                "additional price {} exceeds max {}",
                additional_price, self.max_additional_price
            )));
        }
        self.transition(TripState::DriverToDeparture, now)?;
        self.driver_id = Some(driver_id.to_string());
        self.additional_price = additional_price;
        Ok(())
    }

    /// Event emitted before the last persisted change
    pub fn is_stale(&self, event_time: DateTime<Utc>) -> bool {
        event_time < self.updated_at
    }

    pub fn total_price(&self) -> i64 {
        self.base_price + self.additional_price
    }

    pub fn is_driver(&self, driver_id: &str) -> bool {
        self.driver_id.as_deref() == Some(driver_id)
    }
}
