use chrono::{DateTime, Utc};
use hailing_shared::models::events::SettlementRequest;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::{CoreResult, DispatchError, TripRequest};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementStatus {
    Pending,
}

impl fmt::Display for SettlementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettlementStatus::Pending => f.write_str("PENDING"),
        }
    }
}

impl FromStr for SettlementStatus {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(SettlementStatus::Pending),
            other => Err(DispatchError::Internal(format!("unknown settlement status {}", other))),
        }
    }
}

/// Pending payout for a completed trip, aggregated downstream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SettlementRecord {
    pub id: Uuid,
    pub trip_request_id: Uuid,
    pub rider_id: String,
    pub driver_id: String,
    pub amount: i64,
    pub status: SettlementStatus,
    pub created_at: DateTime<Utc>,
}

impl SettlementRecord {
    pub fn for_trip(trip: &TripRequest, now: DateTime<Utc>) -> CoreResult<Self> {
        let driver_id = trip.driver_id.clone().ok_or_else(|| {
            DispatchError::Internal(format!("trip {} completed without a driver", trip.id))
        })?;

        Ok(Self {
            id: Uuid::new_v4(),
            trip_request_id: trip.id,
            rider_id: trip.rider_id.clone(),
            driver_id,
            amount: trip.total_price(),
            status: SettlementStatus::Pending,
            created_at: now,
        })
    }

    pub fn to_request(&self) -> SettlementRequest {
        SettlementRequest {
            settlement_id: self.id,
            trip_request_id: self.trip_request_id,
            rider_id: self.rider_id.clone(),
            driver_id: self.driver_id.clone(),
            amount: self.amount,
            requested_at: self.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::Route;
    use crate::{Location, Point};

    #[test]
    fn test_completed_trip_settles_total_price() {
        let now = Utc::now();
        let location = |lat, lng| Location { point: Point::new(lat, lng), address: String::new() };
        let route = Route { price: 12000, distance_meters: 9000, eta_seconds: 1500 };
        let mut trip =
            TripRequest::new("rider-1".into(), location(37.49, 127.02), location(37.56, 126.97), &route, 0, 3000, now)
                .unwrap();
        assert!(SettlementRecord::for_trip(&trip, now).is_err());

        trip.assign_driver("driver-1", 1000, now).unwrap();
        let record = SettlementRecord::for_trip(&trip, now).unwrap();
        assert_eq!(record.amount, 13000);
        assert_eq!(record.status, SettlementStatus::Pending);
        assert_eq!(record.status.to_string().parse::<SettlementStatus>().unwrap(), SettlementStatus::Pending);
        assert!("REQUESTED".parse::<SettlementStatus>().is_err());
        assert_eq!(record.to_request().settlement_id, record.id);
    }
}
