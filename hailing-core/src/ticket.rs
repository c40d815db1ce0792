use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{CoreResult, DispatchError};

/// Parameters of the price/radius escalation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EscalationPolicy {
    /// Attempts made at one price before the price is raised
    pub attempts_per_tier: u32,

    /// Amount added to the additional price at each tier boundary
    pub price_increment: i64,

    /// Search radius (in driving minutes) indexed by position inside a tier.
    /// Positions past the end reuse the last entry.
    pub radius_minutes: Vec<i32>,

    /// Conversion from driving minutes to a straight-line search radius
    pub meters_per_minute: f64,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            attempts_per_tier: 3,
            price_increment: 1000,
            radius_minutes: vec![2, 5, 10],
            meters_per_minute: 400.0,
        }
    }
}

impl EscalationPolicy {
    pub fn new(
        attempts_per_tier: u32,
        price_increment: i64,
        radius_minutes: Vec<i32>,
        meters_per_minute: f64,
    ) -> CoreResult<Self> {
        let policy = Self {
            attempts_per_tier,
            price_increment,
            radius_minutes,
            meters_per_minute,
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.attempts_per_tier == 0 {
            return Err(DispatchError::InvalidOperation("attempts_per_tier must be positive".into()));
        }
        if self.price_increment <= 0 {
            return Err(DispatchError::InvalidOperation("price_increment must be positive".into()));
        }
        if self.radius_minutes.is_empty() || self.radius_minutes.iter().any(|m| *m <= 0) {
            return Err(DispatchError::InvalidOperation("radius_minutes must be non-empty and positive".into()));
        }
        if !(self.meters_per_minute > 0.0) {
            return Err(DispatchError::InvalidOperation("meters_per_minute must be positive".into()));
        }
        Ok(())
    }
}

/// One matching attempt for a trip request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ticket {
    pub id: Uuid,
    pub trip_request_id: Uuid,
    pub attempt_count: i32,
    pub additional_price: i64,
    /// Consecutive attempts during which no driver at all was on duty
    pub idle_attempts: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Ticket {
    /// First attempt starts at the rider's minimum additional price
    pub fn first(trip_request_id: Uuid, min_additional_price: i64, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            trip_request_id,
            attempt_count: 1,
            additional_price: min_additional_price,
            idle_attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Next escalation step. The flag is false once the price would pass
    /// `max_additional_price` or leave the `i64` range; the returned ticket is
    /// then unchanged.
    ///
    /// Every valid step issues a new ticket id so offers of the previous step
    /// can no longer be accepted.
    pub fn step(&self, policy: &EscalationPolicy, max_additional_price: i64, now: DateTime<Utc>) -> (Ticket, bool) {
        let attempt_count = self.attempt_count + 1;
        let tier_boundary = (self.attempt_count as u32) % policy.attempts_per_tier == 0;

        let additional_price = if tier_boundary {
            self.additional_price.checked_add(policy.price_increment)
        } else {
            Some(self.additional_price)
        };

        let Some(additional_price) = additional_price.filter(|price| *price <= max_additional_price) else {
            return (self.clone(), false);
        };

        let next = Ticket {
            id: Uuid::new_v4(),
            trip_request_id: self.trip_request_id,
            attempt_count,
            additional_price,
            idle_attempts: self.idle_attempts,
            created_at: self.created_at,
            updated_at: now,
        };
        (next, true)
    }

    /// Zero-based position of this attempt inside its price tier
    pub fn tier_position(&self, policy: &EscalationPolicy) -> usize {
        ((self.attempt_count.max(1) - 1) as u32 % policy.attempts_per_tier) as usize
    }

    pub fn radius_minutes(&self, policy: &EscalationPolicy) -> i32 {
        let position = self.tier_position(policy);
        policy
            .radius_minutes
            .get(position)
            .or_else(|| policy.radius_minutes.last())
            .copied()
            .unwrap_or(1)
    }

    /// Straight-line search radius in metres
    pub fn radius(&self, policy: &EscalationPolicy) -> f64 {
        self.radius_minutes(policy) as f64 * policy.meters_per_minute
    }

    /// Same offer regardless of id and timestamps
    pub fn same_offer(&self, other: &Ticket) -> bool {
        self.trip_request_id == other.trip_request_id
            && self.attempt_count == other.attempt_count
            && self.additional_price == other.additional_price
    }
}
