pub mod app;
pub mod handlers;
pub mod matcher;
pub mod process;

pub use app::{CreateTripRequest, DispatchApp};
pub use handlers::{NotificationHandler, SettlementRequestHandler};
pub use matcher::DriverMatcher;
pub use process::ProcessHandler;

use chrono::{DateTime, SubsecRound, Utc};
use hailing_core::{CoreResult, DispatchError, EscalationPolicy};
use std::time::Duration;

/// Timing and escalation parameters of the dispatch loop
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchPolicy {
    pub escalation: EscalationPolicy,
    /// Delay between two REQUESTED ticks
    pub escalation_interval: chrono::Duration,
    /// How long an unanswered offer blocks a driver from other offers
    pub offer_timeout: chrono::Duration,
    /// Consecutive ticks without any on-duty driver before giving up
    pub idle_attempt_limit: u32,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            escalation: EscalationPolicy::default(),
            escalation_interval: chrono::Duration::seconds(10),
            offer_timeout: chrono::Duration::seconds(10),
            idle_attempt_limit: 3,
        }
    }
}

impl DispatchPolicy {
    pub fn new(
        escalation: EscalationPolicy,
        escalation_interval: Duration,
        offer_timeout: Duration,
        idle_attempt_limit: u32,
    ) -> CoreResult<Self> {
        escalation.validate()?;
        if escalation_interval.is_zero() {
            return Err(DispatchError::InvalidOperation("escalation_interval must be positive".into()));
        }
        if idle_attempt_limit == 0 {
            return Err(DispatchError::InvalidOperation("idle_attempt_limit must be positive".into()));
        }
        let to_chrono = |d: Duration| {
            chrono::Duration::from_std(d).map_err(|e| DispatchError::InvalidOperation(e.to_string()))
        };

        Ok(Self {
            escalation,
            escalation_interval: to_chrono(escalation_interval)?,
            offer_timeout: to_chrono(offer_timeout)?,
            idle_attempt_limit,
        })
    }
}

/// Timestamps are kept at the database's microsecond precision so a value
/// read back compares equal to the one written.
pub(crate) fn store_time(now: DateTime<Utc>) -> DateTime<Utc> {
    now.trunc_subsecs(6)
}
