use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geo::Point;

/// A driver's offer eligibility and last-offered-ticket bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriverDispatchContext {
    pub driver_id: String,
    pub location: Point,
    pub on_duty: bool,
    pub can_receive: bool,
    pub last_received_ticket_id: Option<Uuid>,
    pub rejected_last_ticket: bool,
    pub last_receive_time: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl DriverDispatchContext {
    /// Context created on first duty activation
    pub fn new(driver_id: &str, location: Point, now: DateTime<Utc>) -> Self {
        Self {
            driver_id: driver_id.to_string(),
            location,
            on_duty: true,
            can_receive: true,
            last_received_ticket_id: None,
            rejected_last_ticket: false,
            last_receive_time: None,
            updated_at: now,
        }
    }

    /// Whether an offer for `ticket_id` may be sent now. Offers received at or
    /// before `offer_expired_before` no longer block the driver.
    pub fn can_be_offered(&self, ticket_id: Uuid, offer_expired_before: DateTime<Utc>) -> bool {
        if !self.on_duty || !self.can_receive {
            return false;
        }
        if self.last_received_ticket_id == Some(ticket_id) {
            return false;
        }
        match (self.last_received_ticket_id, self.last_receive_time) {
            (None, _) => true,
            (Some(_), _) if self.rejected_last_ticket => true,
            (Some(_), Some(received)) => received <= offer_expired_before,
            (Some(_), None) => true,
        }
    }

    /// Latest offer, still open for this driver to answer
    pub fn holds_ticket(&self, ticket_id: Uuid) -> bool {
        self.last_received_ticket_id == Some(ticket_id) && !self.rejected_last_ticket
    }

    pub fn receive_ticket(&mut self, ticket_id: Uuid, now: DateTime<Utc>) {
        self.last_received_ticket_id = Some(ticket_id);
        self.last_receive_time = Some(now);
        self.rejected_last_ticket = false;
        self.updated_at = now;
    }

    /// Driver is free for new offers again (trip over or cancelled)
    pub fn release(&mut self, now: DateTime<Utc>) {
        self.can_receive = true;
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_offer_eligibility() {
        let now = Utc::now();
        let mut ctx = DriverDispatchContext::new("driver-1", Point::new(37.5, 127.0), now);
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        assert!(ctx.can_be_offered(first, now - Duration::seconds(10)));

        ctx.receive_ticket(first, now);
        // same ticket is never offered twice
        assert!(!ctx.can_be_offered(first, now + Duration::seconds(60)));
        // outstanding offer blocks other tickets until it expires
        assert!(!ctx.can_be_offered(second, now - Duration::seconds(10)));
        assert!(ctx.can_be_offered(second, now + Duration::seconds(1)));

        assert!(ctx.holds_ticket(first));
        ctx.rejected_last_ticket = true;
        assert!(!ctx.holds_ticket(first));
        assert!(ctx.can_be_offered(second, now - Duration::seconds(10)));

        ctx.can_receive = false;
        assert!(!ctx.can_be_offered(second, now + Duration::seconds(60)));

        ctx.release(now);
        ctx.on_duty = false;
        assert!(!ctx.can_be_offered(second, now + Duration::seconds(60)));
    }
}
