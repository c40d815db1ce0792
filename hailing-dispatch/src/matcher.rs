use chrono::{DateTime, Utc};
use hailing_core::repository::{DriverContextRepository, UnitOfWork};
use hailing_core::{CoreResult, DriverDispatchContext, Point};
use tracing::debug;
use uuid::Uuid;

/// Finds drivers for a ticket and records the offer on their contexts
pub struct DriverMatcher {
    offer_timeout: chrono::Duration,
}

impl DriverMatcher {
    pub fn new(offer_timeout: chrono::Duration) -> Self {
        Self { offer_timeout }
    }

    /// On-duty, free drivers around `pickup` without a pending offer,
    /// excluding those already holding `exclude_ticket_id`
    pub async fn drivers_within_radius(
        &self,
        uow: &mut dyn UnitOfWork,
        pickup: Point,
        radius_meters: f64,
        exclude_ticket_id: Uuid,
        now: DateTime<Utc>,
    ) -> CoreResult<Vec<DriverDispatchContext>> {
        uow.get_driver_contexts_within_radius(pickup, radius_meters, exclude_ticket_id, now - self.offer_timeout)
            .await
    }

    /// Marks `ticket_id` as the latest offer of every driver given
    pub async fn offer(
        &self,
        uow: &mut dyn UnitOfWork,
        drivers: &mut [DriverDispatchContext],
        ticket_id: Uuid,
        now: DateTime<Utc>,
    ) -> CoreResult<()> {
        if drivers.is_empty() {
            return Ok(());
        }
        for driver in drivers.iter_mut() {
            driver.receive_ticket(ticket_id, now);
        }
        debug!("Offering ticket {} to {} drivers", ticket_id, drivers.len());
        uow.bulk_upsert_driver_contexts(drivers).await
    }
}
