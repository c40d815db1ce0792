use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{CoreResult, DriverDispatchContext, Event, Point, SettlementRecord, Ticket, TripRequest};

/// Repository trait for trip request access
#[async_trait]
pub trait TripRequestRepository: Send {
    async fn get_trip_request(&mut self, id: Uuid) -> CoreResult<Option<TripRequest>>;

    /// Loads the request and holds its row lock until commit/rollback.
    /// Every mutation of a request goes through this.
    async fn get_trip_request_for_update(&mut self, id: Uuid) -> CoreResult<Option<TripRequest>>;

    async fn get_latest_trip_request_by_rider(&mut self, rider_id: &str) -> CoreResult<Option<TripRequest>>;

    async fn get_latest_trip_request_by_driver(&mut self, driver_id: &str) -> CoreResult<Option<TripRequest>>;

    async fn list_active_trip_request_ids(&mut self) -> CoreResult<Vec<Uuid>>;

    async fn create_trip_request(&mut self, trip: &TripRequest) -> CoreResult<()>;

    async fn update_trip_request(&mut self, trip: &TripRequest) -> CoreResult<()>;
}

/// Repository trait for the latest ticket of each request
#[async_trait]
pub trait TicketRepository: Send {
    async fn get_latest_ticket(&mut self, trip_request_id: Uuid) -> CoreResult<Option<Ticket>>;

    async fn get_ticket(&mut self, ticket_id: Uuid) -> CoreResult<Option<Ticket>>;

    /// True if the stored ticket already carries the same offer
    async fn ticket_exists(&mut self, ticket: &Ticket) -> CoreResult<bool>;

    /// Replaces the ticket row of the request
    async fn upsert_ticket(&mut self, ticket: &Ticket) -> CoreResult<()>;

    async fn delete_ticket(&mut self, trip_request_id: Uuid) -> CoreResult<()>;
}

/// Repository trait for driver dispatch contexts
#[async_trait]
pub trait DriverContextRepository: Send {
    async fn get_driver_context(&mut self, driver_id: &str) -> CoreResult<Option<DriverDispatchContext>>;

    async fn get_driver_context_for_update(&mut self, driver_id: &str) -> CoreResult<Option<DriverDispatchContext>>;

    async fn upsert_driver_context(&mut self, context: &DriverDispatchContext) -> CoreResult<()>;

    async fn bulk_upsert_driver_contexts(&mut self, contexts: &[DriverDispatchContext]) -> CoreResult<()>;

    /// Drivers around `center` that may be offered `exclude_ticket_id`,
    /// nearest first
    async fn get_driver_contexts_within_radius(
        &mut self,
        center: Point,
        radius_meters: f64,
        exclude_ticket_id: Uuid,
        offer_expired_before: DateTime<Utc>,
    ) -> CoreResult<Vec<DriverDispatchContext>>;

    async fn count_on_duty_drivers(&mut self) -> CoreResult<i64>;
}

/// Outbox side of a unit of work
#[async_trait]
pub trait EventStore: Send {
    async fn append_events(&mut self, events: &[Event]) -> CoreResult<()>;
}

#[async_trait]
pub trait SettlementRepository: Send {
    async fn create_settlement(&mut self, record: &SettlementRecord) -> CoreResult<()>;

    async fn get_settlement_by_trip(&mut self, trip_request_id: Uuid) -> CoreResult<Option<SettlementRecord>>;
}

/// One database transaction. Dropping it without `commit` rolls back.
#[async_trait]
pub trait UnitOfWork:
    TripRequestRepository + TicketRepository + DriverContextRepository + EventStore + SettlementRepository
{
    async fn commit(self: Box<Self>) -> CoreResult<()>;
}

#[async_trait]
pub trait DispatchStore: Send + Sync {
    async fn begin(&self) -> CoreResult<Box<dyn UnitOfWork>>;
}

/// Publisher side of the outbox
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Oldest-first, at most `max` events whose topic starts with one of `prefixes`
    async fn claim_events(&self, prefixes: &[String], max: usize) -> CoreResult<Vec<Event>>;

    /// Deletes exactly the given events. Deleting fewer rows than requested
    /// is an internal error.
    async fn commit_events(&self, events: &[Event]) -> CoreResult<()>;
}

/// Destination of messages that exhausted their delivery attempts
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn store_dead_letter(&self, event: &Event, attempt: u32, reason: &str) -> CoreResult<()>;
}
