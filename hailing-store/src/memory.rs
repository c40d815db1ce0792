use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hailing_core::repository::{
    DeadLetterSink, DispatchStore, DriverContextRepository, EventStore, OutboxStore, SettlementRepository,
    TicketRepository, TripRequestRepository, UnitOfWork,
};
use hailing_core::{
    CoreResult, DispatchError, DriverDispatchContext, Event, Point, SettlementRecord, Ticket, TripRequest,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub event: Event,
    pub attempt: u32,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    trips: HashMap<Uuid, TripRequest>,
    // keyed by trip request id
    tickets: HashMap<Uuid, Ticket>,
    drivers: HashMap<String, DriverDispatchContext>,
    events: Vec<Event>,
    settlements: HashMap<Uuid, SettlementRecord>,
    dead_letters: Vec<DeadLetter>,
}

/// Process-local store for tests and single-node runs.
///
/// A unit of work holds the whole store for its lifetime and works on a copy
/// that replaces the shared state on commit.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Outbox rows not yet committed by the publisher
    pub async fn pending_events(&self) -> Vec<Event> {
        self.state.lock().await.events.clone()
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().await.dead_letters.clone()
    }
}

pub struct MemoryUnitOfWork {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
}

#[async_trait]
impl DispatchStore for MemoryStore {
    async fn begin(&self) -> CoreResult<Box<dyn UnitOfWork>> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryUnitOfWork { guard, working }))
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn commit(self: Box<Self>) -> CoreResult<()> {
        let MemoryUnitOfWork { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }
}

#[async_trait]
impl TripRequestRepository for MemoryUnitOfWork {
    async fn get_trip_request(&mut self, id: Uuid) -> CoreResult<Option<TripRequest>> {
        Ok(self.working.trips.get(&id).cloned())
    }

    async fn get_trip_request_for_update(&mut self, id: Uuid) -> CoreResult<Option<TripRequest>> {
        self.get_trip_request(id).await
    }

    async fn get_latest_trip_request_by_rider(&mut self, rider_id: &str) -> CoreResult<Option<TripRequest>> {
        Ok(self
            .working
            .trips
            .values()
            .filter(|t| t.rider_id == rider_id)
            .max_by_key(|t| t.created_at)
            .cloned())
    }

    async fn get_latest_trip_request_by_driver(&mut self, driver_id: &str) -> CoreResult<Option<TripRequest>> {
        Ok(self
            .working
            .trips
            .values()
            .filter(|t| t.is_driver(driver_id))
            .max_by_key(|t| t.created_at)
            .cloned())
    }

    async fn list_active_trip_request_ids(&mut self) -> CoreResult<Vec<Uuid>> {
        let mut active: Vec<&TripRequest> = self.working.trips.values().filter(|t| t.state.is_active()).collect();
        active.sort_by_key(|t| t.created_at);
        Ok(active.into_iter().map(|t| t.id).collect())
    }

    async fn create_trip_request(&mut self, trip: &TripRequest) -> CoreResult<()> {
        if self.working.trips.contains_key(&trip.id) {
            return Err(DispatchError::AlreadyExists(format!("trip request {}", trip.id)));
        }
        self.working.trips.insert(trip.id, trip.clone());
        Ok(())
    }

    async fn update_trip_request(&mut self, trip: &TripRequest) -> CoreResult<()> {
        match self.working.trips.get_mut(&trip.id) {
            Some(stored) => {
                *stored = trip.clone();
                Ok(())
            }
            None => Err(DispatchError::NotFound(format!("trip request {}", trip.id))),
        }
    }
}

#[async_trait]
impl TicketRepository for MemoryUnitOfWork {
    async fn get_latest_ticket(&mut self, trip_request_id: Uuid) -> CoreResult<Option<Ticket>> {
        Ok(self.working.tickets.get(&trip_request_id).cloned())
    }

    async fn get_ticket(&mut self, ticket_id: Uuid) -> CoreResult<Option<Ticket>> {
        Ok(self.working.tickets.values().find(|t| t.id == ticket_id).cloned())
    }

    async fn ticket_exists(&mut self, ticket: &Ticket) -> CoreResult<bool> {
        Ok(self
            .working
            .tickets
            .get(&ticket.trip_request_id)
            .map(|stored| stored.same_offer(ticket))
            .unwrap_or(false))
    }

    async fn upsert_ticket(&mut self, ticket: &Ticket) -> CoreResult<()> {
        self.working.tickets.insert(ticket.trip_request_id, ticket.clone());
        Ok(())
    }

    async fn delete_ticket(&mut self, trip_request_id: Uuid) -> CoreResult<()> {
        self.working.tickets.remove(&trip_request_id);
        Ok(())
    }
}

#[async_trait]
impl DriverContextRepository for MemoryUnitOfWork {
    async fn get_driver_context(&mut self, driver_id: &str) -> CoreResult<Option<DriverDispatchContext>> {
        Ok(self.working.drivers.get(driver_id).cloned())
    }

    async fn get_driver_context_for_update(&mut self, driver_id: &str) -> CoreResult<Option<DriverDispatchContext>> {
        self.get_driver_context(driver_id).await
    }

    async fn upsert_driver_context(&mut self, context: &DriverDispatchContext) -> CoreResult<()> {
        self.working.drivers.insert(context.driver_id.clone(), context.clone());
        Ok(())
    }

    async fn bulk_upsert_driver_contexts(&mut self, contexts: &[DriverDispatchContext]) -> CoreResult<()> {
        for context in contexts {
            self.working.drivers.insert(context.driver_id.clone(), context.clone());
        }
        Ok(())
    }

    async fn get_driver_contexts_within_radius(
        &mut self,
        center: Point,
        radius_meters: f64,
        exclude_ticket_id: Uuid,
        offer_expired_before: DateTime<Utc>,
    ) -> CoreResult<Vec<DriverDispatchContext>> {
        let mut found: Vec<(f64, DriverDispatchContext)> = self
            .working
            .drivers
            .values()
            .filter(|d| d.can_be_offered(exclude_ticket_id, offer_expired_before))
            .map(|d| (center.distance_meters(&d.location), d))
            .filter(|(distance, _)| *distance <= radius_meters)
            .map(|(distance, d)| (distance, d.clone()))
            .collect();
        found.sort_by(|a, b| a.0.total_cmp(&b.0));
        Ok(found.into_iter().map(|(_, d)| d).collect())
    }

    async fn count_on_duty_drivers(&mut self) -> CoreResult<i64> {
        Ok(self.working.drivers.values().filter(|d| d.on_duty).count() as i64)
    }
}

#[async_trait]
impl EventStore for MemoryUnitOfWork {
    async fn append_events(&mut self, events: &[Event]) -> CoreResult<()> {
        self.working.events.extend_from_slice(events);
        Ok(())
    }
}

#[async_trait]
impl SettlementRepository for MemoryUnitOfWork {
    async fn create_settlement(&mut self, record: &SettlementRecord) -> CoreResult<()> {
        if self.working.settlements.contains_key(&record.trip_request_id) {
            return Err(DispatchError::AlreadyExists(format!(
                "settlement for trip request {}",
                record.trip_request_id
            )));
        }
        self.working.settlements.insert(record.trip_request_id, record.clone());
        Ok(())
    }

    async fn get_settlement_by_trip(&mut self, trip_request_id: Uuid) -> CoreResult<Option<SettlementRecord>> {
        Ok(self.working.settlements.get(&trip_request_id).cloned())
    }
}

#[async_trait]
impl OutboxStore for MemoryStore {
    async fn claim_events(&self, prefixes: &[String], max: usize) -> CoreResult<Vec<Event>> {
        let state = self.state.lock().await;
        let mut claimed: Vec<Event> = state
            .events
            .iter()
            .filter(|e| prefixes.iter().any(|p| e.has_topic_prefix(p)))
            .cloned()
            .collect();
        claimed.sort_by_key(|e| e.created_at);
        claimed.truncate(max);
        Ok(claimed)
    }

    async fn commit_events(&self, events: &[Event]) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        let present = state.events.iter().filter(|e| events.iter().any(|c| c.id == e.id)).count();
        if present != events.len() {
            return Err(DispatchError::Internal(format!(
                "outbox commit matched {} of {} events",
                present,
                events.len()
            )));
        }
        state.events.retain(|e| !events.iter().any(|c| c.id == e.id));
        Ok(())
    }
}

#[async_trait]
impl DeadLetterSink for MemoryStore {
    async fn store_dead_letter(&self, event: &Event, attempt: u32, reason: &str) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        state.dead_letters.push(DeadLetter {
            event: event.clone(),
            attempt,
            reason: reason.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use hailing_core::services::Route;
    use hailing_core::{Location, TripState};
    use hailing_shared::topics;

    fn trip(rider: &str, now: DateTime<Utc>) -> TripRequest {
        let location = |lat: f64, lng: f64| Location { point: Point::new(lat, lng), address: "addr".into() };
        TripRequest::new(
            rider.to_string(),
            location(37.5, 127.0),
            location(37.6, 127.1),
            &Route { price: 10000, distance_meters: 5000, eta_seconds: 600 },
            0,
            3000,
            now,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_rollback_on_drop() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let request = trip("rider-1", now);

        {
            let mut uow = store.begin().await.unwrap();
            uow.create_trip_request(&request).await.unwrap();
            // dropped without commit
        }
        let mut uow = store.begin().await.unwrap();
        assert!(uow.get_trip_request(request.id).await.unwrap().is_none());

        uow.create_trip_request(&request).await.unwrap();
        uow.commit().await.unwrap();

        let mut uow = store.begin().await.unwrap();
        assert_eq!(uow.get_trip_request(request.id).await.unwrap(), Some(request.clone()));
        assert_eq!(uow.list_active_trip_request_ids().await.unwrap(), vec![request.id]);
        assert!(matches!(
            uow.create_trip_request(&request).await,
            Err(DispatchError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_latest_by_rider() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut first = trip("rider-1", now);
        first.transition(TripState::UserCancelled, now).unwrap();
        let second = trip("rider-1", now + Duration::seconds(30));

        let mut uow = store.begin().await.unwrap();
        uow.create_trip_request(&first).await.unwrap();
        uow.create_trip_request(&second).await.unwrap();
        let latest = uow.get_latest_trip_request_by_rider("rider-1").await.unwrap().unwrap();
        assert_eq!(latest.id, second.id);
        assert!(uow.get_latest_trip_request_by_rider("rider-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_drivers_within_radius_nearest_first() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let center = Point::new(37.5, 127.0);
        let near = DriverDispatchContext::new("near", Point::new(37.501, 127.0), now);
        let far = DriverDispatchContext::new("far", Point::new(37.505, 127.0), now);
        let outside = DriverDispatchContext::new("outside", Point::new(37.6, 127.0), now);
        let mut busy = DriverDispatchContext::new("busy", Point::new(37.5, 127.0), now);
        busy.can_receive = false;

        let mut uow = store.begin().await.unwrap();
        uow.bulk_upsert_driver_contexts(&[far, outside, busy, near]).await.unwrap();

        let found = uow
            .get_driver_contexts_within_radius(center, 800.0, Uuid::new_v4(), now - Duration::seconds(10))
            .await
            .unwrap();
        let ids: Vec<&str> = found.iter().map(|d| d.driver_id.as_str()).collect();
        assert_eq!(ids, vec!["near", "far"]);
        assert_eq!(uow.count_on_duty_drivers().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_outbox_claim_and_commit() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let process = Event::new(topics::TAXI_CALL_PROCESS, &serde_json::json!({}), 0, now).unwrap();
        let user = Event::new(topics::USER_NOTIFICATION, &serde_json::json!({}), 0, now + Duration::seconds(1)).unwrap();
        let other = Event::new("Billing/Invoice", &serde_json::json!({}), 0, now).unwrap();

        let mut uow = store.begin().await.unwrap();
        uow.append_events(&[process.clone(), user.clone(), other.clone()]).await.unwrap();
        uow.commit().await.unwrap();

        let prefixes = vec!["TaxiCall".to_string(), "TaxiCallNotification".to_string()];
        let claimed = store.claim_events(&prefixes, 1).await.unwrap();
        assert_eq!(claimed, vec![process.clone()]);

        store.commit_events(&claimed).await.unwrap();
        // committing the same rows twice is an invariant break
        assert!(matches!(store.commit_events(&claimed).await, Err(DispatchError::Internal(_))));

        let claimed = store.claim_events(&prefixes, 10).await.unwrap();
        assert_eq!(claimed, vec![user]);
        assert_eq!(store.pending_events().await.len(), 2);
    }
}
