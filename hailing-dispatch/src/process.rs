use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hailing_core::messaging::EventHandler;
use hailing_core::repository::{
    DispatchStore, DriverContextRepository, EventStore, SettlementRepository, TicketRepository,
    TripRequestRepository, UnitOfWork,
};
use hailing_core::{CoreResult, DispatchError, Event, SettlementRecord, Ticket, TripRequest, TripState};
use hailing_shared::models::events::{
    DriverNotification, DriverNotificationKind, ProcessEvent, UserNotification, UserNotificationKind,
};
use hailing_shared::topics;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::matcher::DriverMatcher;
use crate::{store_time, DispatchPolicy};

/// Process event for `trip` in its current state, due at `desired`
pub(crate) fn process_event(
    trip: &TripRequest,
    event_time: DateTime<Utc>,
    desired: DateTime<Utc>,
    now: DateTime<Utc>,
) -> CoreResult<Event> {
    let payload = ProcessEvent {
        trip_request_id: trip.id,
        state: trip.state,
        event_time,
        desired_process_time: desired,
    };
    Event::process(&payload, now)
}

fn user_notification(
    trip: &TripRequest,
    kind: UserNotificationKind,
    search_radius_minutes: Option<i32>,
    now: DateTime<Utc>,
) -> CoreResult<Event> {
    let notification = UserNotification {
        rider_id: trip.rider_id.clone(),
        trip_request_id: trip.id,
        kind,
        state: trip.state,
        driver_id: trip.driver_id.clone(),
        search_radius_minutes,
        additional_price: trip.additional_price,
        event_time: now,
    };
    Event::user_notification(&notification, now)
}

fn driver_notification(
    trip: &TripRequest,
    driver_id: &str,
    kind: DriverNotificationKind,
    ticket_id: Option<Uuid>,
    now: DateTime<Utc>,
) -> CoreResult<Event> {
    let notification = DriverNotification {
        driver_id: driver_id.to_string(),
        trip_request_id: trip.id,
        kind,
        ticket_id,
        departure_address: trip.departure.address.clone(),
        arrival_address: trip.arrival.address.clone(),
        base_price: trip.base_price,
        additional_price: trip.additional_price,
        event_time: now,
    };
    Event::driver_notification(&notification, now)
}

/// The trip state machine, re-entered once per process event
pub struct ProcessHandler {
    store: Arc<dyn DispatchStore>,
    policy: DispatchPolicy,
    matcher: DriverMatcher,
}

impl ProcessHandler {
    pub fn new(store: Arc<dyn DispatchStore>, policy: DispatchPolicy) -> Self {
        let matcher = DriverMatcher::new(policy.offer_timeout);
        Self { store, policy, matcher }
    }

    /// Runs the handler for the request's current state, provided the event
    /// still describes it. Everything it changes commits together.
    pub async fn handle(&self, event: &ProcessEvent, now: DateTime<Utc>) -> CoreResult<()> {
        let now = store_time(now);
        let mut uow = self.store.begin().await?;

        let mut trip = uow
            .get_trip_request_for_update(event.trip_request_id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("trip request {}", event.trip_request_id)))?;

        if trip.state != event.state {
            debug!(
                "Dropping {} event for trip {} now in {}",
                event.state, trip.id, trip.state
            );
            return Ok(());
        }
        if trip.is_stale(event.event_time) {
            debug!(
                "Dropping stale {} event for trip {} ({} < {})",
                event.state, trip.id, event.event_time, trip.updated_at
            );
            return Ok(());
        }

        let events = match trip.state {
            TripState::Requested => match self.on_requested(uow.as_mut(), &mut trip, now).await? {
                Some(events) => events,
                None => return Ok(()),
            },
            TripState::DriverToDeparture => {
                uow.delete_ticket(trip.id).await?;
                vec![user_notification(&trip, UserNotificationKind::DriverAssigned, None, now)?]
            }
            TripState::DriverToArrival => {
                vec![user_notification(&trip, UserNotificationKind::DriverArrived, None, now)?]
            }
            TripState::Done => self.on_done(uow.as_mut(), &trip, now).await?,
            TripState::UserCancelled
            | TripState::DriverCancelled
            | TripState::Failed
            | TripState::DriverNotAvailable => self.on_closed(uow.as_mut(), &trip, now).await?,
        };

        uow.append_events(&events).await?;
        uow.commit().await?;
        debug!("Processed {} for trip {} ({} events)", trip.state, trip.id, events.len());
        Ok(())
    }

    /// One escalation tick. `None` when an identical ticket is already out.
    async fn on_requested(
        &self,
        uow: &mut dyn UnitOfWork,
        trip: &mut TripRequest,
        now: DateTime<Utc>,
    ) -> CoreResult<Option<Vec<Event>>> {
        let on_duty = uow.count_on_duty_drivers().await?;

        let mut ticket = match uow.get_latest_ticket(trip.id).await? {
            None => Ticket::first(trip.id, trip.min_additional_price, now),
            Some(current) => {
                let (next, valid) = current.step(&self.policy.escalation, trip.max_additional_price, now);
                if !valid {
                    let outcome = if on_duty == 0 { TripState::DriverNotAvailable } else { TripState::Failed };
                    info!(
                        "Trip {} exhausted escalation after {} attempts at +{}",
                        trip.id, current.attempt_count, current.additional_price
                    );
                    return self.close_search(uow, trip, outcome, now).await.map(Some);
                }
                next
            }
        };

        ticket.idle_attempts = if on_duty == 0 { ticket.idle_attempts + 1 } else { 0 };
        if ticket.idle_attempts as u32 >= self.policy.idle_attempt_limit {
            info!("No driver on duty for {} ticks, giving up on trip {}", ticket.idle_attempts, trip.id);
            return self.close_search(uow, trip, TripState::DriverNotAvailable, now).await.map(Some);
        }

        if uow.ticket_exists(&ticket).await? {
            debug!("Ticket attempt {} already issued for trip {}", ticket.attempt_count, trip.id);
            return Ok(None);
        }
        uow.upsert_ticket(&ticket).await?;

        trip.additional_price = ticket.additional_price;
        trip.updated_at = now;
        uow.update_trip_request(trip).await?;

        let radius_minutes = ticket.radius_minutes(&self.policy.escalation);
        let mut drivers = self
            .matcher
            .drivers_within_radius(
                uow,
                trip.departure.point,
                ticket.radius(&self.policy.escalation),
                ticket.id,
                now,
            )
            .await?;
        self.matcher.offer(uow, &mut drivers, ticket.id, now).await?;

        info!(
            "Trip {} attempt {}: +{} within {} min, offered to {} drivers",
            trip.id,
            ticket.attempt_count,
            ticket.additional_price,
            radius_minutes,
            drivers.len()
        );

        let mut events = Vec::with_capacity(drivers.len() + 2);
        for driver in &drivers {
            events.push(driver_notification(
                trip,
                &driver.driver_id,
                DriverNotificationKind::NewTicket,
                Some(ticket.id),
                now,
            )?);
        }
        events.push(user_notification(trip, UserNotificationKind::Searching, Some(radius_minutes), now)?);
        events.push(process_event(trip, now, now + self.policy.escalation_interval, now)?);
        Ok(Some(events))
    }

    /// Leaves REQUESTED for a terminal state; its own event finishes the job
    async fn close_search(
        &self,
        uow: &mut dyn UnitOfWork,
        trip: &mut TripRequest,
        outcome: TripState,
        now: DateTime<Utc>,
    ) -> CoreResult<Vec<Event>> {
        trip.transition(outcome, now)?;
        uow.update_trip_request(trip).await?;
        Ok(vec![process_event(trip, now, now, now)?])
    }

    async fn on_done(&self, uow: &mut dyn UnitOfWork, trip: &TripRequest, now: DateTime<Utc>) -> CoreResult<Vec<Event>> {
        uow.delete_ticket(trip.id).await?;
        self.release_driver(uow, trip, now).await?;

        let mut events = Vec::with_capacity(2);
        if uow.get_settlement_by_trip(trip.id).await?.is_none() {
            let record = SettlementRecord::for_trip(trip, now)?;
            uow.create_settlement(&record).await?;
            events.push(Event::settlement_request(&record.to_request(), now)?);
            info!("Settlement {} of {} requested for trip {}", record.id, record.amount, trip.id);
        }
        events.push(user_notification(trip, UserNotificationKind::TripCompleted, None, now)?);
        Ok(events)
    }

    /// Cancelled, failed and unavailable requests
    async fn on_closed(&self, uow: &mut dyn UnitOfWork, trip: &TripRequest, now: DateTime<Utc>) -> CoreResult<Vec<Event>> {
        uow.delete_ticket(trip.id).await?;
        self.release_driver(uow, trip, now).await?;

        let event = match (trip.state, trip.driver_id.as_deref()) {
            (TripState::UserCancelled, Some(driver_id)) => Some(driver_notification(
                trip,
                driver_id,
                DriverNotificationKind::UserCancelled,
                None,
                now,
            )?),
            (TripState::UserCancelled, None) => None,
            (TripState::DriverCancelled, _) => {
                Some(user_notification(trip, UserNotificationKind::DriverCancelled, None, now)?)
            }
            (TripState::DriverNotAvailable, _) => {
                Some(user_notification(trip, UserNotificationKind::NoDriverAvailable, None, now)?)
            }
            _ => Some(user_notification(trip, UserNotificationKind::Failed, None, now)?),
        };
        Ok(event.into_iter().collect())
    }

    async fn release_driver(&self, uow: &mut dyn UnitOfWork, trip: &TripRequest, now: DateTime<Utc>) -> CoreResult<()> {
        let Some(driver_id) = trip.driver_id.as_deref() else {
            return Ok(());
        };
        match uow.get_driver_context_for_update(driver_id).await? {
            Some(mut context) => {
                context.release(now);
                uow.upsert_driver_context(&context).await
            }
            None => {
                warn!("Trip {} references unknown driver {}", trip.id, driver_id);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl EventHandler for ProcessHandler {
    fn name(&self) -> &'static str {
        "taxi-call-process"
    }

    fn accept(&self, event: &Event) -> bool {
        event.topic == topics::TAXI_CALL_PROCESS
    }

    async fn process(&self, event: &Event, cancel: &CancellationToken) -> CoreResult<()> {
        let payload: ProcessEvent = event.decode()?;

        let wait = (payload.desired_process_time - Utc::now()).to_std().unwrap_or_default();
        if !wait.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }

        self.handle(&payload, Utc::now()).await
    }
}
