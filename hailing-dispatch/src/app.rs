use chrono::{DateTime, Utc};
use hailing_core::repository::{
    DispatchStore, DriverContextRepository, EventStore, TicketRepository, TripRequestRepository, UnitOfWork,
};
use hailing_core::services::{AddressService, RouteService};
use hailing_core::{CoreResult, DispatchError, DriverDispatchContext, Location, Point, TripRequest, TripState};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::process::process_event;
use crate::store_time;

#[derive(Debug, Clone)]
pub struct CreateTripRequest {
    pub rider_id: String,
    pub departure: Point,
    pub arrival: Point,
    pub min_additional_price: i64,
    pub max_additional_price: i64,
    /// Price the trip without persisting anything
    pub dry_run: bool,
}

/// Rider- and driver-facing operations on trip requests
pub struct DispatchApp {
    store: Arc<dyn DispatchStore>,
    routes: Arc<dyn RouteService>,
    addresses: Arc<dyn AddressService>,
}

impl DispatchApp {
    pub fn new(
        store: Arc<dyn DispatchStore>,
        routes: Arc<dyn RouteService>,
        addresses: Arc<dyn AddressService>,
    ) -> Self {
        Self { store, routes, addresses }
    }

    /// Prices the route and, unless dry run, stores the request and starts
    /// the search.
    pub async fn create_trip_request(&self, request: CreateTripRequest, now: DateTime<Utc>) -> CoreResult<TripRequest> {
        let now = store_time(now);
        if !request.departure.is_valid() || !request.arrival.is_valid() {
            return Err(DispatchError::InvalidOperation("invalid coordinates".into()));
        }

        let route = self.routes.get_route(request.departure, request.arrival).await?;
        let departure = Location {
            point: request.departure,
            address: self.addresses.get_address(request.departure).await?,
        };
        let arrival = Location {
            point: request.arrival,
            address: self.addresses.get_address(request.arrival).await?,
        };

        let trip = TripRequest::new(
            request.rider_id,
            departure,
            arrival,
            &route,
            request.min_additional_price,
            request.max_additional_price,
            now,
        )?;
        if request.dry_run {
            return Ok(trip);
        }

        let mut uow = self.store.begin().await?;
        if let Some(latest) = uow.get_latest_trip_request_by_rider(&trip.rider_id).await? {
            if latest.state.is_active() {
                return Err(DispatchError::AlreadyExists(format!(
                    "rider {} already has active trip request {}",
                    trip.rider_id, latest.id
                )));
            }
        }
        uow.create_trip_request(&trip).await?;
        uow.append_events(&[process_event(&trip, now, now, now)?]).await?;
        uow.commit().await?;

        info!(
            "Trip request {} created for rider {}: base {} +{}..{}",
            trip.id, trip.rider_id, trip.base_price, trip.min_additional_price, trip.max_additional_price
        );
        Ok(trip)
    }

    /// Rider cancels before pickup
    pub async fn cancel_trip_request(&self, rider_id: &str, trip_id: Uuid, now: DateTime<Utc>) -> CoreResult<TripRequest> {
        let now = store_time(now);
        let mut uow = self.store.begin().await?;
        let mut trip = Self::load_for_update(uow.as_mut(), trip_id).await?;
        if trip.rider_id != rider_id {
            return Err(DispatchError::Unauthorized(format!("trip request {} belongs to another rider", trip_id)));
        }

        Self::advance(uow, &mut trip, TripState::UserCancelled, now).await?;
        info!("Trip request {} cancelled by rider {}", trip_id, rider_id);
        Ok(trip)
    }

    /// Visible to its rider and its assigned driver only
    pub async fn get_trip_request(&self, actor_id: &str, trip_id: Uuid) -> CoreResult<TripRequest> {
        let mut uow = self.store.begin().await?;
        let trip = uow
            .get_trip_request(trip_id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("trip request {}", trip_id)))?;
        if trip.rider_id != actor_id && !trip.is_driver(actor_id) {
            return Err(DispatchError::Unauthorized(format!("trip request {}", trip_id)));
        }
        Ok(trip)
    }

    pub async fn get_latest_trip_request_by_rider(&self, rider_id: &str) -> CoreResult<TripRequest> {
        let mut uow = self.store.begin().await?;
        uow.get_latest_trip_request_by_rider(rider_id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("trip request of rider {}", rider_id)))
    }

    pub async fn get_latest_trip_request_by_driver(&self, driver_id: &str) -> CoreResult<TripRequest> {
        let mut uow = self.store.begin().await?;
        uow.get_latest_trip_request_by_driver(driver_id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("trip request of driver {}", driver_id)))
    }

    /// Binds the driver to the request of `ticket_id`.
    ///
    /// `InvalidOperation` if the ticket is not the driver's latest offer,
    /// `AlreadyExpired` if the request moved on or the ticket was superseded.
    pub async fn accept_ticket(&self, driver_id: &str, ticket_id: Uuid, now: DateTime<Utc>) -> CoreResult<TripRequest> {
        let now = store_time(now);
        let mut uow = self.store.begin().await?;

        let Some(ticket) = uow.get_ticket(ticket_id).await? else {
            Self::leased_context(uow.as_mut(), driver_id, ticket_id).await?;
            return Err(DispatchError::AlreadyExpired(format!("ticket {}", ticket_id)));
        };
        // trip row before driver row, as in the process handler
        let mut trip = Self::load_for_update(uow.as_mut(), ticket.trip_request_id).await?;
        let mut context = Self::leased_context(uow.as_mut(), driver_id, ticket_id).await?;
        if trip.state != TripState::Requested {
            return Err(DispatchError::AlreadyExpired(format!("trip request {} is {}", trip.id, trip.state)));
        }
        let latest = uow.get_latest_ticket(trip.id).await?;
        if latest.map(|t| t.id) != Some(ticket_id) {
            return Err(DispatchError::AlreadyExpired(format!("ticket {} was superseded", ticket_id)));
        }

        trip.assign_driver(driver_id, ticket.additional_price, now)?;
        context.can_receive = false;
        context.updated_at = now;
        uow.upsert_driver_context(&context).await?;
        uow.update_trip_request(&trip).await?;
        uow.append_events(&[process_event(&trip, now, now, now)?]).await?;
        uow.commit().await?;

        info!(
            "Driver {} accepted ticket {} for trip {} at +{}",
            driver_id, ticket_id, trip.id, trip.additional_price
        );
        Ok(trip)
    }

    pub async fn reject_ticket(&self, driver_id: &str, ticket_id: Uuid, now: DateTime<Utc>) -> CoreResult<()> {
        let now = store_time(now);
        let mut uow = self.store.begin().await?;

        let mut context = Self::leased_context(uow.as_mut(), driver_id, ticket_id).await?;
        context.rejected_last_ticket = true;
        context.updated_at = now;
        uow.upsert_driver_context(&context).await?;
        uow.commit().await?;

        info!("Driver {} rejected ticket {}", driver_id, ticket_id);
        Ok(())
    }

    /// Driver reached the pickup point
    pub async fn mark_arrived(&self, driver_id: &str, trip_id: Uuid, now: DateTime<Utc>) -> CoreResult<TripRequest> {
        self.driver_transition(driver_id, trip_id, TripState::DriverToArrival, now).await
    }

    /// Driver reached the destination
    pub async fn mark_done(&self, driver_id: &str, trip_id: Uuid, now: DateTime<Utc>) -> CoreResult<TripRequest> {
        self.driver_transition(driver_id, trip_id, TripState::Done, now).await
    }

    /// Driver gives up before pickup
    pub async fn cancel_by_driver(&self, driver_id: &str, trip_id: Uuid, now: DateTime<Utc>) -> CoreResult<TripRequest> {
        self.driver_transition(driver_id, trip_id, TripState::DriverCancelled, now).await
    }

    pub async fn activate_duty(&self, driver_id: &str, location: Point, now: DateTime<Utc>) -> CoreResult<DriverDispatchContext> {
        let now = store_time(now);
        if !location.is_valid() {
            return Err(DispatchError::InvalidOperation("invalid coordinates".into()));
        }
        let mut uow = self.store.begin().await?;

        let context = match uow.get_driver_context_for_update(driver_id).await? {
            Some(mut context) => {
                context.on_duty = true;
                context.location = location;
                context.updated_at = now;
                context
            }
            None => DriverDispatchContext::new(driver_id, location, now),
        };
        uow.upsert_driver_context(&context).await?;
        uow.commit().await?;

        info!("Driver {} on duty", driver_id);
        Ok(context)
    }

    pub async fn deactivate_duty(&self, driver_id: &str, now: DateTime<Utc>) -> CoreResult<DriverDispatchContext> {
        let now = store_time(now);
        let mut uow = self.store.begin().await?;

        let mut context = Self::load_context(uow.as_mut(), driver_id).await?;
        context.on_duty = false;
        context.updated_at = now;
        uow.upsert_driver_context(&context).await?;
        uow.commit().await?;

        info!("Driver {} off duty", driver_id);
        Ok(context)
    }

    pub async fn update_location(&self, driver_id: &str, location: Point, now: DateTime<Utc>) -> CoreResult<DriverDispatchContext> {
        let now = store_time(now);
        if !location.is_valid() {
            return Err(DispatchError::InvalidOperation("invalid coordinates".into()));
        }
        let mut uow = self.store.begin().await?;

        let mut context = Self::load_context(uow.as_mut(), driver_id).await?;
        context.location = location;
        context.updated_at = now;
        uow.upsert_driver_context(&context).await?;
        uow.commit().await?;
        Ok(context)
    }

    pub async fn get_driver_context(&self, driver_id: &str) -> CoreResult<DriverDispatchContext> {
        let mut uow = self.store.begin().await?;
        uow.get_driver_context(driver_id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("driver {}", driver_id)))
    }

    /// Re-emits a process event for every active request so work lost with
    /// a crashed node continues. Returns how many were resumed.
    pub async fn resume_active_requests(&self, now: DateTime<Utc>) -> CoreResult<usize> {
        let now = store_time(now);
        let mut uow = self.store.begin().await?;

        let ids = uow.list_active_trip_request_ids().await?;
        let mut events = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(trip) = uow.get_trip_request(id).await? {
                // carries the persisted time so it is not dropped as stale
                events.push(process_event(&trip, trip.updated_at, now, now)?);
            }
        }
        uow.append_events(&events).await?;
        uow.commit().await?;

        info!("Resumed {} active trip requests", events.len());
        Ok(events.len())
    }

    async fn driver_transition(
        &self,
        driver_id: &str,
        trip_id: Uuid,
        next: TripState,
        now: DateTime<Utc>,
    ) -> CoreResult<TripRequest> {
        let now = store_time(now);
        let mut uow = self.store.begin().await?;
        let mut trip = Self::load_for_update(uow.as_mut(), trip_id).await?;
        if !trip.is_driver(driver_id) {
            return Err(DispatchError::Unauthorized(format!("trip request {} is not assigned to {}", trip_id, driver_id)));
        }

        Self::advance(uow, &mut trip, next, now).await?;
        info!("Trip request {} moved to {} by driver {}", trip_id, next, driver_id);
        Ok(trip)
    }

    /// Applies the transition and schedules the state's handler, then commits
    async fn advance(
        mut uow: Box<dyn UnitOfWork>,
        trip: &mut TripRequest,
        next: TripState,
        now: DateTime<Utc>,
    ) -> CoreResult<()> {
        trip.transition(next, now)?;
        uow.update_trip_request(trip).await?;
        uow.append_events(&[process_event(trip, now, now, now)?]).await?;
        uow.commit().await
    }

    async fn load_for_update(uow: &mut dyn UnitOfWork, trip_id: Uuid) -> CoreResult<TripRequest> {
        uow.get_trip_request_for_update(trip_id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("trip request {}", trip_id)))
    }

    async fn load_context(uow: &mut dyn UnitOfWork, driver_id: &str) -> CoreResult<DriverDispatchContext> {
        uow.get_driver_context_for_update(driver_id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("driver {}", driver_id)))
    }

    /// Driver context locked for update, provided `ticket_id` is its latest offer
    async fn leased_context(
        uow: &mut dyn UnitOfWork,
        driver_id: &str,
        ticket_id: Uuid,
    ) -> CoreResult<DriverDispatchContext> {
        let context = Self::load_context(uow, driver_id).await?;
        if !context.holds_ticket(ticket_id) {
            return Err(DispatchError::InvalidOperation(format!(
                "ticket {} is not an open offer of driver {}",
                ticket_id, driver_id
            )));
        }
        Ok(context)
    }
}
