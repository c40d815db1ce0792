#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, SubsecRound, Utc};
use hailing_core::repository::{DispatchStore, OutboxStore, SettlementRepository, TicketRepository};
use hailing_core::services::{AddressService, Route, RouteService};
use hailing_core::{CoreResult, Event, Point, SettlementRecord, Ticket};
use hailing_dispatch::{CreateTripRequest, DispatchApp, DispatchPolicy, ProcessHandler};
use hailing_shared::models::events::{DriverNotification, ProcessEvent, UserNotification};
use hailing_shared::topics;
use hailing_store::MemoryStore;
use std::sync::Arc;
use uuid::Uuid;

pub const PICKUP: Point = Point { latitude: 37.4979, longitude: 127.0276 };
pub const DROP_OFF: Point = Point { latitude: 37.5665, longitude: 126.9780 };

pub struct FixedRoute;

#[async_trait]
impl RouteService for FixedRoute {
    async fn get_route(&self, _from: Point, _to: Point) -> CoreResult<Route> {
        Ok(Route { price: 12000, distance_meters: 9000, eta_seconds: 1500 })
    }
}

pub struct CoordinateAddress;

#[async_trait]
impl AddressService for CoordinateAddress {
    async fn get_address(&self, point: Point) -> CoreResult<String> {
        Ok(format!("{:.4},{:.4}", point.latitude, point.longitude))
    }
}

/// Stands in for the outbox publisher, the bus and the subscription
/// dispatcher: process events run at their desired time, everything else
/// is collected as delivered.
pub struct Harness {
    pub store: MemoryStore,
    pub app: DispatchApp,
    pub handler: ProcessHandler,
    pub delivered: Vec<Event>,
    pub handled: Vec<ProcessEvent>,
    pub start: DateTime<Utc>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_policy(DispatchPolicy::default())
    }

    pub fn with_policy(policy: DispatchPolicy) -> Self {
        let store = MemoryStore::new();
        let shared: Arc<dyn DispatchStore> = Arc::new(store.clone());
        Self {
            app: DispatchApp::new(shared.clone(), Arc::new(FixedRoute), Arc::new(CoordinateAddress)),
            handler: ProcessHandler::new(shared, policy),
            store,
            delivered: Vec::new(),
            handled: Vec::new(),
            start: Utc::now().trunc_subsecs(6),
        }
    }

    /// Another app over the same store, for calls from spawned tasks
    pub fn shared_app(&self) -> Arc<DispatchApp> {
        Arc::new(DispatchApp::new(
            Arc::new(self.store.clone()),
            Arc::new(FixedRoute),
            Arc::new(CoordinateAddress),
        ))
    }

    pub fn at(&self, seconds: i64) -> DateTime<Utc> {
        self.start + Duration::seconds(seconds)
    }

    pub fn request(&self, rider_id: &str, max_additional_price: i64) -> CreateTripRequest {
        CreateTripRequest {
            rider_id: rider_id.to_string(),
            departure: PICKUP,
            arrival: DROP_OFF,
            min_additional_price: 0,
            max_additional_price,
            dry_run: false,
        }
    }

    /// Runs every pending process event once at its desired time, then
    /// delivers the notifications it produced. Returns how many process
    /// events were handled.
    pub async fn tick(&mut self) -> usize {
        let events = self.claim().await;
        self.store.commit_events(&events).await.unwrap();

        let mut processed = 0;
        for event in events {
            if event.topic == topics::TAXI_CALL_PROCESS {
                let payload: ProcessEvent = event.decode().unwrap();
                self.handler.handle(&payload, payload.desired_process_time).await.unwrap();
                self.handled.push(payload);
                processed += 1;
            } else {
                self.delivered.push(event);
            }
        }

        // follow-up process events wait for the next tick
        let produced: Vec<Event> = self
            .claim()
            .await
            .into_iter()
            .filter(|e| e.topic != topics::TAXI_CALL_PROCESS)
            .collect();
        self.store.commit_events(&produced).await.unwrap();
        self.delivered.extend(produced);
        processed
    }

    async fn claim(&self) -> Vec<Event> {
        let prefixes: Vec<String> = topics::DEFAULT_PREFIXES.iter().map(|p| p.to_string()).collect();
        self.store.claim_events(&prefixes, usize::MAX).await.unwrap()
    }

    pub async fn run_until_idle(&mut self, max_ticks: usize) {
        for _ in 0..max_ticks {
            if self.tick().await == 0 {
                return;
            }
        }
        panic!("dispatch loop still busy after {} ticks", max_ticks);
    }

    pub fn user_notifications(&self) -> Vec<UserNotification> {
        self.delivered
            .iter()
            .filter(|e| e.topic == topics::USER_NOTIFICATION)
            .map(|e| e.decode().unwrap())
            .collect()
    }

    pub fn driver_notifications(&self) -> Vec<DriverNotification> {
        self.delivered
            .iter()
            .filter(|e| e.topic == topics::DRIVER_NOTIFICATION)
            .map(|e| e.decode().unwrap())
            .collect()
    }

    pub async fn ticket(&self, trip_id: Uuid) -> Option<Ticket> {
        let mut uow = self.store.begin().await.unwrap();
        uow.get_latest_ticket(trip_id).await.unwrap()
    }

    pub async fn settlement(&self, trip_id: Uuid) -> Option<SettlementRecord> {
        let mut uow = self.store.begin().await.unwrap();
        uow.get_settlement_by_trip(trip_id).await.unwrap()
    }
}
