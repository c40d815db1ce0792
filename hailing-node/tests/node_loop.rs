use async_trait::async_trait;
use chrono::Utc;
use hailing_core::services::{PushService, SettlementService};
use hailing_core::{CoreResult, Point, TripState};
use hailing_dispatch::CreateTripRequest;
use hailing_node::adapters::{CoordinateAddressService, StraightLineRouteService};
use hailing_node::{Backends, Node, Services};
use hailing_shared::models::events::{
    DriverNotification, DriverNotificationKind, SettlementRequest, UserNotification, UserNotificationKind,
};
use hailing_store::{Config, MemoryStore};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const FAST_CONFIG: &str = r#"
[outbox]
poll_interval_ms = 10
max_messages = 100
topic_prefixes = ["TaxiCall", "TaxiCallNotification", "Settlement"]

[subscriber]
workers = 4
max_delivery_attempts = 3
dead_letter = "store"

[dispatch]
escalation_interval_ms = 30000
attempts_per_tier = 3
price_increment = 1000
radius_minutes = [2, 5, 10]
meters_per_minute = 400.0
offer_timeout_ms = 30000
idle_attempt_limit = 3
"#;

#[derive(Default)]
struct RecordingPush {
    users: Mutex<Vec<UserNotification>>,
    drivers: Mutex<Vec<DriverNotification>>,
}

#[async_trait]
impl PushService for RecordingPush {
    async fn send_to_user(&self, notification: &UserNotification) -> CoreResult<()> {
        self.users.lock().unwrap().push(notification.clone());
        Ok(())
    }

    async fn send_to_driver(&self, notification: &DriverNotification) -> CoreResult<()> {
        self.drivers.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

#[derive(Default)]
struct RecordingSettlement {
    requests: Mutex<Vec<SettlementRequest>>,
}

#[async_trait]
impl SettlementService for RecordingSettlement {
    async fn request_settlement(&self, request: &SettlementRequest) -> CoreResult<()> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(())
    }
}

async fn wait_for<T>(mut probe: impl FnMut() -> Option<T>) -> T {
    for _ in 0..500 {
        if let Some(found) = probe() {
            return found;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}

#[tokio::test]
async fn test_trip_runs_through_publisher_and_subscriber() {
    let config = Config::from_toml(FAST_CONFIG).unwrap();
    let push = Arc::new(RecordingPush::default());
    let settlement = Arc::new(RecordingSettlement::default());
    let store = MemoryStore::new();

    let services = Services {
        routes: Arc::new(StraightLineRouteService::new(config.fare.clone())),
        addresses: Arc::new(CoordinateAddressService),
        push: push.clone(),
        settlement: settlement.clone(),
    };
    let node = Node::new(&config, Backends::in_memory(store.clone()), services).unwrap();
    let running = node.spawn(CancellationToken::new());
    let app = running.app.clone();

    let pickup = Point::new(37.4979, 127.0276);
    app.activate_duty("driver-1", Point::new(37.4985, 127.0280), Utc::now()).await.unwrap();

    let trip = app
        .create_trip_request(
            CreateTripRequest {
                rider_id: "rider-1".into(),
                departure: pickup,
                arrival: Point::new(37.5665, 126.9780),
                min_additional_price: 0,
                max_additional_price: 2000,
                dry_run: false,
            },
            Utc::now(),
        )
        .await
        .unwrap();
    assert_eq!(trip.state, TripState::Requested);

    let offer = wait_for(|| {
        push.drivers
            .lock()
            .unwrap()
            .iter()
            .find(|n| n.kind == DriverNotificationKind::NewTicket && n.driver_id == "driver-1")
            .cloned()
    })
    .await;
    assert_eq!(offer.trip_request_id, trip.id);
    assert_eq!(offer.base_price, trip.base_price);

    let ticket_id = offer.ticket_id.unwrap();
    let assigned = app.accept_ticket("driver-1", ticket_id, Utc::now()).await.unwrap();
    assert_eq!(assigned.state, TripState::DriverToDeparture);

    wait_for(|| {
        push.users
            .lock()
            .unwrap()
            .iter()
            .find(|n| n.kind == UserNotificationKind::DriverAssigned)
            .cloned()
    })
    .await;

    app.mark_arrived("driver-1", trip.id, Utc::now()).await.unwrap();
    let done = app.mark_done("driver-1", trip.id, Utc::now()).await.unwrap();
    assert_eq!(done.state, TripState::Done);

    let request = wait_for(|| settlement.requests.lock().unwrap().first().cloned()).await;
    assert_eq!(request.trip_request_id, trip.id);
    assert_eq!(request.driver_id, "driver-1");
    assert_eq!(request.rider_id, "rider-1");
    assert_eq!(request.amount, done.total_price());

    wait_for(|| {
        push.users
            .lock()
            .unwrap()
            .iter()
            .find(|n| n.kind == UserNotificationKind::TripCompleted)
            .cloned()
    })
    .await;

    running.shutdown().await.unwrap();
    assert!(store.dead_letters().await.is_empty());

    let context = app.get_driver_context("driver-1").await.unwrap();
    assert!(context.can_receive);
}

#[tokio::test]
async fn test_shutdown_with_pending_escalation() {
    let config = Config::from_toml(FAST_CONFIG).unwrap();
    let store = MemoryStore::new();
    let node = Node::new(&config, Backends::in_memory(store.clone()), Services::builtin(&config.fare)).unwrap();
    let running = node.spawn(CancellationToken::new());

    // no driver on duty, so the request waits for its next tick
    running
        .app
        .create_trip_request(
            CreateTripRequest {
                rider_id: "rider-2".into(),
                departure: Point::new(37.4979, 127.0276),
                arrival: Point::new(37.5665, 126.9780),
                min_additional_price: 0,
                max_additional_price: 0,
                dry_run: false,
            },
            Utc::now(),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    tokio::time::timeout(Duration::from_secs(5), running.shutdown())
        .await
        .expect("shutdown should not wait for the next tick")
        .unwrap();
    assert!(store.dead_letters().await.is_empty());
}

#[cfg(not(feature = "kafka"))]
#[tokio::test]
async fn test_kafka_backend_requires_feature() {
    let mut config = Config::from_toml(FAST_CONFIG).unwrap();
    config.bus.backend = hailing_store::app_config::BusBackend::Kafka;
    assert!(Backends::connect(&config).await.is_err());
}
