mod common;

use common::{Harness, PICKUP};
use hailing_core::{DispatchError, Point, TripState};
use hailing_shared::models::events::{DriverNotificationKind, UserNotificationKind};
use hailing_shared::topics;

fn near_pickup() -> Point {
    Point::new(PICKUP.latitude + 0.001, PICKUP.longitude)
}

fn far_away() -> Point {
    Point::new(PICKUP.latitude + 0.3, PICKUP.longitude + 0.3)
}

#[tokio::test]
async fn test_search_fails_when_nobody_in_range() {
    let mut h = Harness::new();
    h.app.activate_duty("driver-far", far_away(), h.at(0)).await.unwrap();
    let trip = h.app.create_trip_request(h.request("rider-1", 5000), h.at(0)).await.unwrap();

    h.run_until_idle(30).await;

    let trip = h.app.get_trip_request("rider-1", trip.id).await.unwrap();
    assert_eq!(trip.state, TripState::Failed);
    assert!(trip.additional_price <= 5000);
    assert!(h.ticket(trip.id).await.is_none());
    assert!(h.driver_notifications().is_empty());

    let notifications = h.user_notifications();
    let searching: Vec<_> = notifications
        .iter()
        .filter(|n| n.kind == UserNotificationKind::Searching)
        .collect();
    // six price tiers of three radii each
    assert_eq!(searching.len(), 18);
    assert!(searching.windows(2).all(|w| w[0].additional_price <= w[1].additional_price));
    assert!(searching.iter().all(|n| n.additional_price <= 5000));
    let radii: Vec<i32> = searching.iter().take(4).filter_map(|n| n.search_radius_minutes).collect();
    assert_eq!(radii, vec![2, 5, 10, 2]);
    assert_eq!(notifications.last().unwrap().kind, UserNotificationKind::Failed);
}

#[tokio::test]
async fn test_driver_accepts_and_completes_trip() {
    let mut h = Harness::new();
    h.app.activate_duty("driver-1", near_pickup(), h.at(0)).await.unwrap();
    let trip = h.app.create_trip_request(h.request("rider-1", 3000), h.at(0)).await.unwrap();

    h.tick().await;
    let offers = h.driver_notifications();
    assert_eq!(offers.len(), 1);
    assert_eq!(offers[0].driver_id, "driver-1");
    assert_eq!(offers[0].kind, DriverNotificationKind::NewTicket);
    let ticket_id = offers[0].ticket_id.unwrap();

    let accepted = h.app.accept_ticket("driver-1", ticket_id, h.at(1)).await.unwrap();
    assert_eq!(accepted.state, TripState::DriverToDeparture);
    assert_eq!(accepted.driver_id.as_deref(), Some("driver-1"));
    assert!(!h.app.get_driver_context("driver-1").await.unwrap().can_receive);

    h.tick().await;
    assert!(h.ticket(trip.id).await.is_none());
    let assigned = h.user_notifications().into_iter().last().unwrap();
    assert_eq!(assigned.kind, UserNotificationKind::DriverAssigned);
    assert_eq!(assigned.driver_id.as_deref(), Some("driver-1"));

    // the escalation tick scheduled before the accept was dropped
    assert_eq!(
        h.app.get_trip_request("driver-1", trip.id).await.unwrap().state,
        TripState::DriverToDeparture
    );

    h.app.mark_arrived("driver-1", trip.id, h.at(60)).await.unwrap();
    h.tick().await;
    assert_eq!(h.user_notifications().last().unwrap().kind, UserNotificationKind::DriverArrived);

    h.app.mark_done("driver-1", trip.id, h.at(900)).await.unwrap();
    h.run_until_idle(5).await;

    let done = h.app.get_trip_request("rider-1", trip.id).await.unwrap();
    assert_eq!(done.state, TripState::Done);
    assert!(h.ticket(trip.id).await.is_none());
    assert!(h.app.get_driver_context("driver-1").await.unwrap().can_receive);

    let settlement = h.settlement(trip.id).await.unwrap();
    assert_eq!(settlement.driver_id, "driver-1");
    assert_eq!(settlement.amount, 12000);
    assert!(h.delivered.iter().any(|e| e.topic == topics::SETTLEMENT_REQUEST));
    assert_eq!(h.user_notifications().last().unwrap().kind, UserNotificationKind::TripCompleted);
}

#[tokio::test]
async fn test_rider_cancels_while_searching() {
    let mut h = Harness::new();
    h.app.activate_duty("driver-1", near_pickup(), h.at(0)).await.unwrap();
    let trip = h.app.create_trip_request(h.request("rider-1", 3000), h.at(0)).await.unwrap();
    h.tick().await;
    let offers_before = h.driver_notifications().len();

    let cancelled = h.app.cancel_trip_request("rider-1", trip.id, h.at(2)).await.unwrap();
    assert_eq!(cancelled.state, TripState::UserCancelled);
    h.run_until_idle(5).await;

    assert!(h.ticket(trip.id).await.is_none());
    assert_eq!(h.driver_notifications().len(), offers_before);
    assert!(h
        .driver_notifications()
        .iter()
        .all(|n| n.kind != DriverNotificationKind::UserCancelled));
    assert_eq!(
        h.app.get_trip_request("rider-1", trip.id).await.unwrap().state,
        TripState::UserCancelled
    );

    // the old offer is dead
    let ticket_id = h.driver_notifications()[0].ticket_id.unwrap();
    assert!(matches!(
        h.app.accept_ticket("driver-1", ticket_id, h.at(3)).await,
        Err(DispatchError::AlreadyExpired(_))
    ));
}

#[tokio::test]
async fn test_rider_cancel_after_assignment_notifies_driver() {
    let mut h = Harness::new();
    h.app.activate_duty("driver-1", near_pickup(), h.at(0)).await.unwrap();
    let trip = h.app.create_trip_request(h.request("rider-1", 3000), h.at(0)).await.unwrap();
    h.tick().await;
    let ticket_id = h.driver_notifications()[0].ticket_id.unwrap();
    h.app.accept_ticket("driver-1", ticket_id, h.at(1)).await.unwrap();
    h.tick().await;

    h.app.cancel_trip_request("rider-1", trip.id, h.at(30)).await.unwrap();
    h.run_until_idle(5).await;

    let last = h.driver_notifications().into_iter().last().unwrap();
    assert_eq!(last.kind, DriverNotificationKind::UserCancelled);
    assert!(h.app.get_driver_context("driver-1").await.unwrap().can_receive);
}

#[tokio::test]
async fn test_driver_cancel_releases_driver() {
    let mut h = Harness::new();
    h.app.activate_duty("driver-1", near_pickup(), h.at(0)).await.unwrap();
    let trip = h.app.create_trip_request(h.request("rider-1", 3000), h.at(0)).await.unwrap();
    h.tick().await;
    let ticket_id = h.driver_notifications()[0].ticket_id.unwrap();
    h.app.accept_ticket("driver-1", ticket_id, h.at(1)).await.unwrap();
    h.tick().await;

    assert!(matches!(
        h.app.mark_arrived("driver-2", trip.id, h.at(10)).await,
        Err(DispatchError::Unauthorized(_))
    ));
    // arrival comes before completion
    assert!(matches!(
        h.app.mark_done("driver-1", trip.id, h.at(10)).await,
        Err(DispatchError::InvalidOperation(_))
    ));

    h.app.cancel_by_driver("driver-1", trip.id, h.at(20)).await.unwrap();
    h.run_until_idle(5).await;

    assert_eq!(
        h.app.get_trip_request("rider-1", trip.id).await.unwrap().state,
        TripState::DriverCancelled
    );
    assert!(h.app.get_driver_context("driver-1").await.unwrap().can_receive);
    assert_eq!(h.user_notifications().last().unwrap().kind, UserNotificationKind::DriverCancelled);
}

#[tokio::test]
async fn test_no_driver_on_duty_ends_in_driver_not_available() {
    let mut h = Harness::new();
    let trip = h.app.create_trip_request(h.request("rider-1", 5000), h.at(0)).await.unwrap();

    h.run_until_idle(10).await;

    let trip = h.app.get_trip_request("rider-1", trip.id).await.unwrap();
    assert_eq!(trip.state, TripState::DriverNotAvailable);
    assert!(h.ticket(trip.id).await.is_none());
    let notifications = h.user_notifications();
    assert_eq!(
        notifications.iter().filter(|n| n.kind == UserNotificationKind::Searching).count(),
        2
    );
    assert_eq!(notifications.last().unwrap().kind, UserNotificationKind::NoDriverAvailable);
}

#[tokio::test]
async fn test_dry_run_persists_nothing() {
    let h = Harness::new();
    let request = hailing_dispatch::CreateTripRequest { dry_run: true, ..h.request("rider-1", 3000) };

    let estimate = h.app.create_trip_request(request, h.at(0)).await.unwrap();
    assert_eq!(estimate.base_price, 12000);
    assert_eq!(estimate.route.distance_meters, 9000);

    assert!(matches!(
        h.app.get_trip_request("rider-1", estimate.id).await,
        Err(DispatchError::NotFound(_))
    ));
    assert!(h.store.pending_events().await.is_empty());
}

#[tokio::test]
async fn test_one_active_request_per_rider() {
    let h = Harness::new();
    let first = h.app.create_trip_request(h.request("rider-1", 3000), h.at(0)).await.unwrap();

    assert!(matches!(
        h.app.create_trip_request(h.request("rider-1", 3000), h.at(1)).await,
        Err(DispatchError::AlreadyExists(_))
    ));
    assert!(matches!(
        h.app.cancel_trip_request("rider-2", first.id, h.at(1)).await,
        Err(DispatchError::Unauthorized(_))
    ));

    h.app.cancel_trip_request("rider-1", first.id, h.at(2)).await.unwrap();
    let second = h.app.create_trip_request(h.request("rider-1", 3000), h.at(3)).await.unwrap();
    assert_eq!(h.app.get_latest_trip_request_by_rider("rider-1").await.unwrap().id, second.id);
}
