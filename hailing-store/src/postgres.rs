use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hailing_core::repository::{
    DeadLetterSink, DispatchStore, DriverContextRepository, EventStore, OutboxStore, SettlementRepository,
    TicketRepository, TripRequestRepository, UnitOfWork,
};
use hailing_core::{
    CoreResult, DispatchError, DriverDispatchContext, Event, Location, Point, RouteSummary, SettlementRecord,
    Ticket, TripRequest, TripState,
};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;
use uuid::Uuid;

const METERS_PER_DEGREE: f64 = 111_320.0;

const TRIP_COLUMNS: &str = "id, rider_id, driver_id, departure_latitude, departure_longitude, departure_address, \
     arrival_latitude, arrival_longitude, arrival_address, distance_meters, eta_seconds, base_price, \
     min_additional_price, max_additional_price, additional_price, state, created_at, updated_at";

const TICKET_COLUMNS: &str =
    "id, trip_request_id, attempt_count, additional_price, idle_attempts, created_at, updated_at";

const DRIVER_COLUMNS: &str = "driver_id, latitude, longitude, on_duty, can_receive, last_received_ticket_id, \
     rejected_last_ticket, last_receive_time, updated_at";

#[derive(sqlx::FromRow)]
struct TripRequestRow {
    id: Uuid,
    rider_id: String,
    driver_id: Option<String>,
    departure_latitude: f64,
    departure_longitude: f64,
    departure_address: String,
    arrival_latitude: f64,
    arrival_longitude: f64,
    arrival_address: String,
    distance_meters: i64,
    eta_seconds: i64,
    base_price: i64,
    min_additional_price: i64,
    max_additional_price: i64,
    additional_price: i64,
    state: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TripRequestRow> for TripRequest {
    type Error = DispatchError;

    fn try_from(row: TripRequestRow) -> Result<Self, Self::Error> {
        let state: TripState = row
            .state
            .parse()
            .map_err(|e| DispatchError::Internal(format!("trip request {}: {}", row.id, e)))?;

        Ok(TripRequest {
            id: row.id,
            rider_id: row.rider_id,
            driver_id: row.driver_id,
            departure: Location {
                point: Point::new(row.departure_latitude, row.departure_longitude),
                address: row.departure_address,
            },
            arrival: Location {
                point: Point::new(row.arrival_latitude, row.arrival_longitude),
                address: row.arrival_address,
            },
            route: RouteSummary {
                distance_meters: row.distance_meters,
                eta_seconds: row.eta_seconds,
            },
            base_price: row.base_price,
            min_additional_price: row.min_additional_price,
            max_additional_price: row.max_additional_price,
            additional_price: row.additional_price,
            state,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TicketRow {
    id: Uuid,
    trip_request_id: Uuid,
    attempt_count: i32,
    additional_price: i64,
    idle_attempts: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<TicketRow> for Ticket {
    fn from(row: TicketRow) -> Self {
        Ticket {
            id: row.id,
            trip_request_id: row.trip_request_id,
            attempt_count: row.attempt_count,
            additional_price: row.additional_price,
            idle_attempts: row.idle_attempts,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct DriverContextRow {
    driver_id: String,
    latitude: f64,
    longitude: f64,
    on_duty: bool,
    can_receive: bool,
    last_received_ticket_id: Option<Uuid>,
    rejected_last_ticket: bool,
    last_receive_time: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl From<DriverContextRow> for DriverDispatchContext {
    fn from(row: DriverContextRow) -> Self {
        DriverDispatchContext {
            driver_id: row.driver_id,
            location: Point::new(row.latitude, row.longitude),
            on_duty: row.on_duty,
            can_receive: row.can_receive,
            last_received_ticket_id: row.last_received_ticket_id,
            rejected_last_ticket: row.rejected_last_ticket,
            last_receive_time: row.last_receive_time,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: Uuid,
    topic: String,
    payload: serde_json::Value,
    delay_seconds: i64,
    created_at: DateTime<Utc>,
}

impl From<EventRow> for Event {
    fn from(row: EventRow) -> Self {
        Event {
            id: row.id,
            topic: row.topic,
            payload: row.payload,
            delay_seconds: row.delay_seconds,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct SettlementRow {
    id: Uuid,
    trip_request_id: Uuid,
    rider_id: String,
    driver_id: String,
    amount: i64,
    status: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<SettlementRow> for SettlementRecord {
    type Error = DispatchError;

    fn try_from(row: SettlementRow) -> Result<Self, Self::Error> {
        Ok(SettlementRecord {
            id: row.id,
            trip_request_id: row.trip_request_id,
            rider_id: row.rider_id,
            driver_id: row.driver_id,
            amount: row.amount,
            status: row.status.parse()?,
            created_at: row.created_at,
        })
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false)
}

/// Postgres-backed store; each unit of work is one transaction
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

pub struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

impl PgUnitOfWork {
    async fn fetch_trip(&mut self, sql: &str, bind: Uuid) -> CoreResult<Option<TripRequest>> {
        let row = sqlx::query_as::<_, TripRequestRow>(sql)
            .bind(bind)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(DispatchError::storage)?;
        row.map(TripRequest::try_from).transpose()
    }

    async fn fetch_trip_by_party(&mut self, column: &str, party_id: &str) -> CoreResult<Option<TripRequest>> {
        let sql = format!(
            "SELECT {} FROM trip_requests WHERE {} = $1 ORDER BY created_at DESC LIMIT 1",
            TRIP_COLUMNS, column
        );
        let row = sqlx::query_as::<_, TripRequestRow>(&sql)
            .bind(party_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(DispatchError::storage)?;
        row.map(TripRequest::try_from).transpose()
    }

    async fn fetch_driver(&mut self, driver_id: &str, for_update: bool) -> CoreResult<Option<DriverDispatchContext>> {
        let sql = format!(
            "SELECT {} FROM driver_dispatch_contexts WHERE driver_id = $1{}",
            DRIVER_COLUMNS,
            if for_update { " FOR UPDATE" } else { "" }
        );
        let row = sqlx::query_as::<_, DriverContextRow>(&sql)
            .bind(driver_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(DispatchError::storage)?;
        Ok(row.map(DriverDispatchContext::from))
    }
}

#[async_trait]
impl DispatchStore for PgStore {
    async fn begin(&self) -> CoreResult<Box<dyn UnitOfWork>> {
        let tx = self.pool.begin().await.map_err(DispatchError::storage)?;
        Ok(Box::new(PgUnitOfWork { tx }))
    }
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn commit(self: Box<Self>) -> CoreResult<()> {
        self.tx.commit().await.map_err(DispatchError::storage)
    }
}

#[async_trait]
impl TripRequestRepository for PgUnitOfWork {
    async fn get_trip_request(&mut self, id: Uuid) -> CoreResult<Option<TripRequest>> {
        let sql = format!("SELECT {} FROM trip_requests WHERE id = $1", TRIP_COLUMNS);
        self.fetch_trip(&sql, id).await
    }

    async fn get_trip_request_for_update(&mut self, id: Uuid) -> CoreResult<Option<TripRequest>> {
        let sql = format!("SELECT {} FROM trip_requests WHERE id = $1 FOR UPDATE", TRIP_COLUMNS);
        self.fetch_trip(&sql, id).await
    }

    async fn get_latest_trip_request_by_rider(&mut self, rider_id: &str) -> CoreResult<Option<TripRequest>> {
        self.fetch_trip_by_party("rider_id", rider_id).await
    }

    async fn get_latest_trip_request_by_driver(&mut self, driver_id: &str) -> CoreResult<Option<TripRequest>> {
        self.fetch_trip_by_party("driver_id", driver_id).await
    }

    async fn list_active_trip_request_ids(&mut self) -> CoreResult<Vec<Uuid>> {
        let active: Vec<String> = TripState::ALL
            .iter()
            .filter(|s| s.is_active())
            .map(|s| s.as_str().to_string())
            .collect();

        sqlx::query_scalar::<_, Uuid>("SELECT id FROM trip_requests WHERE state = ANY($1) ORDER BY created_at")
            .bind(active)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(DispatchError::storage)
    }

    async fn create_trip_request(&mut self, trip: &TripRequest) -> CoreResult<()> {
        let sql = format!(
            "INSERT INTO trip_requests ({}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)",
            TRIP_COLUMNS
        );
        sqlx::query(&sql)
            .bind(trip.id)
            .bind(&trip.rider_id)
            .bind(&trip.driver_id)
            .bind(trip.departure.point.latitude)
            .bind(trip.departure.point.longitude)
            .bind(&trip.departure.address)
            .bind(trip.arrival.point.latitude)
            .bind(trip.arrival.point.longitude)
            .bind(&trip.arrival.address)
            .bind(trip.route.distance_meters)
            .bind(trip.route.eta_seconds)
            .bind(trip.base_price)
            .bind(trip.min_additional_price)
            .bind(trip.max_additional_price)
            .bind(trip.additional_price)
            .bind(trip.state.as_str())
            .bind(trip.created_at)
            .bind(trip.updated_at)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    DispatchError::AlreadyExists(format!("trip request {}", trip.id))
                } else {
                    DispatchError::storage(e)
                }
            })?;
        Ok(())
    }

    async fn update_trip_request(&mut self, trip: &TripRequest) -> CoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE trip_requests
            SET driver_id = $2, additional_price = $3, state = $4, updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(trip.id)
        .bind(&trip.driver_id)
        .bind(trip.additional_price)
        .bind(trip.state.as_str())
        .bind(trip.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(DispatchError::storage)?;

        if result.rows_affected() == 0 {
            return Err(DispatchError::NotFound(format!("trip request {}", trip.id)));
        }
        Ok(())
    }
}

#[async_trait]
impl TicketRepository for PgUnitOfWork {
    async fn get_latest_ticket(&mut self, trip_request_id: Uuid) -> CoreResult<Option<Ticket>> {
        let sql = format!("SELECT {} FROM tickets WHERE trip_request_id = $1", TICKET_COLUMNS);
        let row = sqlx::query_as::<_, TicketRow>(&sql)
            .bind(trip_request_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(DispatchError::storage)?;
        Ok(row.map(Ticket::from))
    }

    async fn get_ticket(&mut self, ticket_id: Uuid) -> CoreResult<Option<Ticket>> {
        let sql = format!("SELECT {} FROM tickets WHERE id = $1", TICKET_COLUMNS);
        let row = sqlx::query_as::<_, TicketRow>(&sql)
            .bind(ticket_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(DispatchError::storage)?;
        Ok(row.map(Ticket::from))
    }

    async fn ticket_exists(&mut self, ticket: &Ticket) -> CoreResult<bool> {
        sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM tickets
                WHERE trip_request_id = $1 AND attempt_count = $2 AND additional_price = $3
            )
            "#,
        )
        .bind(ticket.trip_request_id)
        .bind(ticket.attempt_count)
        .bind(ticket.additional_price)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(DispatchError::storage)
    }

    async fn upsert_ticket(&mut self, ticket: &Ticket) -> CoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO tickets (id, trip_request_id, attempt_count, additional_price, idle_attempts, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (trip_request_id) DO UPDATE
            SET id = EXCLUDED.id,
                attempt_count = EXCLUDED.attempt_count,
                additional_price = EXCLUDED.additional_price,
                idle_attempts = EXCLUDED.idle_attempts,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(ticket.id)
        .bind(ticket.trip_request_id)
        .bind(ticket.attempt_count)
        .bind(ticket.additional_price)
        .bind(ticket.idle_attempts)
        .bind(ticket.created_at)
        .bind(ticket.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(DispatchError::storage)?;
        Ok(())
    }

    async fn delete_ticket(&mut self, trip_request_id: Uuid) -> CoreResult<()> {
        sqlx::query("DELETE FROM tickets WHERE trip_request_id = $1")
            .bind(trip_request_id)
            .execute(&mut *self.tx)
            .await
            .map_err(DispatchError::storage)?;
        Ok(())
    }
}

#[async_trait]
impl DriverContextRepository for PgUnitOfWork {
    async fn get_driver_context(&mut self, driver_id: &str) -> CoreResult<Option<DriverDispatchContext>> {
        self.fetch_driver(driver_id, false).await
    }

    async fn get_driver_context_for_update(&mut self, driver_id: &str) -> CoreResult<Option<DriverDispatchContext>> {
        self.fetch_driver(driver_id, true).await
    }

    async fn upsert_driver_context(&mut self, context: &DriverDispatchContext) -> CoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO driver_dispatch_contexts
                (driver_id, latitude, longitude, on_duty, can_receive, last_received_ticket_id,
                 rejected_last_ticket, last_receive_time, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (driver_id) DO UPDATE
            SET latitude = EXCLUDED.latitude,
                longitude = EXCLUDED.longitude,
                on_duty = EXCLUDED.on_duty,
                can_receive = EXCLUDED.can_receive,
                last_received_ticket_id = EXCLUDED.last_received_ticket_id,
                rejected_last_ticket = EXCLUDED.rejected_last_ticket,
                last_receive_time = EXCLUDED.last_receive_time,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&context.driver_id)
        .bind(context.location.latitude)
        .bind(context.location.longitude)
        .bind(context.on_duty)
        .bind(context.can_receive)
        .bind(context.last_received_ticket_id)
        .bind(context.rejected_last_ticket)
        .bind(context.last_receive_time)
        .bind(context.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(DispatchError::storage)?;
        Ok(())
    }

    async fn bulk_upsert_driver_contexts(&mut self, contexts: &[DriverDispatchContext]) -> CoreResult<()> {
        for context in contexts {
            self.upsert_driver_context(context).await?;
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
        // bounding box in SQL, exact distance below
        let lat_delta = radius_meters / METERS_PER_DEGREE;
        let lng_delta = radius_meters / (METERS_PER_DEGREE * center.latitude.to_radians().cos().max(0.01));

        // rows being accepted right now are skipped
        let sql = format!(
            r#"
            SELECT {} FROM driver_dispatch_contexts
            WHERE on_duty AND can_receive
              AND latitude BETWEEN $1 AND $2
              AND longitude BETWEEN $3 AND $4
              AND (last_received_ticket_id IS NULL OR last_received_ticket_id <> $5)
              AND (last_received_ticket_id IS NULL
                   OR rejected_last_ticket
                   OR last_receive_time IS NULL
                   OR last_receive_time <= $6)
            FOR UPDATE SKIP LOCKED
            "#,
            DRIVER_COLUMNS
        );
        let rows = sqlx::query_as::<_, DriverContextRow>(&sql)
            .bind(center.latitude - lat_delta)
            .bind(center.latitude + lat_delta)
            .bind(center.longitude - lng_delta)
            .bind(center.longitude + lng_delta)
            .bind(exclude_ticket_id)
            .bind(offer_expired_before)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(DispatchError::storage)?;

        let mut found: Vec<(f64, DriverDispatchContext)> = rows
            .into_iter()
            .map(DriverDispatchContext::from)
            .map(|d| (center.distance_meters(&d.location), d))
            .filter(|(distance, _)| *distance <= radius_meters)
            .collect();
        found.sort_by(|a, b| a.0.total_cmp(&b.0));
        debug!("{} drivers within {:.0}m of ({}, {})", found.len(), radius_meters, center.latitude, center.longitude);
        Ok(found.into_iter().map(|(_, d)| d).collect())
    }

    async fn count_on_duty_drivers(&mut self) -> CoreResult<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM driver_dispatch_contexts WHERE on_duty")
            .fetch_one(&mut *self.tx)
            .await
            .map_err(DispatchError::storage)
    }
}

#[async_trait]
impl EventStore for PgUnitOfWork {
    async fn append_events(&mut self, events: &[Event]) -> CoreResult<()> {
        for event in events {
            sqlx::query(
                "INSERT INTO events (id, topic, payload, delay_seconds, created_at) VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(event.id)
            .bind(&event.topic)
            .bind(&event.payload)
            .bind(event.delay_seconds)
            .bind(event.created_at)
            .execute(&mut *self.tx)
            .await
            .map_err(DispatchError::storage)?;
        }
        Ok(())
    }
}

#[async_trait]
impl SettlementRepository for PgUnitOfWork {
    async fn create_settlement(&mut self, record: &SettlementRecord) -> CoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO settlements (id, trip_request_id, rider_id, driver_id, amount, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(record.id)
        .bind(record.trip_request_id)
        .bind(&record.rider_id)
        .bind(&record.driver_id)
        .bind(record.amount)
        .bind(record.status.to_string())
        .bind(record.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                DispatchError::AlreadyExists(format!("settlement for trip request {}", record.trip_request_id))
            } else {
                DispatchError::storage(e)
            }
        })?;
        Ok(())
    }

    async fn get_settlement_by_trip(&mut self, trip_request_id: Uuid) -> CoreResult<Option<SettlementRecord>> {
        let row = sqlx::query_as::<_, SettlementRow>(
            "SELECT id, trip_request_id, rider_id, driver_id, amount, status, created_at \
             FROM settlements WHERE trip_request_id = $1",
        )
        .bind(trip_request_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(DispatchError::storage)?;
        row.map(SettlementRecord::try_from).transpose()
    }
}

#[async_trait]
impl OutboxStore for PgStore {
    async fn claim_events(&self, prefixes: &[String], max: usize) -> CoreResult<Vec<Event>> {
        let prefixes: Vec<String> = prefixes.iter().map(|p| p.trim_end_matches('/').to_string()).collect();

        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT id, topic, payload, delay_seconds, created_at FROM events
            WHERE EXISTS (
                SELECT 1 FROM UNNEST($1::text[]) AS p(prefix)
                WHERE events.topic = p.prefix
                   OR LEFT(events.topic, LENGTH(p.prefix) + 1) = p.prefix || '/'
            )
            ORDER BY created_at
            LIMIT $2
            "#,
        )
        .bind(prefixes)
        .bind(max as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(DispatchError::storage)?;

        Ok(rows.into_iter().map(Event::from).collect())
    }

    async fn commit_events(&self, events: &[Event]) -> CoreResult<()> {
        let ids: Vec<Uuid> = events.iter().map(|e| e.id).collect();
        let mut tx = self.pool.begin().await.map_err(DispatchError::storage)?;

        let result = sqlx::query("DELETE FROM events WHERE id = ANY($1)")
            .bind(&ids)
            .execute(&mut *tx)
            .await
            .map_err(DispatchError::storage)?;

        // dropping tx rolls the delete back
        if result.rows_affected() != ids.len() as u64 {
            return Err(DispatchError::Internal(format!(
                "outbox commit matched {} of {} events",
                result.rows_affected(),
                ids.len()
            )));
        }

        tx.commit().await.map_err(DispatchError::storage)
    }
}

#[async_trait]
impl DeadLetterSink for PgStore {
    async fn store_dead_letter(&self, event: &Event, attempt: u32, reason: &str) -> CoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO dead_letter_events (id, topic, payload, attempt, reason)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE
            SET attempt = EXCLUDED.attempt, reason = EXCLUDED.reason, failed_at = NOW()
            "#,
        )
        .bind(event.id)
        .bind(&event.topic)
        .bind(&event.payload)
        .bind(attempt as i32)
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(DispatchError::storage)?;
        Ok(())
    }
}
