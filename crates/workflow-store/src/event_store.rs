//! Append-only event log.
//!
//! Every aggregate transition in the store lands here before it is pushed
//! to the bus, so a failed publish never loses the event: the row remains
//! queryable and can be re-delivered on startup.

use crate::bus::EventBus;
use crate::models::{Event, EventCreate};
use crate::StoreError;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub aggregate_type: Option<String>,
    pub aggregate_id: Option<String>,
    pub event_type: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

impl EventQuery {
    pub fn for_aggregate(aggregate_type: &str, aggregate_id: &str) -> Self {
        Self {
            aggregate_type: Some(aggregate_type.to_string()),
            aggregate_id: Some(aggregate_id.to_string()),
            limit: 100,
            ..Default::default()
        }
    }
}

pub struct EventStore {
    pool: SqlitePool,
    bus: Arc<dyn EventBus>,
}

impl EventStore {
    pub fn new(pool: SqlitePool, bus: Arc<dyn EventBus>) -> Self {
        Self { pool, bus }
    }

    /// Open (creating if missing) a standalone event log at `url`.
    pub async fn connect(url: &str, bus: Arc<dyn EventBus>) -> Result<Self, StoreError> {
        use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
        use std::str::FromStr;

        let options = SqliteConnectOptions::from_str(url)
            .map_err(sqlx::Error::from)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self::new(pool, bus);
        store.init_schema().await?;
        Ok(store)
    }

    pub async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                event_id        TEXT PRIMARY KEY,
                event_type      TEXT NOT NULL,
                aggregate_type  TEXT NOT NULL,
                aggregate_id    TEXT NOT NULL,
                payload         TEXT NOT NULL,
                metadata        TEXT NOT NULL,
                version         INTEGER NOT NULL,
                timestamp       TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_events_aggregate
             ON events (aggregate_type, aggregate_id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Append an event and publish it on the bus.
    ///
    /// The write is authoritative; the publish is best-effort and a failure
    /// is only logged.
    pub async fn append(&self, data: EventCreate) -> Result<Event, StoreError> {
        let mut tx = self.pool.begin().await?;

        let version: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM events
             WHERE aggregate_type = ? AND aggregate_id = ?",
        )
        .bind(&data.aggregate_type)
        .bind(&data.aggregate_id)
        .fetch_one(&mut *tx)
        .await?;

        let event = Event {
            event_id: Uuid::new_v4(),
            event_type: data.event_type,
            aggregate_type: data.aggregate_type,
            aggregate_id: data.aggregate_id,
            payload: data.payload,
            metadata: data.metadata,
            version,
            timestamp: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO events
             (event_id, event_type, aggregate_type, aggregate_id, payload, metadata, version, timestamp)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(event.event_id.to_string())
        .bind(&event.event_type)
        .bind(&event.aggregate_type)
        .bind(&event.aggregate_id)
        .bind(serde_json::to_string(&event.payload)?)
        .bind(serde_json::to_string(&event.metadata)?)
        .bind(event.version)
        .bind(event.timestamp)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        if let Err(e) = self.bus.publish(&event).await {
            warn!(
                event_id = %event.event_id,
                event_type = %event.event_type,
                "Event publish failed, row retained for retry: {}", e
            );
        }

        debug!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            version = event.version,
            "Appended event"
        );

        Ok(event)
    }

    pub async fn get(&self, event_id: Uuid) -> Result<Option<Event>, StoreError> {
        let row = sqlx::query(
            "SELECT event_id, event_type, aggregate_type, aggregate_id,
                    payload, metadata, version, timestamp
             FROM events WHERE event_id = ?",
        )
        .bind(event_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| Self::row_to_event(&r)).transpose()
    }

    pub async fn query(&self, query: EventQuery) -> Result<Vec<Event>, StoreError> {
        let mut sql = String::from(
            "SELECT event_id, event_type, aggregate_type, aggregate_id,
                    payload, metadata, version, timestamp
             FROM events WHERE 1=1",
        );
        if query.aggregate_type.is_some() {
            sql.push_str(" AND aggregate_type = ?");
        }
        if query.aggregate_id.is_some() {
            sql.push_str(" AND aggregate_id = ?");
        }
        if query.event_type.is_some() {
            sql.push_str(" AND event_type = ?");
        }
        sql.push_str(" ORDER BY timestamp DESC, version DESC LIMIT ? OFFSET ?");

        let mut q = sqlx::query(&sql);
        if let Some(at) = &query.aggregate_type {
            q = q.bind(at);
        }
        if let Some(ai) = &query.aggregate_id {
            q = q.bind(ai);
        }
        if let Some(et) = &query.event_type {
            q = q.bind(et);
        }
        let limit = if query.limit > 0 { query.limit } else { 100 };
        q = q.bind(limit).bind(query.offset);

        let rows = q.fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_event).collect()
    }

    fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> Result<Event, StoreError> {
        let event_id: String = row.try_get("event_id")?;
        let payload: String = row.try_get("payload")?;
        let metadata: String = row.try_get("metadata")?;
        let timestamp: DateTime<Utc> = row.try_get("timestamp")?;

        Ok(Event {
            event_id: Uuid::parse_str(&event_id)
                .map_err(|_| StoreError::not_found("event", event_id.clone()))?,
            event_type: row.try_get("event_type")?,
            aggregate_type: row.try_get("aggregate_type")?,
            aggregate_id: row.try_get("aggregate_id")?,
            payload: serde_json::from_str(&payload)?,
            metadata: serde_json::from_str(&metadata)?,
            version: row.try_get("version")?,
            timestamp,
        })
    }
}
