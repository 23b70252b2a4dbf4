//! PostgreSQL backend.
//!
//! Events live in a single `events` table with JSONB tags behind a GIN
//! index, so tag filters (`tags @> {...}`) stay indexed no matter which
//! keys producers invent. Streaming uses keyset pagination on the id, so
//! a full replay never materializes the table in memory.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::TryStreamExt;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, QueryBuilder, Row};
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

use super::{EventFilter, EventPage, StorageBackend, StoreStats};
use crate::blobs::BlobRecord;
use crate::config::StorageConfig;
use crate::error::{ChronicleError, Result};
use crate::events::envelope::{Actor, DomainEvent, EventId, Tags};
use crate::projections::ProjectionRecord;

const STREAM_CHUNK: i64 = 500;

pub struct PostgresBackend {
    pool: PgPool,
}

impl PostgresBackend {
    /// Connect and run pending migrations.
    pub async fn connect(config: &StorageConfig) -> Result<Self> {
        let url = config.database_url.as_deref().ok_or_else(|| {
            ChronicleError::configuration("storage.database_url is required for postgres")
        })?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(url)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| ChronicleError::internal(format!("migration failed: {}", e)))?;

        info!(max_connections = config.max_connections, "postgres backend connected");
        Ok(Self { pool })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Row Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, FromRow)]
struct EventRow {
    id: Uuid,
    event_type: String,
    timestamp: DateTime<Utc>,
    schema_version: i32,
    actor: Value,
    tags: Value,
    payload: Value,
    metadata: Option<Value>,
}

impl EventRow {
    fn into_event(self) -> Result<DomainEvent> {
        let actor: Actor = serde_json::from_value(self.actor)?;
        let tags: Tags = serde_json::from_value(self.tags)?;
        Ok(DomainEvent {
            id: EventId(self.id),
            event_type: self.event_type,
            timestamp: self.timestamp,
            schema_version: self.schema_version as u32,
            actor,
            tags,
            payload: self.payload,
            metadata: self.metadata,
        })
    }
}

#[derive(Debug, FromRow)]
struct BlobRow {
    id: String,
    content_type: String,
    size_bytes: i64,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    data: Vec<u8>,
}

impl From<BlobRow> for BlobRecord {
    fn from(row: BlobRow) -> Self {
        Self {
            id: row.id,
            content_type: row.content_type,
            size_bytes: row.size_bytes as u64,
            created_at: row.created_at,
            expires_at: row.expires_at,
            data: row.data,
        }
    }
}

#[derive(Debug, FromRow)]
struct ProjectionRow {
    name: String,
    entity_id: String,
    state: Value,
    last_event_id: Uuid,
    updated_at: DateTime<Utc>,
}

impl From<ProjectionRow> for ProjectionRecord {
    fn from(row: ProjectionRow) -> Self {
        Self {
            name: row.name,
            entity_id: row.entity_id,
            state: row.state,
            last_event_id: EventId(row.last_event_id),
            updated_at: row.updated_at,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Query Building
// ─────────────────────────────────────────────────────────────────────────────

const EVENT_COLUMNS: &str =
    "id, event_type, timestamp, schema_version, actor, tags, payload, metadata";

fn push_filter(builder: &mut QueryBuilder<'_, Postgres>, filter: &EventFilter) {
    if let Some(since) = filter.since {
        builder.push(" AND timestamp >= ").push_bind(since);
    }
    if let Some(until) = filter.until {
        builder.push(" AND timestamp <= ").push_bind(until);
    }
    if let Some(ref event_type) = filter.event_type {
        builder
            .push(" AND event_type = ")
            .push_bind(event_type.clone());
    }
    if let Some(ref actor_id) = filter.actor_id {
        builder
            .push(" AND actor->>'id' = ")
            .push_bind(actor_id.clone());
    }
    if !filter.tags.is_empty() {
        let tags = serde_json::to_value(&filter.tags).unwrap_or(Value::Null);
        builder.push(" AND tags @> ").push_bind(tags);
    }
}

async fn fetch_chunk_after(
    pool: &PgPool,
    filter: &EventFilter,
    cursor: Option<Uuid>,
) -> Result<Vec<DomainEvent>> {
    let mut builder = QueryBuilder::new(format!(
        "SELECT {} FROM events WHERE TRUE",
        EVENT_COLUMNS
    ));
    push_filter(&mut builder, filter);
    if let Some(cursor) = cursor {
        builder.push(" AND id > ").push_bind(cursor);
    }
    builder.push(" ORDER BY id ASC LIMIT ").push_bind(STREAM_CHUNK);

    let rows: Vec<EventRow> = builder.build_query_as().fetch_all(pool).await?;
    rows.into_iter().map(EventRow::into_event).collect()
}

fn bind_event_insert<'a>(
    builder: &mut QueryBuilder<'a, Postgres>,
    event: &'a DomainEvent,
) -> Result<()> {
    let actor = serde_json::to_value(&event.actor)?;
    let tags = serde_json::to_value(&event.tags)?;
    builder.push("INSERT INTO events (");
    builder.push(EVENT_COLUMNS);
    builder.push(") VALUES (");
    let mut separated = builder.separated(", ");
    separated.push_bind(event.id.0);
    separated.push_bind(event.event_type.clone());
    separated.push_bind(event.timestamp);
    separated.push_bind(event.schema_version as i32);
    separated.push_bind(actor);
    separated.push_bind(tags);
    separated.push_bind(event.payload.clone());
    separated.push_bind(event.metadata.clone());
    builder.push(")");
    Ok(())
}

#[async_trait]
impl StorageBackend for PostgresBackend {
    async fn append_event(&self, event: &DomainEvent) -> Result<()> {
        let mut builder = QueryBuilder::new("");
        bind_event_insert(&mut builder, event)?;
        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn append_events(&self, events: &[DomainEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for event in events {
            let mut builder = QueryBuilder::new("");
            bind_event_insert(&mut builder, event)?;
            builder.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_event(&self, id: EventId) -> Result<Option<DomainEvent>> {
        let row: Option<EventRow> = sqlx::query_as(&format!(
            "SELECT {} FROM events WHERE id = $1",
            EVENT_COLUMNS
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(EventRow::into_event).transpose()
    }

    async fn query_events(
        &self,
        filter: &EventFilter,
        limit: u32,
        offset: u64,
    ) -> Result<EventPage> {
        let mut count_builder = QueryBuilder::new("SELECT COUNT(*) FROM events WHERE TRUE");
        push_filter(&mut count_builder, filter);
        let total: i64 = count_builder
            .build()
            .fetch_one(&self.pool)
            .await?
            .try_get(0)?;

        let mut builder = QueryBuilder::new(format!(
            "SELECT {} FROM events WHERE TRUE",
            EVENT_COLUMNS
        ));
        push_filter(&mut builder, filter);
        builder
            .push(" ORDER BY id ASC LIMIT ")
            .push_bind(limit as i64)
            .push(" OFFSET ")
            .push_bind(offset as i64);

        let rows: Vec<EventRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        let events = rows
            .into_iter()
            .map(EventRow::into_event)
            .collect::<Result<Vec<_>>>()?;

        Ok(EventPage {
            events,
            total: total as u64,
        })
    }

    fn stream_events(&self, filter: EventFilter) -> BoxStream<'static, Result<DomainEvent>> {
        let pool = self.pool.clone();
        let chunks = futures::stream::try_unfold(
            (pool, filter, None::<Uuid>, false),
            |(pool, filter, cursor, done)| async move {
                if done {
                    return Ok::<_, ChronicleError>(None);
                }
                let chunk = fetch_chunk_after(&pool, &filter, cursor).await?;
                if chunk.is_empty() {
                    return Ok::<_, ChronicleError>(None);
                }
                let exhausted = (chunk.len() as i64) < STREAM_CHUNK;
                let next_cursor = chunk.last().map(|e| e.id.0);
                Ok(Some((chunk, (pool, filter, next_cursor, exhausted))))
            },
        );

        Box::pin(
            chunks
                .map_ok(|chunk| futures::stream::iter(chunk.into_iter().map(Ok)))
                .try_flatten(),
        )
    }

    async fn prune_events_before(&self, horizon: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM events WHERE timestamp < $1")
            .bind(horizon)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn put_blob(&self, blob: &BlobRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO event_blobs (id, content_type, size_bytes, created_at, expires_at, data)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&blob.id)
        .bind(&blob.content_type)
        .bind(blob.size_bytes as i64)
        .bind(blob.created_at)
        .bind(blob.expires_at)
        .bind(&blob.data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_blob(&self, blob_id: &str) -> Result<Option<BlobRecord>> {
        let row: Option<BlobRow> = sqlx::query_as(
            "SELECT id, content_type, size_bytes, created_at, expires_at, data
             FROM event_blobs WHERE id = $1",
        )
        .bind(blob_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(BlobRecord::from))
    }

    async fn delete_blob(&self, blob_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM event_blobs WHERE id = $1")
            .bind(blob_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_expired_blobs(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT id FROM event_blobs WHERE expires_at <= $1")
            .bind(now)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| row.try_get::<String, _>(0).map_err(ChronicleError::from))
            .collect()
    }

    async fn load_projection(
        &self,
        name: &str,
        entity_id: &str,
    ) -> Result<Option<ProjectionRecord>> {
        let row: Option<ProjectionRow> = sqlx::query_as(
            "SELECT name, entity_id, state, last_event_id, updated_at
             FROM projections WHERE name = $1 AND entity_id = $2",
        )
        .bind(name)
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ProjectionRecord::from))
    }

    async fn save_projection(&self, record: &ProjectionRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO projections (name, entity_id, state, last_event_id, updated_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (name, entity_id)
             DO UPDATE SET state = $3, last_event_id = $4, updated_at = $5",
        )
        .bind(&record.name)
        .bind(&record.entity_id)
        .bind(&record.state)
        .bind(record.last_event_id.0)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_projections(&self, name: &str) -> Result<Vec<ProjectionRecord>> {
        let rows: Vec<ProjectionRow> = sqlx::query_as(
            "SELECT name, entity_id, state, last_event_id, updated_at
             FROM projections WHERE name = $1 ORDER BY entity_id",
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ProjectionRecord::from).collect())
    }

    async fn max_projected_event_id(&self) -> Result<Option<EventId>> {
        let row = sqlx::query("SELECT MAX(last_event_id) FROM projections")
            .fetch_one(&self.pool)
            .await?;
        let max: Option<Uuid> = row.try_get(0)?;
        Ok(max.map(EventId))
    }

    async fn stats(&self) -> Result<StoreStats> {
        let type_rows = sqlx::query("SELECT event_type, COUNT(*) FROM events GROUP BY event_type")
            .fetch_all(&self.pool)
            .await?;
        let mut events_by_type = HashMap::new();
        let mut event_count = 0u64;
        for row in type_rows {
            let event_type: String = row.try_get(0)?;
            let count: i64 = row.try_get(1)?;
            event_count += count as u64;
            events_by_type.insert(event_type, count as u64);
        }

        let blob_row =
            sqlx::query("SELECT COUNT(*), COALESCE(SUM(size_bytes), 0) FROM event_blobs")
                .fetch_one(&self.pool)
                .await?;
        let blob_count: i64 = blob_row.try_get(0)?;
        let blob_bytes: i64 = blob_row.try_get(1)?;

        Ok(StoreStats {
            event_count,
            events_by_type,
            blob_count: blob_count as u64,
            blob_bytes: blob_bytes as u64,
        })
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_row_conversion() {
        let row = EventRow {
            id: Uuid::now_v7(),
            event_type: "ISSUE.SELECTED".into(),
            timestamp: Utc::now(),
            schema_version: 1,
            actor: json!({"kind": "user", "id": "alice"}),
            tags: json!({"issueId": "42"}),
            payload: json!({"issueId": "42"}),
            metadata: None,
        };

        let event = row.into_event().unwrap();
        assert_eq!(event.event_type, "ISSUE.SELECTED");
        assert_eq!(event.actor.id, "alice");
        assert_eq!(event.tag("issueId"), Some("42"));
    }

    #[test]
    fn test_event_row_rejects_malformed_actor() {
        let row = EventRow {
            id: Uuid::now_v7(),
            event_type: "ISSUE.SELECTED".into(),
            timestamp: Utc::now(),
            schema_version: 1,
            actor: json!({"kind": "martian", "id": "zork"}),
            tags: json!({}),
            payload: json!({}),
            metadata: None,
        };
        assert!(row.into_event().is_err());
    }

    #[test]
    fn test_blob_row_conversion() {
        let row = BlobRow {
            id: "abc".into(),
            content_type: "text/plain".into(),
            size_bytes: 3,
            created_at: Utc::now(),
            expires_at: Utc::now(),
            data: vec![1, 2, 3],
        };
        let record = BlobRecord::from(row);
        assert_eq!(record.size_bytes, 3);
        assert_eq!(record.data, vec![1, 2, 3]);
    }
}
