//! Durable storage for nodes and throttled readings.
//!
//! The live pipeline only ever writes here through the write throttle; the
//! one read path is `GET /latest/{node_id}` and the threshold preload.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use thiserror::Error;

use crate::models::Location;

// ---

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database operation failed: {0}")]
    Database(sqlx::Error),

    /// Connection-level failure; the next throttle window retries naturally.
    #[error("durable store unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Unavailable(err.to_string())
            }
            other => StoreError::Database(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct NodeRecord {
    // ---
    pub node_id: i32,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct ReadingRow {
    // ---
    pub reading_id: i64,
    pub node_id: i32,
    pub water_level: f64,
    pub flow_rate: f64,
    pub timestamp: DateTime<Utc>,
    pub confirmed_alert: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewReading {
    // ---
    pub node_id: i32,
    pub water_level: f64,
    pub flow_rate: f64,
    pub timestamp: DateTime<Utc>,
    pub confirmed_alert: bool,
}

#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Look a node up by name, creating it with `location` and `threshold` if absent.
    async fn find_or_create_node(
        &self,
        name: &str,
        location: Location,
        threshold: f64,
    ) -> Result<NodeRecord, StoreError>;

    async fn insert_reading(&self, reading: &NewReading) -> Result<(), StoreError>;

    /// Delete all but the `keep` most recently written readings of a node;
    /// returns rows removed. Device clocks are not trusted for this ordering.
    async fn delete_readings_beyond(&self, node_id: i32, keep: u32) -> Result<u64, StoreError>;

    /// The most recently written reading for a node.
    async fn latest_reading(&self, name: &str) -> Result<Option<ReadingRow>, StoreError>;

    /// `(name, threshold)` for every known node.
    async fn node_thresholds(&self) -> Result<Vec<(String, f64)>, StoreError>;
}

/// [`DurableStore`] backed by PostgreSQL.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DurableStore for PgStore {
    // ---
    async fn find_or_create_node(
        &self,
        name: &str,
        location: Location,
        threshold: f64,
    ) -> Result<NodeRecord, StoreError> {
        // ---
        let existing = sqlx::query_as::<_, NodeRecord>(
            r#"
            SELECT node_id, name, latitude, longitude, threshold
              FROM nodes
             WHERE name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(node) = existing {
            return Ok(node);
        }

        tracing::info!("Creating new node: {}", name);

        // Another writer may create the same node between the two statements
        let node = sqlx::query_as::<_, NodeRecord>(
            r#"
            INSERT INTO nodes (name, latitude, longitude, threshold)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
            RETURNING node_id, name, latitude, longitude, threshold
            "#,
        )
        .bind(name)
        .bind(location.latitude)
        .bind(location.longitude)
        .bind(threshold)
        .fetch_one(&self.pool)
        .await?;

        Ok(node)
    }

    async fn insert_reading(&self, reading: &NewReading) -> Result<(), StoreError> {
        // ---
        sqlx::query(
            r#"
            INSERT INTO readings (
                node_id, water_level, flow_rate, timestamp, confirmed_alert
            ) VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(reading.node_id)
        .bind(reading.water_level)
        .bind(reading.flow_rate)
        .bind(reading.timestamp)
        .bind(reading.confirmed_alert)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_readings_beyond(&self, node_id: i32, keep: u32) -> Result<u64, StoreError> {
        // ---
        let result = sqlx::query(
            r#"
            DELETE FROM readings
             WHERE reading_id IN (
                SELECT reading_id
                  FROM readings
                 WHERE node_id = $1
                 ORDER BY reading_id DESC
                OFFSET $2
             )
            "#,
        )
        .bind(node_id)
        .bind(i64::from(keep))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn latest_reading(&self, name: &str) -> Result<Option<ReadingRow>, StoreError> {
        // ---
        let row = sqlx::query_as::<_, ReadingRow>(
            r#"
            SELECT r.reading_id, r.node_id, r.water_level, r.flow_rate,
                   r.timestamp, r.confirmed_alert
              FROM readings r
              JOIN nodes n ON n.node_id = r.node_id
             WHERE n.name = $1
             ORDER BY r.reading_id DESC
             LIMIT 1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn node_thresholds(&self) -> Result<Vec<(String, f64)>, StoreError> {
        // ---
        let rows = sqlx::query_as::<_, (String, f64)>("SELECT name, threshold FROM nodes")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows)
    }
}
