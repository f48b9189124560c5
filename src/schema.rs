//! Database schema management for `riverflow-live`.
//!
//! Ensures the durable tables the write throttle targets exist. Applied once
//! on startup from `main.rs`; a failure there is logged and the service keeps
//! ingesting into live state.

use anyhow::Result;
use sqlx::PgPool;

// ---

/// Create the schema if needed (idempotent).
///
/// `nodes` holds one row per monitoring point, created lazily on a node's
/// first durable write. `readings` holds the throttled, pruned reading log.
pub async fn create_schema(pool: &PgPool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS nodes (
            node_id     SERIAL PRIMARY KEY,
            name        TEXT             NOT NULL UNIQUE,
            latitude    DOUBLE PRECISION NOT NULL DEFAULT 0,
            longitude   DOUBLE PRECISION NOT NULL DEFAULT 0,
            threshold   DOUBLE PRECISION NOT NULL DEFAULT 5.0,
            created_at  TIMESTAMPTZ      NOT NULL DEFAULT now()
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS readings (
            reading_id      BIGSERIAL PRIMARY KEY,
            node_id         INTEGER          NOT NULL
                                REFERENCES nodes (node_id) ON DELETE CASCADE,
            water_level     DOUBLE PRECISION NOT NULL,
            flow_rate       DOUBLE PRECISION NOT NULL DEFAULT 0,
            timestamp       TIMESTAMPTZ      NOT NULL,
            confirmed_alert BOOLEAN          NOT NULL DEFAULT FALSE
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Serves both pruning and latest-reading lookups
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_readings_node_recent
            ON readings (node_id, reading_id DESC);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}
