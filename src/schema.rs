//! Database schema management for `weatherflow`.
//!
//! Ensures required tables and indexes exist before serving requests.
//! Applied once on startup from `main.rs` when a `DATABASE_URL` is configured.

use anyhow::Result;
use sqlx::PgPool;

// ---

/// Create or update the database schema (idempotent).
///
/// Creates the `measurements` table (one row per station, timestamp and
/// field, so re-ingesting a report merges instead of duplicating), the
/// `alert_rules` metadata table and the `stations` registry. Safe to call on
/// every startup; no-op if objects already exist.
///
/// Errors are propagated if any SQL execution fails.
pub async fn create_schema(pool: &PgPool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    // Canonical measurements; DOUBLE PRECISION keeps f64 values exact
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS measurements (
            station_id   TEXT             NOT NULL,
            observed_at  TIMESTAMPTZ      NOT NULL,
            field        TEXT             NOT NULL,
            value        DOUBLE PRECISION NOT NULL,
            provenance   TEXT             NOT NULL,
            PRIMARY KEY (station_id, observed_at, field)
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Alert rule definitions, stored as submitted
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS alert_rules (
            id          TEXT PRIMARY KEY,
            definition  JSONB       NOT NULL,
            updated_at  TIMESTAMPTZ NOT NULL DEFAULT now()
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stations (
            id          TEXT PRIMARY KEY,
            created_at  TIMESTAMPTZ NOT NULL DEFAULT now()
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Latest-reading lookups and per-field range scans
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_measurements_station_time
            ON measurements (station_id, observed_at DESC);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_measurements_field_time
            ON measurements (field, observed_at);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}
