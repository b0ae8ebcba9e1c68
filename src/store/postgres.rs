use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::debug;

use super::{MeasurementStore, MetadataStore};
use crate::error::CoreResult;
use crate::models::{AlertRuleDefinition, Measurement, TimeRange};

// ---

/// PostgreSQL-backed store. Schema is created by [`crate::schema::create_schema`].
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

/// One `(station, timestamp, field)` row of the `measurements` table.
#[derive(Debug, sqlx::FromRow)]
struct MeasurementRow {
    station_id: String,
    observed_at: DateTime<Utc>,
    field: String,
    value: f64,
    provenance: String,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Fold rows ordered by timestamp into measurements.
    fn group_rows(rows: Vec<MeasurementRow>) -> Vec<Measurement> {
        // ---
        let mut out: Vec<Measurement> = Vec::new();
        for row in rows {
            match out.last_mut() {
                Some(last) if last.timestamp == row.observed_at => {
                    last.fields.insert(row.field, row.value);
                }
                _ => out.push(Measurement {
                    station_id: row.station_id,
                    timestamp: row.observed_at,
                    fields: BTreeMap::from([(row.field, row.value)]),
                    provenance: row.provenance,
                }),
            }
        }
        out
    }

    async fn rows_at(
        &self,
        station_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<MeasurementRow>, sqlx::Error> {
        sqlx::query_as::<_, MeasurementRow>(
            r#"
            SELECT station_id, observed_at, field, value, provenance
              FROM measurements
             WHERE station_id = $1 AND observed_at = $2
             ORDER BY field
            "#,
        )
        .bind(station_id)
        .bind(at)
        .fetch_all(&self.pool)
        .await
    }
}

#[async_trait]
impl MeasurementStore for PgStore {
    async fn upsert(&self, measurement: &Measurement) -> CoreResult<Measurement> {
        // ---
        let mut tx = self.pool.begin().await?;

        for (field, value) in &measurement.fields {
            sqlx::query(
                r#"
                INSERT INTO measurements (station_id, observed_at, field, value, provenance)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (station_id, observed_at, field) DO UPDATE SET
                    value = EXCLUDED.value,
                    provenance = EXCLUDED.provenance
                "#,
            )
            .bind(&measurement.station_id)
            .bind(measurement.timestamp)
            .bind(field)
            .bind(*value)
            .bind(&measurement.provenance)
            .execute(&mut *tx)
            .await?;
        }

        // Keep one provenance per (station, timestamp) after a merge.
        sqlx::query(
            r#"
            UPDATE measurements SET provenance = $3
             WHERE station_id = $1 AND observed_at = $2
            "#,
        )
        .bind(&measurement.station_id)
        .bind(measurement.timestamp)
        .bind(&measurement.provenance)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let rows = self
            .rows_at(&measurement.station_id, measurement.timestamp)
            .await?;
        debug!(
            station = %measurement.station_id,
            fields = rows.len(),
            "Upserted measurement"
        );
        Ok(Self::group_rows(rows)
            .pop()
            .unwrap_or_else(|| measurement.clone()))
    }

    async fn scan(
        &self,
        station_id: &str,
        fields: &[String],
        range: TimeRange,
    ) -> CoreResult<Vec<Measurement>> {
        // ---
        let rows = sqlx::query_as::<_, MeasurementRow>(
            r#"
            SELECT station_id, observed_at, field, value, provenance
              FROM measurements
             WHERE station_id = $1
               AND observed_at >= $2
               AND observed_at <  $3
               AND field = ANY($4)
             ORDER BY observed_at, field
            "#,
        )
        .bind(station_id)
        .bind(range.start)
        .bind(range.end)
        .bind(fields)
        .fetch_all(&self.pool)
        .await?;

        Ok(Self::group_rows(rows))
    }

    async fn latest(&self, station_id: &str) -> CoreResult<Option<Measurement>> {
        // ---
        let newest: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT max(observed_at) FROM measurements WHERE station_id = $1",
        )
        .bind(station_id)
        .fetch_one(&self.pool)
        .await?;

        let Some(at) = newest else {
            return Ok(None);
        };
        let rows = self.rows_at(station_id, at).await?;
        Ok(Self::group_rows(rows).pop())
    }

    async fn ping(&self) -> CoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for PgStore {
    async fn save_rule(&self, rule: &AlertRuleDefinition) -> CoreResult<()> {
        // ---
        sqlx::query(
            r#"
            INSERT INTO alert_rules (id, definition, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (id) DO UPDATE SET
                definition = EXCLUDED.definition,
                updated_at = now()
            "#,
        )
        .bind(&rule.id)
        .bind(Json(rule))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_rule(&self, rule_id: &str) -> CoreResult<bool> {
        let result = sqlx::query("DELETE FROM alert_rules WHERE id = $1")
            .bind(rule_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn load_rules(&self) -> CoreResult<Vec<AlertRuleDefinition>> {
        let rows: Vec<Json<AlertRuleDefinition>> =
            sqlx::query_scalar("SELECT definition FROM alert_rules ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|Json(rule)| rule).collect())
    }

    async fn save_station(&self, station_id: &str) -> CoreResult<()> {
        sqlx::query("INSERT INTO stations (id) VALUES ($1) ON CONFLICT (id) DO NOTHING")
            .bind(station_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_stations(&self) -> CoreResult<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM stations ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::TimeZone;

    fn row(minute: u32, field: &str, value: f64) -> MeasurementRow {
        MeasurementRow {
            station_id: "KSEA".to_string(),
            observed_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, minute, 0).unwrap(),
            field: field.to_string(),
            value,
            provenance: "test".to_string(),
        }
    }

    #[test]
    fn test_group_rows_by_timestamp() {
        // ---
        let grouped = PgStore::group_rows(vec![
            row(0, "humidity", 40.0),
            row(0, "temperature", 10.0),
            row(1, "temperature", 11.0),
        ]);

        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[0].value("humidity"), Some(40.0));
        assert_eq!(grouped[0].value("temperature"), Some(10.0));
        assert_eq!(grouped[1].value("temperature"), Some(11.0));
    }
}
