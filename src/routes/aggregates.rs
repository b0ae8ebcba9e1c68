//! `GET /aggregates` – bucketed cross-station aggregates.

use std::time::Duration;

use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{envelope, ApiResult, AppState};
use crate::error::{CoreError, CoreResult};
use crate::models::{parse_iso_duration, AggregationFn, TimeRange};
use crate::query::{QueryRequest, SortOrder};

// ---

/// Query string of `GET /aggregates`.
///
/// `stations` and `fields` are comma separated lists.
#[derive(Debug, Deserialize)]
struct AggregatesQuery {
    stations: String,
    fields: String,
    start: String,
    end: String,
    interval: String,
    aggregation: Option<String>,
    limit: Option<usize>,
    cursor: Option<String>,
    sort: Option<String>,
    timeout_ms: Option<u64>,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/aggregates", get(handler))
}

async fn handler(
    State(engine): State<AppState>,
    params: Result<Query<AggregatesQuery>, QueryRejection>,
) -> ApiResult {
    // ---
    let Query(params) = params.map_err(|e| CoreError::invalid_query(e.body_text()))?;
    let request = params.into_request()?;
    debug!(stations = ?request.stations, fields = ?request.fields, "GET /aggregates");

    let page = engine.query(request).await?;
    let meta = json!({
        "total_buckets": page.total_buckets,
        "returned": page.window.buckets.len(),
        "next_cursor": page.next_cursor,
    });
    Ok(envelope(StatusCode::OK, page.window, meta))
}

impl AggregatesQuery {
    // ---
    fn into_request(self) -> CoreResult<QueryRequest> {
        // ---
        let range = TimeRange::new(parse_instant("start", &self.start)?, parse_instant("end", &self.end)?);
        let aggregation = match self.aggregation.as_deref() {
            Some(raw) => raw.parse::<AggregationFn>()?,
            None => AggregationFn::Avg,
        };
        let sort = match self.sort.as_deref() {
            Some(raw) => raw.parse::<SortOrder>()?,
            None => SortOrder::Asc,
        };

        Ok(QueryRequest {
            stations: split_list(&self.stations),
            fields: split_list(&self.fields),
            range,
            interval: parse_iso_duration(&self.interval)?,
            aggregation,
            limit: self.limit,
            cursor: self.cursor.filter(|c| !c.is_empty()),
            sort,
            timeout: self.timeout_ms.map(Duration::from_millis),
        })
    }
}

fn parse_instant(name: &str, raw: &str) -> CoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CoreError::invalid_query(format!("invalid {name} '{raw}': {e}")))
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn create_test_query() -> AggregatesQuery {
        // ---
        AggregatesQuery {
            stations: "KSEA, KPDX,".to_string(),
            fields: "temperature".to_string(),
            start: "2025-01-01T00:00:00Z".to_string(),
            end: "2025-01-02T00:00:00+00:00".to_string(),
            interval: "PT1H".to_string(),
            aggregation: Some("max".to_string()),
            limit: Some(10),
            cursor: Some(String::new()),
            sort: None,
            timeout_ms: Some(250),
        }
    }

    #[test]
    fn test_into_request() {
        // ---
        let request = create_test_query().into_request().unwrap();

        assert_eq!(request.stations, vec!["KSEA", "KPDX"]);
        assert_eq!(request.interval, chrono::TimeDelta::hours(1));
        assert_eq!(request.aggregation, AggregationFn::Max);
        assert_eq!(request.sort, SortOrder::Asc);
        assert_eq!(request.cursor, None);
        assert_eq!(request.timeout, Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_invalid_parameters() {
        // ---
        let mut bad_start = create_test_query();
        bad_start.start = "yesterday".to_string();
        let mut bad_interval = create_test_query();
        bad_interval.interval = "P1M".to_string();
        let mut bad_agg = create_test_query();
        bad_agg.aggregation = Some("median".to_string());

        for query in [bad_start, bad_interval, bad_agg] {
            assert!(matches!(
                query.into_request(),
                Err(CoreError::InvalidQuery { .. })
            ));
        }
    }
}
