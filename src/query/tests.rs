use super::*;
use crate::config::CacheConfig;
use crate::store::MemoryStore;
use chrono::{DateTime, TimeZone, Utc};

// ---

struct Fixture {
    store: Arc<MemoryStore>,
    cache: CacheCoordinator,
    engine: AggregationEngine,
}

fn fixture() -> Fixture {
    // ---
    let store = Arc::new(MemoryStore::new());
    let cache = CacheCoordinator::new(&CacheConfig::default());
    let registry = Arc::new(StationRegistry::new(["A", "B"]));
    let engine = AggregationEngine::new(
        store.clone(),
        cache.clone(),
        registry,
        QueryConfig::default(),
    );
    Fixture {
        store,
        cache,
        engine,
    }
}

fn t(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap() + TimeDelta::minutes(minute as i64)
}

fn reading(station: &str, minute: u32, temperature: f64) -> Measurement {
    Measurement {
        station_id: station.to_string(),
        timestamp: t(minute),
        fields: BTreeMap::from([("temperature".to_string(), temperature)]),
        provenance: "test".to_string(),
    }
}

async fn seed(store: &MemoryStore, rows: &[Measurement]) {
    for m in rows {
        store.upsert(m).await.unwrap();
    }
}

fn request(stations: &[&str], start: u32, end: u32, interval_min: i64, agg: AggregationFn) -> QueryRequest {
    // ---
    QueryRequest {
        stations: stations.iter().map(|s| s.to_string()).collect(),
        fields: vec!["temperature".to_string()],
        range: TimeRange::new(t(start), t(end)),
        interval: TimeDelta::minutes(interval_min),
        aggregation: agg,
        limit: None,
        cursor: None,
        sort: SortOrder::Asc,
        timeout: None,
    }
}

fn first_value(page: &QueryPage) -> Option<f64> {
    page.window.buckets[0].values.get("temperature").copied()
}

#[tokio::test]
async fn test_two_stage_average() {
    // ---
    let f = fixture();
    seed(
        &f.store,
        &[reading("A", 1, 10.0), reading("A", 2, 20.0), reading("B", 3, 30.0)],
    )
    .await;

    let page = f
        .engine
        .query(request(&["A", "B"], 0, 10, 10, AggregationFn::Avg))
        .await
        .unwrap();

    // avg(avg(10, 20), 30), not avg(10, 20, 30)
    assert_eq!(first_value(&page), Some(22.5));
}

#[tokio::test]
async fn test_cross_station_reductions() {
    // ---
    let f = fixture();
    seed(
        &f.store,
        &[reading("A", 1, 10.0), reading("A", 2, 20.0), reading("B", 3, 30.0)],
    )
    .await;

    let run = |agg| f.engine.query(request(&["A", "B"], 0, 10, 10, agg));

    assert_eq!(first_value(&run(AggregationFn::Min).await.unwrap()), Some(10.0));
    assert_eq!(first_value(&run(AggregationFn::Max).await.unwrap()), Some(30.0));
    assert_eq!(first_value(&run(AggregationFn::Sum).await.unwrap()), Some(60.0));
    // Raw measurements, not buckets or stations
    assert_eq!(first_value(&run(AggregationFn::Count).await.unwrap()), Some(3.0));
}

#[tokio::test]
async fn test_station_without_data_is_excluded() {
    // ---
    let f = fixture();
    seed(&f.store, &[reading("A", 1, 4.0), reading("B", 12, 8.0)]).await;

    let page = f
        .engine
        .query(request(&["A", "B"], 0, 20, 10, AggregationFn::Avg))
        .await
        .unwrap();

    // B has nothing in the first bucket; it must not count as zero
    assert_eq!(page.window.buckets[0].values.get("temperature"), Some(&4.0));
    assert_eq!(page.window.buckets[1].values.get("temperature"), Some(&8.0));
}

#[tokio::test]
async fn test_empty_bucket_shapes() {
    // ---
    let f = fixture();

    let avg = f
        .engine
        .query(request(&["A"], 0, 10, 10, AggregationFn::Avg))
        .await
        .unwrap();
    assert!(avg.window.buckets[0].values.is_empty());

    let count = f
        .engine
        .query(request(&["A"], 0, 10, 10, AggregationFn::Count))
        .await
        .unwrap();
    assert_eq!(first_value(&count), Some(0.0));
}

#[tokio::test]
async fn test_half_open_boundary() {
    // ---
    let f = fixture();
    seed(&f.store, &[reading("A", 0, 1.0), reading("A", 10, 100.0)]).await;

    let page = f
        .engine
        .query(request(&["A"], 0, 10, 10, AggregationFn::Max))
        .await
        .unwrap();

    assert_eq!(page.total_buckets, 1);
    assert_eq!(first_value(&page), Some(1.0));
}

#[tokio::test]
async fn test_round_trip_is_exact() {
    // ---
    let f = fixture();
    let value = 0.1 + 0.2;
    seed(&f.store, &[reading("A", 5, value)]).await;

    let page = f
        .engine
        .query(request(&["A"], 5, 6, 1, AggregationFn::Avg))
        .await
        .unwrap();

    assert_eq!(first_value(&page), Some(value));
}

#[tokio::test]
async fn test_last_bucket_truncated() {
    // ---
    let f = fixture();
    let page = f
        .engine
        .query(request(&["A"], 0, 25, 10, AggregationFn::Avg))
        .await
        .unwrap();

    assert_eq!(page.total_buckets, 3);
    let last = page.window.buckets.last().unwrap();
    assert_eq!((last.start, last.end), (t(20), t(25)));
}

#[tokio::test]
async fn test_sub_millisecond_range_end() {
    // ---
    let f = fixture();
    let mut late = reading("A", 0, 7.0);
    late.timestamp = t(0) + TimeDelta::microseconds(1_000_200);
    seed(&f.store, &[late]).await;

    let mut req = request(&["A"], 0, 1, 1, AggregationFn::Max);
    req.range = TimeRange::new(t(0), t(0) + TimeDelta::microseconds(1_000_500));
    req.interval = TimeDelta::seconds(1);

    let page = f.engine.query(req.clone()).await.unwrap();
    assert_eq!(page.total_buckets, 2);
    let last = page.window.buckets.last().unwrap();
    assert_eq!((last.start, last.end), (t(0) + TimeDelta::seconds(1), req.range.end));
    assert_eq!(last.values.get("temperature"), Some(&7.0));

    // A range shorter than a millisecond is still one bucket
    req.range = TimeRange::new(t(0), t(0) + TimeDelta::microseconds(500));
    let page = f.engine.query(req).await.unwrap();
    assert_eq!(page.total_buckets, 1);
    assert_eq!(page.window.buckets[0].end, t(0) + TimeDelta::microseconds(500));
}

#[tokio::test]
async fn test_interval_longer_than_range() {
    // ---
    let f = fixture();
    seed(&f.store, &[reading("A", 30, 3.0)]).await;

    let mut req = request(&["A"], 0, 60, 60, AggregationFn::Avg);
    req.interval = crate::models::parse_iso_duration("P100000000D").unwrap();

    let page = f.engine.query(req).await.unwrap();
    assert_eq!(page.total_buckets, 1);
    let bucket = &page.window.buckets[0];
    assert_eq!((bucket.start, bucket.end), (t(0), t(60)));
    assert_eq!(first_value(&page), Some(3.0));
}

#[tokio::test]
async fn test_pagination() {
    // ---
    let f = fixture();
    let rows: Vec<Measurement> = (0..10).map(|i| reading("A", i * 10, i as f64)).collect();
    seed(&f.store, &rows).await;

    let mut req = request(&["A"], 0, 100, 10, AggregationFn::Avg);
    req.limit = Some(4);

    let mut seen = Vec::new();
    let mut pages = 0;
    loop {
        let page = f.engine.query(req.clone()).await.unwrap();
        pages += 1;
        seen.extend(page.window.buckets.iter().map(|b| b.values["temperature"]));
        match page.next_cursor {
            Some(cursor) => req.cursor = Some(cursor),
            None => break,
        }
    }

    assert_eq!(pages, 3);
    assert_eq!(seen, (0..10).map(|i| i as f64).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_pagination_desc_and_past_end() {
    // ---
    let f = fixture();
    let rows: Vec<Measurement> = (0..3).map(|i| reading("A", i * 10, i as f64)).collect();
    seed(&f.store, &rows).await;

    let mut req = request(&["A"], 0, 30, 10, AggregationFn::Avg);
    req.sort = SortOrder::Desc;
    req.limit = Some(2);

    let page = f.engine.query(req.clone()).await.unwrap();
    let values: Vec<f64> = page.window.buckets.iter().map(|b| b.values["temperature"]).collect();
    assert_eq!(values, vec![2.0, 1.0]);

    // A cursor beyond the last bucket yields an empty page and no cursor
    let plan = f.engine.plan(&req).unwrap();
    let fingerprint = Cursor::fingerprint(&plan.stations, &plan.fields, &req, plan.interval);
    req.cursor = Some(
        Cursor {
            offset: 99,
            fingerprint,
        }
        .encode(),
    );
    let past = f.engine.query(req.clone()).await.unwrap();
    assert!(past.window.buckets.is_empty());
    assert!(past.next_cursor.is_none());

    // Same cursor again: idempotent
    assert_eq!(f.engine.query(req).await.unwrap(), past);
}

#[tokio::test]
async fn test_cursor_from_other_query_rejected() {
    // ---
    let f = fixture();
    let mut req = request(&["A"], 0, 100, 10, AggregationFn::Avg);
    req.limit = Some(2);
    let cursor = f.engine.query(req).await.unwrap().next_cursor.unwrap();

    let mut other = request(&["A"], 0, 100, 10, AggregationFn::Max);
    other.cursor = Some(cursor);
    assert!(matches!(
        f.engine.query(other).await,
        Err(CoreError::InvalidQuery { .. })
    ));
}

#[tokio::test]
async fn test_invalid_queries() {
    // ---
    let f = fixture();
    let mut cases = Vec::new();

    cases.push(request(&[], 0, 10, 10, AggregationFn::Avg));
    cases.push(request(&["A"], 10, 10, 10, AggregationFn::Avg));
    cases.push(request(&["A"], 10, 0, 10, AggregationFn::Avg));
    cases.push(request(&["A"], 0, 10, 0, AggregationFn::Avg));

    let mut no_fields = request(&["A"], 0, 10, 10, AggregationFn::Avg);
    no_fields.fields.clear();
    cases.push(no_fields);

    let mut zero_limit = request(&["A"], 0, 10, 10, AggregationFn::Avg);
    zero_limit.limit = Some(0);
    cases.push(zero_limit);

    let mut too_many = request(&["A"], 0, 10, 10, AggregationFn::Avg);
    too_many.interval = TimeDelta::milliseconds(1);
    too_many.range = TimeRange::new(t(0), t(60 * 24 * 30));
    cases.push(too_many);

    for case in cases {
        let result = f.engine.query(case.clone()).await;
        assert!(
            matches!(result, Err(CoreError::InvalidQuery { .. })),
            "expected InvalidQuery for {case:?}, got {result:?}"
        );
    }
}

#[tokio::test]
async fn test_second_query_served_from_cache() {
    // ---
    let f = fixture();
    seed(&f.store, &[reading("A", 1, 1.0), reading("B", 2, 2.0)]).await;
    let req = request(&["B", "A"], 0, 20, 10, AggregationFn::Avg);

    f.engine.query(req.clone()).await.unwrap();
    let scans = f.store.scan_count();

    // Same sets in a different order hit the same keys
    let mut reordered = req.clone();
    reordered.stations.reverse();
    f.engine.query(reordered).await.unwrap();

    assert_eq!(f.store.scan_count(), scans);
}

#[tokio::test]
async fn test_write_invalidates_covering_window() {
    // ---
    let f = fixture();
    seed(&f.store, &[reading("A", 1, 10.0)]).await;
    let req = request(&["A"], 0, 10, 10, AggregationFn::Avg);

    assert_eq!(first_value(&f.engine.query(req.clone()).await.unwrap()), Some(10.0));

    let late = reading("A", 2, 20.0);
    f.store.upsert(&late).await.unwrap();
    f.cache.invalidate(&late.station_id, late.timestamp);

    assert_eq!(first_value(&f.engine.query(req).await.unwrap()), Some(15.0));
}

#[tokio::test]
async fn test_partial_cache_with_failed_store_fails_whole_query() {
    // ---
    let f = fixture();
    seed(&f.store, &[reading("A", 1, 10.0), reading("A", 11, 20.0)]).await;

    // Warm only the first bucket
    f.engine
        .query(request(&["A"], 0, 10, 10, AggregationFn::Avg))
        .await
        .unwrap();

    f.store.set_available(false);
    let result = f
        .engine
        .query(request(&["A"], 0, 20, 10, AggregationFn::Avg))
        .await;
    assert!(matches!(
        result,
        Err(CoreError::BackingStoreUnavailable { .. })
    ));

    // Failures are not cached
    f.store.set_available(true);
    assert!(f
        .engine
        .query(request(&["A"], 0, 20, 10, AggregationFn::Avg))
        .await
        .is_ok());
}

#[tokio::test]
async fn test_query_timeout() {
    // ---
    let f = fixture();
    f.store.set_scan_delay(Duration::from_millis(200));

    let mut req = request(&["A"], 0, 10, 10, AggregationFn::Avg);
    req.timeout = Some(Duration::from_millis(20));

    assert_eq!(
        f.engine.query(req).await.unwrap_err(),
        CoreError::QueryTimeout { deadline_ms: 20 }
    );
}

#[tokio::test]
async fn test_latest_reading() {
    // ---
    let f = fixture();
    assert_eq!(f.engine.latest("A").await.unwrap(), None);

    seed(&f.store, &[reading("A", 1, 1.0), reading("A", 2, 2.0)]).await;
    // The cached "no data" answer is evicted by the ingestion path
    f.cache.invalidate("A", t(2));

    let latest = f.engine.latest("A").await.unwrap().unwrap();
    assert_eq!(latest.timestamp, t(2));

    assert!(matches!(
        f.engine.latest("Z").await,
        Err(CoreError::UnknownStation { .. })
    ));
}

#[test]
fn test_reduce_bucket_directly() {
    // ---
    let a = vec![reading("A", 1, 10.0), reading("A", 2, 20.0)];
    let b = vec![reading("B", 3, 30.0)];
    let values = reduce_bucket(&["temperature".to_string()], AggregationFn::Avg, &[a, b, vec![]]);
    assert_eq!(values["temperature"], 22.5);
}
