//! Event publisher.
//!
//! Stations are routed to a fixed set of shards, each drained by one
//! worker. Alerts go through a bounded channel (producers wait for
//! capacity), live measurements through a bounded drop-oldest queue. Every
//! queued event takes a per-shard sequence number and the worker always
//! delivers the lower one first, so a station's alerts and measurements
//! leave in the order they were queued.

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::alert::FiredAlert;
use crate::config::PublishConfig;
use crate::error::{CoreError, CoreResult};
use crate::models::Measurement;

mod bus;

pub use bus::{BusError, EventBus, LogBus, MemoryBus};

// ---

pub fn measurement_topic(station_id: &str, field: &str) -> String {
    format!("weather/{station_id}/{field}")
}

pub fn alert_topic(rule_id: &str) -> String {
    format!("weather/alerts/{rule_id}")
}

#[derive(Debug, Clone)]
struct Envelope {
    seq: u64,
    topic: String,
    payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PublisherStats {
    pub published: u64,
    pub retried: u64,
    /// Events given up on after the retry deadline.
    pub dropped: u64,
    /// Live measurements evicted from a full queue.
    pub coalesced: u64,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    retried: AtomicU64,
    dropped: AtomicU64,
    coalesced: AtomicU64,
}

/// Bounded FIFO that evicts its oldest entry when full.
struct LiveQueue {
    capacity: usize,
    items: Mutex<VecDeque<Envelope>>,
    notify: Notify,
}

impl LiveQueue {
    // ---
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// Returns the number of evicted entries.
    fn push(&self, envelope: Envelope) -> u64 {
        // ---
        let mut evicted = 0;
        {
            let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
            while items.len() >= self.capacity {
                items.pop_front();
                evicted += 1;
            }
            items.push_back(envelope);
        }
        self.notify.notify_one();
        evicted
    }

    fn front_seq(&self) -> Option<u64> {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .front()
            .map(|e| e.seq)
    }

    /// Pop the head if it is `seq` or older; an eviction may have moved it.
    fn pop_through(&self, seq: u64) -> Option<Envelope> {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        if items.front().is_some_and(|e| e.seq <= seq) {
            items.pop_front()
        } else {
            None
        }
    }
}

struct Shard {
    alerts: mpsc::Sender<Envelope>,
    live: Arc<LiveQueue>,
    seq: AtomicU64,
}

impl Shard {
    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }
}

/// Take whichever of the next alert and the live queue head was queued
/// first. `None` with work still pending means the head moved; call again.
fn take_next(
    held: &mut Option<Envelope>,
    alerts: &mut mpsc::Receiver<Envelope>,
    live: &LiveQueue,
) -> Option<Envelope> {
    // Read the live head before the channel so any alert queued ahead of
    // it is already visible to `try_recv`.
    let head = live.front_seq();
    if held.is_none() {
        *held = alerts.try_recv().ok();
    }
    match (head, held.as_ref().map(|e| e.seq)) {
        (Some(head), Some(alert)) if head < alert => live.pop_through(head),
        (_, Some(_)) => held.take(),
        (Some(head), None) => live.pop_through(head),
        (None, None) => None,
    }
}

struct Inner {
    bus: Arc<dyn EventBus>,
    config: PublishConfig,
    shards: Vec<Shard>,
    counters: Counters,
    closed: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct Publisher {
    inner: Arc<Inner>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Publisher {
    // ---
    /// Start the shard workers. Must be called from within a Tokio runtime.
    pub fn spawn(bus: Arc<dyn EventBus>, config: PublishConfig) -> Self {
        // ---
        let shard_count = config.shards.max(1);
        let (closed, _) = watch::channel(false);

        let mut shards = Vec::with_capacity(shard_count);
        let mut receivers = Vec::with_capacity(shard_count);
        for _ in 0..shard_count {
            let (tx, rx) = mpsc::channel(config.alert_queue_capacity.max(1));
            let live = Arc::new(LiveQueue::new(config.live_queue_capacity));
            shards.push(Shard {
                alerts: tx,
                live: Arc::clone(&live),
                seq: AtomicU64::new(0),
            });
            receivers.push((rx, live));
        }

        info!(
            bus = bus.name(),
            shards = shard_count,
            alert_queue = config.alert_queue_capacity,
            live_queue = config.live_queue_capacity,
            "Publisher started"
        );

        let inner = Arc::new(Inner {
            bus,
            config,
            shards,
            counters: Counters::default(),
            closed,
        });

        let workers = receivers
            .into_iter()
            .enumerate()
            .map(|(index, (rx, live))| {
                let inner = Arc::clone(&inner);
                let closed = inner.closed.subscribe();
                tokio::spawn(async move { inner.run_shard(index, rx, live, closed).await })
            })
            .collect();

        Self {
            inner,
            workers: Arc::new(Mutex::new(workers)),
        }
    }

    /// Deliver one message now, retrying until the deadline.
    pub async fn publish(&self, topic: &str, payload: &[u8]) -> CoreResult<()> {
        self.inner
            .deliver(Envelope {
                seq: 0,
                topic: topic.to_string(),
                payload: payload.to_vec(),
            })
            .await
    }

    /// Queue one message per field on `weather/<station>/<field>`.
    pub fn publish_measurement(&self, measurement: &Measurement) {
        // ---
        let shard = self.inner.shard(&measurement.station_id);
        for (field, value) in &measurement.fields {
            let payload = json!({
                "station_id": measurement.station_id,
                "timestamp": measurement.timestamp,
                "field": field,
                "value": value,
            });
            let evicted = shard.live.push(Envelope {
                seq: shard.next_seq(),
                topic: measurement_topic(&measurement.station_id, field),
                payload: payload.to_string().into_bytes(),
            });
            if evicted > 0 {
                self.inner
                    .counters
                    .coalesced
                    .fetch_add(evicted, Ordering::Relaxed);
                debug!(station = %measurement.station_id, evicted, "Live queue full, dropped oldest");
            }
        }
    }

    /// Queue an alert event, waiting for queue capacity.
    pub async fn publish_alert(&self, alert: &FiredAlert) -> CoreResult<()> {
        // ---
        let payload = serde_json::to_vec(&alert.event).map_err(|e| CoreError::PublishFailure {
            topic: alert.topic.clone(),
            attempts: 0,
            reason: e.to_string(),
        })?;

        if *self.inner.closed.borrow() {
            return Err(CoreError::PublishFailure {
                topic: alert.topic.clone(),
                attempts: 0,
                reason: "publisher is shut down".to_string(),
            });
        }

        let shard = self.inner.shard(&alert.event.station_id);
        shard
            .alerts
            .send(Envelope {
                seq: shard.next_seq(),
                topic: alert.topic.clone(),
                payload,
            })
            .await
            .map_err(|_| CoreError::PublishFailure {
                topic: alert.topic.clone(),
                attempts: 0,
                reason: "publisher is shut down".to_string(),
            })
    }

    pub fn stats(&self) -> PublisherStats {
        // ---
        let c = &self.inner.counters;
        PublisherStats {
            published: c.published.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            coalesced: c.coalesced.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting alerts and wait for the workers to drain their queues.
    pub async fn shutdown(&self) {
        // ---
        self.inner.closed.send_replace(true);
        let workers: Vec<_> = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()),
        );
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Publisher worker failed");
            }
        }
        info!(stats = ?self.stats(), "Publisher stopped");
    }
}

impl Inner {
    // ---
    fn shard(&self, station_id: &str) -> &Shard {
        let mut hasher = DefaultHasher::new();
        station_id.hash(&mut hasher);
        &self.shards[(hasher.finish() % self.shards.len() as u64) as usize]
    }

    async fn run_shard(
        &self,
        index: usize,
        mut alerts: mpsc::Receiver<Envelope>,
        live: Arc<LiveQueue>,
        mut closed: watch::Receiver<bool>,
    ) {
        // ---
        let mut held: Option<Envelope> = None;
        loop {
            if let Some(envelope) = take_next(&mut held, &mut alerts, &live) {
                let _ = self.deliver(envelope).await;
                continue;
            }
            if held.is_some() || live.front_seq().is_some() {
                continue;
            }
            tokio::select! {
                Some(envelope) = alerts.recv() => held = Some(envelope),
                _ = live.notify.notified() => {}
                _ = closed.changed() => break,
            }
        }

        alerts.close();
        loop {
            match take_next(&mut held, &mut alerts, &live) {
                Some(envelope) => {
                    let _ = self.deliver(envelope).await;
                }
                None if held.is_none() && live.front_seq().is_none() => break,
                None => {}
            }
        }
        debug!(shard = index, "Publisher shard drained");
    }

    /// Publish with bounded exponential backoff until the retry deadline.
    async fn deliver(&self, envelope: Envelope) -> CoreResult<()> {
        // ---
        let deadline = Instant::now() + self.config.retry_deadline;
        let mut delay = self.config.retry_initial;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let reason = match self.bus.publish(&envelope.topic, &envelope.payload).await {
                Ok(()) => {
                    self.counters.published.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(e) => e.0,
            };

            if Instant::now() + delay > deadline {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                error!(
                    topic = %envelope.topic,
                    attempts,
                    reason = %reason,
                    "Event dropped after retry deadline"
                );
                return Err(CoreError::PublishFailure {
                    topic: envelope.topic,
                    attempts,
                    reason,
                });
            }

            self.counters.retried.fetch_add(1, Ordering::Relaxed);
            warn!(
                topic = %envelope.topic,
                attempts,
                retry_in_ms = delay.as_millis() as u64,
                reason = %reason,
                "Publish failed, retrying"
            );
            sleep(delay).await;
            delay = (delay * 2).min(self.config.retry_max);
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::{AlertEvent, TransitionKind};
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;
    use std::time::Duration;
    use uuid::Uuid;

    fn create_test_config() -> PublishConfig {
        // ---
        PublishConfig {
            shards: 2,
            alert_queue_capacity: 4,
            live_queue_capacity: 8,
            retry_initial: Duration::from_millis(2),
            retry_max: Duration::from_millis(10),
            retry_deadline: Duration::from_millis(60),
        }
    }

    fn create_test_alert(station: &str, seq: u32) -> FiredAlert {
        // ---
        FiredAlert {
            topic: alert_topic("freeze"),
            event: AlertEvent {
                event_id: Uuid::new_v4(),
                rule_id: "freeze".to_string(),
                station_id: station.to_string(),
                field: "temperature".to_string(),
                value: f64::from(seq),
                threshold: 0.0,
                kind: TransitionKind::Triggered,
                timestamp: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            },
        }
    }

    #[test]
    fn test_topics() {
        // ---
        assert_eq!(measurement_topic("KSEA", "temperature"), "weather/KSEA/temperature");
        assert_eq!(alert_topic("freeze"), "weather/alerts/freeze");
    }

    #[test]
    fn test_live_queue_drops_oldest() {
        // ---
        let queue = LiveQueue::new(2);
        let envelope = |n: u8| Envelope {
            seq: u64::from(n),
            topic: "t".to_string(),
            payload: vec![n],
        };

        assert_eq!(queue.push(envelope(1)), 0);
        assert_eq!(queue.push(envelope(2)), 0);
        assert_eq!(queue.push(envelope(3)), 1);

        assert_eq!(queue.front_seq(), Some(2));
        assert_eq!(queue.pop_through(u64::MAX).map(|e| e.payload), Some(vec![2]));
        assert_eq!(queue.pop_through(u64::MAX).map(|e| e.payload), Some(vec![3]));
        assert!(queue.pop_through(u64::MAX).is_none());
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        // ---
        let bus = Arc::new(MemoryBus::new());
        let publisher = Publisher::spawn(bus.clone(), create_test_config());
        bus.fail_next(2);

        publisher.publish("weather/alerts/x", b"{}").await.unwrap();

        let stats = publisher.stats();
        assert_eq!(stats.published, 1);
        assert_eq!(stats.retried, 2);
        assert_eq!(bus.messages().len(), 1);
        publisher.shutdown().await;
    }

    #[tokio::test]
    async fn test_drop_after_deadline() {
        // ---
        let bus = Arc::new(MemoryBus::new());
        let publisher = Publisher::spawn(bus.clone(), create_test_config());
        bus.set_available(false);

        let err = publisher.publish("weather/alerts/x", b"{}").await.unwrap_err();
        match err {
            CoreError::PublishFailure { topic, attempts, .. } => {
                assert_eq!(topic, "weather/alerts/x");
                assert!(attempts > 1);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(publisher.stats().dropped, 1);
        publisher.shutdown().await;
    }

    #[tokio::test]
    async fn test_alerts_keep_station_order() {
        // ---
        let bus = Arc::new(MemoryBus::new());
        let publisher = Publisher::spawn(bus.clone(), create_test_config());

        for seq in 0..20 {
            publisher.publish_alert(&create_test_alert("KSEA", seq)).await.unwrap();
            publisher.publish_alert(&create_test_alert("KPDX", seq)).await.unwrap();
        }
        publisher.shutdown().await;

        let events = bus.json_on("weather/alerts/freeze");
        assert_eq!(events.len(), 40);
        for station in ["KSEA", "KPDX"] {
            let values: Vec<f64> = events
                .iter()
                .filter(|e| e["station_id"] == station)
                .filter_map(|e| e["value"].as_f64())
                .collect();
            let expected: Vec<f64> = (0..20).map(f64::from).collect();
            assert_eq!(values, expected);
        }

        assert!(publisher.publish_alert(&create_test_alert("KSEA", 99)).await.is_err());
    }

    #[tokio::test]
    async fn test_measurement_fan_out() {
        // ---
        let bus = Arc::new(MemoryBus::new());
        let publisher = Publisher::spawn(bus.clone(), create_test_config());

        let measurement = Measurement {
            station_id: "KSEA".to_string(),
            timestamp: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            fields: BTreeMap::from([
                ("humidity".to_string(), 81.0),
                ("temperature".to_string(), 4.5),
            ]),
            provenance: "test".to_string(),
        };
        publisher.publish_measurement(&measurement);
        publisher.shutdown().await;

        let temperature = bus.json_on("weather/KSEA/temperature");
        assert_eq!(temperature.len(), 1);
        assert_eq!(temperature[0]["value"], 4.5);
        assert_eq!(bus.json_on("weather/KSEA/humidity").len(), 1);
        assert_eq!(publisher.stats().published, 2);
    }

    #[tokio::test]
    async fn test_station_events_leave_in_queue_order() {
        // ---
        let bus = Arc::new(MemoryBus::new());
        let publisher = Publisher::spawn(bus.clone(), create_test_config());
        let reading = |minute: u32| Measurement {
            station_id: "KSEA".to_string(),
            timestamp: Utc.with_ymd_and_hms(2025, 1, 1, 0, minute, 0).unwrap(),
            fields: BTreeMap::from([("temperature".to_string(), f64::from(minute))]),
            provenance: "test".to_string(),
        };

        publisher.publish_measurement(&reading(0));
        publisher.publish_alert(&create_test_alert("KSEA", 1)).await.unwrap();
        publisher.publish_measurement(&reading(2));
        publisher.publish_alert(&create_test_alert("KSEA", 3)).await.unwrap();
        publisher.shutdown().await;

        let topics: Vec<String> = bus.messages().into_iter().map(|(topic, _)| topic).collect();
        assert_eq!(
            topics,
            vec![
                "weather/KSEA/temperature",
                "weather/alerts/freeze",
                "weather/KSEA/temperature",
                "weather/alerts/freeze",
            ]
        );
    }

    #[test]
    fn test_take_next_prefers_lower_sequence() {
        // ---
        let envelope = |seq: u64| Envelope {
            seq,
            topic: format!("t{seq}"),
            payload: Vec::new(),
        };
        let (tx, mut alerts) = mpsc::channel(4);
        let live = LiveQueue::new(4);
        live.push(envelope(0));
        tx.try_send(envelope(1)).unwrap();
        live.push(envelope(2));
        tx.try_send(envelope(3)).unwrap();

        let mut held = None;
        let order: Vec<u64> = std::iter::from_fn(|| take_next(&mut held, &mut alerts, &live))
            .map(|e| e.seq)
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
    }
}
