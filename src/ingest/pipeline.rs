//! Per-station ingestion workers.
//!
//! Each station gets one worker task fed by a bounded channel, so writes,
//! cache updates, live publication and rule evaluation of a station happen
//! strictly one report at a time. Different stations proceed in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::alert::{AlertEvaluator, ReorderBuffer};
use crate::cache::CacheCoordinator;
use crate::error::{CoreError, CoreResult};
use crate::models::Measurement;
use crate::publish::Publisher;
use crate::store::MeasurementStore;

use super::StationRegistry;

// ---

enum Job {
    Apply {
        measurement: Measurement,
        reply: oneshot::Sender<CoreResult<Measurement>>,
    },
    Flush(oneshot::Sender<()>),
}

struct Stage {
    store: Arc<dyn MeasurementStore>,
    cache: CacheCoordinator,
    registry: Arc<StationRegistry>,
    evaluator: Arc<AlertEvaluator>,
    publisher: Publisher,
}

pub struct IngestPipeline {
    stage: Arc<Stage>,
    queue_capacity: usize,
    reorder_window: Duration,
    workers: Mutex<HashMap<String, mpsc::Sender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl IngestPipeline {
    // ---
    pub fn new(
        store: Arc<dyn MeasurementStore>,
        cache: CacheCoordinator,
        registry: Arc<StationRegistry>,
        evaluator: Arc<AlertEvaluator>,
        publisher: Publisher,
        queue_capacity: usize,
        reorder_window: Duration,
    ) -> Self {
        Self {
            stage: Arc::new(Stage {
                store,
                cache,
                registry,
                evaluator,
                publisher,
            }),
            queue_capacity: queue_capacity.max(1),
            reorder_window,
            workers: Mutex::new(HashMap::new()),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Persist a normalized measurement and feed it downstream.
    ///
    /// Resolves once the measurement is stored; rule evaluation follows
    /// after the reorder window.
    #[instrument(skip_all, fields(station = %measurement.station_id, ts = %measurement.timestamp))]
    pub async fn submit(&self, measurement: Measurement) -> CoreResult<Measurement> {
        // ---
        let (reply, rx) = oneshot::channel();
        let sender = self.worker(&measurement.station_id);
        sender
            .send(Job::Apply { measurement, reply })
            .await
            .map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())?
    }

    /// Release every buffered measurement to rule evaluation and wait
    /// until all stations have processed it.
    pub async fn flush(&self) {
        // ---
        let senders: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();

        for sender in senders {
            let (tx, rx) = oneshot::channel();
            if sender.send(Job::Flush(tx)).await.is_ok() {
                let _ = rx.await;
            }
        }
    }

    /// Close all station queues and wait for the workers to finish.
    pub async fn shutdown(&self) {
        // ---
        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        let handles: Vec<_> =
            std::mem::take(&mut *self.handles.lock().unwrap_or_else(|e| e.into_inner()));
        let count = handles.len();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Ingest worker failed");
            }
        }
        info!(workers = count, "Ingest pipeline stopped");
    }

    fn worker(&self, station_id: &str) -> mpsc::Sender<Job> {
        // ---
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sender) = workers.get(station_id) {
            return sender.clone();
        }

        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let stage = Arc::clone(&self.stage);
        let buffer = ReorderBuffer::new(self.reorder_window);
        let station = station_id.to_string();
        let handle = tokio::spawn(async move { stage.run(station, rx, buffer).await });

        self.handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
        workers.insert(station_id.to_string(), tx.clone());
        debug!(station = %station_id, "Ingest worker started");
        tx
    }
}

fn stopped() -> CoreError {
    CoreError::store("ingestion pipeline is shut down")
}

impl Stage {
    // ---
    async fn run(&self, station: String, mut jobs: mpsc::Receiver<Job>, mut buffer: ReorderBuffer) {
        // ---
        loop {
            let deadline = buffer.next_deadline().map(Instant::from_std);
            tokio::select! {
                job = jobs.recv() => match job {
                    Some(Job::Apply { measurement, reply }) => {
                        let result = self.apply(&measurement).await;
                        if let Ok(stored) = &result {
                            buffer.push(stored.clone(), std::time::Instant::now());
                        }
                        let _ = reply.send(result);
                        let ready = buffer.release(std::time::Instant::now());
                        self.evaluate(ready).await;
                    }
                    Some(Job::Flush(done)) => {
                        self.evaluate(buffer.flush()).await;
                        let _ = done.send(());
                    }
                    None => break,
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    let ready = buffer.release(std::time::Instant::now());
                    self.evaluate(ready).await;
                }
            }
        }

        self.evaluate(buffer.flush()).await;
        debug!(station = %station, "Ingest worker stopped");
    }

    /// Store, then update cache and live subscribers.
    async fn apply(&self, measurement: &Measurement) -> CoreResult<Measurement> {
        // ---
        let stored = self.store.upsert(measurement).await.map_err(|e| {
            warn!(station = %measurement.station_id, error = %e, "Store write failed");
            e
        })?;

        // A late report must not replace the cached newest reading
        let newest = self
            .registry
            .last_accepted(&stored.station_id)
            .map_or(true, |last| stored.timestamp >= last);
        self.registry
            .record_accepted(&stored.station_id, stored.timestamp);
        let invalidated = self.cache.invalidate(&stored.station_id, stored.timestamp);
        if newest {
            self.cache.put_latest(&stored);
        }
        self.publisher.publish_measurement(&stored);

        debug!(
            station = %stored.station_id,
            fields = stored.fields.len(),
            invalidated,
            "Measurement stored"
        );
        Ok(stored)
    }

    async fn evaluate(&self, released: Vec<Measurement>) {
        // ---
        for measurement in released {
            for fired in self.evaluator.evaluate(&measurement) {
                if let Err(e) = self.publisher.publish_alert(&fired).await {
                    error!(
                        rule_id = %fired.event.rule_id,
                        station = %fired.event.station_id,
                        error = %e,
                        "Alert could not be queued"
                    );
                }
            }
        }
    }
}
