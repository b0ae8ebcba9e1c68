//! Outbound transport seam.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

// ---

#[derive(Debug, Clone, Error, PartialEq)]
#[error("{0}")]
pub struct BusError(pub String);

/// Pub/sub transport the publisher delivers to.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BusError>;

    /// Transport name for logging
    fn name(&self) -> &'static str;
}

/// Bus that writes every message to the tracing log.
#[derive(Debug, Default)]
pub struct LogBus;

#[async_trait]
impl EventBus for LogBus {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BusError> {
        // ---
        info!(
            topic = %topic,
            payload = %String::from_utf8_lossy(payload),
            "Event published"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// In-process bus that records messages, with failure injection.
#[derive(Debug, Default)]
pub struct MemoryBus {
    messages: Mutex<Vec<(String, Vec<u8>)>>,
    fail_next: AtomicU32,
    unavailable: AtomicBool,
}

impl MemoryBus {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` publish attempts.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn messages(&self) -> Vec<(String, Vec<u8>)> {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Payloads published on `topic`, decoded as JSON.
    pub fn json_on(&self, topic: &str) -> Vec<serde_json::Value> {
        // ---
        self.messages()
            .into_iter()
            .filter(|(t, _)| t == topic)
            .filter_map(|(_, payload)| serde_json::from_slice(&payload).ok())
            .collect()
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BusError> {
        // ---
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BusError("bus unavailable".to_string()));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(BusError("injected failure".to_string()));
        }

        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((topic.to_string(), payload.to_vec()));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
