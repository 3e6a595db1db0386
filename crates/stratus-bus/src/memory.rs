//! In-process bus backend with the same contract as the Redis backend.
//! Used by tests and single-process local runs.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, RwLock};

use stratus_core::EventEnvelope;

use crate::{BusError, CoordinationBus, CHANNEL_CAPACITY};

#[derive(Debug, Clone)]
struct StoredValue {
    value: serde_json::Value,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }
}

/// In-memory key/value store with TTL expiry plus broadcast pub/sub.
#[derive(Default)]
pub struct MemoryBus {
    entries: Arc<RwLock<HashMap<String, StoredValue>>>,
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<EventEnvelope>>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    async fn sender_for(&self, channel: &str) -> broadcast::Sender<EventEnvelope> {
        let mut channels = self.channels.write().await;
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl CoordinationBus for MemoryBus {
    async fn put(
        &self,
        key: &str,
        value: &serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), BusError> {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            StoredValue {
                value: value.clone(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, BusError> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(stored) if !stored.is_expired(now) => {
                    return Ok(Some(stored.value.clone()))
                }
                None => return Ok(None),
                _ => {}
            }
        }
        // Lazily drop the expired entry.
        let mut entries = self.entries.write().await;
        if entries.get(key).map(|s| s.is_expired(now)).unwrap_or(false) {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, BusError> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(key, stored)| key.starts_with(prefix) && !stored.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn publish(&self, channel: &str, envelope: &EventEnvelope) -> Result<(), BusError> {
        let sender = self.sender_for(channel).await;
        // Best-effort, at-most-once: no subscribers simply drops the event.
        let _ = sender.send(envelope.clone());
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
    ) -> Result<broadcast::Receiver<EventEnvelope>, BusError> {
        Ok(self.sender_for(channel).await.subscribe())
    }
}
