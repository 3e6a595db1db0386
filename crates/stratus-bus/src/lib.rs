//! Coordination bus: a thin abstraction over a key/value store with
//! pub/sub (Redis-compatible), shared by every Stratus subsystem.
//!
//! Delivery is at-most-once and best-effort. Durability for replay comes
//! from the key/value side: every published envelope is also written under
//! `events:{producer}:{type}` with a bounded TTL, and consumers deduplicate
//! on the embedded event id.

pub mod handler;
pub mod memory;
pub mod redis_bus;

use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

use stratus_core::EventEnvelope;

pub use handler::{attach_handler, EventHandler};
pub use memory::MemoryBus;
pub use redis_bus::RedisBus;

/// Buffer depth for per-channel broadcast fan-out.
pub const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus unavailable: {0}")]
    Unavailable(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("subscription failed for channel {channel}: {reason}")]
    Subscription { channel: String, reason: String },
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        BusError::Serialization(err.to_string())
    }
}

/// Key/value + pub/sub contract shared by the Redis and in-memory backends.
#[async_trait]
pub trait CoordinationBus: Send + Sync {
    /// Store a JSON value, optionally bounded by a TTL.
    async fn put(
        &self,
        key: &str,
        value: &serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), BusError>;

    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, BusError>;

    /// All keys starting with `prefix`.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, BusError>;

    async fn publish(&self, channel: &str, envelope: &EventEnvelope) -> Result<(), BusError>;

    /// Subscribe to a channel; the receiver observes every envelope
    /// published after the call.
    async fn subscribe(&self, channel: &str)
        -> Result<broadcast::Receiver<EventEnvelope>, BusError>;

    /// Whether the backend has entered degraded mode after persistent
    /// failures. Degraded mode disables automatic rollback downstream so
    /// the engine never acts without state confirmation.
    fn is_degraded(&self) -> bool {
        false
    }
}

/// Extension helpers shared by all backends.
#[async_trait]
pub trait CoordinationBusExt: CoordinationBus {
    /// Publish an envelope and persist it for replay under its
    /// `events:{producer}:{type}` key.
    async fn publish_with_replay(
        &self,
        channel: &str,
        envelope: &EventEnvelope,
        replay_ttl: Duration,
    ) -> Result<(), BusError> {
        let value = serde_json::to_value(envelope)?;
        self.put(&envelope.replay_key(), &value, Some(replay_ttl)).await?;
        self.publish(channel, envelope).await
    }

    /// Typed put: serialize any model type to its JSON bus representation.
    async fn put_json<T: serde::Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), BusError> {
        let value = serde_json::to_value(value)?;
        self.put(key, &value, ttl).await
    }

    /// Typed get.
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, BusError> {
        match self.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl<B: CoordinationBus + ?Sized> CoordinationBusExt for B {}

/// Bounded window of observed event ids, used by consumers to make
/// replayed deliveries idempotent.
#[derive(Debug)]
pub struct SeenEvents {
    order: VecDeque<Uuid>,
    seen: HashSet<Uuid>,
    capacity: usize,
}

impl SeenEvents {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Returns true the first time an event id is observed.
    pub fn observe(&mut self, event_id: Uuid) -> bool {
        if self.seen.contains(&event_id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.order.push_back(event_id);
        self.seen.insert(event_id);
        true
    }
}
