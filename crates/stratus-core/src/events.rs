//! Typed event envelope and channel naming shared by all producers.
//!
//! Delivery is at-most-once and best-effort; durability for replay comes
//! from the key/value side of the bus. Producers embed a unique event id so
//! consumers can make replayed deliveries idempotent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Pub/sub channel names.
pub mod channels {
    pub const PLACEMENT: &str = "placement.events";
    pub const DEPLOYMENT: &str = "deployment.events";
    pub const ROLLBACK: &str = "rollback.events";
    pub const RECOVERY: &str = "recovery.events";
    pub const MONITORING: &str = "monitoring.events";
    pub const GEO: &str = "geo.events";
}

/// Wire envelope for every published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique per publication; replays carry the same id.
    #[serde(rename = "eventId")]
    pub event_id: Uuid,
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "swarmId")]
    pub swarm_id: String,
    #[serde(rename = "producerId")]
    pub producer_id: String,
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    pub fn new(
        event_type: impl Into<String>,
        swarm_id: impl Into<String>,
        producer_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            swarm_id: swarm_id.into(),
            producer_id: producer_id.into(),
            payload,
        }
    }

    /// Key under which the envelope is persisted for replay.
    pub fn replay_key(&self) -> String {
        format!("events:{}:{}", self.producer_id, self.event_type)
    }
}
