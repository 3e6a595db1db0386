//! Snapshot capture and retention.
//!
//! A snapshot is the immutable capture of configuration plus health and
//! performance baselines sufficient to restore the previous deployment
//! state. Snapshots are TTL-bound on the bus and indexed per deployment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use stratus_bus::{BusError, CoordinationBus, CoordinationBusExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthBaseline {
    pub overall: HealthState,
    /// Per-check pass/fail at capture time.
    pub checks: HashMap<String, bool>,
}

impl HealthBaseline {
    pub fn healthy() -> Self {
        Self { overall: HealthState::Healthy, checks: HashMap::new() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceBaseline {
    pub p50_response_ms: f64,
    pub p95_response_ms: f64,
    pub error_rate: f64,
    pub availability: f64,
}

impl Default for PerformanceBaseline {
    fn default() -> Self {
        Self { p50_response_ms: 50.0, p95_response_ms: 200.0, error_rate: 0.0, availability: 1.0 }
    }
}

/// Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: Uuid,
    pub deployment_id: Uuid,
    pub version: String,
    pub configuration: serde_json::Value,
    /// Optional database state capture; rollback skips data restore when
    /// absent.
    pub db_state: Option<serde_json::Value>,
    pub health_baseline: HealthBaseline,
    pub performance_baseline: PerformanceBaseline,
    pub created_at: DateTime<Utc>,
}

pub struct SnapshotStore {
    bus: Arc<dyn CoordinationBus>,
    retention: Duration,
    by_deployment: Arc<RwLock<HashMap<Uuid, Vec<Snapshot>>>>,
}

impl SnapshotStore {
    pub fn new(bus: Arc<dyn CoordinationBus>, retention: Duration) -> Self {
        Self { bus, retention, by_deployment: Arc::new(RwLock::new(HashMap::new())) }
    }

    /// Capture and persist a snapshot.
    pub async fn capture(
        &self,
        deployment_id: Uuid,
        version: &str,
        configuration: serde_json::Value,
        db_state: Option<serde_json::Value>,
        health_baseline: HealthBaseline,
        performance_baseline: PerformanceBaseline,
    ) -> Result<Snapshot, BusError> {
        let snapshot = Snapshot {
            id: Uuid::new_v4(),
            deployment_id,
            version: version.to_string(),
            configuration,
            db_state,
            health_baseline,
            performance_baseline,
            created_at: Utc::now(),
        };
        self.bus
            .put_json(
                &format!("snapshots:{}", snapshot.id),
                &snapshot,
                Some(self.retention),
            )
            .await?;
        self.by_deployment
            .write()
            .await
            .entry(deployment_id)
            .or_default()
            .push(snapshot.clone());
        info!(snapshot = %snapshot.id, deployment = %deployment_id, "snapshot captured");
        Ok(snapshot)
    }

    pub async fn get(&self, snapshot_id: Uuid) -> Option<Snapshot> {
        let index = self.by_deployment.read().await;
        index
            .values()
            .flat_map(|snapshots| snapshots.iter())
            .find(|snapshot| snapshot.id == snapshot_id)
            .cloned()
    }

    /// Snapshot selection for rollback: the most recent snapshot with a
    /// healthy baseline, else the most recent.
    pub async fn select_for_rollback(&self, deployment_id: Uuid) -> Option<Snapshot> {
        let index = self.by_deployment.read().await;
        let snapshots = index.get(&deployment_id)?;
        snapshots
            .iter()
            .rev()
            .find(|snapshot| snapshot.health_baseline.overall == HealthState::Healthy)
            .or_else(|| snapshots.last())
            .cloned()
    }

    pub async fn count_for(&self, deployment_id: Uuid) -> usize {
        self.by_deployment
            .read()
            .await
            .get(&deployment_id)
            .map(|snapshots| snapshots.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_bus::MemoryBus;

    fn store() -> SnapshotStore {
        SnapshotStore::new(Arc::new(MemoryBus::new()), Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn capture_persists_to_bus() {
        let bus: Arc<dyn CoordinationBus> = Arc::new(MemoryBus::new());
        let store = SnapshotStore::new(bus.clone(), Duration::from_secs(3600));
        let deployment = Uuid::new_v4();
        let snapshot = store
            .capture(
                deployment,
                "1.0.0",
                serde_json::json!({"replicas": 2}),
                None,
                HealthBaseline::healthy(),
                PerformanceBaseline::default(),
            )
            .await
            .unwrap();

        let stored: Snapshot = bus
            .get_json(&format!("snapshots:{}", snapshot.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored, snapshot);
    }

    #[tokio::test]
    async fn rollback_selection_prefers_latest_healthy() {
        let store = store();
        let deployment = Uuid::new_v4();

        let healthy = store
            .capture(
                deployment,
                "1.0.0",
                serde_json::json!({}),
                None,
                HealthBaseline::healthy(),
                PerformanceBaseline::default(),
            )
            .await
            .unwrap();
        store
            .capture(
                deployment,
                "1.1.0",
                serde_json::json!({}),
                None,
                HealthBaseline {
                    overall: HealthState::Degraded,
                    checks: HashMap::new(),
                },
                PerformanceBaseline::default(),
            )
            .await
            .unwrap();

        let selected = store.select_for_rollback(deployment).await.unwrap();
        assert_eq!(selected.id, healthy.id);
    }

    #[tokio::test]
    async fn rollback_selection_falls_back_to_latest() {
        let store = store();
        let deployment = Uuid::new_v4();
        let degraded = HealthBaseline { overall: HealthState::Degraded, checks: HashMap::new() };
        store
            .capture(deployment, "1.0.0", serde_json::json!({}), None, degraded.clone(), PerformanceBaseline::default())
            .await
            .unwrap();
        let last = store
            .capture(deployment, "1.1.0", serde_json::json!({}), None, degraded, PerformanceBaseline::default())
            .await
            .unwrap();
        let selected = store.select_for_rollback(deployment).await.unwrap();
        assert_eq!(selected.id, last.id);
    }
}
