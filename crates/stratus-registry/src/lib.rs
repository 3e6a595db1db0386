//! Node/task registry: the canonical in-memory model of the cluster,
//! reconstructed from the bus on startup and written through on change.
//!
//! The registry is the sole owner of node state; regions are views computed
//! from node tags and locations, never stored back onto nodes. Optimizers
//! read cloned snapshots and never mutate registry state directly.

pub mod region;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use stratus_bus::{BusError, CoordinationBus, CoordinationBusExt};
use stratus_core::{
    channels, EventEnvelope, GeoLocation, Node, NodeStatus, Placement, RegistryConfig,
    ResourceAxis, ResourceVector, Task,
};

pub use region::{RegionHealth, RegionView};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("node {0} is not registered")]
    NodeNotFound(String),

    #[error("task {0} is not registered")]
    TaskNotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Partial runtime metrics merged into a node record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeMetricsUpdate {
    pub utilization: Option<ResourceVector>,
    pub latency_ms: Option<f64>,
    pub throughput: Option<f64>,
    pub reliability: Option<f64>,
    pub availability: Option<f64>,
    pub status: Option<NodeStatus>,
}

pub struct NodeRegistry {
    bus: Arc<dyn CoordinationBus>,
    config: RegistryConfig,
    swarm_id: String,
    producer_id: String,
    nodes: Arc<RwLock<HashMap<String, Node>>>,
    tasks: Arc<RwLock<HashMap<String, Task>>>,
    regions: Arc<RwLock<HashMap<String, RegionView>>>,
}

impl NodeRegistry {
    pub fn new(
        bus: Arc<dyn CoordinationBus>,
        config: RegistryConfig,
        swarm_id: impl Into<String>,
        producer_id: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            config,
            swarm_id: swarm_id.into(),
            producer_id: producer_id.into(),
            nodes: Arc::new(RwLock::new(HashMap::new())),
            tasks: Arc::new(RwLock::new(HashMap::new())),
            regions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Rebuild the in-memory model from the bus. Called once on startup.
    pub async fn restore(&self) -> Result<usize, RegistryError> {
        let mut restored = 0;
        for key in self.bus.list_keys("nodes:").await? {
            match self.bus.get_json::<Node>(&key).await {
                Ok(Some(node)) => {
                    self.nodes.write().await.insert(node.id.clone(), node);
                    restored += 1;
                }
                Ok(None) => {}
                Err(err) => warn!(%key, error = %err, "skipping unreadable node record"),
            }
        }
        for key in self.bus.list_keys("tasks:").await? {
            match self.bus.get_json::<Task>(&key).await {
                Ok(Some(task)) => {
                    self.tasks.write().await.insert(task.id.clone(), task);
                }
                Ok(None) => {}
                Err(err) => warn!(%key, error = %err, "skipping unreadable task record"),
            }
        }
        self.recompute_regions().await;
        info!(nodes = restored, "registry restored from bus");
        Ok(restored)
    }

    pub async fn register_node(&self, node: Node) -> Result<(), RegistryError> {
        if node.id.is_empty() {
            return Err(RegistryError::InvalidInput("node id must not be empty".into()));
        }
        if ResourceAxis::ALL.iter().any(|axis| node.capacity.axis(*axis) < 0.0) {
            return Err(RegistryError::InvalidInput(format!(
                "node {} has negative capacity",
                node.id
            )));
        }

        self.bus
            .put_json(
                &format!("nodes:{}", node.id),
                &node,
                Some(Duration::from_secs(self.config.node_ttl_secs)),
            )
            .await?;

        let envelope = EventEnvelope::new(
            "node.registered",
            &self.swarm_id,
            &self.producer_id,
            serde_json::json!({ "nodeId": node.id, "region": node.region }),
        );
        self.publish(&envelope).await?;

        self.nodes.write().await.insert(node.id.clone(), node);
        self.recompute_regions().await;
        Ok(())
    }

    pub async fn deregister_node(&self, node_id: &str) -> Result<(), RegistryError> {
        let removed = self.nodes.write().await.remove(node_id);
        let node = removed.ok_or_else(|| RegistryError::NodeNotFound(node_id.to_string()))?;

        // Tombstone with a short TTL so other processes converge.
        self.bus
            .put_json(
                &format!("nodes:{}", node.id),
                &serde_json::json!({ "deregistered": true }),
                Some(Duration::from_secs(60)),
            )
            .await?;

        let envelope = EventEnvelope::new(
            "node.deregistered",
            &self.swarm_id,
            &self.producer_id,
            serde_json::json!({ "nodeId": node_id }),
        );
        self.publish(&envelope).await?;
        self.recompute_regions().await;
        Ok(())
    }

    pub async fn register_task(&self, task: Task) -> Result<(), RegistryError> {
        if task.id.is_empty() {
            return Err(RegistryError::InvalidInput("task id must not be empty".into()));
        }
        let until_deadline = (task.deadline - Utc::now()).num_seconds().max(0) as u64;
        let ttl = Duration::from_secs(until_deadline + self.config.task_ttl_grace_secs);
        self.bus
            .put_json(&format!("tasks:{}", task.id), &task, Some(ttl))
            .await?;
        self.tasks.write().await.insert(task.id.clone(), task);
        Ok(())
    }

    /// Merge observed runtime metrics into a node and refresh the bus
    /// record (which also renews its TTL).
    pub async fn update_metrics(
        &self,
        node_id: &str,
        update: NodeMetricsUpdate,
    ) -> Result<(), RegistryError> {
        let node = {
            let mut nodes = self.nodes.write().await;
            let node = nodes
                .get_mut(node_id)
                .ok_or_else(|| RegistryError::NodeNotFound(node_id.to_string()))?;
            if let Some(utilization) = update.utilization {
                node.utilization = utilization;
            }
            if let Some(latency) = update.latency_ms {
                node.performance.latency_ms = latency;
            }
            if let Some(throughput) = update.throughput {
                node.performance.throughput = throughput;
            }
            if let Some(reliability) = update.reliability {
                node.performance.reliability = reliability.clamp(0.0, 1.0);
            }
            if let Some(availability) = update.availability {
                node.performance.availability = availability.clamp(0.0, 1.0);
            }
            if let Some(status) = update.status {
                node.status = status;
            }
            node.clone()
        };

        self.bus
            .put_json(
                &format!("nodes:{}", node.id),
                &node,
                Some(Duration::from_secs(self.config.node_ttl_secs)),
            )
            .await?;

        let envelope = EventEnvelope::new(
            "node.metrics.updated",
            &self.swarm_id,
            &self.producer_id,
            serde_json::json!({ "nodeId": node_id }),
        );
        self.publish(&envelope).await?;
        self.recompute_regions().await;
        Ok(())
    }

    /// Fold a committed placement's demands into node utilization.
    /// Conflicting concurrent commits resolve last-writer-wins; the engine
    /// runs a post-commit validity check on top.
    pub async fn commit_placement(
        &self,
        placement: &Placement,
        tasks: &[Task],
    ) -> Result<(), RegistryError> {
        let demand_by_task: HashMap<&str, &ResourceVector> =
            tasks.iter().map(|task| (task.id.as_str(), &task.demand)).collect();

        let mut nodes = self.nodes.write().await;
        for assignment in &placement.assignments {
            let node = nodes
                .get_mut(&assignment.node_id)
                .ok_or_else(|| RegistryError::NodeNotFound(assignment.node_id.clone()))?;
            if let Some(demand) = demand_by_task.get(assignment.task_id.as_str()) {
                for axis in ResourceAxis::ALL {
                    let capacity = node.capacity.axis(axis);
                    if capacity > 0.0 {
                        let share = demand.axis(axis) / capacity;
                        let slot = node.utilization.axis_mut(axis);
                        *slot = (*slot + share).min(1.0);
                    }
                }
            }
        }
        drop(nodes);
        self.recompute_regions().await;
        debug!(placement = %placement.id, "placement committed to registry");
        Ok(())
    }

    pub async fn node(&self, node_id: &str) -> Option<Node> {
        self.nodes.read().await.get(node_id).cloned()
    }

    pub async fn task(&self, task_id: &str) -> Option<Task> {
        self.tasks.read().await.get(task_id).cloned()
    }

    /// Cloned snapshot of all nodes; optimizers reason over this copy.
    pub async fn nodes_snapshot(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.nodes.read().await.values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    pub async fn nodes_by_region(&self, region: &str) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .nodes
            .read()
            .await
            .values()
            .filter(|node| node.region == region)
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    pub async fn region_views(&self) -> Vec<RegionView> {
        let mut views: Vec<RegionView> = self.regions.read().await.values().cloned().collect();
        views.sort_by(|a, b| a.id.cmp(&b.id));
        views
    }

    pub async fn region_view(&self, region: &str) -> Option<RegionView> {
        self.regions.read().await.get(region).cloned()
    }

    /// Nearest region to a location by Haversine distance over region
    /// centroids; ties break by region id lexicographically.
    pub async fn region_for(&self, location: &GeoLocation) -> Option<String> {
        let regions = self.regions.read().await;
        let mut best: Option<(f64, &str)> = None;
        for view in regions.values() {
            let distance = location.distance_km(&view.centroid);
            best = match best {
                None => Some((distance, view.id.as_str())),
                Some((best_distance, best_id)) => {
                    if distance < best_distance
                        || (distance == best_distance && view.id.as_str() < best_id)
                    {
                        Some((distance, view.id.as_str()))
                    } else {
                        Some((best_distance, best_id))
                    }
                }
            };
        }
        best.map(|(_, id)| id.to_string())
    }

    async fn recompute_regions(&self) {
        let nodes = self.nodes.read().await;
        let mut grouped: HashMap<String, Vec<&Node>> = HashMap::new();
        for node in nodes.values() {
            grouped.entry(node.region.clone()).or_default().push(node);
        }

        let threshold = self.config.region_health_threshold;
        let views: HashMap<String, RegionView> = grouped
            .into_iter()
            .map(|(region, members)| {
                let view = RegionView::compute(&region, &members, threshold);
                (region, view)
            })
            .collect();
        *self.regions.write().await = views;
    }

    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), RegistryError> {
        self.bus
            .publish_with_replay(channels::MONITORING, envelope, Duration::from_secs(3600))
            .await?;
        Ok(())
    }
}
