//! Geographic distributor: region-aware pre-placement.
//!
//! For every task the distributor resolves a preferred region, checks
//! capacity-feasible healthy candidates there, and emits a
//! `taskId -> region` hint map the placement optimizer consumes as soft
//! constraints. Sovereignty makes a hint hard; the optimizer may override
//! soft hints when the global objective wins.

use chrono::Utc;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use stratus_bus::{BusError, CoordinationBus, CoordinationBusExt};
use stratus_core::{
    channels, EventEnvelope, GeoConfig, LocationPreference, Node, RegionHint, ResourceAxis, Task,
};
use stratus_registry::{NodeRegistry, RegionView};

#[derive(Debug, Error)]
pub enum GeoError {
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Distribution strategy selected by the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionStrategy {
    LatencyOptimized,
    CostOptimized,
    Balanced,
    ComplianceAware,
}

impl DistributionStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            DistributionStrategy::LatencyOptimized => "latency_optimized",
            DistributionStrategy::CostOptimized => "cost_optimized",
            DistributionStrategy::Balanced => "balanced",
            DistributionStrategy::ComplianceAware => "compliance_aware",
        }
    }
}

/// Per-strategy multipliers applied to the configured base weights.
struct StrategyPreset {
    region: f64,
    latency: f64,
    load: f64,
    cost: f64,
    compliance: f64,
}

static STRATEGY_PRESETS: Lazy<HashMap<&'static str, StrategyPreset>> = Lazy::new(|| {
    HashMap::from([
        (
            "latency_optimized",
            StrategyPreset { region: 1.0, latency: 2.0, load: 1.0, cost: 0.5, compliance: 1.0 },
        ),
        (
            "cost_optimized",
            StrategyPreset { region: 1.0, latency: 0.5, load: 1.0, cost: 2.0, compliance: 1.0 },
        ),
        (
            "balanced",
            StrategyPreset { region: 1.0, latency: 1.0, load: 1.0, cost: 1.0, compliance: 1.0 },
        ),
        (
            "compliance_aware",
            StrategyPreset { region: 1.0, latency: 1.0, load: 1.0, cost: 1.0, compliance: 2.0 },
        ),
    ])
});

/// The tentative `taskId -> region` map handed to the optimizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionPlan {
    pub strategy: String,
    pub hints: HashMap<String, RegionHint>,
    /// Tasks for which no in-region candidate was found and the fallback
    /// (any healthy feasible node) applies.
    pub unplaced: Vec<String>,
    pub generated_at: chrono::DateTime<Utc>,
}

pub struct GeographicDistributor {
    bus: Arc<dyn CoordinationBus>,
    registry: Arc<NodeRegistry>,
    config: GeoConfig,
    swarm_id: String,
    producer_id: String,
}

impl GeographicDistributor {
    pub fn new(
        bus: Arc<dyn CoordinationBus>,
        registry: Arc<NodeRegistry>,
        config: GeoConfig,
        swarm_id: impl Into<String>,
        producer_id: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            registry,
            config,
            swarm_id: swarm_id.into(),
            producer_id: producer_id.into(),
        }
    }

    /// Build the distribution plan for a batch of tasks.
    pub async fn plan(
        &self,
        tasks: &[Task],
        strategy: DistributionStrategy,
    ) -> Result<DistributionPlan, GeoError> {
        let regions = self.registry.region_views().await;
        let nodes = self.registry.nodes_snapshot().await;

        let mut hints = HashMap::new();
        let mut unplaced = Vec::new();

        for task in tasks {
            match self.resolve_region(task, &regions, &nodes, strategy).await {
                Some(hint) => {
                    hints.insert(task.id.clone(), hint);
                }
                None => unplaced.push(task.id.clone()),
            }
        }

        let plan = DistributionPlan {
            strategy: strategy.name().to_string(),
            hints,
            unplaced,
            generated_at: Utc::now(),
        };

        let envelope = EventEnvelope::new(
            "geo.distribution.completed",
            &self.swarm_id,
            &self.producer_id,
            serde_json::json!({
                "strategy": plan.strategy,
                "tasks": tasks.len(),
                "hinted": plan.hints.len(),
                "unplaced": plan.unplaced.len(),
            }),
        );
        self.bus
            .publish_with_replay(channels::GEO, &envelope, Duration::from_secs(3600))
            .await?;

        info!(
            strategy = plan.strategy,
            hinted = plan.hints.len(),
            unplaced = plan.unplaced.len(),
            "geographic distribution planned"
        );
        Ok(plan)
    }

    /// Resolve the preferred region for one task:
    /// sovereignty (hard) > explicit region preference > preferred point >
    /// best-scoring region by health/load/latency/cost.
    async fn resolve_region(
        &self,
        task: &Task,
        regions: &[RegionView],
        nodes: &[Node],
        strategy: DistributionStrategy,
    ) -> Option<RegionHint> {
        if let Some(required) = task.sovereign_region() {
            // Sovereignty keeps the region eligible even when unhealthy.
            return Some(RegionHint { region: required.to_string(), hard: true });
        }

        let candidate_regions: Vec<&RegionView> = regions
            .iter()
            .filter(|view| view.healthy)
            .filter(|view| {
                strategy != DistributionStrategy::ComplianceAware
                    || task.region_allowed(&view.id)
            })
            .collect();

        if let Some(LocationPreference::Region(region)) = &task.location_preference {
            if self.region_has_candidate(region, task, nodes) && task.region_allowed(region) {
                return Some(RegionHint { region: region.clone(), hard: false });
            }
        }

        if let Some(LocationPreference::Point(point)) = &task.location_preference {
            if let Some(region) = self.registry.region_for(point).await {
                if self.region_has_candidate(&region, task, nodes) && task.region_allowed(&region)
                {
                    return Some(RegionHint { region, hard: false });
                }
            }
        }

        // Score remaining healthy regions that can actually take the task.
        let preset = STRATEGY_PRESETS
            .get(strategy.name())
            .unwrap_or(&STRATEGY_PRESETS["balanced"]);
        let mut best: Option<(f64, &RegionView)> = None;
        for &view in &candidate_regions {
            if !task.region_allowed(&view.id) {
                continue;
            }
            if !self.region_has_candidate(&view.id, task, nodes) {
                continue;
            }
            let score = self.score_region(view, task, nodes, preset);
            best = match best {
                None => Some((score, view)),
                Some((best_score, best_view)) => {
                    if score > best_score
                        || (score == best_score && view.id < best_view.id)
                    {
                        Some((score, view))
                    } else {
                        Some((best_score, best_view))
                    }
                }
            };
        }
        if let Some((score, view)) = best {
            debug!(task = %task.id, region = %view.id, score, "region scored");
            return Some(RegionHint { region: view.id.clone(), hard: false });
        }

        // Fallback: any healthy feasible node, regardless of region health.
        nodes
            .iter()
            .filter(|node| node.is_healthy() && node.can_host(task))
            .find(|node| Self::node_feasible(node, task) && task.region_allowed(&node.region))
            .map(|node| RegionHint { region: node.region.clone(), hard: false })
    }

    fn score_region(
        &self,
        view: &RegionView,
        task: &Task,
        nodes: &[Node],
        preset: &StrategyPreset,
    ) -> f64 {
        let preference_match = match &task.location_preference {
            Some(LocationPreference::Region(region)) if *region == view.id => 1.0,
            _ => 0.0,
        };
        let compliance_match = if task.region_allowed(&view.id) { 1.0 } else { 0.0 };

        // Cost score: cheaper mean blended unit cost scores higher.
        let members: Vec<&Node> = nodes.iter().filter(|n| n.region == view.id).collect();
        let mean_cost = if members.is_empty() {
            0.0
        } else {
            members
                .iter()
                .map(|n| {
                    n.unit_costs.per_compute
                        + n.unit_costs.per_memory
                        + n.unit_costs.per_bandwidth
                        + n.unit_costs.per_storage
                })
                .sum::<f64>()
                / members.len() as f64
        };
        let cost_score = 1.0 / (1.0 + mean_cost);

        self.config.region_weight * preset.region * preference_match
            + self.config.latency_weight * preset.latency * view.health.latency_score
            + self.config.load_weight * preset.load * view.health.load_score
            + self.config.cost_weight * preset.cost * cost_score
            + self.config.compliance_weight * preset.compliance * compliance_match
    }

    fn region_has_candidate(&self, region: &str, task: &Task, nodes: &[Node]) -> bool {
        nodes.iter().any(|node| {
            node.region == region
                && node.is_healthy()
                && node.can_host(task)
                && Self::node_feasible(node, task)
        })
    }

    /// Capacity feasibility against remaining headroom.
    fn node_feasible(node: &Node, task: &Task) -> bool {
        ResourceAxis::ALL.iter().all(|axis| {
            let headroom = node.capacity.axis(*axis) * (1.0 - node.utilization.axis(*axis));
            task.demand.axis(*axis) <= headroom
        })
    }

    /// Persist a periodic geographic distribution snapshot under
    /// `metrics:geo:{ts}`.
    pub async fn snapshot_metrics(&self) -> Result<(), GeoError> {
        let regions = self.registry.region_views().await;
        let timestamp = Utc::now().timestamp_millis();
        let payload = serde_json::json!({
            "timestamp": timestamp,
            "regions": regions
                .iter()
                .map(|view| {
                    serde_json::json!({
                        "id": view.id,
                        "nodes": view.node_ids.len(),
                        "health": view.health.overall,
                        "healthy": view.healthy,
                    })
                })
                .collect::<Vec<_>>(),
        });
        self.bus
            .put(
                &format!("metrics:geo:{timestamp}"),
                &payload,
                Some(Duration::from_secs(24 * 3600)),
            )
            .await?;
        Ok(())
    }

    /// Spawn the periodic snapshot loop. Runs until the returned handle
    /// is aborted or the process exits.
    pub fn start_snapshots(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let distributor = self;
        let period = Duration::from_secs(distributor.config.snapshot_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if let Err(err) = distributor.snapshot_metrics().await {
                    tracing::warn!(error = %err, "geo snapshot failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use stratus_bus::MemoryBus;
    use stratus_core::{
        GeoLocation, NodePerformance, NodeStatus, RegistryConfig, ResourceVector, UnitCosts,
    };

    fn node(id: &str, region: &str, latency: f64, cost: f64) -> Node {
        Node {
            id: id.to_string(),
            region: region.to_string(),
            location: GeoLocation::new(0.0, 0.0),
            capacity: ResourceVector::new(100.0, 100.0, 100.0, 100.0),
            utilization: ResourceVector::zero(),
            unit_costs: UnitCosts {
                per_compute: cost,
                per_memory: 0.0,
                per_bandwidth: 0.0,
                per_storage: 0.0,
            },
            performance: NodePerformance { latency_ms: latency, ..NodePerformance::default() },
            capabilities: BTreeSet::new(),
            supported_tasks: BTreeSet::new(),
            status: NodeStatus::Healthy,
        }
    }

    fn task(id: &str) -> Task {
        Task {
            id: id.to_string(),
            demand: ResourceVector::new(10.0, 10.0, 10.0, 10.0),
            priority: 1,
            deadline: Utc::now() + chrono::Duration::hours(1),
            estimated_duration_ms: 60_000,
            affinity: BTreeSet::new(),
            anti_affinity: BTreeSet::new(),
            location_preference: None,
            data_sovereignty: None,
            compliance_regions: None,
        }
    }

    async fn distributor_with(nodes: Vec<Node>) -> GeographicDistributor {
        let bus: Arc<dyn CoordinationBus> = Arc::new(MemoryBus::new());
        let registry = Arc::new(NodeRegistry::new(
            bus.clone(),
            RegistryConfig::default(),
            "swarm-test",
            "registry-test",
        ));
        for n in nodes {
            registry.register_node(n).await.unwrap();
        }
        GeographicDistributor::new(bus, registry, GeoConfig::default(), "swarm-test", "geo-test")
    }

    #[tokio::test]
    async fn sovereignty_produces_hard_hint() {
        let distributor = distributor_with(vec![
            node("n1", "eu-west", 10.0, 5.0),
            node("n2", "us-east", 5.0, 1.0),
        ])
        .await;
        let mut t = task("t1");
        t.data_sovereignty = Some("eu-west".to_string());

        let plan = distributor
            .plan(&[t], DistributionStrategy::CostOptimized)
            .await
            .unwrap();
        let hint = &plan.hints["t1"];
        assert_eq!(hint.region, "eu-west");
        assert!(hint.hard);
    }

    #[tokio::test]
    async fn explicit_region_preference_wins_over_scoring() {
        let distributor = distributor_with(vec![
            node("n1", "eu-west", 100.0, 5.0),
            node("n2", "us-east", 5.0, 1.0),
        ])
        .await;
        let mut t = task("t1");
        t.location_preference = Some(LocationPreference::Region("eu-west".to_string()));

        let plan = distributor
            .plan(&[t], DistributionStrategy::LatencyOptimized)
            .await
            .unwrap();
        assert_eq!(plan.hints["t1"].region, "eu-west");
        assert!(!plan.hints["t1"].hard);
    }

    #[tokio::test]
    async fn latency_strategy_prefers_fast_region() {
        let distributor = distributor_with(vec![
            node("n1", "eu-west", 400.0, 1.0),
            node("n2", "us-east", 10.0, 1.0),
        ])
        .await;
        let plan = distributor
            .plan(&[task("t1")], DistributionStrategy::LatencyOptimized)
            .await
            .unwrap();
        assert_eq!(plan.hints["t1"].region, "us-east");
    }

    #[tokio::test]
    async fn compliance_aware_respects_allow_list() {
        let distributor = distributor_with(vec![
            node("n1", "eu-west", 50.0, 5.0),
            node("n2", "us-east", 5.0, 1.0),
        ])
        .await;
        let mut t = task("t1");
        t.compliance_regions = Some(["eu-west".to_string()].into());

        let plan = distributor
            .plan(&[t], DistributionStrategy::ComplianceAware)
            .await
            .unwrap();
        assert_eq!(plan.hints["t1"].region, "eu-west");
    }

    #[tokio::test]
    async fn infeasible_everywhere_lands_in_unplaced() {
        let distributor = distributor_with(vec![node("n1", "eu-west", 10.0, 1.0)]).await;
        let mut t = task("t1");
        t.demand = ResourceVector::new(1000.0, 0.0, 0.0, 0.0);

        let plan = distributor
            .plan(&[t], DistributionStrategy::Balanced)
            .await
            .unwrap();
        assert!(plan.hints.is_empty());
        assert_eq!(plan.unplaced, vec!["t1"]);
    }

    #[tokio::test]
    async fn snapshot_is_written_under_metrics_prefix() {
        let bus: Arc<dyn CoordinationBus> = Arc::new(MemoryBus::new());
        let registry = Arc::new(NodeRegistry::new(
            bus.clone(),
            RegistryConfig::default(),
            "swarm-test",
            "registry-test",
        ));
        registry.register_node(node("n1", "eu-west", 10.0, 1.0)).await.unwrap();
        let distributor = GeographicDistributor::new(
            bus.clone(),
            registry,
            GeoConfig::default(),
            "swarm-test",
            "geo-test",
        );
        distributor.snapshot_metrics().await.unwrap();
        let keys = bus.list_keys("metrics:geo:").await.unwrap();
        assert_eq!(keys.len(), 1);
    }
}
