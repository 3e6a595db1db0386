//! Engine context: one process-wide struct owning every subsystem,
//! constructed at startup and passed explicitly. This is the operator
//! surface: `optimize`, `deploy`, `rollback`, `initiate_recovery`,
//! `status` and `cancel`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use stratus_bus::{BusError, CoordinationBus, CoordinationBusExt, MemoryBus, RedisBus};
use stratus_core::{
    channels, BusMode, EngineConfig, EventEnvelope, Node, OptimizationConstraints, Placement,
    ResourceAxis, Task,
};
use stratus_deploy::{
    ApplicationConfig, DeploymentCoordinator, DeploymentError, DeploymentExecution,
    DeploymentOptions, HealthProbe, MetricsSource, RollbackManager, SnapshotStore, StaticProbe,
};
use stratus_geo::{DistributionStrategy, GeoError, GeographicDistributor};
use stratus_optimizer::{
    Algorithm, OptimizationReport, OptimizationRequest, PlacementOptimizer,
};
use stratus_predictor::{ContextTracker, ObservedOutcome, PerformancePredictor};
use stratus_recovery::{
    DeploymentRollbackHook, ErrorData, RecoveryError, RecoveryExecution, RecoveryOrchestrator,
    SimulatedExecutor, StepExecutor, StrategyRegistry,
};
use stratus_registry::{NodeRegistry, RegistryError};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Geo(#[from] GeoError),

    #[error(transparent)]
    Deployment(#[from] DeploymentError),

    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    #[error("unknown id: {0}")]
    UnknownId(Uuid),

    #[error("unknown node or task: {0}")]
    UnknownEntity(String),
}

/// Options for one optimization run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizeOptions {
    pub distribution: DistributionStrategy,
    pub time_budget_ms: u64,
    pub preferred_algorithm: Option<Algorithm>,
}

impl Default for OptimizeOptions {
    fn default() -> Self {
        Self {
            distribution: DistributionStrategy::Balanced,
            time_budget_ms: 5_000,
            preferred_algorithm: None,
        }
    }
}

/// Operator-facing status of a long-running id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum StatusReport {
    Deployment { execution: DeploymentExecution },
    Rollback { outcome: stratus_deploy::RollbackOutcome },
    Recovery { execution: RecoveryExecution },
    Placement { placement: Placement },
}

/// Builder for the engine context; tests swap in scripted probes and
/// executors, production keeps the defaults.
pub struct EngineBuilder {
    config: EngineConfig,
    bus: Option<Arc<dyn CoordinationBus>>,
    probe: Option<Arc<dyn HealthProbe>>,
    metrics: Option<Arc<dyn MetricsSource>>,
    executor: Option<Arc<dyn StepExecutor>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self { config, bus: None, probe: None, metrics: None, executor: None }
    }

    pub fn bus(mut self, bus: Arc<dyn CoordinationBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSource>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn step_executor(mut self, executor: Arc<dyn StepExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub async fn build(self) -> Result<Engine, EngineError> {
        let config = self.config;
        let bus: Arc<dyn CoordinationBus> = match self.bus {
            Some(bus) => bus,
            None => match config.bus.mode {
                BusMode::Redis => Arc::new(RedisBus::connect(&config.bus).await?),
                BusMode::Memory => Arc::new(MemoryBus::new()),
            },
        };
        let swarm_id = config.swarm.swarm_id.clone();
        let producer_id = config.swarm.producer_id.clone();

        let registry = Arc::new(NodeRegistry::new(
            bus.clone(),
            config.registry.clone(),
            &swarm_id,
            &producer_id,
        ));
        registry.restore().await?;

        let predictor = Arc::new(PerformancePredictor::new(config.predictor.clone()));
        predictor.clone().start().await;

        let geo = Arc::new(GeographicDistributor::new(
            bus.clone(),
            registry.clone(),
            config.geo.clone(),
            &swarm_id,
            &producer_id,
        ));

        let optimizer =
            Arc::new(PlacementOptimizer::new(config.optimizer.clone(), predictor.clone()));

        let probe = self.probe.unwrap_or_else(|| Arc::new(StaticProbe));
        let metrics = self.metrics.unwrap_or_else(|| Arc::new(StaticProbe));
        let snapshots = Arc::new(SnapshotStore::new(
            bus.clone(),
            Duration::from_secs(config.rollback.snapshot_retention_secs),
        ));
        let rollback = Arc::new(RollbackManager::new(
            bus.clone(),
            config.rollback.clone(),
            snapshots,
            metrics.clone(),
            &swarm_id,
            &producer_id,
        ));
        let deployments = Arc::new(DeploymentCoordinator::new(
            bus.clone(),
            config.deployment.clone(),
            probe,
            metrics,
            rollback,
            &swarm_id,
            &producer_id,
        ));

        let strategies = Arc::new(
            StrategyRegistry::with_builtins(bus.clone(), config.recovery.success_ema_factor)
                .await,
        );
        let executor = self.executor.unwrap_or_else(|| Arc::new(SimulatedExecutor));
        let recovery = RecoveryOrchestrator::new(
            config.recovery.clone(),
            bus.clone(),
            strategies,
            executor,
            &swarm_id,
            &producer_id,
        );
        recovery
            .set_rollback_hook(Arc::new(CoordinatorRollbackHook {
                coordinator: deployments.clone(),
            }))
            .await;

        Ok(Engine {
            config,
            bus,
            registry,
            predictor,
            tracker: Arc::new(ContextTracker::new(0.9)),
            geo,
            optimizer,
            deployments,
            recovery,
            running_optimizations: Arc::new(RwLock::new(
                std::collections::HashMap::new(),
            )),
        })
    }
}

/// Bridges recovery escalation into the deployment coordinator.
struct CoordinatorRollbackHook {
    coordinator: Arc<DeploymentCoordinator>,
}

#[async_trait]
impl DeploymentRollbackHook for CoordinatorRollbackHook {
    async fn trigger_rollback(&self, deployment_id: Uuid, reason: &str) -> Result<Uuid, String> {
        self.coordinator
            .trigger_rollback(deployment_id, reason, None)
            .await
            .map_err(|err| err.to_string())
    }
}

pub struct Engine {
    pub config: EngineConfig,
    pub bus: Arc<dyn CoordinationBus>,
    pub registry: Arc<NodeRegistry>,
    pub predictor: Arc<PerformancePredictor>,
    pub tracker: Arc<ContextTracker>,
    pub geo: Arc<GeographicDistributor>,
    pub optimizer: Arc<PlacementOptimizer>,
    pub deployments: Arc<DeploymentCoordinator>,
    pub recovery: Arc<RecoveryOrchestrator>,
    running_optimizations: Arc<RwLock<std::collections::HashMap<Uuid, watch::Sender<bool>>>>,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Connect with production defaults (bus backend per configuration).
    pub async fn connect(config: EngineConfig) -> Result<Engine, EngineError> {
        EngineBuilder::new(config).build().await
    }

    /// Register inputs, pre-partition by region, optimize, persist and
    /// commit. Never fails on infeasible input: the returned placement
    /// carries `valid = false` and a diagnostic instead.
    pub async fn optimize(
        &self,
        nodes: Vec<Node>,
        tasks: Vec<Task>,
        constraints: OptimizationConstraints,
        options: OptimizeOptions,
    ) -> Result<(Placement, OptimizationReport), EngineError> {
        for node in &nodes {
            self.registry.register_node(node.clone()).await?;
        }
        for task in &tasks {
            self.registry.register_task(task.clone()).await?;
        }

        let operation_id = Uuid::new_v4();
        let (stop_tx, stop_rx) = watch::channel(false);
        self.running_optimizations.write().await.insert(operation_id, stop_tx);

        self.publish_placement_event(
            "placement.started",
            serde_json::json!({
                "operationId": operation_id,
                "tasks": tasks.len(),
                "nodes": nodes.len(),
            }),
        )
        .await;

        let plan = self.geo.plan(&tasks, options.distribution).await?;
        let snapshot = self.registry.nodes_snapshot().await;
        let request = OptimizationRequest {
            nodes: snapshot,
            tasks: tasks.clone(),
            constraints,
            hints: plan.hints,
            time_budget_ms: options.time_budget_ms,
            preferred_algorithm: options.preferred_algorithm,
            prior_best: None,
        };
        let (placement, report) = self.optimizer.optimize(request, stop_rx).await;
        self.running_optimizations.write().await.remove(&operation_id);

        self.bus
            .put_json(
                &format!("placements:{}", placement.id),
                &placement,
                Some(Duration::from_secs(self.config.rollback.metrics_retention_secs)),
            )
            .await?;

        if placement.valid {
            self.registry.commit_placement(&placement, &tasks).await?;
            self.verify_commit(&placement, &tasks).await;
        }

        self.publish_placement_event(
            "placement.completed",
            serde_json::json!({
                "operationId": operation_id,
                "placementId": placement.id,
                "valid": placement.valid,
                "strategy": report.strategy_selected,
                "diagnostic": report.diagnostic,
            }),
        )
        .await;
        Ok((placement, report))
    }

    /// Post-commit validity check: committed demand must still fit node
    /// capacity. Conflicting concurrent commits resolve last-writer-wins,
    /// so a violation here is logged for the operator rather than undone.
    async fn verify_commit(&self, placement: &Placement, tasks: &[Task]) {
        for assignment in &placement.assignments {
            let Some(node) = self.registry.node(&assignment.node_id).await else {
                warn!(node = %assignment.node_id, "committed node vanished from registry");
                continue;
            };
            let Some(task) = tasks.iter().find(|t| t.id == assignment.task_id) else {
                continue;
            };
            for axis in ResourceAxis::ALL {
                let capacity = node.capacity.axis(axis);
                if capacity > 0.0 && node.utilization.axis(axis) >= 1.0 && task.demand.axis(axis) > 0.0
                {
                    warn!(
                        node = %node.id,
                        axis = axis.name(),
                        "post-commit check: node saturated after concurrent placements"
                    );
                }
            }
        }
    }

    /// Register and launch a deployment; returns the deployment id while
    /// the rollout runs in the background.
    pub async fn deploy(
        &self,
        app: ApplicationConfig,
        options: DeploymentOptions,
    ) -> Result<Uuid, EngineError> {
        let id = self.deployments.begin(app, options).await?;
        let coordinator = self.deployments.clone();
        tokio::spawn(async move {
            if let Err(err) = coordinator.execute(id).await {
                warn!(deployment = %id, error = %err, "deployment execution error");
            }
        });
        Ok(id)
    }

    /// Run a deployment to completion, for callers that want to block.
    pub async fn deploy_and_wait(
        &self,
        app: ApplicationConfig,
        options: DeploymentOptions,
    ) -> Result<(Uuid, stratus_deploy::DeploymentStatus), EngineError> {
        let id = self.deployments.begin(app, options).await?;
        let status = self.deployments.execute(id).await?;
        Ok((id, status))
    }

    /// Roll back a deployment to a snapshot (the latest healthy one when
    /// unspecified).
    pub async fn rollback(
        &self,
        deployment_id: Uuid,
        snapshot_id: Option<Uuid>,
    ) -> Result<Uuid, EngineError> {
        let rollback_id = self
            .deployments
            .trigger_rollback(deployment_id, "operator request", snapshot_id)
            .await?;
        Ok(rollback_id)
    }

    pub async fn initiate_recovery(&self, error: ErrorData) -> Result<Uuid, EngineError> {
        let id = self.recovery.initiate(error).await?;
        Ok(id)
    }

    /// Record an observed execution outcome: feeds the predictor's online
    /// update path and the per-node historical aggregates. Never blocks on
    /// retraining.
    pub async fn record_task_outcome(
        &self,
        node_id: &str,
        task_id: &str,
        outcome: ObservedOutcome,
    ) -> Result<(), EngineError> {
        let node = self
            .registry
            .node(node_id)
            .await
            .ok_or_else(|| EngineError::UnknownEntity(node_id.to_string()))?;
        let task = self
            .registry
            .task(task_id)
            .await
            .ok_or_else(|| EngineError::UnknownEntity(task_id.to_string()))?;

        let context = self.tracker.context_for(node_id).await;
        self.predictor.observe(&node, &task, &context, outcome).await;
        self.tracker.record(node_id, outcome.success_rate >= 0.5).await;

        let envelope = EventEnvelope::new(
            "task.outcome.recorded",
            &self.config.swarm.swarm_id,
            &self.config.swarm.producer_id,
            serde_json::json!({
                "nodeId": node_id,
                "taskId": task_id,
                "successRate": outcome.success_rate,
            }),
        );
        if let Err(err) = self
            .bus
            .publish_with_replay(channels::MONITORING, &envelope, Duration::from_secs(3600))
            .await
        {
            warn!(error = %err, "failed to publish task outcome event");
        }
        Ok(())
    }

    /// Resolve a long-running id across subsystems.
    pub async fn status(&self, id: Uuid) -> Result<StatusReport, EngineError> {
        if let Some(execution) = self.deployments.status(id).await {
            return Ok(StatusReport::Deployment { execution });
        }
        if let Some(outcome) = self.deployments.rollback_outcome(id).await {
            return Ok(StatusReport::Rollback { outcome });
        }
        if let Some(execution) = self.recovery.status(id).await {
            return Ok(StatusReport::Recovery { execution });
        }
        if let Some(placement) = self
            .bus
            .get_json::<Placement>(&format!("placements:{id}"))
            .await?
        {
            return Ok(StatusReport::Placement { placement });
        }
        Err(EngineError::UnknownId(id))
    }

    /// Cancel a long-running operation. Returns true when something was
    /// signalled.
    pub async fn cancel(&self, id: Uuid) -> Result<bool, EngineError> {
        if let Some(sender) = self.running_optimizations.read().await.get(&id) {
            sender.send_replace(true);
            return Ok(true);
        }
        if self.deployments.status(id).await.is_some() {
            self.deployments.cancel(id).await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Spawn the periodic background loops: deployment trigger monitoring
    /// and geographic snapshots.
    pub fn start_monitors(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        let deployments = self.deployments.clone();
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            loop {
                interval.tick().await;
                let rolled_back = deployments.monitor_once().await;
                for id in rolled_back {
                    info!(deployment = %id, "automatic rollback triggered by monitor");
                }
            }
        }));

        // Recovery dispatch gates on current utilization; feed it the
        // cluster mean observed by the registry.
        let registry = self.registry.clone();
        let recovery = self.recovery.clone();
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            loop {
                interval.tick().await;
                let nodes = registry.nodes_snapshot().await;
                if nodes.is_empty() {
                    continue;
                }
                let count = nodes.len() as f64;
                let mut cpu = 0.0;
                let mut memory = 0.0;
                let mut network = 0.0;
                let mut disk = 0.0;
                for node in &nodes {
                    cpu += node.utilization.compute;
                    memory += node.utilization.memory;
                    network += node.utilization.bandwidth;
                    disk += node.utilization.storage;
                }
                recovery
                    .set_utilization(stratus_recovery::ResourceShare::new(
                        cpu / count,
                        memory / count,
                        network / count,
                        disk / count,
                    ))
                    .await;
            }
        }));

        handles.push(self.geo.clone().start_snapshots());
        handles
    }

    async fn publish_placement_event(&self, event_type: &str, payload: serde_json::Value) {
        let envelope = EventEnvelope::new(
            event_type,
            &self.config.swarm.swarm_id,
            &self.config.swarm.producer_id,
            payload,
        );
        if let Err(err) = self
            .bus
            .publish_with_replay(channels::PLACEMENT, &envelope, Duration::from_secs(3600))
            .await
        {
            warn!(error = %err, event = event_type, "failed to publish placement event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use stratus_core::{
        GeoLocation, NodePerformance, NodeStatus, ResourceVector, UnitCosts,
    };

    fn memory_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.bus.mode = BusMode::Memory;
        config.optimizer.seed = Some(42);
        config.optimizer.population_size = 20;
        config.optimizer.generations = 30;
        config.optimizer.max_iterations = 2_000;
        config.deployment.stabilization_period_ms = 10;
        config
    }

    fn node(id: &str, region: &str) -> Node {
        Node {
            id: id.to_string(),
            region: region.to_string(),
            location: GeoLocation::new(53.0, -6.0),
            capacity: ResourceVector::new(100.0, 100.0, 100.0, 100.0),
            utilization: ResourceVector::zero(),
            unit_costs: UnitCosts::default(),
            performance: NodePerformance::default(),
            capabilities: BTreeSet::new(),
            supported_tasks: BTreeSet::new(),
            status: NodeStatus::Healthy,
        }
    }

    fn task(id: &str, compute: f64) -> Task {
        Task {
            id: id.to_string(),
            demand: ResourceVector::new(compute, 10.0, 10.0, 1.0),
            priority: 1,
            deadline: chrono::Utc::now() + chrono::Duration::hours(1),
            estimated_duration_ms: 60_000,
            affinity: BTreeSet::new(),
            anti_affinity: BTreeSet::new(),
            location_preference: None,
            data_sovereignty: None,
            compliance_regions: None,
        }
    }

    #[tokio::test]
    async fn end_to_end_optimize_persists_and_commits() {
        let engine = Engine::connect(memory_config()).await.unwrap();
        let (placement, report) = engine
            .optimize(
                vec![node("n1", "eu-west"), node("n2", "eu-west")],
                vec![task("t1", 40.0), task("t2", 40.0)],
                OptimizationConstraints::default(),
                OptimizeOptions::default(),
            )
            .await
            .unwrap();

        assert!(placement.valid);
        assert_eq!(placement.assignments.len(), 2);
        assert!(!report.strategy_selected.is_empty());

        // The placement is queryable through the operator surface.
        let status = engine.status(placement.id).await.unwrap();
        assert!(matches!(status, StatusReport::Placement { .. }));

        // Committed demand shows up as node utilization.
        let total_util: f64 = total_compute_utilization(&engine).await;
        assert!(total_util > 0.0);
    }

    async fn total_compute_utilization(engine: &Engine) -> f64 {
        let mut total = 0.0;
        for node in engine.registry.nodes_snapshot().await {
            total += node.utilization.compute;
        }
        total
    }

    #[tokio::test]
    async fn recovery_is_reachable_through_operator_surface() {
        let engine = Engine::connect(memory_config()).await.unwrap();
        let id = engine
            .initiate_recovery(ErrorData {
                error_type: "service-unavailable".to_string(),
                message: "health endpoint down".to_string(),
                component: "api".to_string(),
                deployment_id: None,
                metrics: Default::default(),
            })
            .await
            .unwrap();
        let status = engine
            .recovery
            .wait_terminal(id, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(status.is_terminal());
        assert!(matches!(
            engine.status(id).await.unwrap(),
            StatusReport::Recovery { .. }
        ));
    }

    #[tokio::test]
    async fn unknown_id_is_an_error() {
        let engine = Engine::connect(memory_config()).await.unwrap();
        let err = engine.status(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, EngineError::UnknownId(_)));
    }

    #[tokio::test]
    async fn recorded_outcomes_update_node_history() {
        let engine = Engine::connect(memory_config()).await.unwrap();
        engine
            .optimize(
                vec![node("n1", "eu-west")],
                vec![task("t1", 10.0)],
                OptimizationConstraints::default(),
                OptimizeOptions::default(),
            )
            .await
            .unwrap();

        for _ in 0..10 {
            engine
                .record_task_outcome(
                    "n1",
                    "t1",
                    ObservedOutcome {
                        latency_ms: 40.0,
                        cost: 2.0,
                        reliability: 0.8,
                        success_rate: 0.1,
                    },
                )
                .await
                .unwrap();
        }
        let rate = engine.tracker.success_rate("n1").await.unwrap();
        assert!(rate < 0.5, "repeated failures must drag history down, got {rate}");

        let err = engine
            .record_task_outcome("ghost", "t1", ObservedOutcome {
                latency_ms: 1.0,
                cost: 1.0,
                reliability: 1.0,
                success_rate: 1.0,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownEntity(_)));
    }
}
