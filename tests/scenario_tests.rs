//! End-to-end scenario tests exercising the full engine over the
//! in-process bus: placement scenarios, canary rollback, recovery
//! strategy selection and idempotent event replay.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use stratus::core::{
    channels, BusMode, EngineConfig, EventEnvelope, GeoLocation, Node, NodePerformance,
    NodeStatus, OptimizationConstraints, ResourceVector, Task, UnitCosts,
};
use stratus::bus::{CoordinationBus, MemoryBus, SeenEvents};
use stratus::deploy::{
    ApplicationConfig, Color, DeploymentOptions, DeploymentStatus, HealthProbe, MetricsSource,
    RolloutStrategy, ScriptedProbe,
};
use stratus::geo::DistributionStrategy;
use stratus::recovery::{ErrorData, RecoveryStatus, ScriptedExecutor, StepExecutor};
use stratus::{Engine, OptimizeOptions};

fn engine_config(seed: u64) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.bus.mode = BusMode::Memory;
    config.optimizer.seed = Some(seed);
    config.optimizer.population_size = 30;
    config.optimizer.generations = 50;
    config.optimizer.max_iterations = 4_000;
    config.deployment.stabilization_period_ms = 10;
    config.deployment.phase_timeout_ms = 5_000;
    config
}

fn node(id: &str, region: &str, compute: f64, latency: f64) -> Node {
    Node {
        id: id.to_string(),
        region: region.to_string(),
        location: GeoLocation::new(50.0, 0.0),
        capacity: ResourceVector::new(compute, 1000.0, 1000.0, 1000.0),
        utilization: ResourceVector::zero(),
        unit_costs: UnitCosts::default(),
        performance: NodePerformance { latency_ms: latency, ..NodePerformance::default() },
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

fn app() -> ApplicationConfig {
    ApplicationConfig {
        name: "svc".to_string(),
        version: "3.1.0".to_string(),
        configuration: serde_json::json!({"replicas": 4}),
    }
}

fn approvals() -> Vec<stratus::deploy::Approval> {
    vec![stratus::deploy::approval("release-signoff", "release-owner")]
}

// Scenario: two nodes with equal capacity but different latency; both
// tasks must land, latency dominated by the faster node, perfectly even
// compute spread.
#[tokio::test]
async fn latency_optimized_placement_prefers_fast_node() {
    let engine = Engine::connect(engine_config(101)).await.unwrap();
    let (placement, _) = engine
        .optimize(
            vec![
                node("n1", "region-fast", 100.0, 10.0),
                node("n2", "region-slow", 100.0, 50.0),
            ],
            vec![task("t1", 40.0), task("t2", 40.0)],
            OptimizationConstraints::default(),
            OptimizeOptions {
                distribution: DistributionStrategy::LatencyOptimized,
                ..OptimizeOptions::default()
            },
        )
        .await
        .unwrap();

    assert!(placement.valid);
    assert_eq!(placement.assignments.len(), 2);
    // Processing latency is 400ms on either node (40/100 compute); the
    // network component must sit nearer the 10ms node than the 50ms one.
    let network_component = placement.metrics.avg_latency_ms - 400.0;
    assert!(
        (network_component - 10.0).abs() < (network_component - 50.0).abs(),
        "network latency {network_component}ms is not dominated by the fast node"
    );
    assert_eq!(placement.metrics.load_balance_index, 0.0);
}

// Scenario: demand exceeds total capacity; the optimizer must return a
// best-effort invalid placement naming the compute capacity class.
#[tokio::test]
async fn infeasible_demand_reports_compute_capacity_violation() {
    let engine = Engine::connect(engine_config(102)).await.unwrap();
    let (placement, report) = engine
        .optimize(
            vec![
                node("n1", "eu-west", 100.0, 10.0),
                node("n2", "eu-west", 100.0, 10.0),
            ],
            vec![task("t1", 60.0), task("t2", 60.0), task("t3", 60.0)],
            OptimizationConstraints::default(),
            OptimizeOptions::default(),
        )
        .await
        .unwrap();

    assert!(!placement.valid);
    assert!(!placement.violations.is_empty());
    assert_eq!(report.diagnostic.as_deref(), Some("capacity.compute"));
}

// Scenario: data sovereignty pins a task to eu-west even though us-east
// nodes are far cheaper.
#[tokio::test]
async fn sovereignty_overrides_cost() {
    let engine = Engine::connect(engine_config(103)).await.unwrap();

    let mut eu = node("n1", "eu-west", 100.0, 30.0);
    eu.unit_costs.per_compute = 10.0;
    let mut us_a = node("n2", "us-east", 100.0, 5.0);
    us_a.unit_costs.per_compute = 0.01;
    let mut us_b = node("n3", "us-east", 100.0, 5.0);
    us_b.unit_costs.per_compute = 0.01;

    let mut pinned = task("t1", 20.0);
    pinned.data_sovereignty = Some("eu-west".to_string());

    let (placement, _) = engine
        .optimize(
            vec![eu, us_a, us_b],
            vec![pinned],
            OptimizationConstraints::default(),
            OptimizeOptions {
                distribution: DistributionStrategy::ComplianceAware,
                ..OptimizeOptions::default()
            },
        )
        .await
        .unwrap();

    assert!(placement.valid);
    assert_eq!(placement.assignments[0].region, "eu-west");
    assert_eq!(placement.assignments[0].node_id, "n1");
}

// Scenario: canary rollout fails its health gate at the 25% step; exactly
// one rollback runs, the previous color keeps serving, and the event
// trace ends with deployment.rolled_back.
#[tokio::test]
async fn canary_gate_failure_rolls_back_once() {
    let bus: Arc<dyn CoordinationBus> = Arc::new(MemoryBus::new());
    let probe = ScriptedProbe::new();
    probe.fail_traffic_at(25).await;

    let engine = Engine::builder(engine_config(104))
        .bus(bus.clone())
        .probe(probe.clone() as Arc<dyn HealthProbe>)
        .metrics(probe.clone() as Arc<dyn MetricsSource>)
        .build()
        .await
        .unwrap();

    let mut deployment_events = bus.subscribe(channels::DEPLOYMENT).await.unwrap();
    let mut rollback_events = bus.subscribe(channels::ROLLBACK).await.unwrap();

    let (id, status) = engine
        .deploy_and_wait(
            app(),
            DeploymentOptions { strategy: RolloutStrategy::Canary, approvals: approvals() },
        )
        .await
        .unwrap();
    assert_eq!(status, DeploymentStatus::RolledBack);

    let execution = engine.deployments.status(id).await.unwrap();
    assert_eq!(execution.active_color, Color::Blue);
    assert_eq!(execution.traffic_to_target, 0);

    let mut trace = Vec::new();
    while let Ok(envelope) = deployment_events.try_recv() {
        trace.push(envelope.event_type);
    }
    assert_eq!(trace.last().map(String::as_str), Some("deployment.rolled_back"));

    let mut initiated = 0;
    while let Ok(envelope) = rollback_events.try_recv() {
        if envelope.event_type == "rollback.initiated" {
            initiated += 1;
        }
    }
    assert_eq!(initiated, 1, "exactly one rollback must be initiated");
}

// Scenario: two strategies apply to database-connection-lost; the higher
// success rate wins, and a step failure past the threshold runs its
// rollback plan to completion.
#[tokio::test]
async fn recovery_selects_best_strategy_and_rolls_back_on_failure() {
    let executor = ScriptedExecutor::new();
    executor.fail_step("diagnose-pool").await;

    let engine = Engine::builder(engine_config(105))
        .step_executor(executor.clone() as Arc<dyn StepExecutor>)
        .build()
        .await
        .unwrap();

    // A second applicable strategy with a worse success rate must lose
    // selection to the built-in one (0.9).
    let mut weaker = stratus::recovery::builtin_strategies()
        .into_iter()
        .find(|s| s.id == "service-restart")
        .unwrap();
    weaker.id = "blunt-db-restart".to_string();
    weaker.applicable_error_types = vec!["database-connection-lost".to_string()];
    weaker.success_probability = 0.6;
    engine.recovery.register_strategy(weaker).await;

    let id = engine
        .initiate_recovery(ErrorData {
            error_type: "database-connection-lost".to_string(),
            message: "pool exhausted".to_string(),
            component: "orders-db".to_string(),
            deployment_id: None,
            metrics: Default::default(),
        })
        .await
        .unwrap();

    let status = engine
        .recovery
        .wait_terminal(id, Duration::from_secs(5))
        .await
        .expect("recovery should terminate");
    assert_eq!(status, RecoveryStatus::RolledBack);

    let execution = engine.recovery.status(id).await.unwrap();
    // The built-in database strategy (success rate 0.9) wins over any
    // lower-ranked alternative and its failover rollback plan completed.
    assert_eq!(execution.strategy_id, "database-connection-recovery");
    assert_eq!(execution.rollback_history, vec!["failover:ok"]);
    let executed = executor.executed.lock().await.clone();
    assert!(executed.contains(&"failover".to_string()));
}

// Capacity invariant over a committed placement: per-node demand sums
// never exceed capacity on any axis.
#[tokio::test]
async fn committed_placement_respects_capacity_on_every_axis() {
    let engine = Engine::connect(engine_config(106)).await.unwrap();
    let nodes = vec![
        node("n1", "eu-west", 200.0, 10.0),
        node("n2", "eu-west", 150.0, 20.0),
        node("n3", "us-east", 120.0, 40.0),
    ];
    let tasks: Vec<Task> = (0..12).map(|i| task(&format!("t{i}"), 25.0)).collect();

    let (placement, _) = engine
        .optimize(nodes.clone(), tasks.clone(), OptimizationConstraints::default(), OptimizeOptions::default())
        .await
        .unwrap();
    assert!(placement.valid);

    for check_node in &nodes {
        let assigned: f64 = placement
            .assignments
            .iter()
            .filter(|a| a.node_id == check_node.id)
            .map(|a| {
                tasks
                    .iter()
                    .find(|t| t.id == a.task_id)
                    .map(|t| t.demand.compute)
                    .unwrap_or(0.0)
            })
            .sum();
        assert!(
            assigned <= check_node.capacity.compute,
            "node {} over-committed: {assigned}",
            check_node.id
        );
    }
}

// Replaying the same envelope (same event id) must be a no-op for a
// deduplicating consumer.
#[tokio::test]
async fn replayed_events_are_idempotent_for_consumers() {
    let bus = MemoryBus::new();
    let mut receiver = bus.subscribe(channels::PLACEMENT).await.unwrap();
    let envelope = EventEnvelope::new(
        "placement.completed",
        "swarm-test",
        "producer-test",
        serde_json::json!({"placementId": "p-1"}),
    );

    bus.publish(channels::PLACEMENT, &envelope).await.unwrap();
    bus.publish(channels::PLACEMENT, &envelope).await.unwrap();

    let mut seen = SeenEvents::new(128);
    let mut applied = 0;
    while let Ok(received) = receiver.try_recv() {
        if seen.observe(received.event_id) {
            applied += 1;
        }
    }
    assert_eq!(applied, 1);
}

// Placement of zero tasks returns an empty, valid placement.
#[tokio::test]
async fn empty_task_set_is_trivially_valid() {
    let engine = Engine::connect(engine_config(107)).await.unwrap();
    let (placement, _) = engine
        .optimize(
            vec![node("n1", "eu-west", 100.0, 10.0)],
            vec![],
            OptimizationConstraints::default(),
            OptimizeOptions::default(),
        )
        .await
        .unwrap();
    assert!(placement.valid);
    assert!(placement.assignments.is_empty());
    assert!(placement.violations.is_empty());
}
