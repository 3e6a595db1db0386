//! Placement optimizer benchmarks: solution evaluation throughput and
//! full search runs on synthetic clusters.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};
use tokio::sync::watch;

use stratus::core::{
    GeoLocation, Node, NodePerformance, NodeStatus, OptimizationConstraints, OptimizerConfig,
    ResourceVector, Task, UnitCosts,
};
use stratus::optimizer::annealing::AnnealingEngine;
use stratus::optimizer::genetic::GeneticEngine;
use stratus::optimizer::problem::PlacementProblem;

fn synthetic_node(index: usize) -> Node {
    Node {
        id: format!("node-{index}"),
        region: if index % 3 == 0 { "eu-west" } else { "us-east" }.to_string(),
        location: GeoLocation::new(40.0 + index as f64, -70.0),
        capacity: ResourceVector::new(200.0 + (index % 5) as f64 * 50.0, 1000.0, 1000.0, 1000.0),
        utilization: ResourceVector::zero(),
        unit_costs: UnitCosts {
            per_compute: 0.1 + (index % 4) as f64 * 0.05,
            per_memory: 0.01,
            per_bandwidth: 0.01,
            per_storage: 0.001,
        },
        performance: NodePerformance {
            latency_ms: 10.0 + (index % 7) as f64 * 15.0,
            throughput: 1000.0,
            reliability: 0.99,
            availability: 0.999,
        },
        capabilities: BTreeSet::new(),
        supported_tasks: BTreeSet::new(),
        status: NodeStatus::Healthy,
    }
}

fn synthetic_task(index: usize) -> Task {
    Task {
        id: format!("task-{index}"),
        demand: ResourceVector::new(10.0 + (index % 4) as f64 * 5.0, 20.0, 10.0, 1.0),
        priority: (index % 3) as u32,
        deadline: chrono::Utc::now() + chrono::Duration::hours(1),
        estimated_duration_ms: 60_000,
        affinity: BTreeSet::new(),
        anti_affinity: BTreeSet::new(),
        location_preference: None,
        data_sovereignty: None,
        compliance_regions: None,
    }
}

fn problem(nodes: usize, tasks: usize) -> PlacementProblem {
    PlacementProblem::new(
        (0..nodes).map(synthetic_node).collect(),
        (0..tasks).map(synthetic_task).collect(),
        OptimizationConstraints::default(),
        HashMap::new(),
    )
}

fn bench_evaluation(c: &mut Criterion) {
    let mut group = c.benchmark_group("solution_evaluation");
    for size in [10usize, 50, 200] {
        let problem = problem(10, size);
        let genes: Vec<usize> = (0..size).map(|i| i % 10).collect();
        group.bench_with_input(BenchmarkId::new("tasks", size), &size, |b, _| {
            b.iter(|| black_box(problem.evaluate(&genes)))
        });
    }
    group.finish();
}

fn bench_genetic_search(c: &mut Criterion) {
    let problem = problem(12, 60);
    let config = OptimizerConfig {
        population_size: 40,
        generations: 30,
        seed: Some(7),
        ..OptimizerConfig::default()
    };

    c.bench_function("genetic_search_60_tasks", |b| {
        b.iter(|| {
            let (_tx, rx) = watch::channel(false);
            let mut engine = GeneticEngine::new(&problem, config.clone());
            black_box(engine.run(Instant::now() + Duration::from_secs(30), &rx))
        })
    });
}

fn bench_annealing_search(c: &mut Criterion) {
    let problem = problem(12, 60);
    let config = OptimizerConfig {
        max_iterations: 2_000,
        seed: Some(7),
        ..OptimizerConfig::default()
    };

    c.bench_function("annealing_search_60_tasks", |b| {
        b.iter(|| {
            let (_tx, rx) = watch::channel(false);
            let mut engine = AnnealingEngine::new(&problem, config.clone());
            black_box(engine.run(None, Instant::now() + Duration::from_secs(30), &rx))
        })
    });
}

criterion_group!(
    benches,
    bench_evaluation,
    bench_genetic_search,
    bench_annealing_search
);
criterion_main!(benches);
