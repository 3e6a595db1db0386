//! Problem encoding, cost model and solution evaluation.
//!
//! A solution is an integer vector of length |tasks|: entry `i` is the
//! index of the node chosen for task `i`. All derived metrics come from
//! replaying the assignments while tracking per-node cumulative usage.

use rand::distributions::WeightedIndex;
use rand::prelude::*;
use std::collections::HashMap;

use stratus_core::{
    ConstraintClass, ConstraintViolation, LocationPreference, Node, OptimizationConstraints,
    PlacementMetrics, RegionHint, ResourceAxis, ResourceVector, Task,
};

/// Fitness component weights (latency / cost / reliability / load balance).
pub const LATENCY_WEIGHT: f64 = 0.30;
pub const COST_WEIGHT: f64 = 0.25;
pub const RELIABILITY_WEIGHT: f64 = 0.30;
pub const LOAD_BALANCE_WEIGHT: f64 = 0.15;

/// Per-axis penalty weights applied to capacity overage in the energy
/// function (per-unit overage × weight).
fn axis_penalty_weight(axis: ResourceAxis) -> f64 {
    match axis {
        ResourceAxis::Compute => 1.0,
        ResourceAxis::Memory => 0.8,
        ResourceAxis::Bandwidth => 0.6,
        ResourceAxis::Storage => 0.4,
    }
}

/// Penalty added per sovereignty/compliance violation.
const PLACEMENT_RULE_PENALTY: f64 = 2.0;

/// Network latency for running `task` on `node`: the node's base latency
/// plus a factor growing linearly once demanded bandwidth exceeds supply.
pub fn network_latency(node: &Node, task: &Task) -> f64 {
    let base = node.performance.latency_ms;
    let ratio = if node.capacity.bandwidth > 0.0 {
        task.demand.bandwidth / node.capacity.bandwidth
    } else if task.demand.bandwidth > 0.0 {
        100.0
    } else {
        1.0
    };
    let bandwidth_factor = ratio.max(1.0) * base - base;
    base + bandwidth_factor
}

/// Processing latency proportional to the compute demand/capacity ratio.
pub fn processing_latency(node: &Node, task: &Task) -> f64 {
    if node.capacity.compute > 0.0 {
        task.demand.compute / node.capacity.compute * 1000.0
    } else {
        1000.0
    }
}

/// Monetary cost of the assignment: demand times unit price, per axis.
pub fn assignment_cost(node: &Node, task: &Task) -> f64 {
    task.demand.compute * node.unit_costs.per_compute
        + task.demand.memory * node.unit_costs.per_memory
        + task.demand.bandwidth * node.unit_costs.per_bandwidth
        + task.demand.storage * node.unit_costs.per_storage
}

/// Expected reliability of the assignment, discounted for heavy and
/// long-running tasks.
pub fn assignment_reliability(node: &Node, task: &Task) -> f64 {
    node.performance.reliability
        * node.performance.availability
        * (1.0 - task.demand.compute / 10_000.0).max(0.9)
        * (1.0 - task.estimated_duration_ms as f64 / 3_600_000.0).max(0.95)
}

/// Immutable search input: a cluster snapshot plus constraints and region
/// hints. Engines own their working copies; nothing here is shared state.
pub struct PlacementProblem {
    pub nodes: Vec<Node>,
    pub tasks: Vec<Task>,
    pub constraints: OptimizationConstraints,
    pub hints: HashMap<String, RegionHint>,
    /// Per task: indices of structurally compatible nodes. Falls back to
    /// every node when the real candidate set is empty, so the search can
    /// still produce a best-effort (invalid) solution.
    candidates: Vec<Vec<usize>>,
}

impl PlacementProblem {
    pub fn new(
        nodes: Vec<Node>,
        tasks: Vec<Task>,
        constraints: OptimizationConstraints,
        hints: HashMap<String, RegionHint>,
    ) -> Self {
        let all_nodes: Vec<usize> = (0..nodes.len()).collect();
        let candidates = tasks
            .iter()
            .map(|task| {
                let hard_region = hints
                    .get(&task.id)
                    .filter(|hint| hint.hard)
                    .map(|hint| hint.region.as_str());
                let eligible: Vec<usize> = nodes
                    .iter()
                    .enumerate()
                    .filter(|(_, node)| node.is_healthy())
                    .filter(|(_, node)| node.can_host(task))
                    .filter(|(_, node)| task.region_allowed(&node.region))
                    .filter(|(_, node)| {
                        hard_region.map(|region| node.region == region).unwrap_or(true)
                    })
                    .map(|(index, _)| index)
                    .collect();
                if eligible.is_empty() {
                    all_nodes.clone()
                } else {
                    eligible
                }
            })
            .collect();
        Self { nodes, tasks, constraints, hints, candidates }
    }

    pub fn size(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty() || self.nodes.is_empty()
    }

    /// Compatible node indices for a task (with the all-nodes fallback).
    pub fn candidates(&self, task_index: usize) -> &[usize] {
        &self.candidates[task_index]
    }

    /// Initialization weight for assigning `task` to `node`, biased toward
    /// reliable, fast, cheap nodes with matching region and affinity.
    pub fn assignment_weight(&self, node: &Node, task: &Task) -> f64 {
        let base = node.performance.reliability
            * node.performance.availability
            * (1.0 / (1.0 + node.performance.latency_ms / 100.0))
            * (node.performance.throughput / 1000.0)
            * (-assignment_cost(node, task) / 100.0).exp();

        let region_match = match (&task.location_preference, self.hints.get(&task.id)) {
            (Some(LocationPreference::Region(region)), _) if *region == node.region => true,
            (_, Some(hint)) if hint.region == node.region => true,
            _ => false,
        };
        let region_boost = if region_match { 1.5 } else { 1.0 };
        let affinity_boost = 1.0 + 0.2 * node.affinity_matches(task) as f64;

        (base * region_boost * affinity_boost).max(f64::MIN_POSITIVE)
    }

    /// Random solution drawn with the weighted node-selection scheme.
    pub fn weighted_random_solution(&self, rng: &mut impl Rng) -> Vec<usize> {
        self.tasks
            .iter()
            .enumerate()
            .map(|(task_index, task)| {
                let candidates = self.candidates(task_index);
                let weights: Vec<f64> = candidates
                    .iter()
                    .map(|&node_index| self.assignment_weight(&self.nodes[node_index], task))
                    .collect();
                match WeightedIndex::new(&weights) {
                    Ok(distribution) => candidates[distribution.sample(rng)],
                    Err(_) => candidates[rng.gen_range(0..candidates.len())],
                }
            })
            .collect()
    }

    /// Replay a solution and derive all aggregate metrics, violations and
    /// both scalar objectives.
    pub fn evaluate(&self, genes: &[usize]) -> EvaluatedSolution {
        debug_assert_eq!(genes.len(), self.tasks.len());

        if self.tasks.is_empty() {
            return EvaluatedSolution {
                genes: Vec::new(),
                metrics: PlacementMetrics::default(),
                fitness: 1.0,
                energy: 0.0,
                valid: true,
                violations: Vec::new(),
            };
        }

        let mut usage: Vec<ResourceVector> = vec![ResourceVector::zero(); self.nodes.len()];
        let mut total_latency = 0.0;
        let mut total_cost = 0.0;
        let mut total_reliability = 0.0;
        let mut violations = Vec::new();

        for (task, &node_index) in self.tasks.iter().zip(genes) {
            let node = &self.nodes[node_index];
            usage[node_index].add(&task.demand);
            total_latency += network_latency(node, task) + processing_latency(node, task);
            total_cost += assignment_cost(node, task);
            total_reliability += assignment_reliability(node, task);

            if let Some(required) = task.sovereign_region() {
                if node.region != required {
                    violations.push(ConstraintViolation {
                        class: ConstraintClass::Sovereignty,
                        detail: format!(
                            "task {} requires region {required}, assigned {}",
                            task.id, node.region
                        ),
                        magnitude: 1.0,
                    });
                }
            } else if !task.region_allowed(&node.region) {
                violations.push(ConstraintViolation {
                    class: ConstraintClass::Compliance,
                    detail: format!(
                        "task {} not allowed in region {}",
                        task.id, node.region
                    ),
                    magnitude: 1.0,
                });
            }
        }

        for (node, used) in self.nodes.iter().zip(&usage) {
            for axis in ResourceAxis::ALL {
                let capacity = node.capacity.axis(axis);
                let demanded = used.axis(axis);
                if demanded > capacity {
                    violations.push(ConstraintViolation {
                        class: ConstraintClass::for_axis(axis),
                        detail: format!(
                            "node {} {} over capacity: {demanded:.1} > {capacity:.1}",
                            node.id,
                            axis.name()
                        ),
                        magnitude: demanded - capacity,
                    });
                }
            }
        }

        let task_count = self.tasks.len() as f64;
        let avg_latency = total_latency / task_count;
        let avg_reliability = (total_reliability / task_count).clamp(0.0, 1.0);

        // Load-balance index over nodes receiving at least one task.
        let mut compute_utils: Vec<f64> = Vec::new();
        let mut utilization_sum = 0.0;
        for (node, used) in self.nodes.iter().zip(&usage) {
            let touched = ResourceAxis::ALL.iter().any(|axis| used.axis(*axis) > 0.0);
            if !touched {
                continue;
            }
            if node.capacity.compute > 0.0 {
                compute_utils.push(used.compute / node.capacity.compute);
            }
            let mut fraction_sum = 0.0;
            for axis in ResourceAxis::ALL {
                let capacity = node.capacity.axis(axis);
                fraction_sum += if capacity > 0.0 { used.axis(axis) / capacity } else { 0.0 };
            }
            utilization_sum += fraction_sum / 4.0;
        }
        let load_balance_index = match (
            compute_utils.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            compute_utils.iter().cloned().fold(f64::INFINITY, f64::min),
        ) {
            (max, min) if max > 0.0 && max.is_finite() => (max - min) / max,
            _ => 0.0,
        };
        let avg_utilization = if compute_utils.is_empty() {
            0.0
        } else {
            utilization_sum / compute_utils.len() as f64
        };

        let latency_score = (1.0 - avg_latency / self.constraints.max_latency_ms).max(0.0);
        let cost_score = (1.0 - total_cost / self.constraints.max_cost).max(0.0);
        let load_balance_score = 1.0 - load_balance_index;
        let fitness = LATENCY_WEIGHT * latency_score
            + COST_WEIGHT * cost_score
            + RELIABILITY_WEIGHT * avg_reliability
            + LOAD_BALANCE_WEIGHT * load_balance_score;

        // Energy: inverse fitness plus additive per-unit violation penalty.
        let mut penalty = 0.0;
        for violation in &violations {
            penalty += match violation.class {
                ConstraintClass::CapacityCompute => {
                    violation.magnitude * axis_penalty_weight(ResourceAxis::Compute)
                }
                ConstraintClass::CapacityMemory => {
                    violation.magnitude * axis_penalty_weight(ResourceAxis::Memory)
                }
                ConstraintClass::CapacityBandwidth => {
                    violation.magnitude * axis_penalty_weight(ResourceAxis::Bandwidth)
                }
                ConstraintClass::CapacityStorage => {
                    violation.magnitude * axis_penalty_weight(ResourceAxis::Storage)
                }
                _ => PLACEMENT_RULE_PENALTY,
            };
        }

        EvaluatedSolution {
            genes: genes.to_vec(),
            metrics: PlacementMetrics {
                avg_latency_ms: avg_latency,
                total_cost,
                avg_reliability,
                load_balance_index,
                avg_utilization,
            },
            fitness,
            energy: (1.0 - fitness) + penalty,
            valid: violations.is_empty(),
            violations,
        }
    }
}

/// A solution with every derived quantity the engines need.
#[derive(Debug, Clone)]
pub struct EvaluatedSolution {
    pub genes: Vec<usize>,
    pub metrics: PlacementMetrics,
    /// Higher is better; drives the genetic engine.
    pub fitness: f64,
    /// Lower is better; drives the annealing engine.
    pub energy: f64,
    pub valid: bool,
    pub violations: Vec<ConstraintViolation>,
}

impl EvaluatedSolution {
    /// Ordering used for best-tracking: a valid solution always beats an
    /// invalid one; within a class, higher fitness wins.
    pub fn better_than(&self, other: &EvaluatedSolution) -> bool {
        match (self.valid, other.valid) {
            (true, false) => true,
            (false, true) => false,
            _ => self.fitness > other.fitness,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeSet;
    use stratus_core::{GeoLocation, NodePerformance, NodeStatus, UnitCosts};

    pub(crate) fn make_node(id: &str, region: &str, compute: f64, latency: f64) -> Node {
        Node {
            id: id.to_string(),
            region: region.to_string(),
            location: GeoLocation::new(0.0, 0.0),
            capacity: ResourceVector::new(compute, 1000.0, 1000.0, 1000.0),
            utilization: ResourceVector::zero(),
            unit_costs: UnitCosts {
                per_compute: 0.1,
                per_memory: 0.01,
                per_bandwidth: 0.01,
                per_storage: 0.001,
            },
            performance: NodePerformance { latency_ms: latency, ..NodePerformance::default() },
            capabilities: BTreeSet::new(),
            supported_tasks: BTreeSet::new(),
            status: NodeStatus::Healthy,
        }
    }

    pub(crate) fn make_task(id: &str, compute: f64) -> Task {
        Task {
            id: id.to_string(),
            demand: ResourceVector::new(compute, 10.0, 10.0, 1.0),
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

    #[test]
    fn bandwidth_pressure_raises_network_latency() {
        let node = make_node("n1", "eu-west", 100.0, 10.0);
        let light = make_task("t1", 10.0);
        let mut heavy = make_task("t2", 10.0);
        heavy.demand.bandwidth = 2000.0; // twice the node's supply
        assert_eq!(network_latency(&node, &light), 10.0);
        assert!((network_latency(&node, &heavy) - 20.0).abs() < 1e-9);
    }

    #[test]
    fn reliability_discounts_are_floored() {
        let node = make_node("n1", "eu-west", 100.0, 10.0);
        let mut task = make_task("t1", 9_999.0);
        task.estimated_duration_ms = 3_600_000;
        let reliability = assignment_reliability(&node, &task);
        let expected = node.performance.reliability * node.performance.availability * 0.9 * 0.95;
        assert!((reliability - expected).abs() < 1e-9);
    }

    #[test]
    fn overloaded_node_yields_capacity_violation() {
        let nodes = vec![make_node("n1", "eu-west", 100.0, 10.0)];
        let tasks = vec![make_task("t1", 60.0), make_task("t2", 60.0)];
        let problem = PlacementProblem::new(
            nodes,
            tasks,
            OptimizationConstraints::default(),
            HashMap::new(),
        );
        let evaluated = problem.evaluate(&[0, 0]);
        assert!(!evaluated.valid);
        assert!(evaluated
            .violations
            .iter()
            .any(|v| v.class == ConstraintClass::CapacityCompute && v.magnitude == 20.0));
        assert!(evaluated.energy > 1.0 - evaluated.fitness);
    }

    #[test]
    fn balanced_solution_has_zero_load_balance_index() {
        let nodes = vec![
            make_node("n1", "eu-west", 100.0, 10.0),
            make_node("n2", "eu-west", 100.0, 10.0),
        ];
        let tasks = vec![make_task("t1", 40.0), make_task("t2", 40.0)];
        let problem = PlacementProblem::new(
            nodes,
            tasks,
            OptimizationConstraints::default(),
            HashMap::new(),
        );
        let evaluated = problem.evaluate(&[0, 1]);
        assert!(evaluated.valid);
        assert_eq!(evaluated.metrics.load_balance_index, 0.0);
        let skewed = problem.evaluate(&[0, 0]);
        assert!(skewed.metrics.load_balance_index > 0.0);
    }

    #[test]
    fn sovereignty_violation_is_reported() {
        let nodes = vec![make_node("n1", "us-east", 100.0, 10.0)];
        let mut task = make_task("t1", 10.0);
        task.data_sovereignty = Some("eu-west".to_string());
        let problem = PlacementProblem::new(
            nodes,
            vec![task],
            OptimizationConstraints::default(),
            HashMap::new(),
        );
        let evaluated = problem.evaluate(&[0]);
        assert!(!evaluated.valid);
        assert_eq!(evaluated.violations[0].class, ConstraintClass::Sovereignty);
    }

    #[test]
    fn hard_hint_restricts_candidates() {
        let nodes = vec![
            make_node("n1", "eu-west", 100.0, 10.0),
            make_node("n2", "us-east", 100.0, 10.0),
        ];
        let task = make_task("t1", 10.0);
        let hints = HashMap::from([(
            "t1".to_string(),
            RegionHint { region: "eu-west".to_string(), hard: true },
        )]);
        let problem =
            PlacementProblem::new(nodes, vec![task], OptimizationConstraints::default(), hints);
        assert_eq!(problem.candidates(0), &[0]);
    }

    #[test]
    fn empty_problem_evaluates_as_valid() {
        let problem = PlacementProblem::new(
            Vec::new(),
            Vec::new(),
            OptimizationConstraints::default(),
            HashMap::new(),
        );
        let evaluated = problem.evaluate(&[]);
        assert!(evaluated.valid);
        assert_eq!(evaluated.metrics, PlacementMetrics::default());
    }

    #[test]
    fn weighted_sampling_only_picks_candidates() {
        let nodes = vec![
            make_node("n1", "eu-west", 100.0, 10.0),
            make_node("n2", "us-east", 100.0, 10.0),
        ];
        let mut task = make_task("t1", 10.0);
        task.data_sovereignty = Some("eu-west".to_string());
        let problem = PlacementProblem::new(
            nodes,
            vec![task],
            OptimizationConstraints::default(),
            HashMap::new(),
        );
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        for _ in 0..20 {
            let genes = problem.weighted_random_solution(&mut rng);
            assert_eq!(genes, vec![0]);
        }
    }
}
