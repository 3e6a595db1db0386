//! Placement optimizer: strategy selection over the genetic and
//! simulated-annealing engines, plus the ML-hybrid pipeline that re-ranks
//! genetic candidates with the performance predictor before annealing
//! refinement.
//!
//! Optimizer calls never fail: infeasible inputs produce the best
//! solution seen with `valid = false` and a diagnostic naming the most
//! violated constraint class.

pub mod annealing;
pub mod genetic;
pub mod problem;

use chrono::Utc;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use stratus_core::{
    Assignment, Node, OptimizationConstraints, OptimizerConfig, Placement, RegionHint,
    ScoreBreakdown, Task,
};
use stratus_predictor::{FeatureContext, PerformancePredictor};

use annealing::AnnealingEngine;
use genetic::GeneticEngine;
use problem::{
    assignment_cost, assignment_reliability, network_latency, processing_latency,
    EvaluatedSolution, PlacementProblem, COST_WEIGHT, LATENCY_WEIGHT, LOAD_BALANCE_WEIGHT,
    RELIABILITY_WEIGHT,
};

/// Problem size at or above which the genetic engine is preferred.
const GENETIC_SIZE_THRESHOLD: usize = 25;
/// Prior placements at or above this fitness seed the annealing engine.
const NEAR_OPTIMAL_FITNESS: f64 = 0.85;
/// Candidates re-ranked by the predictor in the hybrid pipeline.
const HYBRID_TOP_K: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    Genetic,
    SimulatedAnnealing,
    MlHybrid,
}

impl Algorithm {
    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::Genetic => "genetic",
            Algorithm::SimulatedAnnealing => "simulated_annealing",
            Algorithm::MlHybrid => "ml_hybrid",
        }
    }
}

/// Coarse time budget classes derived from the millisecond budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeBudget {
    Fast,
    Medium,
    Extensive,
}

impl TimeBudget {
    pub fn from_millis(budget_ms: u64) -> Self {
        match budget_ms {
            0..=1999 => TimeBudget::Fast,
            2000..=9999 => TimeBudget::Medium,
            _ => TimeBudget::Extensive,
        }
    }
}

/// Full optimizer input.
pub struct OptimizationRequest {
    pub nodes: Vec<Node>,
    pub tasks: Vec<Task>,
    pub constraints: OptimizationConstraints,
    pub hints: HashMap<String, RegionHint>,
    pub time_budget_ms: u64,
    pub preferred_algorithm: Option<Algorithm>,
    /// Genes of the last committed placement for this task set, if any;
    /// near-optimal priors steer selection toward seeded annealing.
    pub prior_best: Option<Vec<usize>>,
}

/// Telemetry attached to every optimizer result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationReport {
    pub strategy_selected: String,
    pub generations: usize,
    pub iterations: usize,
    pub convergence: bool,
    pub diversity: Option<f64>,
    pub acceptance_rate: Option<f64>,
    pub elapsed_ms: u64,
    /// Present when the result is invalid: the most violated constraint
    /// class, e.g. `capacity.compute`.
    pub diagnostic: Option<String>,
}

pub struct PlacementOptimizer {
    config: OptimizerConfig,
    predictor: Arc<PerformancePredictor>,
}

impl PlacementOptimizer {
    pub fn new(config: OptimizerConfig, predictor: Arc<PerformancePredictor>) -> Self {
        Self { config, predictor }
    }

    /// Strategy selection: genetic for large problems with at least a
    /// medium budget (hybrid when the predictor is informative and the
    /// budget is extensive), seeded annealing when the prior best is
    /// already near-optimal, annealing otherwise.
    pub fn select_algorithm(
        &self,
        problem_size: usize,
        budget: TimeBudget,
        prior_near_optimal: bool,
        predictor_trained: bool,
    ) -> Algorithm {
        if prior_near_optimal {
            return Algorithm::SimulatedAnnealing;
        }
        if problem_size >= GENETIC_SIZE_THRESHOLD && budget >= TimeBudget::Medium {
            if predictor_trained && budget == TimeBudget::Extensive {
                return Algorithm::MlHybrid;
            }
            return Algorithm::Genetic;
        }
        Algorithm::SimulatedAnnealing
    }

    /// Run one optimization. Always returns a placement; failures surface
    /// as `valid = false` plus a diagnostic rather than an error.
    pub async fn optimize(
        &self,
        request: OptimizationRequest,
        stop: watch::Receiver<bool>,
    ) -> (Placement, OptimizationReport) {
        let started = Instant::now();
        let deadline = started + Duration::from_millis(request.time_budget_ms.max(1));

        if request.tasks.is_empty() {
            let placement = Placement::empty("none");
            let report = OptimizationReport {
                strategy_selected: "none".to_string(),
                generations: 0,
                iterations: 0,
                convergence: true,
                diversity: None,
                acceptance_rate: None,
                elapsed_ms: 0,
                diagnostic: None,
            };
            return (placement, report);
        }

        let problem = PlacementProblem::new(
            request.nodes,
            request.tasks,
            request.constraints,
            request.hints,
        );

        if problem.nodes.is_empty() {
            warn!("optimization requested with no nodes registered");
            let mut placement = Placement::empty("none");
            placement.valid = false;
            placement.violations.push(stratus_core::ConstraintViolation {
                class: stratus_core::ConstraintClass::CapacityCompute,
                detail: "no nodes available to host any task".to_string(),
                magnitude: problem.tasks.len() as f64,
            });
            let report = OptimizationReport {
                strategy_selected: "none".to_string(),
                generations: 0,
                iterations: 0,
                convergence: false,
                diversity: None,
                acceptance_rate: None,
                elapsed_ms: started.elapsed().as_millis() as u64,
                diagnostic: Some("capacity.compute".to_string()),
            };
            return (placement, report);
        }

        let budget = TimeBudget::from_millis(request.time_budget_ms);
        let prior = request
            .prior_best
            .filter(|genes| genes.len() == problem.size())
            .map(|genes| problem.evaluate(&genes));
        let prior_near_optimal = prior
            .as_ref()
            .map(|p| p.valid && p.fitness >= NEAR_OPTIMAL_FITNESS)
            .unwrap_or(false);
        let predictor_trained = self.predictor.status().await.trained;

        let algorithm = request.preferred_algorithm.unwrap_or_else(|| {
            self.select_algorithm(problem.size(), budget, prior_near_optimal, predictor_trained)
        });
        info!(
            algorithm = algorithm.name(),
            tasks = problem.size(),
            nodes = problem.nodes.len(),
            budget_ms = request.time_budget_ms,
            "placement optimization started"
        );

        let (best, report) = match algorithm {
            Algorithm::Genetic => {
                let mut engine = GeneticEngine::new(&problem, self.config.clone());
                let outcome = engine.run(deadline, &stop);
                let report = OptimizationReport {
                    strategy_selected: algorithm.name().to_string(),
                    generations: outcome.generations_run,
                    iterations: 0,
                    convergence: outcome.converged,
                    diversity: Some(outcome.diversity),
                    acceptance_rate: None,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    diagnostic: None,
                };
                (outcome.best, report)
            }
            Algorithm::SimulatedAnnealing => {
                let seed = prior.map(|p| p.genes);
                let mut engine = AnnealingEngine::new(&problem, self.config.clone());
                let outcome = engine.run(seed, deadline, &stop);
                let report = OptimizationReport {
                    strategy_selected: algorithm.name().to_string(),
                    generations: 0,
                    iterations: outcome.iterations,
                    convergence: outcome.cooled_out,
                    diversity: None,
                    acceptance_rate: Some(outcome.acceptance_rate),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    diagnostic: None,
                };
                (outcome.best, report)
            }
            Algorithm::MlHybrid => self.run_hybrid(&problem, deadline, &stop, started).await,
        };

        let placement = self.build_placement(&problem, &best, algorithm.name());
        let mut report = report;
        if !placement.valid {
            report.diagnostic = placement
                .most_violated_class()
                .map(|class| class.name().to_string());
        }
        info!(
            placement = %placement.id,
            valid = placement.valid,
            fitness = best.fitness,
            elapsed_ms = report.elapsed_ms,
            "placement optimization finished"
        );
        (placement, report)
    }

    /// ML hybrid: a short genetic pass generates candidates, the predictor
    /// re-ranks the top K, and annealing refines the winner.
    async fn run_hybrid(
        &self,
        problem: &PlacementProblem,
        deadline: Instant,
        stop: &watch::Receiver<bool>,
        started: Instant,
    ) -> (EvaluatedSolution, OptimizationReport) {
        let mut short_config = self.config.clone();
        short_config.generations = (self.config.generations / 4).max(10);

        let mut genetic = GeneticEngine::new(problem, short_config);
        let ga_outcome = genetic.run(deadline, stop);

        // Collect distinct candidates: the GA best plus weighted restarts.
        let mut candidates = vec![ga_outcome.best.clone()];
        {
            let mut seed_rng: rand::rngs::StdRng = match self.config.seed {
                Some(seed) => rand::SeedableRng::seed_from_u64(seed.wrapping_add(7)),
                None => rand::SeedableRng::from_entropy(),
            };
            while candidates.len() < HYBRID_TOP_K {
                let genes = problem.weighted_random_solution(&mut seed_rng);
                candidates.push(problem.evaluate(&genes));
            }
        }

        let mut ranked: Vec<(OrderedFloat<f64>, EvaluatedSolution)> = Vec::new();
        for candidate in candidates {
            let predictor_score = self.predictor_score(problem, &candidate).await;
            let blended = 0.6 * candidate.fitness + 0.4 * predictor_score;
            ranked.push((OrderedFloat(blended), candidate));
        }
        ranked.sort_by(|a, b| b.0.cmp(&a.0));
        let seed = ranked
            .first()
            .map(|(_, candidate)| candidate.genes.clone());

        let mut annealing = AnnealingEngine::new(problem, self.config.clone());
        let sa_outcome = annealing.run(seed, deadline, stop);

        let best = if sa_outcome.best.better_than(&ga_outcome.best) {
            sa_outcome.best
        } else {
            ga_outcome.best
        };
        let report = OptimizationReport {
            strategy_selected: Algorithm::MlHybrid.name().to_string(),
            generations: ga_outcome.generations_run,
            iterations: sa_outcome.iterations,
            convergence: ga_outcome.converged || sa_outcome.cooled_out,
            diversity: Some(ga_outcome.diversity),
            acceptance_rate: Some(sa_outcome.acceptance_rate),
            elapsed_ms: started.elapsed().as_millis() as u64,
            diagnostic: None,
        };
        (best, report)
    }

    /// Mean predicted quality of a candidate solution; neutral predictions
    /// contribute the candidate's own reliability so an untrained ensemble
    /// cannot skew ranking.
    async fn predictor_score(
        &self,
        problem: &PlacementProblem,
        candidate: &EvaluatedSolution,
    ) -> f64 {
        if candidate.genes.is_empty() {
            return 0.0;
        }
        let context = FeatureContext::default();
        let mut total = 0.0;
        for (task, &node_index) in problem.tasks.iter().zip(&candidate.genes) {
            let node = &problem.nodes[node_index];
            let prediction = self.predictor.predict(node, task, &context).await;
            total += if prediction.is_informative() {
                let latency_score =
                    (1.0 - prediction.latency_ms / problem.constraints.max_latency_ms).max(0.0);
                0.4 * prediction.reliability + 0.3 * prediction.success_rate + 0.3 * latency_score
            } else {
                assignment_reliability(node, task)
            };
        }
        total / candidate.genes.len() as f64
    }

    /// Materialize the winning solution as an auditable placement.
    fn build_placement(
        &self,
        problem: &PlacementProblem,
        solution: &EvaluatedSolution,
        strategy: &str,
    ) -> Placement {
        let task_count = solution.genes.len().max(1) as f64;
        let assignments = problem
            .tasks
            .iter()
            .zip(&solution.genes)
            .map(|(task, &node_index)| {
                let node = &problem.nodes[node_index];
                let latency = network_latency(node, task) + processing_latency(node, task);
                let cost = assignment_cost(node, task);
                let reliability = assignment_reliability(node, task);
                let latency_score =
                    (1.0 - latency / problem.constraints.max_latency_ms).max(0.0);
                let cost_score =
                    (1.0 - cost * task_count / problem.constraints.max_cost).max(0.0);
                let score = LATENCY_WEIGHT * latency_score
                    + COST_WEIGHT * cost_score
                    + RELIABILITY_WEIGHT * reliability
                    + LOAD_BALANCE_WEIGHT;
                Assignment {
                    task_id: task.id.clone(),
                    node_id: node.id.clone(),
                    region: node.region.clone(),
                    score,
                    strategy: strategy.to_string(),
                    breakdown: ScoreBreakdown { latency_ms: latency, cost, reliability },
                }
            })
            .collect();

        Placement {
            id: Uuid::new_v4(),
            assignments,
            metrics: solution.metrics,
            valid: solution.valid,
            violations: solution.violations.clone(),
            strategy: strategy.to_string(),
            created_at: Utc::now(),
        }
    }
}
