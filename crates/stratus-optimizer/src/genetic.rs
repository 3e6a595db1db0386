//! Genetic search engine.
//!
//! Tournament selection over a weighted-random initial population, uniform
//! crossover, three-way mutation (point replace / swap / inversion) and
//! elitism. Invalid individuals stay in the gene pool but never enter the
//! best-solution tracking, which is strictly monotonic.

use rand::prelude::*;
use statrs::statistics::Statistics;
use std::time::Instant;
use tokio::sync::watch;
use tracing::debug;

use stratus_core::OptimizerConfig;

use crate::problem::{EvaluatedSolution, PlacementProblem};

/// Mutation operator split: point replace 0.3, swap 0.3, inversion 0.4.
const POINT_MUTATION_SHARE: f64 = 0.3;
const SWAP_MUTATION_SHARE: f64 = 0.3;

#[derive(Debug, Clone)]
pub struct GaOutcome {
    pub best: EvaluatedSolution,
    pub generations_run: usize,
    pub converged: bool,
    /// Mean pairwise assignment disagreement over a bounded population
    /// sample, in [0, 1].
    pub diversity: f64,
}

pub struct GeneticEngine<'p> {
    problem: &'p PlacementProblem,
    config: OptimizerConfig,
    rng: StdRng,
}

impl<'p> GeneticEngine<'p> {
    pub fn new(problem: &'p PlacementProblem, config: OptimizerConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { problem, config, rng }
    }

    pub fn run(&mut self, deadline: Instant, stop: &watch::Receiver<bool>) -> GaOutcome {
        let population_size = self.config.population_size.max(2);
        let mut population: Vec<EvaluatedSolution> = (0..population_size)
            .map(|_| {
                let genes = self.problem.weighted_random_solution(&mut self.rng);
                self.problem.evaluate(&genes)
            })
            .collect();

        let mut best = Self::population_best(&population).clone();
        let mut stagnant_generations = 0;
        let mut generations_run = 0;
        let mut converged = false;

        for _ in 0..self.config.generations {
            if *stop.borrow() || Instant::now() >= deadline {
                break;
            }
            generations_run += 1;

            let elite_count = ((self.config.elitism_rate * population_size as f64).ceil()
                as usize)
                .min(population_size);
            let mut next: Vec<EvaluatedSolution> = Self::elites(&population, elite_count);

            while next.len() < population_size {
                let parent_a = self.tournament(&population).genes.clone();
                let parent_b = self.tournament(&population).genes.clone();

                let (mut child_a, mut child_b) = if self.rng.gen_bool(self.config.crossover_rate)
                {
                    self.uniform_crossover(&parent_a, &parent_b)
                } else {
                    (parent_a, parent_b)
                };

                if self.rng.gen_bool(self.config.mutation_rate) {
                    self.mutate(&mut child_a);
                }
                if self.rng.gen_bool(self.config.mutation_rate) {
                    self.mutate(&mut child_b);
                }

                next.push(self.problem.evaluate(&child_a));
                if next.len() < population_size {
                    next.push(self.problem.evaluate(&child_b));
                }
            }

            population = next;

            let generation_best = Self::population_best(&population);
            let previous_fitness = best.fitness;
            if generation_best.better_than(&best) {
                best = generation_best.clone();
            }
            let improvement = best.fitness - previous_fitness;

            if improvement.abs() < self.config.convergence_threshold {
                stagnant_generations += 1;
                if stagnant_generations >= self.config.max_stagnant_generations {
                    converged = true;
                    break;
                }
            } else {
                stagnant_generations = 0;
            }
        }

        let diversity = self.population_diversity(&population);
        debug!(
            generations = generations_run,
            converged,
            diversity,
            best_fitness = best.fitness,
            best_valid = best.valid,
            "genetic search finished"
        );
        GaOutcome { best, generations_run, converged, diversity }
    }

    /// Tournament of `tournament_size`: the best valid entrant wins; if
    /// none is valid, the best raw fitness does.
    fn tournament<'a>(&mut self, population: &'a [EvaluatedSolution]) -> &'a EvaluatedSolution {
        let size = self.config.tournament_size.max(1);
        let mut winner: Option<&EvaluatedSolution> = None;
        for _ in 0..size {
            let entrant = &population[self.rng.gen_range(0..population.len())];
            winner = match winner {
                None => Some(entrant),
                Some(current) if entrant.better_than(current) => Some(entrant),
                Some(current) => Some(current),
            };
        }
        winner.expect("tournament size is at least 1")
    }

    fn uniform_crossover(
        &mut self,
        parent_a: &[usize],
        parent_b: &[usize],
    ) -> (Vec<usize>, Vec<usize>) {
        let mut child_a = Vec::with_capacity(parent_a.len());
        let mut child_b = Vec::with_capacity(parent_b.len());
        for (&gene_a, &gene_b) in parent_a.iter().zip(parent_b) {
            if self.rng.gen_bool(0.5) {
                child_a.push(gene_a);
                child_b.push(gene_b);
            } else {
                child_a.push(gene_b);
                child_b.push(gene_a);
            }
        }
        (child_a, child_b)
    }

    fn mutate(&mut self, genes: &mut [usize]) {
        if genes.is_empty() {
            return;
        }
        let roll: f64 = self.rng.gen();
        if roll < POINT_MUTATION_SHARE {
            let position = self.rng.gen_range(0..genes.len());
            let candidates = self.problem.candidates(position);
            genes[position] = candidates[self.rng.gen_range(0..candidates.len())];
        } else if roll < POINT_MUTATION_SHARE + SWAP_MUTATION_SHARE {
            if genes.len() >= 2 {
                let a = self.rng.gen_range(0..genes.len());
                let b = self.rng.gen_range(0..genes.len());
                genes.swap(a, b);
            }
        } else if genes.len() >= 2 {
            let start = self.rng.gen_range(0..genes.len() - 1);
            let end = self.rng.gen_range(start + 1..genes.len());
            genes[start..=end].reverse();
        }
    }

    /// Top individuals carried forward unchanged: valid ones first, then
    /// by fitness if the valid pool is too small.
    fn elites(population: &[EvaluatedSolution], count: usize) -> Vec<EvaluatedSolution> {
        let mut sorted: Vec<&EvaluatedSolution> = population.iter().collect();
        sorted.sort_by(|a, b| {
            b.valid
                .cmp(&a.valid)
                .then(b.fitness.partial_cmp(&a.fitness).unwrap_or(std::cmp::Ordering::Equal))
        });
        sorted.into_iter().take(count).cloned().collect()
    }

    fn population_best(population: &[EvaluatedSolution]) -> &EvaluatedSolution {
        population
            .iter()
            .reduce(|best, candidate| if candidate.better_than(best) { candidate } else { best })
            .expect("population is never empty")
    }

    fn population_diversity(&self, population: &[EvaluatedSolution]) -> f64 {
        let sample: Vec<&EvaluatedSolution> = population.iter().take(10).collect();
        if sample.len() < 2 || self.problem.size() == 0 {
            return 0.0;
        }
        let mut distances = Vec::new();
        for i in 0..sample.len() {
            for j in (i + 1)..sample.len() {
                let disagreement = sample[i]
                    .genes
                    .iter()
                    .zip(&sample[j].genes)
                    .filter(|(a, b)| a != b)
                    .count();
                distances.push(disagreement as f64 / self.problem.size() as f64);
            }
        }
        Statistics::mean(distances.iter())
    }
}
