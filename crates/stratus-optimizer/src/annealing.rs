//! Simulated-annealing search engine.
//!
//! Metropolis acceptance over three neighborhood moves (compatible
//! re-assign 0.4, swap 0.3, block swap of length <= 3 0.3) with geometric,
//! logarithmic or adaptive cooling, bounded reheating, and strictly
//! non-increasing best-energy tracking.

use rand::prelude::*;
use statrs::statistics::Statistics;
use std::collections::VecDeque;
use std::time::Instant;
use tokio::sync::watch;
use tracing::debug;

use stratus_core::{OptimizerConfig, ScheduleType};

use crate::problem::{EvaluatedSolution, PlacementProblem};

const REASSIGN_SHARE: f64 = 0.4;
const SWAP_SHARE: f64 = 0.3;
const MAX_BLOCK_LEN: usize = 3;

#[derive(Debug, Clone)]
pub struct SaOutcome {
    pub best: EvaluatedSolution,
    pub iterations: usize,
    pub final_temperature: f64,
    /// Accepted moves over all iterations, in [0, 1].
    pub acceptance_rate: f64,
    pub reheats: usize,
    /// True when the schedule ran down to the minimum temperature.
    pub cooled_out: bool,
}

pub struct AnnealingEngine<'p> {
    problem: &'p PlacementProblem,
    config: OptimizerConfig,
    rng: StdRng,
}

impl<'p> AnnealingEngine<'p> {
    pub fn new(problem: &'p PlacementProblem, config: OptimizerConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(1)),
            None => StdRng::from_entropy(),
        };
        Self { problem, config, rng }
    }

    /// Run the annealing loop, optionally seeded with a prior solution
    /// (e.g. the last committed placement or a GA result).
    pub fn run(
        &mut self,
        seed: Option<Vec<usize>>,
        deadline: Instant,
        stop: &watch::Receiver<bool>,
    ) -> SaOutcome {
        let genes = seed.unwrap_or_else(|| self.problem.weighted_random_solution(&mut self.rng));
        let mut current = self.problem.evaluate(&genes);
        let mut best = current.clone();

        let initial_temperature = self.config.initial_temperature;
        let mut temperature = initial_temperature;
        let mut iterations = 0;
        let mut accepted_total = 0usize;
        let mut reheats = 0;
        let window_len = self.config.equilibrium_iterations.max(1);
        let mut window: VecDeque<bool> = VecDeque::with_capacity(window_len);

        while temperature > self.config.min_temperature
            && iterations < self.config.max_iterations
        {
            if *stop.borrow() || Instant::now() >= deadline {
                break;
            }
            iterations += 1;

            let neighbor_genes = self.neighbor(&current.genes);
            let neighbor = self.problem.evaluate(&neighbor_genes);
            let delta = neighbor.energy - current.energy;
            let accepted = delta < 0.0 || {
                let probability = (-delta / temperature).exp();
                self.rng.gen::<f64>() < probability
            };

            if window.len() == window_len {
                window.pop_front();
            }
            window.push_back(accepted);

            if accepted {
                accepted_total += 1;
                current = neighbor;
                // Best tracking prefers valid solutions and is strictly
                // non-increasing in energy within a validity class.
                let improves = match (current.valid, best.valid) {
                    (true, false) => true,
                    (false, true) => false,
                    _ => current.energy < best.energy,
                };
                if improves {
                    best = current.clone();
                }
            }

            // Equilibrium boundary: apply the cooling schedule and the
            // reheating rule over the trailing acceptance window.
            if iterations % window_len == 0 {
                let rate = Self::acceptance_rate_of(&window);
                temperature = self.cooled(temperature, initial_temperature, iterations, rate);
                if rate < self.config.reheating_threshold && reheats < self.config.max_reheats {
                    temperature = (2.0 * temperature).min(initial_temperature);
                    reheats += 1;
                    debug!(temperature, reheats, "annealing reheated");
                }
            }
        }

        let cooled_out = temperature <= self.config.min_temperature;
        let acceptance_rate = if iterations == 0 {
            0.0
        } else {
            accepted_total as f64 / iterations as f64
        };
        debug!(
            iterations,
            acceptance_rate,
            final_temperature = temperature,
            best_energy = best.energy,
            best_valid = best.valid,
            "annealing finished"
        );
        SaOutcome {
            best,
            iterations,
            final_temperature: temperature,
            acceptance_rate,
            reheats,
            cooled_out,
        }
    }

    fn cooled(
        &self,
        temperature: f64,
        initial_temperature: f64,
        iteration: usize,
        window_rate: f64,
    ) -> f64 {
        match self.config.schedule {
            ScheduleType::Geometric => temperature * self.config.cooling_rate,
            ScheduleType::Logarithmic => initial_temperature / ((iteration + 1) as f64).ln(),
            ScheduleType::Adaptive => {
                let target = self.config.target_acceptance_rate;
                if window_rate < target * 0.5 {
                    temperature * 1.1
                } else if window_rate > target * 1.5 {
                    temperature * 0.9
                } else {
                    temperature * 0.95
                }
            }
        }
    }

    fn acceptance_rate_of(window: &VecDeque<bool>) -> f64 {
        if window.is_empty() {
            return 0.0;
        }
        let samples: Vec<f64> =
            window.iter().map(|&accepted| if accepted { 1.0 } else { 0.0 }).collect();
        Statistics::mean(samples.iter())
    }

    /// One of {compatible re-assign, swap, block swap}, 0.4/0.3/0.3.
    fn neighbor(&mut self, genes: &[usize]) -> Vec<usize> {
        let mut next = genes.to_vec();
        if next.is_empty() {
            return next;
        }
        let roll: f64 = self.rng.gen();
        if roll < REASSIGN_SHARE || next.len() < 2 {
            let position = self.rng.gen_range(0..next.len());
            let candidates = self.problem.candidates(position);
            next[position] = candidates[self.rng.gen_range(0..candidates.len())];
        } else if roll < REASSIGN_SHARE + SWAP_SHARE {
            let a = self.rng.gen_range(0..next.len());
            let b = self.rng.gen_range(0..next.len());
            next.swap(a, b);
        } else {
            self.block_swap(&mut next);
        }
        next
    }

    /// Swap two non-overlapping blocks of equal length <= 3.
    fn block_swap(&mut self, genes: &mut [usize]) {
        let max_len = MAX_BLOCK_LEN.min(genes.len() / 2);
        if max_len == 0 {
            return;
        }
        let block_len = self.rng.gen_range(1..=max_len);
        let first = self.rng.gen_range(0..=genes.len() - 2 * block_len);
        let second = self.rng.gen_range(first + block_len..=genes.len() - block_len);
        for offset in 0..block_len {
            genes.swap(first + offset, second + offset);
        }
    }
}
