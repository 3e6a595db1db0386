//! Feature extraction for the performance predictor.
//!
//! Each (node, task) pair maps to a fixed 25-field vector combining node
//! capacity, task demand, demand/capacity ratios, time-of-day, geographic
//! distance, affinity matching and historical per-node aggregates.

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use stratus_core::{LocationPreference, Node, ResourceAxis, Task};

pub const FEATURE_COUNT: usize = 25;
pub const TARGET_COUNT: usize = 4;

/// Historical aggregates for a node, maintained by the caller from
/// observed outcomes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeatureContext {
    /// Rolling success rate of work placed on this node, in [0, 1].
    pub historical_success_rate: f64,
}

impl Default for FeatureContext {
    fn default() -> Self {
        // With no history, assume the node behaves like its advertised
        // reliability rather than penalising it.
        Self { historical_success_rate: 1.0 }
    }
}

pub type FeatureVector = [f64; FEATURE_COUNT];

/// Build the 25-field feature vector for one candidate assignment.
pub fn extract(
    node: &Node,
    task: &Task,
    context: &FeatureContext,
    now: DateTime<Utc>,
) -> FeatureVector {
    let mut features = [0.0; FEATURE_COUNT];

    // 0..4: node capacity per axis
    for (i, axis) in ResourceAxis::ALL.iter().enumerate() {
        features[i] = node.capacity.axis(*axis);
    }
    // 4: current mean utilization
    features[4] = node.utilization.mean();
    // 5..9: node performance profile
    features[5] = node.performance.latency_ms;
    features[6] = node.performance.throughput;
    features[7] = node.performance.reliability;
    features[8] = node.performance.availability;
    // 9: blended unit cost
    features[9] = node.unit_costs.per_compute
        + node.unit_costs.per_memory
        + node.unit_costs.per_bandwidth
        + node.unit_costs.per_storage;
    // 10..14: task demand per axis
    for (i, axis) in ResourceAxis::ALL.iter().enumerate() {
        features[10 + i] = task.demand.axis(*axis);
    }
    // 14: priority, 15: estimated duration
    features[14] = task.priority as f64;
    features[15] = task.estimated_duration_ms as f64;
    // 16..20: demand/capacity ratios per axis
    for (i, axis) in ResourceAxis::ALL.iter().enumerate() {
        let capacity = node.capacity.axis(*axis);
        features[16 + i] = if capacity > 0.0 {
            task.demand.axis(*axis) / capacity
        } else {
            1.0
        };
    }
    // 20, 21: time of day encoded on the unit circle
    let hour = now.hour() as f64 + now.minute() as f64 / 60.0;
    let angle = hour / 24.0 * std::f64::consts::TAU;
    features[20] = angle.sin();
    features[21] = angle.cos();
    // 22: distance from the task's preferred point, if any
    features[22] = match &task.location_preference {
        Some(LocationPreference::Point(point)) => node.location.distance_km(point),
        _ => 0.0,
    };
    // 23: affinity score
    features[23] = node.affinity_matches(task) as f64;
    // 24: historical per-node success aggregate
    features[24] = context.historical_success_rate;

    features
}
