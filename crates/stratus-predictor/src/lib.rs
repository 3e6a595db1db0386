//! Performance predictor: an ensemble of small feed-forward networks
//! estimating `(latency, cost, reliability, success rate)` for a candidate
//! (node, task) pair, with a confidence derived from ensemble variance.
//!
//! The predictor never blocks placement: until trained it returns a
//! neutral stub with confidence 0.5 that the optimizer treats as
//! non-informative, and retraining always happens on a background task.

pub mod ensemble;
pub mod features;
pub mod network;
pub mod tracker;

pub use ensemble::{ObservedOutcome, PerformancePredictor, Prediction, PredictorStatus};
pub use features::{FeatureContext, FeatureVector, FEATURE_COUNT, TARGET_COUNT};
pub use network::Mlp;
pub use tracker::ContextTracker;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PredictorError {
    #[error("insufficient training data: {available} observations, {required} required")]
    InsufficientData { available: usize, required: usize },

    #[error("malformed observation: {0}")]
    MalformedObservation(String),
}
