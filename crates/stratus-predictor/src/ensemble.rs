//! Bagged MLP ensemble with validation-weighted averaging.

use chrono::{DateTime, Utc};
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

use stratus_core::{Node, PredictorConfig, Task};

use crate::features::{self, FeatureContext, FeatureVector, FEATURE_COUNT, TARGET_COUNT};
use crate::network::Mlp;
use crate::PredictorError;

/// Architectures member models are drawn from.
const ARCHITECTURES: &[&[usize]] = &[
    &[64, 32, 16],
    &[48, 24],
    &[32, 16],
    &[64, 32],
    &[32, 32, 16],
];

/// Upper bound on retained observations.
const HISTORY_CAPACITY: usize = 10_000;

/// One recorded (features, outcome) pair.
#[derive(Debug, Clone)]
struct Observation {
    features: FeatureVector,
    targets: [f64; TARGET_COUNT],
}

/// Observed runtime outcome for a completed (node, task) execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ObservedOutcome {
    pub latency_ms: f64,
    pub cost: f64,
    pub reliability: f64,
    pub success_rate: f64,
}

impl ObservedOutcome {
    fn targets(&self) -> [f64; TARGET_COUNT] {
        [self.latency_ms, self.cost, self.reliability, self.success_rate]
    }
}

/// Ensemble output for one candidate assignment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Prediction {
    pub latency_ms: f64,
    pub cost: f64,
    pub reliability: f64,
    pub success_rate: f64,
    /// 1 − sqrt(weighted ensemble variance), clipped to [0, 1]. The
    /// neutral stub carries exactly 0.5.
    pub confidence: f64,
}

impl Prediction {
    /// Non-informative stub returned while the ensemble is untrained.
    pub fn neutral() -> Self {
        Self {
            latency_ms: 100.0,
            cost: 10.0,
            reliability: 0.95,
            success_rate: 0.95,
            confidence: 0.5,
        }
    }

    /// Consumers ignore predictions that are not strictly more confident
    /// than the stub.
    pub fn is_informative(&self) -> bool {
        self.confidence > 0.5
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictorStatus {
    pub trained: bool,
    pub models: usize,
    pub observations: usize,
    pub last_trained: Option<DateTime<Utc>>,
}

struct EnsembleMember {
    network: Mlp,
    weight: f64,
    validation_mse: f64,
}

#[derive(Clone, Copy)]
struct Bounds {
    min: f64,
    max: f64,
}

impl Bounds {
    fn empty() -> Self {
        Self { min: f64::INFINITY, max: f64::NEG_INFINITY }
    }

    fn update(&mut self, value: f64) {
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    fn normalize(&self, value: f64) -> f64 {
        let span = self.max - self.min;
        if span <= f64::EPSILON {
            0.5
        } else {
            ((value - self.min) / span).clamp(0.0, 1.0)
        }
    }

    fn denormalize(&self, value: f64) -> f64 {
        let span = self.max - self.min;
        if span <= f64::EPSILON {
            self.min
        } else {
            self.min + value * span
        }
    }
}

struct EnsembleState {
    members: Vec<EnsembleMember>,
    feature_bounds: Vec<Bounds>,
    /// Per-target min/max learned from training data; used to
    /// de-normalise predictions.
    target_bounds: Vec<Bounds>,
    trained: bool,
    last_trained: Option<DateTime<Utc>>,
}

impl EnsembleState {
    fn untrained() -> Self {
        Self {
            members: Vec::new(),
            feature_bounds: vec![Bounds::empty(); FEATURE_COUNT],
            target_bounds: vec![Bounds::empty(); TARGET_COUNT],
            trained: false,
            last_trained: None,
        }
    }
}

pub struct PerformancePredictor {
    config: PredictorConfig,
    state: Arc<RwLock<EnsembleState>>,
    history: Arc<RwLock<Vec<Observation>>>,
    retrain_tx: mpsc::Sender<()>,
    retrain_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl PerformancePredictor {
    pub fn new(config: PredictorConfig) -> Self {
        let (retrain_tx, retrain_rx) = mpsc::channel(1);
        Self {
            config,
            state: Arc::new(RwLock::new(EnsembleState::untrained())),
            history: Arc::new(RwLock::new(Vec::new())),
            retrain_tx,
            retrain_rx: Mutex::new(Some(retrain_rx)),
        }
    }

    /// Spawn the background retrain worker. Placement never waits on it.
    pub async fn start(self: Arc<Self>) {
        let mut receiver = match self.retrain_rx.lock().await.take() {
            Some(receiver) => receiver,
            None => return,
        };
        let predictor = Arc::clone(&self);
        tokio::spawn(async move {
            while receiver.recv().await.is_some() {
                match predictor.train().await {
                    Ok(()) => debug!("predictor retrained"),
                    Err(PredictorError::InsufficientData { .. }) => {}
                    Err(err) => warn!(error = %err, "predictor retrain failed"),
                }
            }
        });
    }

    /// Predict the outcome of running `task` on `node`. Returns the
    /// neutral stub while untrained.
    pub async fn predict(
        &self,
        node: &Node,
        task: &Task,
        context: &FeatureContext,
    ) -> Prediction {
        let features = features::extract(node, task, context, Utc::now());
        self.predict_features(&features).await
    }

    /// Prediction from an already-extracted feature vector.
    pub async fn predict_features(&self, features: &FeatureVector) -> Prediction {
        let state = self.state.read().await;
        if !state.trained || state.members.is_empty() {
            return Prediction::neutral();
        }

        let input = normalize_features(features, &state.feature_bounds);
        let total_weight: f64 = state.members.iter().map(|m| m.weight).sum();
        if total_weight <= f64::EPSILON {
            return Prediction::neutral();
        }

        let outputs: Vec<Array1<f64>> =
            state.members.iter().map(|m| m.network.predict(&input)).collect();

        let mut mean = [0.0; TARGET_COUNT];
        for (member, output) in state.members.iter().zip(&outputs) {
            for target in 0..TARGET_COUNT {
                mean[target] += member.weight * output[target];
            }
        }
        for value in mean.iter_mut() {
            *value /= total_weight;
        }

        let mut variance = [0.0; TARGET_COUNT];
        for (member, output) in state.members.iter().zip(&outputs) {
            for target in 0..TARGET_COUNT {
                let diff = output[target] - mean[target];
                variance[target] += member.weight * diff * diff;
            }
        }
        let mean_variance =
            variance.iter().map(|v| v / total_weight).sum::<f64>() / TARGET_COUNT as f64;
        let confidence = (1.0 - mean_variance.sqrt()).clamp(0.0, 1.0);

        Prediction {
            latency_ms: state.target_bounds[0].denormalize(mean[0].clamp(0.0, 1.0)),
            cost: state.target_bounds[1].denormalize(mean[1].clamp(0.0, 1.0)),
            reliability: state.target_bounds[2].denormalize(mean[2].clamp(0.0, 1.0)),
            success_rate: state.target_bounds[3].denormalize(mean[3].clamp(0.0, 1.0)),
            confidence,
        }
    }

    /// Record an observed outcome. If the ensemble's error on it exceeds
    /// the update threshold, a retrain is enqueued (never run inline).
    pub async fn observe(
        &self,
        node: &Node,
        task: &Task,
        context: &FeatureContext,
        outcome: ObservedOutcome,
    ) {
        let features = features::extract(node, task, context, Utc::now());
        let targets = outcome.targets();

        {
            let mut history = self.history.write().await;
            if history.len() == HISTORY_CAPACITY {
                history.remove(0);
            }
            history.push(Observation { features, targets });
        }

        // Snapshot what we need and release the lock before predicting, so
        // the read lock is never held across another state acquisition.
        let (trained, target_bounds) = {
            let state = self.state.read().await;
            (state.trained, state.target_bounds.clone())
        };
        let should_retrain = if !trained {
            self.history.read().await.len() >= self.config.min_training_samples
        } else {
            let predicted = self.predict_features(&features).await;
            let mut error = 0.0;
            for (target, (observed, bounds)) in
                targets.iter().zip(target_bounds.iter()).enumerate()
            {
                let predicted_value = match target {
                    0 => predicted.latency_ms,
                    1 => predicted.cost,
                    2 => predicted.reliability,
                    _ => predicted.success_rate,
                };
                error += (bounds.normalize(predicted_value) - bounds.normalize(*observed)).abs();
            }
            error / TARGET_COUNT as f64 > self.config.model_update_threshold
        };

        if should_retrain && self.retrain_tx.try_send(()).is_ok() {
            debug!("predictor retrain enqueued");
        }
    }

    /// Train the ensemble from recorded history. Exposed for tests and the
    /// background worker; callers on the placement path never invoke it.
    pub async fn train(&self) -> Result<(), PredictorError> {
        let observations = self.history.read().await.clone();
        if observations.len() < self.config.min_training_samples {
            return Err(PredictorError::InsufficientData {
                available: observations.len(),
                required: self.config.min_training_samples,
            });
        }

        let mut feature_bounds = vec![Bounds::empty(); FEATURE_COUNT];
        let mut target_bounds = vec![Bounds::empty(); TARGET_COUNT];
        for observation in &observations {
            for (bounds, value) in feature_bounds.iter_mut().zip(observation.features.iter()) {
                bounds.update(*value);
            }
            for (bounds, value) in target_bounds.iter_mut().zip(observation.targets.iter()) {
                bounds.update(*value);
            }
        }

        let inputs: Vec<Array1<f64>> = observations
            .iter()
            .map(|o| normalize_features(&o.features, &feature_bounds))
            .collect();
        let targets: Vec<Array1<f64>> = observations
            .iter()
            .map(|o| {
                Array1::from_iter(
                    o.targets
                        .iter()
                        .zip(target_bounds.iter())
                        .map(|(value, bounds)| bounds.normalize(*value)),
                )
            })
            .collect();

        let validation_len = ((inputs.len() as f64 * self.config.validation_split) as usize)
            .clamp(1, inputs.len() - 1);
        let train_len = inputs.len() - validation_len;
        let validation_inputs = &inputs[train_len..];
        let validation_targets = &targets[train_len..];

        let mut rng = StdRng::from_entropy();
        let mut members = Vec::with_capacity(self.config.ensemble_size);
        for model_index in 0..self.config.ensemble_size {
            let architecture = ARCHITECTURES[model_index % ARCHITECTURES.len()];
            let mut network = Mlp::new(FEATURE_COUNT, architecture, TARGET_COUNT, &mut rng);

            // Bagged bootstrap sample over the training split.
            let mut sample_inputs = Vec::with_capacity(train_len);
            let mut sample_targets = Vec::with_capacity(train_len);
            for _ in 0..train_len {
                let pick = rng.gen_range(0..train_len);
                sample_inputs.push(inputs[pick].clone());
                sample_targets.push(targets[pick].clone());
            }

            for _ in 0..self.config.training_epochs {
                network.train_epoch(&sample_inputs, &sample_targets, self.config.learning_rate);
            }

            let validation_mse = network.evaluate(validation_inputs, validation_targets);
            members.push(EnsembleMember {
                network,
                weight: 1.0 / (1.0 + validation_mse),
                validation_mse,
            });
        }

        let mut state = self.state.write().await;
        *state = EnsembleState {
            members,
            feature_bounds,
            target_bounds,
            trained: true,
            last_trained: Some(Utc::now()),
        };
        info!(
            observations = observations.len(),
            models = state.members.len(),
            "predictor ensemble trained"
        );
        Ok(())
    }

    pub async fn status(&self) -> PredictorStatus {
        let state = self.state.read().await;
        PredictorStatus {
            trained: state.trained,
            models: state.members.len(),
            observations: self.history.read().await.len(),
            last_trained: state.last_trained,
        }
    }

    /// Validation error of each member, for diagnostics.
    pub async fn member_errors(&self) -> Vec<f64> {
        self.state.read().await.members.iter().map(|m| m.validation_mse).collect()
    }
}

fn normalize_features(features: &FeatureVector, bounds: &[Bounds]) -> Array1<f64> {
    Array1::from_iter(
        features
            .iter()
            .zip(bounds.iter())
            .map(|(value, bounds)| bounds.normalize(*value)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use stratus_core::{
        GeoLocation, NodePerformance, NodeStatus, ResourceVector, UnitCosts,
    };

    fn node(latency: f64) -> Node {
        Node {
            id: "n1".to_string(),
            region: "eu-west".to_string(),
            location: GeoLocation::new(53.0, -6.0),
            capacity: ResourceVector::new(100.0, 100.0, 100.0, 100.0),
            utilization: ResourceVector::zero(),
            unit_costs: UnitCosts {
                per_compute: 1.0,
                per_memory: 0.5,
                per_bandwidth: 0.2,
                per_storage: 0.1,
            },
            performance: NodePerformance { latency_ms: latency, ..NodePerformance::default() },
            capabilities: BTreeSet::new(),
            supported_tasks: BTreeSet::new(),
            status: NodeStatus::Healthy,
        }
    }

    fn task(compute: f64) -> Task {
        Task {
            id: "t1".to_string(),
            demand: ResourceVector::new(compute, 10.0, 5.0, 1.0),
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

    fn test_config() -> PredictorConfig {
        PredictorConfig {
            ensemble_size: 3,
            min_training_samples: 40,
            training_epochs: 80,
            ..PredictorConfig::default()
        }
    }

    #[tokio::test]
    async fn untrained_predictor_returns_neutral_stub() {
        let predictor = PerformancePredictor::new(test_config());
        let prediction = predictor
            .predict(&node(20.0), &task(10.0), &FeatureContext::default())
            .await;
        assert_eq!(prediction.confidence, 0.5);
        assert!(!prediction.is_informative());
    }

    #[tokio::test]
    async fn training_requires_minimum_samples() {
        let predictor = PerformancePredictor::new(test_config());
        let err = predictor.train().await.unwrap_err();
        assert!(matches!(err, PredictorError::InsufficientData { .. }));
    }

    #[tokio::test]
    async fn trained_ensemble_tracks_latency_signal() {
        let predictor = PerformancePredictor::new(test_config());
        // Latency outcomes proportional to node latency; everything else flat.
        for i in 0..60 {
            let latency = 10.0 + (i % 6) as f64 * 50.0;
            let n = node(latency);
            let t = task(10.0 + (i % 4) as f64 * 10.0);
            predictor
                .observe(
                    &n,
                    &t,
                    &FeatureContext::default(),
                    ObservedOutcome {
                        latency_ms: latency * 1.5,
                        cost: 20.0,
                        reliability: 0.99,
                        success_rate: 0.98,
                    },
                )
                .await;
        }
        predictor.train().await.unwrap();

        let status = predictor.status().await;
        assert!(status.trained);
        assert_eq!(status.models, 3);

        let fast = predictor
            .predict(&node(10.0), &task(20.0), &FeatureContext::default())
            .await;
        let slow = predictor
            .predict(&node(260.0), &task(20.0), &FeatureContext::default())
            .await;
        assert!(
            fast.latency_ms < slow.latency_ms,
            "fast {} vs slow {}",
            fast.latency_ms,
            slow.latency_ms
        );
        // De-normalised latency stays within the observed target range.
        assert!(fast.latency_ms >= 10.0 && slow.latency_ms <= 400.0);
    }
}
