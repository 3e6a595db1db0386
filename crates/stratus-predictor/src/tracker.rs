//! Per-node historical aggregates feeding the feature vector.
//!
//! The tracker keeps a rolling success rate per node from observed task
//! outcomes; the predictor reads it as feature 25.

use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::features::FeatureContext;

pub struct ContextTracker {
    ema_factor: f64,
    rates: RwLock<HashMap<String, f64>>,
}

impl ContextTracker {
    pub fn new(ema_factor: f64) -> Self {
        Self { ema_factor, rates: RwLock::new(HashMap::new()) }
    }

    /// Feature context for a node; nodes without history use the neutral
    /// default.
    pub async fn context_for(&self, node_id: &str) -> FeatureContext {
        match self.rates.read().await.get(node_id) {
            Some(rate) => FeatureContext { historical_success_rate: *rate },
            None => FeatureContext::default(),
        }
    }

    /// Fold one observed outcome into the node's rolling success rate.
    pub async fn record(&self, node_id: &str, success: bool) {
        let outcome = if success { 1.0 } else { 0.0 };
        let mut rates = self.rates.write().await;
        let entry = rates.entry(node_id.to_string()).or_insert(outcome);
        *entry = self.ema_factor * *entry + (1.0 - self.ema_factor) * outcome;
    }

    pub async fn success_rate(&self, node_id: &str) -> Option<f64> {
        self.rates.read().await.get(node_id).copied()
    }
}
