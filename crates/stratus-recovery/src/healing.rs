//! Self-healing: pre-emptive recovery scheduling from health trends.
//!
//! Signals with degrading trends and confidence at or above the
//! configured threshold map to a pre-emptive recovery, each action
//! carrying an explicit risk assessment and prerequisites.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use stratus_core::RecoveryConfig;

use crate::orchestrator::RecoveryOrchestrator;
use crate::types::{ErrorData, RiskLevel};
use crate::RecoveryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Stable,
    Degrading,
}

/// One health observation with a confidence-scored trend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSignal {
    pub component: String,
    /// Metric family, e.g. "memory", "disk", "latency", "connections".
    pub metric: String,
    pub value: f64,
    pub threshold: f64,
    pub trend: Trend,
    /// Confidence that the trend will breach the threshold, in [0, 1].
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    pub justification: String,
}

/// A pre-emptive action the scheduler proposes for a degrading signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingAction {
    pub error_type: String,
    pub component: String,
    pub risk: RiskAssessment,
    pub prerequisites: Vec<String>,
}

pub struct SelfHealingScheduler {
    config: RecoveryConfig,
    orchestrator: Arc<RecoveryOrchestrator>,
}

impl SelfHealingScheduler {
    pub fn new(config: RecoveryConfig, orchestrator: Arc<RecoveryOrchestrator>) -> Self {
        Self { config, orchestrator }
    }

    /// Decide whether a signal warrants pre-emptive recovery.
    pub fn evaluate(&self, signal: &HealthSignal) -> Option<HealingAction> {
        if signal.trend != Trend::Degrading {
            return None;
        }
        if signal.confidence < self.config.healing_confidence_threshold {
            debug!(
                component = %signal.component,
                confidence = signal.confidence,
                "signal below healing confidence threshold"
            );
            return None;
        }

        let (error_type, risk_level, prerequisites) = match signal.metric.as_str() {
            "memory" => (
                "memory-exhaustion",
                RiskLevel::Medium,
                vec!["capacity headroom".to_string()],
            ),
            "disk" => ("disk-pressure", RiskLevel::Low, vec![]),
            "connections" => (
                "database-timeout",
                RiskLevel::Low,
                vec!["replica available".to_string()],
            ),
            "latency" => (
                "slow-degradation",
                RiskLevel::Medium,
                vec!["alternate route exists".to_string()],
            ),
            _ => return None,
        };

        Some(HealingAction {
            error_type: error_type.to_string(),
            component: signal.component.clone(),
            risk: RiskAssessment {
                level: risk_level,
                justification: format!(
                    "{} at {:.2} trending toward threshold {:.2} with confidence {:.2}",
                    signal.metric, signal.value, signal.threshold, signal.confidence
                ),
            },
            prerequisites,
        })
    }

    /// Evaluate a signal and, when warranted, queue the pre-emptive
    /// recovery through the normal orchestrator path.
    pub async fn schedule(&self, signal: &HealthSignal) -> Result<Option<Uuid>, RecoveryError> {
        let Some(action) = self.evaluate(signal) else {
            return Ok(None);
        };
        info!(
            component = %action.component,
            error_type = %action.error_type,
            risk = ?action.risk.level,
            "scheduling pre-emptive recovery"
        );
        let id = self
            .orchestrator
            .initiate(ErrorData {
                error_type: action.error_type.clone(),
                message: format!(
                    "pre-emptive: {} ({})",
                    action.risk.justification,
                    action
                        .prerequisites
                        .iter()
                        .map(String::as_str)
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
                component: action.component.clone(),
                deployment_id: None,
                metrics: HashMap::from([
                    ("value".to_string(), signal.value),
                    ("threshold".to_string(), signal.threshold),
                ]),
            })
            .await?;
        Ok(Some(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::SimulatedExecutor;
    use crate::strategy::StrategyRegistry;
    use std::time::Duration;
    use stratus_bus::{CoordinationBus, MemoryBus};

    fn signal(metric: &str, trend: Trend, confidence: f64) -> HealthSignal {
        HealthSignal {
            component: "worker".to_string(),
            metric: metric.to_string(),
            value: 0.85,
            threshold: 0.95,
            trend,
            confidence,
        }
    }

    async fn scheduler() -> SelfHealingScheduler {
        let bus: Arc<dyn CoordinationBus> = Arc::new(MemoryBus::new());
        let registry = Arc::new(StrategyRegistry::with_builtins(bus.clone(), 0.9).await);
        let orchestrator = RecoveryOrchestrator::new(
            RecoveryConfig::default(),
            bus,
            registry,
            Arc::new(SimulatedExecutor),
            "swarm-test",
            "healing-test",
        );
        SelfHealingScheduler::new(RecoveryConfig::default(), orchestrator)
    }

    #[tokio::test]
    async fn low_confidence_signals_are_ignored() {
        let scheduler = scheduler().await;
        assert!(scheduler.evaluate(&signal("memory", Trend::Degrading, 0.4)).is_none());
        assert!(scheduler.evaluate(&signal("memory", Trend::Stable, 0.99)).is_none());
    }

    #[tokio::test]
    async fn degrading_memory_signal_maps_to_exhaustion_recovery() {
        let scheduler = scheduler().await;
        let action = scheduler
            .evaluate(&signal("memory", Trend::Degrading, 0.9))
            .expect("action expected");
        assert_eq!(action.error_type, "memory-exhaustion");
        assert_eq!(action.risk.level, RiskLevel::Medium);
        assert!(!action.prerequisites.is_empty());
    }

    #[tokio::test]
    async fn scheduled_action_runs_to_completion() {
        let scheduler = scheduler().await;
        let id = scheduler
            .schedule(&signal("disk", Trend::Degrading, 0.95))
            .await
            .unwrap()
            .expect("recovery scheduled");
        let status = scheduler
            .orchestrator
            .wait_terminal(id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(status, crate::types::RecoveryStatus::Completed);
    }
}
