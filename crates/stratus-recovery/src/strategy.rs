//! Strategy registry with rolling success-rate selection.
//!
//! Selection filters by applicable error type and ranks by each
//! strategy's exponential moving average of observed outcomes (seeded
//! from its prior success probability); per-strategy performance is
//! persisted on the bus.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

use stratus_bus::{CoordinationBus, CoordinationBusExt};

use crate::types::{
    RecoveryAction, RecoveryContext, RecoveryStep, RecoveryStrategy, ResourceShare, RiskLevel,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StrategyPerformance {
    pub ema_success: f64,
    pub samples: u64,
}

pub struct StrategyRegistry {
    bus: Arc<dyn CoordinationBus>,
    ema_factor: f64,
    strategies: RwLock<HashMap<String, RecoveryStrategy>>,
    performance: RwLock<HashMap<String, StrategyPerformance>>,
}

impl StrategyRegistry {
    pub fn new(bus: Arc<dyn CoordinationBus>, ema_factor: f64) -> Self {
        Self {
            bus,
            ema_factor,
            strategies: RwLock::new(HashMap::new()),
            performance: RwLock::new(HashMap::new()),
        }
    }

    /// Registry preloaded with the built-in strategy catalogue.
    pub async fn with_builtins(bus: Arc<dyn CoordinationBus>, ema_factor: f64) -> Self {
        let registry = Self::new(bus, ema_factor);
        for strategy in builtin_strategies() {
            registry.register(strategy).await;
        }
        registry
    }

    pub async fn register(&self, strategy: RecoveryStrategy) {
        info!(strategy = %strategy.id, "recovery strategy registered");
        self.strategies.write().await.insert(strategy.id.clone(), strategy);
    }

    pub async fn get(&self, id: &str) -> Option<RecoveryStrategy> {
        self.strategies.read().await.get(id).cloned()
    }

    /// Rolling success rate for ranking; prior probability until observed.
    pub async fn success_rate(&self, id: &str) -> f64 {
        if let Some(performance) = self.performance.read().await.get(id) {
            return performance.ema_success;
        }
        self.strategies
            .read()
            .await
            .get(id)
            .map(|s| s.success_probability)
            .unwrap_or(0.0)
    }

    /// Pick the applicable strategy with the best rolling success rate;
    /// ties break by strategy id for determinism.
    pub async fn select(&self, context: &RecoveryContext) -> Option<RecoveryStrategy> {
        let applicable: Vec<RecoveryStrategy> = {
            let strategies = self.strategies.read().await;
            strategies
                .values()
                .filter(|strategy| {
                    strategy
                        .applicable_error_types
                        .iter()
                        .any(|t| t == &context.error_type)
                })
                .cloned()
                .collect()
        };
        if applicable.is_empty() {
            return None;
        }

        let mut ranked = Vec::with_capacity(applicable.len());
        {
            let performance = self.performance.read().await;
            for strategy in applicable {
                let rate = performance
                    .get(&strategy.id)
                    .map(|p| p.ema_success)
                    .unwrap_or(strategy.success_probability);
                ranked.push((rate, strategy));
            }
        }
        ranked.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.id.cmp(&b.1.id))
        });
        let selected = ranked.remove(0).1;
        debug!(strategy = %selected.id, error_type = %context.error_type, "strategy selected");
        Some(selected)
    }

    /// Fold one observed outcome into the strategy's EMA and persist it.
    pub async fn record_outcome(&self, id: &str, success: bool) {
        let outcome = if success { 1.0 } else { 0.0 };
        let prior_default = self
            .strategies
            .read()
            .await
            .get(id)
            .map(|s| s.success_probability)
            .unwrap_or(0.5);
        let updated = {
            let mut performance = self.performance.write().await;
            let prior = performance
                .get(id)
                .map(|p| p.ema_success)
                .unwrap_or(prior_default);
            let entry = performance.entry(id.to_string()).or_insert(StrategyPerformance {
                ema_success: prior,
                samples: 0,
            });
            entry.ema_success = self.ema_factor * prior + (1.0 - self.ema_factor) * outcome;
            entry.samples += 1;
            *entry
        };

        let _ = self
            .bus
            .put_json(
                &format!("recovery:strategy-performance:{id}"),
                &updated,
                Some(Duration::from_secs(7 * 24 * 3600)),
            )
            .await;
    }
}

fn step(
    id: &str,
    name: &str,
    action: RecoveryAction,
    timeout_ms: u64,
    retry_attempts: u32,
    validation: Option<&str>,
) -> RecoveryStep {
    RecoveryStep {
        id: id.to_string(),
        name: name.to_string(),
        action,
        timeout_ms,
        retry_attempts,
        validation: validation.map(str::to_string),
    }
}

/// Built-in strategy catalogue covering the common runtime error classes.
pub fn builtin_strategies() -> Vec<RecoveryStrategy> {
    vec![
        RecoveryStrategy {
            id: "database-connection-recovery".to_string(),
            name: "Re-establish database connectivity".to_string(),
            applicable_error_types: vec![
                "database-connection-lost".to_string(),
                "database-timeout".to_string(),
            ],
            required_resources: ResourceShare::new(0.1, 0.05, 0.2, 0.0),
            estimated_duration_ms: 60_000,
            success_probability: 0.9,
            risk_level: RiskLevel::Low,
            steps: vec![
                step(
                    "diagnose-pool",
                    "Inspect connection pool state",
                    RecoveryAction::Custom("inspect-pool".to_string()),
                    10_000,
                    1,
                    None,
                ),
                step(
                    "flush-connections",
                    "Flush stale connections",
                    RecoveryAction::FlushConnections,
                    15_000,
                    2,
                    Some("pool reports zero stale connections"),
                ),
                step(
                    "reconnect",
                    "Re-open connections against the primary",
                    RecoveryAction::RestartComponent,
                    30_000,
                    3,
                    Some("test query succeeds"),
                ),
            ],
            rollback_plan: vec![step(
                "failover",
                "Fail over to the read replica",
                RecoveryAction::FailoverReplica,
                30_000,
                1,
                Some("replica serving reads"),
            )],
            prerequisites: vec!["replica available".to_string()],
            side_effects: vec!["in-flight transactions aborted".to_string()],
        },
        RecoveryStrategy {
            id: "service-restart".to_string(),
            name: "Restart the failing service".to_string(),
            applicable_error_types: vec![
                "service-unavailable".to_string(),
                "crash-loop".to_string(),
            ],
            required_resources: ResourceShare::new(0.2, 0.1, 0.05, 0.0),
            estimated_duration_ms: 90_000,
            success_probability: 0.8,
            risk_level: RiskLevel::Medium,
            steps: vec![
                step(
                    "drain",
                    "Drain traffic from the instance",
                    RecoveryAction::Custom("drain-traffic".to_string()),
                    20_000,
                    1,
                    None,
                ),
                step(
                    "restart",
                    "Restart the service process",
                    RecoveryAction::RestartComponent,
                    45_000,
                    2,
                    Some("health endpoint returns ok"),
                ),
            ],
            rollback_plan: vec![step(
                "reroute",
                "Route traffic to healthy replicas",
                RecoveryAction::FailoverReplica,
                20_000,
                1,
                None,
            )],
            prerequisites: vec![],
            side_effects: vec!["brief capacity reduction".to_string()],
        },
        RecoveryStrategy {
            id: "memory-pressure-relief".to_string(),
            name: "Relieve memory pressure".to_string(),
            applicable_error_types: vec!["memory-exhaustion".to_string()],
            required_resources: ResourceShare::new(0.1, 0.3, 0.0, 0.0),
            estimated_duration_ms: 45_000,
            success_probability: 0.75,
            risk_level: RiskLevel::Medium,
            steps: vec![
                step(
                    "clear-caches",
                    "Clear in-process caches",
                    RecoveryAction::ClearBacklog,
                    10_000,
                    1,
                    None,
                ),
                step(
                    "scale-out",
                    "Add one worker to spread the heap",
                    RecoveryAction::ScaleOut,
                    60_000,
                    1,
                    Some("new worker joined"),
                ),
            ],
            rollback_plan: vec![step(
                "scale-in",
                "Remove the added worker",
                RecoveryAction::Custom("scale-in".to_string()),
                30_000,
                1,
                None,
            )],
            prerequisites: vec!["capacity headroom".to_string()],
            side_effects: vec!["cold caches".to_string()],
        },
        RecoveryStrategy {
            id: "network-partition-heal".to_string(),
            name: "Heal network partition".to_string(),
            applicable_error_types: vec!["network-partition".to_string()],
            required_resources: ResourceShare::new(0.05, 0.0, 0.4, 0.0),
            estimated_duration_ms: 120_000,
            success_probability: 0.6,
            risk_level: RiskLevel::High,
            steps: vec![
                step(
                    "reroute",
                    "Re-route around the partition",
                    RecoveryAction::ReallocateResources,
                    60_000,
                    2,
                    Some("cross-zone pings succeed"),
                ),
            ],
            rollback_plan: vec![step(
                "restore-routes",
                "Restore the original routing table",
                RecoveryAction::Custom("restore-routes".to_string()),
                30_000,
                1,
                None,
            )],
            prerequisites: vec!["alternate route exists".to_string()],
            side_effects: vec!["higher cross-zone latency".to_string()],
        },
        RecoveryStrategy {
            id: "disk-cleanup".to_string(),
            name: "Reclaim disk space".to_string(),
            applicable_error_types: vec!["disk-pressure".to_string()],
            required_resources: ResourceShare::new(0.1, 0.0, 0.0, 0.2),
            estimated_duration_ms: 30_000,
            success_probability: 0.85,
            risk_level: RiskLevel::Low,
            steps: vec![step(
                "purge",
                "Purge expired artifacts and logs",
                RecoveryAction::ClearBacklog,
                30_000,
                2,
                Some("free space above watermark"),
            )],
            rollback_plan: vec![],
            prerequisites: vec![],
            side_effects: vec!["older logs unavailable".to_string()],
        },
    ]
}
