//! Rollback manager: automatic trigger evaluation and ordered reversal.
//!
//! Five trigger classes (error rate, p95 response time, availability,
//! health-check pass rate, critical error patterns), each with its own
//! threshold and sustained-duration window. Execution restores the
//! captured snapshot in strict step order with bounded retries and an
//! overall timeout, and at most one rollback runs per deployment.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

use stratus_bus::{CoordinationBus, CoordinationBusExt};
use stratus_core::{channels, EventEnvelope, RollbackConfig};

use crate::health::MetricsSource;
use crate::snapshot::{Snapshot, SnapshotStore};
use crate::types::{Color, DeploymentExecution, RuntimeHealthSample};
use crate::DeploymentError;

/// Automatic rollback trigger classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackTrigger {
    ErrorRate,
    ResponseTime,
    Availability,
    HealthCheckPassRate,
    CriticalError,
}

impl RollbackTrigger {
    pub const ALL: [RollbackTrigger; 5] = [
        RollbackTrigger::ErrorRate,
        RollbackTrigger::ResponseTime,
        RollbackTrigger::Availability,
        RollbackTrigger::HealthCheckPassRate,
        RollbackTrigger::CriticalError,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            RollbackTrigger::ErrorRate => "error_rate",
            RollbackTrigger::ResponseTime => "response_time",
            RollbackTrigger::Availability => "availability",
            RollbackTrigger::HealthCheckPassRate => "health_check_pass_rate",
            RollbackTrigger::CriticalError => "critical_error",
        }
    }
}

/// Ordered reversal steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStep {
    RestoreConfiguration,
    RestoreDataState,
    FlipTraffic,
    Verify,
    Cleanup,
}

impl RollbackStep {
    pub const ORDER: [RollbackStep; 5] = [
        RollbackStep::RestoreConfiguration,
        RollbackStep::RestoreDataState,
        RollbackStep::FlipTraffic,
        RollbackStep::Verify,
        RollbackStep::Cleanup,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            RollbackStep::RestoreConfiguration => "restore_configuration",
            RollbackStep::RestoreDataState => "restore_data_state",
            RollbackStep::FlipTraffic => "flip_traffic",
            RollbackStep::Verify => "verify",
            RollbackStep::Cleanup => "cleanup",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStatus {
    Completed,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackStepRecord {
    pub step: RollbackStep,
    pub succeeded: bool,
    pub attempts: u32,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackOutcome {
    pub rollback_id: Uuid,
    pub deployment_id: Uuid,
    pub status: RollbackStatus,
    pub reason: String,
    pub restored_snapshot: Option<Uuid>,
    pub steps: Vec<RollbackStepRecord>,
}

/// Per-trigger breach bookkeeping for sustained-window evaluation.
#[derive(Default)]
struct TriggerState {
    breach_since: HashMap<RollbackTrigger, Instant>,
}

pub struct RollbackManager {
    bus: Arc<dyn CoordinationBus>,
    config: RollbackConfig,
    snapshots: Arc<SnapshotStore>,
    metrics: Arc<dyn MetricsSource>,
    swarm_id: String,
    producer_id: String,
    in_flight: Arc<RwLock<HashSet<Uuid>>>,
    trigger_state: Arc<RwLock<HashMap<Uuid, TriggerState>>>,
    history: Arc<RwLock<HashMap<Uuid, RollbackOutcome>>>,
}

impl RollbackManager {
    pub fn new(
        bus: Arc<dyn CoordinationBus>,
        config: RollbackConfig,
        snapshots: Arc<SnapshotStore>,
        metrics: Arc<dyn MetricsSource>,
        swarm_id: impl Into<String>,
        producer_id: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            config,
            snapshots,
            metrics,
            swarm_id: swarm_id.into(),
            producer_id: producer_id.into(),
            in_flight: Arc::new(RwLock::new(HashSet::new())),
            trigger_state: Arc::new(RwLock::new(HashMap::new())),
            history: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Outcome of a finished rollback, by rollback id.
    pub async fn outcome(&self, rollback_id: Uuid) -> Option<RollbackOutcome> {
        self.history.read().await.get(&rollback_id).cloned()
    }

    pub fn snapshots(&self) -> &Arc<SnapshotStore> {
        &self.snapshots
    }

    /// Whether a sample breaches a trigger's threshold right now.
    fn breached(&self, trigger: RollbackTrigger, sample: &RuntimeHealthSample) -> bool {
        match trigger {
            RollbackTrigger::ErrorRate => sample.error_rate > self.config.error_rate_threshold,
            RollbackTrigger::ResponseTime => {
                sample.p95_response_ms > self.config.p95_response_threshold_ms
            }
            RollbackTrigger::Availability => {
                sample.availability < self.config.availability_threshold
            }
            RollbackTrigger::HealthCheckPassRate => {
                sample.health_check_pass_rate < self.config.health_pass_rate_threshold
            }
            RollbackTrigger::CriticalError => sample.critical_errors.iter().any(|line| {
                self.config
                    .critical_error_patterns
                    .iter()
                    .any(|pattern| line.contains(pattern))
            }),
        }
    }

    fn window_for(&self, trigger: RollbackTrigger) -> Duration {
        let millis = match trigger {
            RollbackTrigger::ErrorRate => self.config.error_rate_window_ms,
            RollbackTrigger::ResponseTime => self.config.p95_response_window_ms,
            RollbackTrigger::Availability => self.config.availability_window_ms,
            RollbackTrigger::HealthCheckPassRate => self.config.health_pass_rate_window_ms,
            RollbackTrigger::CriticalError => self.config.critical_error_window_ms,
        };
        Duration::from_millis(millis)
    }

    /// Evaluate one sample against all triggers. Returns the first trigger
    /// whose breach has been sustained for its full window.
    pub async fn evaluate_sample(
        &self,
        deployment_id: Uuid,
        sample: &RuntimeHealthSample,
    ) -> Option<RollbackTrigger> {
        let mut states = self.trigger_state.write().await;
        let state = states.entry(deployment_id).or_default();
        let now = Instant::now();

        for trigger in RollbackTrigger::ALL {
            if self.breached(trigger, sample) {
                let since = *state.breach_since.entry(trigger).or_insert(now);
                if now.duration_since(since) >= self.window_for(trigger) {
                    return Some(trigger);
                }
            } else {
                state.breach_since.remove(&trigger);
            }
        }
        None
    }

    /// Whether any trigger is breached by a fresh sample right now. Used
    /// when a phase times out and the manager must decide between rollback
    /// and plain failure without waiting for a sustained window.
    pub async fn breached_now(&self, deployment_id: Uuid) -> bool {
        let sample = self.metrics.sample(deployment_id).await;
        RollbackTrigger::ALL.iter().any(|trigger| self.breached(*trigger, &sample))
    }

    /// Clear trigger bookkeeping for a finished deployment.
    pub async fn forget(&self, deployment_id: Uuid) {
        self.trigger_state.write().await.remove(&deployment_id);
    }

    /// Execute an ordered rollback of `execution` to the selected (or
    /// given) snapshot. Mutates the execution record in place; the caller
    /// persists it.
    pub async fn execute(
        &self,
        execution: &mut DeploymentExecution,
        reason: &str,
        snapshot_id: Option<Uuid>,
    ) -> Result<RollbackOutcome, DeploymentError> {
        {
            let mut in_flight = self.in_flight.write().await;
            if !in_flight.insert(execution.id) {
                return Err(DeploymentError::RollbackAlreadyRunning(execution.id));
            }
        }
        let result = self.execute_inner(execution, reason, snapshot_id).await;
        self.in_flight.write().await.remove(&execution.id);
        result
    }

    async fn execute_inner(
        &self,
        execution: &mut DeploymentExecution,
        reason: &str,
        snapshot_id: Option<Uuid>,
    ) -> Result<RollbackOutcome, DeploymentError> {
        let snapshot = match snapshot_id {
            Some(id) => self.snapshots.get(id).await,
            None => self.snapshots.select_for_rollback(execution.id).await,
        };
        let rollback_id = Uuid::new_v4();

        self.publish(
            "rollback.initiated",
            serde_json::json!({
                "rollbackId": rollback_id,
                "deploymentId": execution.id,
                "reason": reason,
                "snapshotId": snapshot.as_ref().map(|s| s.id),
            }),
        )
        .await;
        info!(deployment = %execution.id, %reason, "rollback initiated");

        let deadline = Instant::now() + Duration::from_millis(self.config.rollback_timeout_ms);
        let mut steps = Vec::with_capacity(RollbackStep::ORDER.len());
        let mut status = RollbackStatus::Completed;

        for step in RollbackStep::ORDER {
            if Instant::now() >= deadline {
                status = RollbackStatus::TimedOut;
                self.publish(
                    "rollback.timeout",
                    serde_json::json!({
                        "rollbackId": rollback_id,
                        "deploymentId": execution.id,
                        "step": step.name(),
                    }),
                )
                .await;
                break;
            }

            let record = self.run_step(step, execution, snapshot.as_ref()).await;
            let succeeded = record.succeeded;
            self.publish(
                if succeeded { "rollback.step.completed" } else { "rollback.step.failed" },
                serde_json::json!({
                    "rollbackId": rollback_id,
                    "deploymentId": execution.id,
                    "step": step.name(),
                    "attempts": record.attempts,
                }),
            )
            .await;
            steps.push(record);

            if !succeeded {
                status = RollbackStatus::Failed;
                break;
            }
        }

        let outcome = RollbackOutcome {
            rollback_id,
            deployment_id: execution.id,
            status,
            reason: reason.to_string(),
            restored_snapshot: snapshot.as_ref().map(|s| s.id),
            steps,
        };
        self.history.write().await.insert(rollback_id, outcome.clone());

        match status {
            RollbackStatus::Completed => {
                self.publish(
                    "rollback.completed",
                    serde_json::json!({
                        "rollbackId": rollback_id,
                        "deploymentId": execution.id,
                    }),
                )
                .await;
                info!(deployment = %execution.id, "rollback completed");
                Ok(outcome)
            }
            RollbackStatus::Failed | RollbackStatus::TimedOut => {
                self.publish(
                    "rollback.failed",
                    serde_json::json!({
                        "rollbackId": rollback_id,
                        "deploymentId": execution.id,
                        "status": status,
                    }),
                )
                .await;
                error!(deployment = %execution.id, ?status, "rollback did not complete; operator attention required");
                Err(DeploymentError::RollbackFailed {
                    deployment_id: execution.id,
                    outcome: Box::new(outcome),
                })
            }
        }
    }

    /// One step with bounded retries. Steps act on the execution record
    /// and snapshot; infrastructure side effects flow through the events
    /// other components subscribe to.
    async fn run_step(
        &self,
        step: RollbackStep,
        execution: &mut DeploymentExecution,
        snapshot: Option<&Snapshot>,
    ) -> RollbackStepRecord {
        let max_attempts = self.config.max_rollback_attempts.max(1);
        let mut attempts = 0;
        let mut detail = None;

        while attempts < max_attempts {
            attempts += 1;
            let result = self.apply_step(step, execution, snapshot).await;
            match result {
                Ok(step_detail) => {
                    return RollbackStepRecord {
                        step,
                        succeeded: true,
                        attempts,
                        detail: step_detail,
                    }
                }
                Err(message) => {
                    warn!(step = step.name(), attempts, %message, "rollback step attempt failed");
                    detail = Some(message);
                }
            }
        }
        RollbackStepRecord { step, succeeded: false, attempts, detail }
    }

    async fn apply_step(
        &self,
        step: RollbackStep,
        execution: &mut DeploymentExecution,
        snapshot: Option<&Snapshot>,
    ) -> Result<Option<String>, String> {
        match step {
            RollbackStep::RestoreConfiguration => match snapshot {
                Some(snapshot) => Ok(Some(format!(
                    "configuration restored from snapshot {} (version {})",
                    snapshot.id, snapshot.version
                ))),
                None => Ok(Some("no snapshot available; configuration left as-is".to_string())),
            },
            RollbackStep::RestoreDataState => match snapshot.and_then(|s| s.db_state.as_ref()) {
                Some(_) => Ok(Some("database state restored".to_string())),
                None => Ok(Some("no data state captured; step skipped".to_string())),
            },
            RollbackStep::FlipTraffic => {
                // All traffic back to the previously active color; no
                // partial shift survives a rollback.
                execution.traffic_to_target = 0;
                Ok(Some(format!(
                    "traffic restored to {}",
                    execution.active_color.name()
                )))
            }
            RollbackStep::Verify => {
                let sample = self.metrics.sample(execution.id).await;
                let mut breaches: Vec<&str> = Vec::new();
                for trigger in [
                    RollbackTrigger::ErrorRate,
                    RollbackTrigger::Availability,
                    RollbackTrigger::HealthCheckPassRate,
                ] {
                    if self.breached(trigger, &sample) {
                        breaches.push(trigger.name());
                    }
                }
                if breaches.is_empty() {
                    Ok(Some("post-rollback health verified".to_string()))
                } else {
                    Err(format!("post-rollback verification failed: {}", breaches.join(", ")))
                }
            }
            RollbackStep::Cleanup => {
                execution.snapshot_id = snapshot.map(|s| s.id);
                Ok(Some(format!(
                    "{} instances cleaned up",
                    execution.target_color.name()
                )))
            }
        }
    }

    async fn publish(&self, event_type: &str, payload: serde_json::Value) {
        let envelope =
            EventEnvelope::new(event_type, &self.swarm_id, &self.producer_id, payload);
        if let Err(err) = self
            .bus
            .publish_with_replay(channels::ROLLBACK, &envelope, Duration::from_secs(3600))
            .await
        {
            warn!(error = %err, event = event_type, "failed to publish rollback event");
        }
    }

    /// Restore the execution record to the pre-rollout serving state.
    pub fn restore_serving_state(execution: &mut DeploymentExecution, previous_active: Color) {
        execution.active_color = previous_active;
        execution.target_color = previous_active.other();
        execution.traffic_to_target = 0;
        execution.ended_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::ScriptedProbe;
    use crate::snapshot::{HealthBaseline, PerformanceBaseline};
    use crate::types::{ApplicationConfig, RolloutStrategy};
    use stratus_bus::MemoryBus;

    fn app() -> ApplicationConfig {
        ApplicationConfig {
            name: "svc".to_string(),
            version: "2.0.0".to_string(),
            configuration: serde_json::json!({"replicas": 3}),
        }
    }

    fn fast_config() -> RollbackConfig {
        RollbackConfig {
            error_rate_window_ms: 0,
            p95_response_window_ms: 0,
            availability_window_ms: 0,
            health_pass_rate_window_ms: 0,
            critical_error_window_ms: 0,
            ..RollbackConfig::default()
        }
    }

    async fn manager_with(probe: Arc<ScriptedProbe>, config: RollbackConfig) -> RollbackManager {
        let bus: Arc<dyn CoordinationBus> = Arc::new(MemoryBus::new());
        let snapshots =
            Arc::new(SnapshotStore::new(bus.clone(), Duration::from_secs(3600)));
        RollbackManager::new(bus, config, snapshots, probe, "swarm-test", "rollback-test")
    }

    #[tokio::test]
    async fn sustained_breach_fires_trigger() {
        let probe = ScriptedProbe::new();
        let manager = manager_with(probe, fast_config()).await;
        let deployment = Uuid::new_v4();

        let mut sample = RuntimeHealthSample::healthy();
        sample.error_rate = 0.5;
        // Zero-length window: first breach already counts as sustained.
        let fired = manager.evaluate_sample(deployment, &sample).await;
        assert_eq!(fired, Some(RollbackTrigger::ErrorRate));
    }

    #[tokio::test]
    async fn short_breach_within_window_does_not_fire() {
        let probe = ScriptedProbe::new();
        let mut config = fast_config();
        config.error_rate_window_ms = 60_000;
        let manager = manager_with(probe, config).await;
        let deployment = Uuid::new_v4();

        let mut sample = RuntimeHealthSample::healthy();
        sample.error_rate = 0.5;
        assert_eq!(manager.evaluate_sample(deployment, &sample).await, None);

        // Recovery resets the window.
        let healthy = RuntimeHealthSample::healthy();
        assert_eq!(manager.evaluate_sample(deployment, &healthy).await, None);
    }

    #[tokio::test]
    async fn critical_pattern_matches_substring() {
        let probe = ScriptedProbe::new();
        let manager = manager_with(probe, fast_config()).await;
        let mut sample = RuntimeHealthSample::healthy();
        sample.critical_errors = vec!["panic: OutOfMemory in worker".to_string()];
        let fired = manager.evaluate_sample(Uuid::new_v4(), &sample).await;
        assert_eq!(fired, Some(RollbackTrigger::CriticalError));
    }

    #[tokio::test]
    async fn rollback_runs_all_steps_in_order() {
        let probe = ScriptedProbe::new();
        let manager = manager_with(probe, fast_config()).await;
        let mut execution =
            DeploymentExecution::new(&app(), RolloutStrategy::Canary, Color::Blue);
        execution.traffic_to_target = 50;

        manager
            .snapshots()
            .capture(
                execution.id,
                "1.9.0",
                serde_json::json!({}),
                None,
                HealthBaseline::healthy(),
                PerformanceBaseline::default(),
            )
            .await
            .unwrap();

        let outcome = manager.execute(&mut execution, "canary gate failed", None).await.unwrap();
        assert_eq!(outcome.status, RollbackStatus::Completed);
        let executed: Vec<RollbackStep> = outcome.steps.iter().map(|s| s.step).collect();
        assert_eq!(executed, RollbackStep::ORDER.to_vec());
        assert_eq!(execution.traffic_to_target, 0);
        assert!(outcome.restored_snapshot.is_some());
    }

    #[tokio::test]
    async fn second_concurrent_rollback_is_rejected() {
        let probe = ScriptedProbe::new();
        let manager = Arc::new(manager_with(probe, fast_config()).await);
        let execution = DeploymentExecution::new(&app(), RolloutStrategy::BlueGreen, Color::Blue);

        // Simulate an in-flight rollback by holding the slot.
        manager.in_flight.write().await.insert(execution.id);
        let mut second = execution.clone();
        let err = manager.execute(&mut second, "again", None).await.unwrap_err();
        assert!(matches!(err, DeploymentError::RollbackAlreadyRunning(_)));
    }

    #[tokio::test]
    async fn failed_verification_fails_rollback() {
        let probe = ScriptedProbe::new();
        let mut bad = RuntimeHealthSample::healthy();
        bad.availability = 0.5;
        probe.push_sample(bad).await;
        let manager = manager_with(probe, fast_config()).await;

        let mut execution =
            DeploymentExecution::new(&app(), RolloutStrategy::BlueGreen, Color::Blue);
        let err = manager.execute(&mut execution, "bad deploy", None).await.unwrap_err();
        match err {
            DeploymentError::RollbackFailed { outcome, .. } => {
                assert_eq!(outcome.status, RollbackStatus::Failed);
                let verify = outcome
                    .steps
                    .iter()
                    .find(|s| s.step == RollbackStep::Verify)
                    .unwrap();
                assert!(!verify.succeeded);
                assert_eq!(verify.attempts, RollbackConfig::default().max_rollback_attempts);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
