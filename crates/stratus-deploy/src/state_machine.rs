//! Phased deployment state machine.
//!
//! Phases run in strict order; each either completes or hands the
//! deployment to the rollback manager. Phase history is append-only and at
//! most one phase is in `Running` state at any time. Every phase is
//! bounded by the configured timeout; a timeout does not roll back by
//! itself, the rollback manager decides based on current metrics.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use stratus_bus::{CoordinationBus, CoordinationBusExt};
use stratus_core::{channels, DeploymentConfig, EventEnvelope};

use crate::checklist::GoLiveChecklist;
use crate::health::{HealthCheckKind, HealthProbe, MetricsSource};
use crate::readiness::ReadinessAssessor;
use crate::rollback::RollbackManager;
use crate::snapshot::{HealthBaseline, HealthState, PerformanceBaseline};
use crate::types::{
    ApplicationConfig, Approval, Color, DeploymentExecution, DeploymentOptions, DeploymentPhase,
    DeploymentStatus, PhaseRecord, PhaseStatus, RolloutStrategy,
};
use crate::DeploymentError;

struct DeploymentSlot {
    execution: DeploymentExecution,
    approvals: Vec<Approval>,
}

pub struct DeploymentCoordinator {
    bus: Arc<dyn CoordinationBus>,
    config: DeploymentConfig,
    probe: Arc<dyn HealthProbe>,
    metrics: Arc<dyn MetricsSource>,
    rollback: Arc<RollbackManager>,
    readiness: ReadinessAssessor,
    checklist: GoLiveChecklist,
    slots: Arc<RwLock<HashMap<Uuid, DeploymentSlot>>>,
    stops: Arc<RwLock<HashMap<Uuid, watch::Sender<bool>>>>,
    /// Color currently serving production traffic, cluster-wide.
    serving_color: Arc<RwLock<Color>>,
    swarm_id: String,
    producer_id: String,
}

impl DeploymentCoordinator {
    pub fn new(
        bus: Arc<dyn CoordinationBus>,
        config: DeploymentConfig,
        probe: Arc<dyn HealthProbe>,
        metrics: Arc<dyn MetricsSource>,
        rollback: Arc<RollbackManager>,
        swarm_id: impl Into<String>,
        producer_id: impl Into<String>,
    ) -> Self {
        let readiness =
            ReadinessAssessor::new(config.readiness_go_threshold, config.readiness_category_floor);
        Self {
            bus,
            config,
            probe,
            metrics,
            rollback,
            readiness,
            checklist: GoLiveChecklist::standard(),
            slots: Arc::new(RwLock::new(HashMap::new())),
            stops: Arc::new(RwLock::new(HashMap::new())),
            serving_color: Arc::new(RwLock::new(Color::Blue)),
            swarm_id: swarm_id.into(),
            producer_id: producer_id.into(),
        }
    }

    /// Register a new rollout and return its id. `execute` drives it.
    pub async fn begin(
        &self,
        app: ApplicationConfig,
        options: DeploymentOptions,
    ) -> Result<Uuid, DeploymentError> {
        let active = *self.serving_color.read().await;
        let execution = DeploymentExecution::new(&app, options.strategy, active);
        let id = execution.id;

        self.persist(&execution).await?;
        self.publish(
            "deployment.started",
            serde_json::json!({
                "deploymentId": id,
                "app": execution.app_name,
                "version": execution.version,
                "strategy": execution.strategy.name(),
            }),
        )
        .await;

        let (stop_tx, _stop_rx) = watch::channel(false);
        self.stops.write().await.insert(id, stop_tx);
        self.slots
            .write()
            .await
            .insert(id, DeploymentSlot { execution, approvals: options.approvals });
        info!(deployment = %id, "deployment registered");
        Ok(id)
    }

    /// Drive a registered deployment to a terminal state.
    pub async fn execute(&self, id: Uuid) -> Result<DeploymentStatus, DeploymentError> {
        let (mut execution, approvals) = {
            let slots = self.slots.read().await;
            let slot = slots.get(&id).ok_or(DeploymentError::NotFound(id))?;
            (slot.execution.clone(), slot.approvals.clone())
        };
        let mut stop = {
            let stops = self.stops.read().await;
            stops
                .get(&id)
                .map(|sender| sender.subscribe())
                .ok_or(DeploymentError::NotFound(id))?
        };

        execution.status = DeploymentStatus::Running;
        self.store(&execution).await;

        let previous_active = execution.active_color;
        let phase_timeout = Duration::from_millis(self.config.phase_timeout_ms.max(1));

        for phase in DeploymentPhase::ORDER {
            if *stop.borrow() {
                return Ok(self.finish_cancelled(&mut execution).await);
            }

            self.start_phase(&mut execution, phase).await;
            let phase_result = tokio::time::timeout(
                phase_timeout,
                self.run_phase(phase, &mut execution, &approvals, &mut stop),
            )
            .await;

            match phase_result {
                Ok(Ok(())) => {
                    self.finish_phase(&mut execution, phase, PhaseStatus::Completed, None).await;
                }
                Ok(Err(reason)) => {
                    warn!(deployment = %id, phase = phase.name(), %reason, "phase failed");
                    self.finish_phase(
                        &mut execution,
                        phase,
                        PhaseStatus::Failed,
                        Some(reason.clone()),
                    )
                    .await;
                    let status = self
                        .roll_back(&mut execution, previous_active, &reason)
                        .await;
                    return Ok(status);
                }
                Err(_elapsed) => {
                    let reason = format!(
                        "phase {} timed out after {}ms",
                        phase.name(),
                        self.config.phase_timeout_ms
                    );
                    warn!(deployment = %id, phase = phase.name(), "phase timed out");
                    self.finish_phase(
                        &mut execution,
                        phase,
                        PhaseStatus::TimedOut,
                        Some(reason.clone()),
                    )
                    .await;
                    // The rollback manager decides: roll back only when
                    // current metrics already breach a trigger.
                    let status = if self.rollback.breached_now(id).await {
                        self.roll_back(&mut execution, previous_active, &reason).await
                    } else {
                        self.finish_failed(&mut execution, reason).await
                    };
                    return Ok(status);
                }
            }
        }

        execution.status = DeploymentStatus::Completed;
        execution.active_color = execution.target_color;
        execution.ended_at = Some(Utc::now());
        *self.serving_color.write().await = execution.active_color;
        self.store(&execution).await;
        self.rollback.forget(id).await;
        self.publish(
            "deployment.completed",
            serde_json::json!({
                "deploymentId": id,
                "activeColor": execution.active_color.name(),
            }),
        )
        .await;
        info!(deployment = %id, color = execution.active_color.name(), "deployment completed");
        Ok(DeploymentStatus::Completed)
    }

    /// Request cancellation of an in-flight deployment.
    pub async fn cancel(&self, id: Uuid) -> Result<(), DeploymentError> {
        let stops = self.stops.read().await;
        let sender = stops.get(&id).ok_or(DeploymentError::NotFound(id))?;
        // send_replace updates the value even before anyone subscribed.
        sender.send_replace(true);
        Ok(())
    }

    pub async fn status(&self, id: Uuid) -> Option<DeploymentExecution> {
        self.slots.read().await.get(&id).map(|slot| slot.execution.clone())
    }

    /// Outcome of a finished rollback, by rollback id.
    pub async fn rollback_outcome(&self, rollback_id: Uuid) -> Option<crate::RollbackOutcome> {
        self.rollback.outcome(rollback_id).await
    }

    /// Trigger a rollback of an in-flight or completed deployment, e.g.
    /// from the recovery orchestrator or the trigger monitor.
    pub async fn trigger_rollback(
        &self,
        id: Uuid,
        reason: &str,
        snapshot_id: Option<Uuid>,
    ) -> Result<Uuid, DeploymentError> {
        let mut execution = self
            .status(id)
            .await
            .ok_or(DeploymentError::NotFound(id))?;
        let previous_active = execution.active_color;

        execution.status = DeploymentStatus::RollingBack;
        self.store(&execution).await;
        let outcome = self.rollback.execute(&mut execution, reason, snapshot_id).await;
        match outcome {
            Ok(outcome) => {
                RollbackManager::restore_serving_state(&mut execution, previous_active);
                execution.status = DeploymentStatus::RolledBack;
                self.store(&execution).await;
                self.publish(
                    "deployment.rolled_back",
                    serde_json::json!({
                        "deploymentId": id,
                        "rollbackId": outcome.rollback_id,
                        "activeColor": execution.active_color.name(),
                    }),
                )
                .await;
                Ok(outcome.rollback_id)
            }
            Err(err) => {
                execution.status = DeploymentStatus::Failed;
                execution.error = Some(err.to_string());
                execution.ended_at = Some(Utc::now());
                self.store(&execution).await;
                Err(err)
            }
        }
    }

    /// One monitoring pass over all running deployments: sample metrics
    /// and roll back any whose breach has been sustained past its window.
    /// While the bus is degraded automatic rollback is suspended, so the
    /// engine never acts without state confirmation.
    pub async fn monitor_once(&self) -> Vec<Uuid> {
        if self.bus.is_degraded() {
            warn!("bus degraded; automatic rollback suspended");
            return Vec::new();
        }
        let running: Vec<Uuid> = {
            let slots = self.slots.read().await;
            slots
                .values()
                .filter(|slot| !slot.execution.status.is_terminal())
                .map(|slot| slot.execution.id)
                .collect()
        };

        let mut rolled_back = Vec::new();
        for id in running {
            let sample = self.metrics.sample(id).await;
            if let Some(trigger) = self.rollback.evaluate_sample(id, &sample).await {
                let reason = format!("automatic trigger: {}", trigger.name());
                if self.trigger_rollback(id, &reason, None).await.is_ok() {
                    rolled_back.push(id);
                }
            }
        }
        rolled_back
    }

    async fn roll_back(
        &self,
        execution: &mut DeploymentExecution,
        previous_active: Color,
        reason: &str,
    ) -> DeploymentStatus {
        execution.status = DeploymentStatus::RollingBack;
        self.store(execution).await;

        match self.rollback.execute(execution, reason, None).await {
            Ok(outcome) => {
                RollbackManager::restore_serving_state(execution, previous_active);
                execution.status = DeploymentStatus::RolledBack;
                self.store(execution).await;
                self.publish(
                    "deployment.rolled_back",
                    serde_json::json!({
                        "deploymentId": execution.id,
                        "rollbackId": outcome.rollback_id,
                        "activeColor": execution.active_color.name(),
                        "reason": reason,
                    }),
                )
                .await;
                DeploymentStatus::RolledBack
            }
            Err(err) => {
                warn!(deployment = %execution.id, error = %err, "rollback failed");
                self.finish_failed(execution, format!("{reason}; rollback failed: {err}")).await
            }
        }
    }

    async fn finish_failed(
        &self,
        execution: &mut DeploymentExecution,
        reason: String,
    ) -> DeploymentStatus {
        execution.status = DeploymentStatus::Failed;
        execution.error = Some(reason.clone());
        execution.ended_at = Some(Utc::now());
        self.store(execution).await;
        self.publish(
            "deployment.failed",
            serde_json::json!({ "deploymentId": execution.id, "error": reason }),
        )
        .await;
        DeploymentStatus::Failed
    }

    async fn finish_cancelled(&self, execution: &mut DeploymentExecution) -> DeploymentStatus {
        execution.status = DeploymentStatus::Failed;
        execution.error = Some("cancelled by operator".to_string());
        execution.ended_at = Some(Utc::now());
        self.store(execution).await;
        self.publish(
            "deployment.cancelled",
            serde_json::json!({ "deploymentId": execution.id }),
        )
        .await;
        DeploymentStatus::Failed
    }

    async fn run_phase(
        &self,
        phase: DeploymentPhase,
        execution: &mut DeploymentExecution,
        approvals: &[Approval],
        stop: &mut watch::Receiver<bool>,
    ) -> Result<(), String> {
        match phase {
            DeploymentPhase::Preparation => self.run_preparation(execution, approvals).await,
            DeploymentPhase::DeployNewColor => self.run_deploy_new_color(execution).await,
            DeploymentPhase::HealthValidation => {
                self.run_health_validation(execution, stop).await
            }
            DeploymentPhase::TrafficShift => self.run_traffic_shift(execution, stop).await,
            DeploymentPhase::CleanupOldColor => self.run_cleanup(execution, stop).await,
            DeploymentPhase::PostDeploymentValidation => {
                self.run_post_validation(execution).await
            }
        }
    }

    /// Verify prerequisites, capture the rollback snapshot, notify.
    async fn run_preparation(
        &self,
        execution: &mut DeploymentExecution,
        approvals: &[Approval],
    ) -> Result<(), String> {
        let readiness = self.readiness.assess(&self.probe, execution.target_color).await;
        if !readiness.go {
            return Err(format!("readiness rejected: {}", readiness.blocking.join("; ")));
        }

        let checklist = self
            .checklist
            .verify(&self.probe, execution.target_color, approvals)
            .await;
        if !checklist.complete {
            return Err(format!(
                "go-live checklist incomplete: missing approvals [{}]",
                checklist.missing_approvals.join(", ")
            ));
        }

        // Baseline the currently serving color for rollback.
        let sample = self.metrics.sample(execution.id).await;
        let mut checks = HashMap::new();
        for kind in HealthCheckKind::VALIDATION {
            let report = self.probe.check(kind, execution.active_color).await;
            checks.insert(kind.name().to_string(), report.healthy);
        }
        let overall = if checks.values().all(|healthy| *healthy) {
            HealthState::Healthy
        } else {
            HealthState::Degraded
        };
        let snapshot = self
            .rollback
            .snapshots()
            .capture(
                execution.id,
                &execution.version,
                serde_json::json!({
                    "app": execution.app_name,
                    "servingColor": execution.active_color.name(),
                }),
                None,
                HealthBaseline { overall, checks },
                PerformanceBaseline {
                    p50_response_ms: sample.p95_response_ms / 2.0,
                    p95_response_ms: sample.p95_response_ms,
                    error_rate: sample.error_rate,
                    availability: sample.availability,
                },
            )
            .await
            .map_err(|err| format!("snapshot capture failed: {err}"))?;
        execution.snapshot_id = Some(snapshot.id);
        self.store(execution).await;
        Ok(())
    }

    async fn run_deploy_new_color(
        &self,
        execution: &mut DeploymentExecution,
    ) -> Result<(), String> {
        self.probe
            .provision(execution.target_color)
            .await
            .map_err(|err| format!("provisioning {} failed: {err}", execution.target_color.name()))?;
        let report = self.probe.check(HealthCheckKind::Service, execution.target_color).await;
        if !report.healthy {
            return Err(format!(
                "{} not ready after provisioning: {}",
                execution.target_color.name(),
                report.detail
            ));
        }
        Ok(())
    }

    async fn run_health_validation(
        &self,
        execution: &mut DeploymentExecution,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<(), String> {
        for kind in HealthCheckKind::VALIDATION {
            let report = self.probe.check(kind, execution.target_color).await;
            if !report.healthy {
                return Err(format!("{} validation failed: {}", kind.name(), report.detail));
            }
        }

        // Canary additionally routes a slice of traffic and monitors it.
        if execution.strategy == RolloutStrategy::Canary {
            let percent = self.config.canary_percentage.min(100);
            execution.traffic_to_target = percent;
            self.store(execution).await;
            if self.wait_or_stop(self.stabilization_for(percent), stop).await {
                return Err("cancelled during canary monitoring".to_string());
            }
            let gate = self.probe.traffic_health(execution.target_color, percent).await;
            if !gate.healthy {
                return Err(format!("canary monitoring at {percent}%: {}", gate.detail));
            }
        }
        Ok(())
    }

    async fn run_traffic_shift(
        &self,
        execution: &mut DeploymentExecution,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<(), String> {
        let steps: Vec<u8> = match execution.strategy {
            RolloutStrategy::BlueGreen => vec![100],
            RolloutStrategy::Canary => self.config.canary_steps.clone(),
        };

        for percent in steps {
            execution.traffic_to_target = percent;
            self.store(execution).await;
            info!(
                deployment = %execution.id,
                percent,
                color = execution.target_color.name(),
                "traffic shifted"
            );

            if self.wait_or_stop(self.stabilization_for(percent), stop).await {
                return Err(format!("cancelled during traffic shift at {percent}%"));
            }
            let gate = self.probe.traffic_health(execution.target_color, percent).await;
            if !gate.healthy {
                return Err(format!("health gate failed at {percent}% traffic: {}", gate.detail));
            }
        }
        Ok(())
    }

    async fn run_cleanup(
        &self,
        execution: &mut DeploymentExecution,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<(), String> {
        let stabilization = Duration::from_millis(self.config.stabilization_period_ms);
        if self.wait_or_stop(stabilization, stop).await {
            return Err("cancelled during stabilization".to_string());
        }
        let old_color = execution.active_color;
        self.probe
            .drain(old_color)
            .await
            .map_err(|err| format!("draining {} failed: {err}", old_color.name()))?;
        info!(deployment = %execution.id, color = old_color.name(), "old color drained and terminated");
        Ok(())
    }

    async fn run_post_validation(
        &self,
        execution: &mut DeploymentExecution,
    ) -> Result<(), String> {
        for kind in HealthCheckKind::POST_DEPLOYMENT {
            let report = self.probe.check(kind, execution.target_color).await;
            if !report.healthy {
                return Err(format!(
                    "post-deployment {} validation failed: {}",
                    kind.name(),
                    report.detail
                ));
            }
        }
        Ok(())
    }

    /// Stabilization wait proportional to the traffic percentage.
    fn stabilization_for(&self, percent: u8) -> Duration {
        Duration::from_millis(
            self.config.stabilization_period_ms * u64::from(percent) / 100,
        )
    }

    /// Returns true when the deployment was cancelled during the wait.
    async fn wait_or_stop(&self, duration: Duration, stop: &mut watch::Receiver<bool>) -> bool {
        let sleep = tokio::time::sleep(duration);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return false,
                result = stop.changed() => {
                    match result {
                        Ok(()) if *stop.borrow() => return true,
                        Ok(()) => continue,
                        Err(_) => {
                            sleep.as_mut().await;
                            return false;
                        }
                    }
                }
            }
        }
    }

    async fn start_phase(&self, execution: &mut DeploymentExecution, phase: DeploymentPhase) {
        debug_assert!(
            execution.running_phase().is_none(),
            "phase transitions are append-only with a single running phase"
        );
        execution.phase_history.push(PhaseRecord {
            phase,
            status: PhaseStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            error: None,
        });
        self.store(execution).await;
        self.publish(
            "deployment.phase.started",
            serde_json::json!({ "deploymentId": execution.id, "phase": phase.name() }),
        )
        .await;
    }

    async fn finish_phase(
        &self,
        execution: &mut DeploymentExecution,
        phase: DeploymentPhase,
        status: PhaseStatus,
        error: Option<String>,
    ) {
        if let Some(record) = execution
            .phase_history
            .iter_mut()
            .rev()
            .find(|record| record.phase == phase && record.status == PhaseStatus::Running)
        {
            record.status = status;
            record.ended_at = Some(Utc::now());
            record.error = error.clone();
        }
        self.store(execution).await;
        let event = match status {
            PhaseStatus::Completed => "deployment.phase.completed",
            _ => "deployment.phase.failed",
        };
        self.publish(
            event,
            serde_json::json!({
                "deploymentId": execution.id,
                "phase": phase.name(),
                "error": error,
            }),
        )
        .await;
    }

    /// Mirror the record into the slot map and onto the bus.
    async fn store(&self, execution: &DeploymentExecution) {
        if let Some(slot) = self.slots.write().await.get_mut(&execution.id) {
            slot.execution = execution.clone();
        }
        if let Err(err) = self.persist(execution).await {
            warn!(deployment = %execution.id, error = %err, "failed to persist deployment record");
        }
    }

    async fn persist(&self, execution: &DeploymentExecution) -> Result<(), DeploymentError> {
        self.bus
            .put_json(&format!("deployments:{}", execution.id), execution, None)
            .await?;
        for (index, record) in execution.phase_history.iter().enumerate() {
            self.bus
                .put_json(
                    &format!("deployments:{}:phase:{index}", execution.id),
                    record,
                    None,
                )
                .await?;
        }
        Ok(())
    }

    async fn publish(&self, event_type: &str, payload: serde_json::Value) {
        let envelope =
            EventEnvelope::new(event_type, &self.swarm_id, &self.producer_id, payload);
        if let Err(err) = self
            .bus
            .publish_with_replay(channels::DEPLOYMENT, &envelope, Duration::from_secs(3600))
            .await
        {
            warn!(error = %err, event = event_type, "failed to publish deployment event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checklist::approval;
    use crate::health::ScriptedProbe;
    use crate::types::RuntimeHealthSample;
    use stratus_bus::MemoryBus;
    use stratus_core::RollbackConfig;

    fn fast_deploy_config() -> DeploymentConfig {
        DeploymentConfig {
            phase_timeout_ms: 2_000,
            stabilization_period_ms: 10,
            ..DeploymentConfig::default()
        }
    }

    struct Fixture {
        coordinator: DeploymentCoordinator,
        probe: Arc<ScriptedProbe>,
        bus: Arc<dyn CoordinationBus>,
    }

    async fn fixture() -> Fixture {
        let bus: Arc<dyn CoordinationBus> = Arc::new(MemoryBus::new());
        let probe = ScriptedProbe::new();
        let snapshots = Arc::new(crate::snapshot::SnapshotStore::new(
            bus.clone(),
            Duration::from_secs(3600),
        ));
        let rollback = Arc::new(RollbackManager::new(
            bus.clone(),
            RollbackConfig::default(),
            snapshots,
            probe.clone(),
            "swarm-test",
            "rollback-test",
        ));
        let coordinator = DeploymentCoordinator::new(
            bus.clone(),
            fast_deploy_config(),
            probe.clone(),
            probe.clone(),
            rollback,
            "swarm-test",
            "deploy-test",
        );
        Fixture { coordinator, probe, bus }
    }

    fn app() -> ApplicationConfig {
        ApplicationConfig {
            name: "svc".to_string(),
            version: "2.0.0".to_string(),
            configuration: serde_json::json!({"replicas": 3}),
        }
    }

    fn options(strategy: RolloutStrategy) -> DeploymentOptions {
        DeploymentOptions {
            strategy,
            approvals: vec![approval("release-signoff", "release-owner")],
        }
    }

    #[tokio::test]
    async fn blue_green_deployment_completes_and_flips_color() {
        let fixture = fixture().await;
        let id = fixture
            .coordinator
            .begin(app(), options(RolloutStrategy::BlueGreen))
            .await
            .unwrap();
        let status = fixture.coordinator.execute(id).await.unwrap();
        assert_eq!(status, DeploymentStatus::Completed);

        let execution = fixture.coordinator.status(id).await.unwrap();
        assert_eq!(execution.active_color, Color::Green);
        assert_eq!(execution.traffic_to_target, 100);
        assert_eq!(execution.phase_history.len(), 6);
        assert!(execution
            .phase_history
            .iter()
            .all(|record| record.status == PhaseStatus::Completed));
    }

    #[tokio::test]
    async fn canary_walks_the_full_traffic_ladder() {
        let fixture = fixture().await;
        let id = fixture
            .coordinator
            .begin(app(), options(RolloutStrategy::Canary))
            .await
            .unwrap();
        let status = fixture.coordinator.execute(id).await.unwrap();
        assert_eq!(status, DeploymentStatus::Completed);

        let calls = fixture.probe.calls.lock().await.clone();
        for step in [10u8, 25, 50, 75, 100] {
            assert!(
                calls.iter().any(|call| call == &format!("traffic:green:{step}")),
                "missing gate at {step}%: {calls:?}"
            );
        }
    }

    #[tokio::test]
    async fn canary_failure_at_25_percent_rolls_back() {
        let fixture = fixture().await;
        fixture.probe.fail_traffic_at(25).await;

        let mut events = fixture.bus.subscribe(channels::DEPLOYMENT).await.unwrap();
        let id = fixture
            .coordinator
            .begin(app(), options(RolloutStrategy::Canary))
            .await
            .unwrap();
        let status = fixture.coordinator.execute(id).await.unwrap();
        assert_eq!(status, DeploymentStatus::RolledBack);

        let execution = fixture.coordinator.status(id).await.unwrap();
        // Previous color keeps serving; no partial traffic shift survives.
        assert_eq!(execution.active_color, Color::Blue);
        assert_eq!(execution.traffic_to_target, 0);

        // The event trace ends with deployment.rolled_back.
        let mut seen = Vec::new();
        while let Ok(envelope) = events.try_recv() {
            seen.push(envelope.event_type);
        }
        assert_eq!(seen.last().map(String::as_str), Some("deployment.rolled_back"));
        // Exactly one snapshot was captured and exactly one rollback ran.
        assert_eq!(fixture.coordinator.rollback.snapshots().count_for(id).await, 1);
        assert_eq!(seen.iter().filter(|e| *e == "deployment.rolled_back").count(), 1);
    }

    #[tokio::test]
    async fn missing_approval_fails_preparation() {
        let fixture = fixture().await;
        let id = fixture
            .coordinator
            .begin(
                app(),
                DeploymentOptions { strategy: RolloutStrategy::BlueGreen, approvals: vec![] },
            )
            .await
            .unwrap();
        let status = fixture.coordinator.execute(id).await.unwrap();
        // Preparation fails; rollback still runs against the (empty)
        // snapshot set and restores the serving state.
        assert_eq!(status, DeploymentStatus::RolledBack);
        let execution = fixture.coordinator.status(id).await.unwrap();
        let prep = &execution.phase_history[0];
        assert_eq!(prep.phase, DeploymentPhase::Preparation);
        assert_eq!(prep.status, PhaseStatus::Failed);
        assert!(prep.error.as_deref().unwrap_or("").contains("checklist"));
    }

    #[tokio::test]
    async fn post_validation_failure_triggers_rollback() {
        let fixture = fixture().await;
        fixture.probe.fail_check(HealthCheckKind::Smoke).await;
        let id = fixture
            .coordinator
            .begin(app(), options(RolloutStrategy::BlueGreen))
            .await
            .unwrap();
        let status = fixture.coordinator.execute(id).await.unwrap();
        assert_eq!(status, DeploymentStatus::RolledBack);
    }

    #[tokio::test]
    async fn cancellation_is_terminal_and_recorded() {
        let fixture = fixture().await;
        let id = fixture
            .coordinator
            .begin(app(), options(RolloutStrategy::Canary))
            .await
            .unwrap();
        fixture.coordinator.cancel(id).await.unwrap();
        let status = fixture.coordinator.execute(id).await.unwrap();
        assert_eq!(status, DeploymentStatus::Failed);
        let execution = fixture.coordinator.status(id).await.unwrap();
        assert!(execution.error.as_deref().unwrap_or("").contains("cancelled"));
        assert!(execution.running_phase().is_none());
    }

    #[tokio::test]
    async fn monitor_rolls_back_on_sustained_breach() {
        let bus: Arc<dyn CoordinationBus> = Arc::new(MemoryBus::new());
        let probe = ScriptedProbe::new();
        let mut degraded = RuntimeHealthSample::healthy();
        degraded.error_rate = 0.9;
        // First sample (seen by the monitor) is degraded; the system then
        // recovers so post-rollback verification passes.
        probe.push_sample(degraded).await;
        probe.push_sample(RuntimeHealthSample::healthy()).await;

        let snapshots = Arc::new(crate::snapshot::SnapshotStore::new(
            bus.clone(),
            Duration::from_secs(3600),
        ));
        let rollback_config = RollbackConfig {
            error_rate_window_ms: 0,
            ..RollbackConfig::default()
        };
        let rollback = Arc::new(RollbackManager::new(
            bus.clone(),
            rollback_config,
            snapshots,
            probe.clone(),
            "swarm-test",
            "rollback-test",
        ));
        let coordinator = DeploymentCoordinator::new(
            bus,
            fast_deploy_config(),
            probe.clone(),
            probe.clone(),
            rollback,
            "swarm-test",
            "deploy-test",
        );

        let id = coordinator
            .begin(app(), options(RolloutStrategy::BlueGreen))
            .await
            .unwrap();
        // Deployment registered but not yet terminal: the monitor samples
        // the degraded metrics and rolls it back.
        let rolled = coordinator.monitor_once().await;
        assert_eq!(rolled, vec![id]);
        let execution = coordinator.status(id).await.unwrap();
        assert_eq!(execution.status, DeploymentStatus::RolledBack);
    }
}
