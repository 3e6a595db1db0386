//! Queued, resource-aware recovery execution.
//!
//! Queueing is FIFO within equal severity and critical work jumps the
//! queue. At most `max_concurrent_recoveries` run in parallel; work whose
//! required resources exceed current headroom is re-queued, optionally
//! after pausing one non-critical active execution to make room. Step
//! failures past the failure-rate threshold run the strategy's rollback
//! plan, and a failing recovery that implicates a deployment escalates
//! through the deployment rollback hook.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use stratus_bus::{CoordinationBus, CoordinationBusExt};
use stratus_core::{channels, EventEnvelope, RecoveryConfig};

use crate::analyzer::ContextAnalyzer;
use crate::strategy::StrategyRegistry;
use crate::types::{
    ErrorData, ErrorSeverity, RecoveryContext, RecoveryExecution, RecoveryStatus, RecoveryStep,
    RecoveryStrategy, ResourceShare,
};
use crate::RecoveryError;

/// Executes individual recovery steps against the real system. Tests and
/// local mode script outcomes.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(
        &self,
        step: &RecoveryStep,
        context: &RecoveryContext,
    ) -> Result<(), String>;
}

/// Executor that simulates success for every step.
pub struct SimulatedExecutor;

#[async_trait]
impl StepExecutor for SimulatedExecutor {
    async fn execute(
        &self,
        _step: &RecoveryStep,
        _context: &RecoveryContext,
    ) -> Result<(), String> {
        Ok(())
    }
}

/// Test executor with scriptable per-step failures.
#[derive(Default)]
pub struct ScriptedExecutor {
    failing_steps: Mutex<HashSet<String>>,
    pub executed: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn fail_step(&self, step_id: &str) {
        self.failing_steps.lock().await.insert(step_id.to_string());
    }
}

#[async_trait]
impl StepExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        step: &RecoveryStep,
        _context: &RecoveryContext,
    ) -> Result<(), String> {
        self.executed.lock().await.push(step.id.clone());
        if self.failing_steps.lock().await.contains(&step.id) {
            Err(format!("step {} failed", step.id))
        } else {
            Ok(())
        }
    }
}

/// Lets recovery escalate to rollback of an implicated deployment without
/// a crate cycle; the engine wires this to the deployment coordinator.
#[async_trait]
pub trait DeploymentRollbackHook: Send + Sync {
    async fn trigger_rollback(&self, deployment_id: Uuid, reason: &str) -> Result<Uuid, String>;
}

#[derive(Debug, Clone, Copy)]
struct QueuedItem {
    execution_id: Uuid,
    severity: ErrorSeverity,
}

pub struct RecoveryOrchestrator {
    config: RecoveryConfig,
    bus: Arc<dyn CoordinationBus>,
    registry: Arc<StrategyRegistry>,
    executor: Arc<dyn StepExecutor>,
    /// Self-handle used to spawn execution tasks from `&self` methods.
    self_ref: std::sync::Weak<RecoveryOrchestrator>,
    swarm_id: String,
    producer_id: String,
    queue: Mutex<VecDeque<QueuedItem>>,
    executions: RwLock<HashMap<Uuid, RecoveryExecution>>,
    active: RwLock<HashSet<Uuid>>,
    /// Resources reserved by active executions.
    reserved: RwLock<HashMap<Uuid, ResourceShare>>,
    /// Current system utilization, fed by the registry/monitoring side.
    utilization: RwLock<ResourceShare>,
    rollback_hook: RwLock<Option<Arc<dyn DeploymentRollbackHook>>>,
}

impl RecoveryOrchestrator {
    pub fn new(
        config: RecoveryConfig,
        bus: Arc<dyn CoordinationBus>,
        registry: Arc<StrategyRegistry>,
        executor: Arc<dyn StepExecutor>,
        swarm_id: impl Into<String>,
        producer_id: impl Into<String>,
    ) -> Arc<Self> {
        let swarm_id = swarm_id.into();
        let producer_id = producer_id.into();
        Arc::new_cyclic(|self_ref| Self {
            config,
            bus,
            registry,
            executor,
            self_ref: self_ref.clone(),
            swarm_id,
            producer_id,
            queue: Mutex::new(VecDeque::new()),
            executions: RwLock::new(HashMap::new()),
            active: RwLock::new(HashSet::new()),
            reserved: RwLock::new(HashMap::new()),
            utilization: RwLock::new(ResourceShare::default()),
            rollback_hook: RwLock::new(None),
        })
    }

    pub async fn set_rollback_hook(&self, hook: Arc<dyn DeploymentRollbackHook>) {
        *self.rollback_hook.write().await = Some(hook);
    }

    /// Add a strategy to the registry at runtime.
    pub async fn register_strategy(&self, strategy: RecoveryStrategy) {
        self.registry.register(strategy).await;
    }

    /// Feed the current system utilization used for dispatch gating.
    pub async fn set_utilization(&self, utilization: ResourceShare) {
        *self.utilization.write().await = utilization;
    }

    /// Analyze an error, select a strategy, queue the execution and kick
    /// the dispatcher.
    pub async fn initiate(&self, error: ErrorData) -> Result<Uuid, RecoveryError> {
        let utilization = *self.utilization.read().await;
        let context = ContextAnalyzer::analyze(&error, &utilization);
        let strategy = self
            .registry
            .select(&context)
            .await
            .ok_or_else(|| RecoveryError::NoApplicableStrategy(context.error_type.clone()))?;

        let execution = RecoveryExecution::new(context, &strategy.id);
        let id = execution.id;
        let severity = execution.context.severity;
        self.persist(&execution).await;
        self.executions.write().await.insert(id, execution);

        self.enqueue(QueuedItem { execution_id: id, severity }).await;
        self.publish(
            "recovery.queued",
            serde_json::json!({
                "recoveryId": id,
                "errorType": error.error_type,
                "strategy": strategy.id,
                "severity": severity,
            }),
        )
        .await;
        info!(recovery = %id, strategy = %strategy.id, "recovery queued");

        self.dispatch().await;
        Ok(id)
    }

    /// FIFO within equal severity; higher severity inserts ahead of lower.
    async fn enqueue(&self, item: QueuedItem) {
        let mut queue = self.queue.lock().await;
        let position = queue
            .iter()
            .position(|queued| queued.severity < item.severity)
            .unwrap_or(queue.len());
        queue.insert(position, item);

        if queue.len() > self.config.queue_soft_bound {
            let depth = queue.len();
            drop(queue);
            self.publish(
                "recovery.queue.saturated",
                serde_json::json!({ "depth": depth, "softBound": self.config.queue_soft_bound }),
            )
            .await;
        }
    }

    /// Pull work while capacity and resources allow.
    pub async fn dispatch(&self) {
        loop {
            if self.active.read().await.len() >= self.config.max_concurrent_recoveries {
                return;
            }
            let item = match self.queue.lock().await.pop_front() {
                Some(item) => item,
                None => return,
            };

            let strategy = match self.strategy_for(item.execution_id).await {
                Some(strategy) => strategy,
                None => continue,
            };

            if !self.headroom().await.covers(&strategy.required_resources) {
                // Try to make room by pausing one non-critical execution;
                // otherwise the item waits at the back of the queue.
                if item.severity == ErrorSeverity::Critical
                    && self.pause_one_non_critical().await
                {
                    self.queue.lock().await.push_front(item);
                    continue;
                }
                debug!(recovery = %item.execution_id, "insufficient resources; re-queued");
                // Re-insert preserving priority order (back of its class).
                self.enqueue(item).await;
                return;
            }

            self.reserved
                .write()
                .await
                .insert(item.execution_id, strategy.required_resources);
            self.active.write().await.insert(item.execution_id);

            let Some(orchestrator) = self.self_ref.upgrade() else { return };
            tokio::spawn(async move {
                orchestrator.run_execution(item.execution_id, strategy).await;
                orchestrator.release(item.execution_id).await;
                // Boxed to keep the worker future type independent of the
                // dispatcher's.
                Arc::clone(&orchestrator).redispatch().await;
            });
        }
    }

    fn redispatch(
        self: Arc<Self>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(async move { self.dispatch().await })
    }

    /// Available headroom: full capacity minus system utilization minus
    /// what active recoveries have reserved.
    async fn headroom(&self) -> ResourceShare {
        let utilization = *self.utilization.read().await;
        let mut headroom = ResourceShare::full().subtract_clamped(&utilization);
        let reserved = self.reserved.read().await;
        for share in reserved.values() {
            headroom = headroom.subtract_clamped(share);
        }
        headroom
    }

    /// Pause the first non-critical active execution. The paused execution
    /// parks at the queue head and resumes from its current step.
    async fn pause_one_non_critical(&self) -> bool {
        let candidate = {
            let active = self.active.read().await;
            let executions = self.executions.read().await;
            active
                .iter()
                .filter_map(|id| executions.get(id))
                .find(|execution| {
                    execution.status == RecoveryStatus::Running
                        && execution.context.severity < ErrorSeverity::Critical
                })
                .map(|execution| (execution.id, execution.context.severity))
        };
        let Some((id, severity)) = candidate else { return false };

        {
            let mut executions = self.executions.write().await;
            if let Some(execution) = executions.get_mut(&id) {
                execution.status = RecoveryStatus::Paused;
            }
        }
        self.release(id).await;
        self.queue
            .lock()
            .await
            .push_front(QueuedItem { execution_id: id, severity });
        info!(recovery = %id, "non-critical recovery paused to make room");
        true
    }

    async fn release(&self, id: Uuid) {
        self.active.write().await.remove(&id);
        self.reserved.write().await.remove(&id);
    }

    async fn strategy_for(&self, execution_id: Uuid) -> Option<RecoveryStrategy> {
        let strategy_id = {
            let executions = self.executions.read().await;
            executions.get(&execution_id)?.strategy_id.clone()
        };
        self.registry.get(&strategy_id).await
    }

    async fn run_execution(&self, id: Uuid, strategy: RecoveryStrategy) {
        let resume_from = {
            let mut executions = self.executions.write().await;
            let Some(execution) = executions.get_mut(&id) else { return };
            // A paused execution resumes from its current step.
            let resume_from = match execution.status {
                RecoveryStatus::Paused => execution.current_step,
                _ => 0,
            };
            execution.status = RecoveryStatus::Running;
            execution.started_at.get_or_insert_with(Utc::now);
            resume_from
        };
        self.persist_by_id(id).await;
        self.publish(
            "recovery.started",
            serde_json::json!({ "recoveryId": id, "strategy": strategy.id }),
        )
        .await;

        let total_steps = strategy.steps.len().max(1);
        let mut rolled_back = false;

        for (index, step) in strategy.steps.iter().enumerate().skip(resume_from) {
            // A dispatcher pause lands between steps.
            if self.paused(id).await {
                info!(recovery = %id, "execution paused; yielding");
                return;
            }
            {
                let mut executions = self.executions.write().await;
                if let Some(execution) = executions.get_mut(&id) {
                    execution.current_step = index;
                }
            }

            let succeeded = self.run_step(id, step).await;
            {
                let mut executions = self.executions.write().await;
                if let Some(execution) = executions.get_mut(&id) {
                    if succeeded {
                        execution.completed_steps.push(step.id.clone());
                    } else {
                        execution.failed_steps.push(step.id.clone());
                    }
                    execution.progress = (execution.completed_steps.len()
                        + execution.failed_steps.len())
                        as f64
                        / total_steps as f64;
                }
            }
            self.persist_by_id(id).await;
            self.publish(
                if succeeded { "recovery.step.completed" } else { "recovery.step.failed" },
                serde_json::json!({ "recoveryId": id, "step": step.id }),
            )
            .await;

            if !succeeded {
                let failure_rate = {
                    let executions = self.executions.read().await;
                    executions.get(&id).map(|e| e.failure_rate()).unwrap_or(1.0)
                };
                if failure_rate >= self.config.rollback_threshold
                    && self.config.enable_automatic_rollback
                {
                    self.run_rollback_plan(id, &strategy).await;
                    rolled_back = true;
                    break;
                }
            }
        }

        let (status, deployment_id) = {
            let mut executions = self.executions.write().await;
            let Some(execution) = executions.get_mut(&id) else { return };
            execution.status = if rolled_back {
                RecoveryStatus::RolledBack
            } else if execution.failed_steps.is_empty() {
                RecoveryStatus::Completed
            } else {
                RecoveryStatus::Failed
            };
            execution.ended_at = Some(Utc::now());
            (execution.status, execution.context.deployment_id)
        };
        self.persist_by_id(id).await;

        let success = status == RecoveryStatus::Completed;
        self.registry.record_outcome(&strategy.id, success).await;
        let event = match status {
            RecoveryStatus::Completed => "recovery.completed",
            RecoveryStatus::RolledBack => "recovery.rolled_back",
            _ => "recovery.failed",
        };
        self.publish(event, serde_json::json!({ "recoveryId": id })).await;
        info!(recovery = %id, ?status, "recovery finished");

        // A failed recovery that implicates a deployment escalates to a
        // deployment rollback.
        if !success {
            if let Some(deployment_id) = deployment_id {
                let hook = self.rollback_hook.read().await.clone();
                if let Some(hook) = hook {
                    match hook
                        .trigger_rollback(deployment_id, "recovery escalation")
                        .await
                    {
                        Ok(rollback_id) => {
                            info!(%deployment_id, %rollback_id, "deployment rollback triggered by recovery")
                        }
                        Err(err) => {
                            error!(%deployment_id, error = %err, "deployment rollback escalation failed")
                        }
                    }
                }
            }
        }
    }

    /// One step with per-step timeout and bounded retries.
    async fn run_step(&self, id: Uuid, step: &RecoveryStep) -> bool {
        let context = {
            let executions = self.executions.read().await;
            match executions.get(&id) {
                Some(execution) => execution.context.clone(),
                None => return false,
            }
        };
        let timeout = Duration::from_millis(step.timeout_ms.max(1));
        let attempts = step.retry_attempts.max(1);

        for attempt in 1..=attempts {
            match tokio::time::timeout(timeout, self.executor.execute(step, &context)).await {
                Ok(Ok(())) => return true,
                Ok(Err(reason)) => {
                    warn!(recovery = %id, step = %step.id, attempt, %reason, "step attempt failed");
                }
                Err(_) => {
                    warn!(recovery = %id, step = %step.id, attempt, "step attempt timed out");
                }
            }
        }
        false
    }

    async fn run_rollback_plan(&self, id: Uuid, strategy: &RecoveryStrategy) {
        info!(recovery = %id, strategy = %strategy.id, "running strategy rollback plan");
        for step in &strategy.rollback_plan {
            let succeeded = self.run_step(id, step).await;
            {
                let mut executions = self.executions.write().await;
                if let Some(execution) = executions.get_mut(&id) {
                    execution.rollback_history.push(format!(
                        "{}:{}",
                        step.id,
                        if succeeded { "ok" } else { "failed" }
                    ));
                }
            }
            self.publish(
                if succeeded { "recovery.step.completed" } else { "recovery.step.failed" },
                serde_json::json!({ "recoveryId": id, "step": step.id, "rollback": true }),
            )
            .await;
            if !succeeded {
                error!(recovery = %id, step = %step.id, "rollback plan step failed");
                break;
            }
        }
    }

    async fn paused(&self, id: Uuid) -> bool {
        self.executions
            .read()
            .await
            .get(&id)
            .map(|execution| execution.status == RecoveryStatus::Paused)
            .unwrap_or(false)
    }

    pub async fn status(&self, id: Uuid) -> Option<RecoveryExecution> {
        self.executions.read().await.get(&id).cloned()
    }

    pub async fn queue_depth(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Poll until the execution reaches a terminal state or the timeout
    /// elapses.
    pub async fn wait_terminal(&self, id: Uuid, timeout: Duration) -> Option<RecoveryStatus> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(execution) = self.status(id).await {
                if execution.status.is_terminal() {
                    return Some(execution.status);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn persist_by_id(&self, id: Uuid) {
        let execution = self.executions.read().await.get(&id).cloned();
        if let Some(execution) = execution {
            self.persist(&execution).await;
        }
    }

    async fn persist(&self, execution: &RecoveryExecution) {
        if let Err(err) = self
            .bus
            .put_json(
                &format!("recovery:execution:{}", execution.id),
                execution,
                Some(Duration::from_secs(7 * 24 * 3600)),
            )
            .await
        {
            warn!(recovery = %execution.id, error = %err, "failed to persist recovery record");
        }
        if let Err(err) = self
            .bus
            .put_json(
                &format!("recovery:context:{}", execution.context.id),
                &execution.context,
                Some(Duration::from_secs(7 * 24 * 3600)),
            )
            .await
        {
            warn!(recovery = %execution.id, error = %err, "failed to persist recovery context");
        }
    }

    async fn publish(&self, event_type: &str, payload: serde_json::Value) {
        let envelope =
            EventEnvelope::new(event_type, &self.swarm_id, &self.producer_id, payload);
        if let Err(err) = self
            .bus
            .publish_with_replay(channels::RECOVERY, &envelope, Duration::from_secs(3600))
            .await
        {
            warn!(error = %err, event = event_type, "failed to publish recovery event");
        }
    }
}
