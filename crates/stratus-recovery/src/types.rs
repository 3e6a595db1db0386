//! Recovery domain model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusinessImpact {
    Low,
    Moderate,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// Fractions of system resources, per axis, in [0, 1].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceShare {
    pub cpu: f64,
    pub memory: f64,
    pub network: f64,
    pub disk: f64,
}

impl ResourceShare {
    pub fn new(cpu: f64, memory: f64, network: f64, disk: f64) -> Self {
        Self { cpu, memory, network, disk }
    }

    /// Whether this share is large enough to cover `required`.
    pub fn covers(&self, required: &ResourceShare) -> bool {
        required.cpu <= self.cpu
            && required.memory <= self.memory
            && required.network <= self.network
            && required.disk <= self.disk
    }

    pub fn add(&mut self, other: &ResourceShare) {
        self.cpu += other.cpu;
        self.memory += other.memory;
        self.network += other.network;
        self.disk += other.disk;
    }

    pub fn subtract_clamped(&self, other: &ResourceShare) -> ResourceShare {
        ResourceShare {
            cpu: (self.cpu - other.cpu).max(0.0),
            memory: (self.memory - other.memory).max(0.0),
            network: (self.network - other.network).max(0.0),
            disk: (self.disk - other.disk).max(0.0),
        }
    }

    pub fn full() -> Self {
        Self { cpu: 1.0, memory: 1.0, network: 1.0, disk: 1.0 }
    }
}

/// Raw error report handed to `initiateRecovery`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorData {
    pub error_type: String,
    pub message: String,
    pub component: String,
    /// Deployment implicated by this error, if any. A failing recovery for
    /// an implicated deployment escalates to deployment rollback.
    #[serde(default)]
    pub deployment_id: Option<Uuid>,
    #[serde(default)]
    pub metrics: HashMap<String, f64>,
}

/// Analyzed context a strategy is selected against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryContext {
    pub id: Uuid,
    pub error_type: String,
    pub severity: ErrorSeverity,
    pub affected_components: Vec<String>,
    /// Headroom available when the context was analyzed.
    pub available_resources: ResourceShare,
    pub business_impact: BusinessImpact,
    /// Hard bound on total recovery time, if the caller has one.
    pub time_constraint_ms: Option<u64>,
    pub deployment_id: Option<Uuid>,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    RestartComponent,
    ReallocateResources,
    FlushConnections,
    ClearBacklog,
    ScaleOut,
    FailoverReplica,
    Custom(String),
}

/// One executable step of a strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStep {
    pub id: String,
    pub name: String,
    pub action: RecoveryAction,
    pub timeout_ms: u64,
    pub retry_attempts: u32,
    /// Criterion the executor validates after the action, if any.
    pub validation: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryStrategy {
    pub id: String,
    pub name: String,
    pub applicable_error_types: Vec<String>,
    pub required_resources: ResourceShare,
    pub estimated_duration_ms: u64,
    /// Prior success probability, in [0, 1]; replaced by the rolling EMA
    /// once outcomes are observed.
    pub success_probability: f64,
    pub risk_level: RiskLevel,
    pub steps: Vec<RecoveryStep>,
    pub rollback_plan: Vec<RecoveryStep>,
    pub prerequisites: Vec<String>,
    pub side_effects: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStatus {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    RolledBack,
}

impl RecoveryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RecoveryStatus::Completed | RecoveryStatus::Failed | RecoveryStatus::RolledBack
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryExecution {
    pub id: Uuid,
    pub context: RecoveryContext,
    pub strategy_id: String,
    pub status: RecoveryStatus,
    pub current_step: usize,
    pub completed_steps: Vec<String>,
    pub failed_steps: Vec<String>,
    /// Completed fraction of the strategy's steps, in [0, 1].
    pub progress: f64,
    pub rollback_history: Vec<String>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl RecoveryExecution {
    pub fn new(context: RecoveryContext, strategy_id: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            context,
            strategy_id: strategy_id.to_string(),
            status: RecoveryStatus::Queued,
            current_step: 0,
            completed_steps: Vec::new(),
            failed_steps: Vec::new(),
            progress: 0.0,
            rollback_history: Vec::new(),
            queued_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }

    /// Failure rate over attempted steps. The rollback threshold is a
    /// rate in [0, 1] in this subsystem.
    pub fn failure_rate(&self) -> f64 {
        let attempted = self.completed_steps.len() + self.failed_steps.len();
        if attempted == 0 {
            0.0
        } else {
            self.failed_steps.len() as f64 / attempted as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_orders_for_queue_priority() {
        assert!(ErrorSeverity::Critical > ErrorSeverity::High);
        assert!(ErrorSeverity::High > ErrorSeverity::Medium);
        assert!(ErrorSeverity::Medium > ErrorSeverity::Low);
    }

    #[test]
    fn resource_share_cover_and_subtract() {
        let available = ResourceShare::new(0.5, 0.5, 0.9, 0.9);
        let small = ResourceShare::new(0.2, 0.1, 0.1, 0.1);
        let big = ResourceShare::new(0.6, 0.1, 0.1, 0.1);
        assert!(available.covers(&small));
        assert!(!available.covers(&big));
        let rest = available.subtract_clamped(&big);
        assert_eq!(rest.cpu, 0.0);
        assert!((rest.memory - 0.4).abs() < 1e-9);
    }

    #[test]
    fn failure_rate_counts_attempted_steps_only() {
        let context = RecoveryContext {
            id: Uuid::new_v4(),
            error_type: "service-unavailable".to_string(),
            severity: ErrorSeverity::High,
            affected_components: vec!["svc".to_string()],
            available_resources: ResourceShare::full(),
            business_impact: BusinessImpact::Moderate,
            time_constraint_ms: None,
            deployment_id: None,
            detected_at: Utc::now(),
        };
        let mut execution = RecoveryExecution::new(context, "restart");
        assert_eq!(execution.failure_rate(), 0.0);
        execution.completed_steps.push("a".to_string());
        execution.failed_steps.push("b".to_string());
        assert_eq!(execution.failure_rate(), 0.5);
    }
}
