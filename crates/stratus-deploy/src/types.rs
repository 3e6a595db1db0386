//! Deployment execution model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Blue/green color slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Color {
    Blue,
    Green,
}

impl Color {
    pub fn other(&self) -> Color {
        match self {
            Color::Blue => Color::Green,
            Color::Green => Color::Blue,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Color::Blue => "blue",
            Color::Green => "green",
        }
    }
}

/// Rollout strategy for one deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStrategy {
    /// Single traffic flip after validation.
    BlueGreen,
    /// Staged traffic ladder with per-step health gates.
    Canary,
}

impl RolloutStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            RolloutStrategy::BlueGreen => "blue_green",
            RolloutStrategy::Canary => "canary",
        }
    }
}

/// The six rollout phases, in strict order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentPhase {
    Preparation,
    DeployNewColor,
    HealthValidation,
    TrafficShift,
    CleanupOldColor,
    PostDeploymentValidation,
}

impl DeploymentPhase {
    pub const ORDER: [DeploymentPhase; 6] = [
        DeploymentPhase::Preparation,
        DeploymentPhase::DeployNewColor,
        DeploymentPhase::HealthValidation,
        DeploymentPhase::TrafficShift,
        DeploymentPhase::CleanupOldColor,
        DeploymentPhase::PostDeploymentValidation,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            DeploymentPhase::Preparation => "preparation",
            DeploymentPhase::DeployNewColor => "deploy_new_color",
            DeploymentPhase::HealthValidation => "health_validation",
            DeploymentPhase::TrafficShift => "traffic_shift",
            DeploymentPhase::CleanupOldColor => "cleanup_old_color",
            DeploymentPhase::PostDeploymentValidation => "post_deployment_validation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Running,
    Completed,
    Failed,
    TimedOut,
}

/// Append-only record of one phase run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: DeploymentPhase,
    pub status: PhaseStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Running,
    Completed,
    Failed,
    RollingBack,
    RolledBack,
}

impl DeploymentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Completed | DeploymentStatus::Failed | DeploymentStatus::RolledBack
        )
    }
}

/// What the operator asks to deploy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    pub name: String,
    pub version: String,
    /// Opaque application configuration captured into snapshots.
    pub configuration: serde_json::Value,
}

/// A recorded manual approval for a gated checklist item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Approval {
    pub item_id: String,
    pub approver: String,
    pub approved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentOptions {
    pub strategy: RolloutStrategy,
    /// Manual approvals already collected for go-live checklist items.
    pub approvals: Vec<Approval>,
}

impl Default for DeploymentOptions {
    fn default() -> Self {
        Self { strategy: RolloutStrategy::BlueGreen, approvals: Vec::new() }
    }
}

/// Durable record of one rollout, mirrored to the bus after every change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentExecution {
    pub id: Uuid,
    pub app_name: String,
    pub version: String,
    pub strategy: RolloutStrategy,
    pub status: DeploymentStatus,
    /// Color currently serving production traffic.
    pub active_color: Color,
    /// Color being rolled out.
    pub target_color: Color,
    /// Traffic fraction currently routed to the target color, 0..=100.
    /// Mutated only by the state machine and the rollback manager.
    pub traffic_to_target: u8,
    pub snapshot_id: Option<Uuid>,
    pub phase_history: Vec<PhaseRecord>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl DeploymentExecution {
    pub fn new(app: &ApplicationConfig, strategy: RolloutStrategy, active_color: Color) -> Self {
        Self {
            id: Uuid::new_v4(),
            app_name: app.name.clone(),
            version: app.version.clone(),
            strategy,
            status: DeploymentStatus::Pending,
            active_color,
            target_color: active_color.other(),
            traffic_to_target: 0,
            snapshot_id: None,
            phase_history: Vec::new(),
            started_at: Utc::now(),
            ended_at: None,
            error: None,
        }
    }

    /// The currently running phase, if any. The state machine maintains
    /// the invariant that at most one record is in `Running` state.
    pub fn running_phase(&self) -> Option<DeploymentPhase> {
        self.phase_history
            .iter()
            .find(|record| record.status == PhaseStatus::Running)
            .map(|record| record.phase)
    }
}

/// One observed runtime health sample used by rollback triggers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeHealthSample {
    /// Fraction of failing requests, in [0, 1].
    pub error_rate: f64,
    pub p95_response_ms: f64,
    /// Fraction of time the service answered, in [0, 1].
    pub availability: f64,
    /// Fraction of passing health checks, in [0, 1].
    pub health_check_pass_rate: f64,
    /// Raw error strings scanned for critical patterns.
    pub critical_errors: Vec<String>,
    pub sampled_at: DateTime<Utc>,
}

impl RuntimeHealthSample {
    /// A sample describing a fully healthy system.
    pub fn healthy() -> Self {
        Self {
            error_rate: 0.0,
            p95_response_ms: 100.0,
            availability: 1.0,
            health_check_pass_rate: 1.0,
            critical_errors: Vec::new(),
            sampled_at: Utc::now(),
        }
    }
}
