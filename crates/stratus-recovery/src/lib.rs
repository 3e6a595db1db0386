//! Automated recovery orchestrator: context analysis, strategy selection
//! with rolling success rates, queued resource-aware execution, and
//! pre-emptive self-healing.

pub mod analyzer;
pub mod healing;
pub mod orchestrator;
pub mod strategy;
pub mod types;

use thiserror::Error;
use uuid::Uuid;

use stratus_bus::BusError;

pub use analyzer::ContextAnalyzer;
pub use healing::{HealingAction, HealthSignal, RiskAssessment, SelfHealingScheduler, Trend};
pub use orchestrator::{
    DeploymentRollbackHook, RecoveryOrchestrator, ScriptedExecutor, SimulatedExecutor,
    StepExecutor,
};
pub use strategy::{builtin_strategies, StrategyPerformance, StrategyRegistry};
pub use types::{
    BusinessImpact, ErrorData, ErrorSeverity, RecoveryAction, RecoveryContext, RecoveryExecution,
    RecoveryStatus, RecoveryStep, RecoveryStrategy, ResourceShare, RiskLevel,
};

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("no applicable recovery strategy for error type {0}")]
    NoApplicableStrategy(String),

    #[error("recovery {0} not found")]
    NotFound(Uuid),

    #[error(transparent)]
    Bus(#[from] BusError),
}
