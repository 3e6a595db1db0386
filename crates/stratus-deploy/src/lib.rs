//! Deployment subsystem: readiness gating, go-live checklist, the phased
//! blue/green + canary state machine, snapshot capture and health-driven
//! rollback.

pub mod checklist;
pub mod health;
pub mod readiness;
pub mod rollback;
pub mod snapshot;
pub mod state_machine;
pub mod types;

use thiserror::Error;
use uuid::Uuid;

use stratus_bus::BusError;

pub use checklist::{approval, ChecklistItem, ChecklistKind, ChecklistReport, GoLiveChecklist};
pub use health::{
    HealthCheckKind, HealthProbe, HealthReport, MetricsSource, ScriptedProbe, StaticProbe,
};
pub use readiness::{ReadinessAssessor, ReadinessCategory, ReadinessReport};
pub use rollback::{
    RollbackManager, RollbackOutcome, RollbackStatus, RollbackStep, RollbackTrigger,
};
pub use snapshot::{HealthBaseline, HealthState, PerformanceBaseline, Snapshot, SnapshotStore};
pub use state_machine::DeploymentCoordinator;
pub use types::{
    ApplicationConfig, Approval, Color, DeploymentExecution, DeploymentOptions, DeploymentPhase,
    DeploymentStatus, PhaseRecord, PhaseStatus, RolloutStrategy, RuntimeHealthSample,
};

#[derive(Debug, Error)]
pub enum DeploymentError {
    #[error("deployment {0} not found")]
    NotFound(Uuid),

    #[error("rollback already running for deployment {0}")]
    RollbackAlreadyRunning(Uuid),

    #[error("rollback failed for deployment {deployment_id}; operator attention required")]
    RollbackFailed {
        deployment_id: Uuid,
        outcome: Box<RollbackOutcome>,
    },

    #[error(transparent)]
    Bus(#[from] BusError),
}
