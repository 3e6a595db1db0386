//! Health probing seams.
//!
//! The state machine validates color health through the `HealthProbe`
//! trait and reads runtime metrics through `MetricsSource`. Production
//! wires real collectors here; tests script failures (for example a
//! canary gate failing at the 25% step).

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::types::{Color, RuntimeHealthSample};

/// Check families run during validation phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthCheckKind {
    Service,
    Database,
    Api,
    Dependencies,
    Resources,
    Smoke,
    Performance,
    Security,
    Monitoring,
}

impl HealthCheckKind {
    /// Checks run during the health-validation phase.
    pub const VALIDATION: [HealthCheckKind; 5] = [
        HealthCheckKind::Service,
        HealthCheckKind::Database,
        HealthCheckKind::Api,
        HealthCheckKind::Dependencies,
        HealthCheckKind::Resources,
    ];

    /// Checks run during post-deployment validation.
    pub const POST_DEPLOYMENT: [HealthCheckKind; 4] = [
        HealthCheckKind::Smoke,
        HealthCheckKind::Performance,
        HealthCheckKind::Security,
        HealthCheckKind::Monitoring,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            HealthCheckKind::Service => "service",
            HealthCheckKind::Database => "database",
            HealthCheckKind::Api => "api",
            HealthCheckKind::Dependencies => "dependencies",
            HealthCheckKind::Resources => "resources",
            HealthCheckKind::Smoke => "smoke",
            HealthCheckKind::Performance => "performance",
            HealthCheckKind::Security => "security",
            HealthCheckKind::Monitoring => "monitoring",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub detail: String,
}

impl HealthReport {
    pub fn healthy() -> Self {
        Self { healthy: true, detail: "ok".to_string() }
    }

    pub fn unhealthy(detail: impl Into<String>) -> Self {
        Self { healthy: false, detail: detail.into() }
    }
}

/// Color-level lifecycle and health operations.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Provision the idle color. Infrastructure errors surface as strings
    /// local to the failing phase.
    async fn provision(&self, _color: Color) -> Result<(), String> {
        Ok(())
    }

    async fn check(&self, kind: HealthCheckKind, color: Color) -> HealthReport;

    /// Health gate evaluated at a given traffic percentage during the
    /// shift phase. Defaults to the plain service check.
    async fn traffic_health(&self, color: Color, _percent: u8) -> HealthReport {
        self.check(HealthCheckKind::Service, color).await
    }

    /// Gracefully drain connections off a color before termination.
    async fn drain(&self, _color: Color) -> Result<(), String> {
        Ok(())
    }
}

/// Runtime metric feed for rollback trigger evaluation.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn sample(&self, deployment_id: Uuid) -> RuntimeHealthSample;
}

/// Probe that reports everything healthy. Useful default for local runs.
pub struct StaticProbe;

#[async_trait]
impl HealthProbe for StaticProbe {
    async fn check(&self, _kind: HealthCheckKind, _color: Color) -> HealthReport {
        HealthReport::healthy()
    }
}

#[async_trait]
impl MetricsSource for StaticProbe {
    async fn sample(&self, _deployment_id: Uuid) -> RuntimeHealthSample {
        RuntimeHealthSample::healthy()
    }
}

/// Scripted probe for tests and rehearsals: per-kind results and per-step
/// traffic gates, with recorded call history.
#[derive(Default)]
pub struct ScriptedProbe {
    check_results: Mutex<HashMap<HealthCheckKind, bool>>,
    traffic_gates: Mutex<HashMap<u8, bool>>,
    samples: Mutex<Vec<RuntimeHealthSample>>,
    pub calls: Mutex<Vec<String>>,
}

impl ScriptedProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn fail_check(&self, kind: HealthCheckKind) {
        self.check_results.lock().await.insert(kind, false);
    }

    pub async fn fail_traffic_at(&self, percent: u8) {
        self.traffic_gates.lock().await.insert(percent, false);
    }

    /// Queue a metrics sample; the last queued sample repeats once the
    /// queue drains.
    pub async fn push_sample(&self, sample: RuntimeHealthSample) {
        self.samples.lock().await.push(sample);
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn check(&self, kind: HealthCheckKind, color: Color) -> HealthReport {
        self.calls
            .lock()
            .await
            .push(format!("check:{}:{}", kind.name(), color.name()));
        match self.check_results.lock().await.get(&kind) {
            Some(false) => HealthReport::unhealthy(format!("{} check failed", kind.name())),
            _ => HealthReport::healthy(),
        }
    }

    async fn traffic_health(&self, color: Color, percent: u8) -> HealthReport {
        self.calls
            .lock()
            .await
            .push(format!("traffic:{}:{percent}", color.name()));
        match self.traffic_gates.lock().await.get(&percent) {
            Some(false) => {
                HealthReport::unhealthy(format!("health gate failed at {percent}% traffic"))
            }
            _ => HealthReport::healthy(),
        }
    }
}

#[async_trait]
impl MetricsSource for ScriptedProbe {
    async fn sample(&self, _deployment_id: Uuid) -> RuntimeHealthSample {
        let mut samples = self.samples.lock().await;
        if samples.len() > 1 {
            samples.remove(0)
        } else if let Some(last) = samples.first() {
            last.clone()
        } else {
            RuntimeHealthSample { sampled_at: Utc::now(), ..RuntimeHealthSample::healthy() }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_probe_fails_configured_traffic_step() {
        let probe = ScriptedProbe::new();
        probe.fail_traffic_at(25).await;
        assert!(probe.traffic_health(Color::Green, 10).await.healthy);
        assert!(!probe.traffic_health(Color::Green, 25).await.healthy);
    }

    #[tokio::test]
    async fn scripted_probe_repeats_last_sample() {
        let probe = ScriptedProbe::new();
        let mut degraded = RuntimeHealthSample::healthy();
        degraded.error_rate = 0.5;
        probe.push_sample(degraded).await;
        let a = probe.sample(Uuid::new_v4()).await;
        let b = probe.sample(Uuid::new_v4()).await;
        assert_eq!(a.error_rate, 0.5);
        assert_eq!(b.error_rate, 0.5);
    }
}
