//! Readiness assessor: weighted multi-category scoring producing a
//! go/no-go decision ahead of rollout.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::health::{HealthCheckKind, HealthProbe};
use crate::types::Color;

/// Categories and their weights. Weights sum to 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessCategory {
    Infrastructure,
    Application,
    Operations,
    Security,
}

impl ReadinessCategory {
    pub const ALL: [ReadinessCategory; 4] = [
        ReadinessCategory::Infrastructure,
        ReadinessCategory::Application,
        ReadinessCategory::Operations,
        ReadinessCategory::Security,
    ];

    pub fn weight(&self) -> f64 {
        match self {
            ReadinessCategory::Infrastructure => 0.30,
            ReadinessCategory::Application => 0.25,
            ReadinessCategory::Operations => 0.25,
            ReadinessCategory::Security => 0.20,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ReadinessCategory::Infrastructure => "infrastructure",
            ReadinessCategory::Application => "application",
            ReadinessCategory::Operations => "operations",
            ReadinessCategory::Security => "security",
        }
    }

    /// The health checks feeding this category's score.
    fn checks(&self) -> &'static [HealthCheckKind] {
        match self {
            ReadinessCategory::Infrastructure => &[HealthCheckKind::Resources],
            ReadinessCategory::Application => {
                &[HealthCheckKind::Service, HealthCheckKind::Api]
            }
            ReadinessCategory::Operations => {
                &[HealthCheckKind::Monitoring, HealthCheckKind::Dependencies]
            }
            ReadinessCategory::Security => &[HealthCheckKind::Security],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryScore {
    pub category: ReadinessCategory,
    /// Fraction of the category's checks that passed, in [0, 1].
    pub score: f64,
    pub failed_checks: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessReport {
    pub overall: f64,
    pub go: bool,
    pub categories: Vec<CategoryScore>,
    /// Human-readable reasons blocking go-live, empty when `go`.
    pub blocking: Vec<String>,
}

pub struct ReadinessAssessor {
    go_threshold: f64,
    category_floor: f64,
}

impl ReadinessAssessor {
    pub fn new(go_threshold: f64, category_floor: f64) -> Self {
        Self { go_threshold, category_floor }
    }

    /// Probe every category against the target color and combine the
    /// weighted scores. A category below the floor blocks regardless of
    /// the overall score.
    pub async fn assess(&self, probe: &Arc<dyn HealthProbe>, color: Color) -> ReadinessReport {
        let mut categories = Vec::with_capacity(ReadinessCategory::ALL.len());
        let mut overall = 0.0;
        let mut blocking = Vec::new();

        for category in ReadinessCategory::ALL {
            let checks = category.checks();
            let mut passed = 0usize;
            let mut failed_checks = Vec::new();
            for kind in checks {
                let report = probe.check(*kind, color).await;
                if report.healthy {
                    passed += 1;
                } else {
                    failed_checks.push(format!("{}: {}", kind.name(), report.detail));
                }
            }
            let score = passed as f64 / checks.len() as f64;
            overall += category.weight() * score;
            if score < self.category_floor {
                blocking.push(format!(
                    "category {} scored {score:.2}, below floor {:.2}",
                    category.name(),
                    self.category_floor
                ));
            }
            categories.push(CategoryScore { category, score, failed_checks });
        }

        if overall < self.go_threshold {
            blocking.push(format!(
                "overall readiness {overall:.2} below threshold {:.2}",
                self.go_threshold
            ));
        }

        ReadinessReport { overall, go: blocking.is_empty(), categories, blocking }
    }
}
