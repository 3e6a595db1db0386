//! Go-live checklist: ordered automated and manual verification items.
//! Manual items are gated on recorded approvals; the checklist refuses
//! completion while a required approval is missing.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::health::{HealthCheckKind, HealthProbe};
use crate::types::{Approval, Color};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ChecklistKind {
    /// Verified by running a health check.
    Automated { check: HealthCheckKind },
    /// Verified by a recorded human approval.
    Manual { required_approver: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Passed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChecklistItem {
    pub id: String,
    pub description: String,
    pub kind: ChecklistKind,
    pub status: ItemStatus,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecklistReport {
    pub complete: bool,
    pub items: Vec<ChecklistItem>,
    pub missing_approvals: Vec<String>,
}

/// The standard pre-rollout checklist.
pub struct GoLiveChecklist {
    items: Vec<ChecklistItem>,
}

impl GoLiveChecklist {
    pub fn standard() -> Self {
        let item = |id: &str, description: &str, kind: ChecklistKind| ChecklistItem {
            id: id.to_string(),
            description: description.to_string(),
            kind,
            status: ItemStatus::Pending,
            detail: None,
        };
        Self {
            items: vec![
                item(
                    "service-health",
                    "Target color responds to service health checks",
                    ChecklistKind::Automated { check: HealthCheckKind::Service },
                ),
                item(
                    "database-migrations",
                    "Database is reachable and migrations applied",
                    ChecklistKind::Automated { check: HealthCheckKind::Database },
                ),
                item(
                    "monitoring-wired",
                    "Dashboards and alerting receive data from the target color",
                    ChecklistKind::Automated { check: HealthCheckKind::Monitoring },
                ),
                item(
                    "release-signoff",
                    "Release owner signed off on the change set",
                    ChecklistKind::Manual { required_approver: "release-owner".to_string() },
                ),
            ],
        }
    }

    pub fn with_items(items: Vec<ChecklistItem>) -> Self {
        Self { items }
    }

    /// Run automated items against the probe and resolve manual items
    /// against the supplied approvals.
    pub async fn verify(
        &self,
        probe: &Arc<dyn HealthProbe>,
        color: Color,
        approvals: &[Approval],
    ) -> ChecklistReport {
        let mut items = self.items.clone();
        let mut missing_approvals = Vec::new();

        for item in items.iter_mut() {
            match &item.kind {
                ChecklistKind::Automated { check } => {
                    let report = probe.check(*check, color).await;
                    item.status = if report.healthy { ItemStatus::Passed } else { ItemStatus::Failed };
                    item.detail = Some(report.detail);
                }
                ChecklistKind::Manual { required_approver } => {
                    let approval = approvals.iter().find(|approval| {
                        approval.item_id == item.id && approval.approver == *required_approver
                    });
                    match approval {
                        Some(approval) => {
                            item.status = ItemStatus::Passed;
                            item.detail = Some(format!(
                                "approved by {} at {}",
                                approval.approver, approval.approved_at
                            ));
                        }
                        None => {
                            item.status = ItemStatus::Failed;
                            item.detail =
                                Some(format!("missing approval from {required_approver}"));
                            missing_approvals
                                .push(format!("{}:{required_approver}", item.id));
                        }
                    }
                }
            }
        }

        let complete = items.iter().all(|item| item.status == ItemStatus::Passed);
        ChecklistReport { complete, items, missing_approvals }
    }
}

/// Convenience constructor for a recorded approval.
pub fn approval(item_id: &str, approver: &str) -> Approval {
    Approval {
        item_id: item_id.to_string(),
        approver: approver.to_string(),
        approved_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::ScriptedProbe;

    #[tokio::test]
    async fn checklist_requires_manual_approval() {
        let probe: Arc<dyn HealthProbe> = ScriptedProbe::new();
        let checklist = GoLiveChecklist::standard();

        let report = checklist.verify(&probe, Color::Green, &[]).await;
        assert!(!report.complete);
        assert_eq!(report.missing_approvals, vec!["release-signoff:release-owner"]);

        let approved = checklist
            .verify(&probe, Color::Green, &[approval("release-signoff", "release-owner")])
            .await;
        assert!(approved.complete);
    }

    #[tokio::test]
    async fn wrong_approver_does_not_satisfy_gate() {
        let probe: Arc<dyn HealthProbe> = ScriptedProbe::new();
        let checklist = GoLiveChecklist::standard();
        let report = checklist
            .verify(&probe, Color::Green, &[approval("release-signoff", "someone-else")])
            .await;
        assert!(!report.complete);
    }

    #[tokio::test]
    async fn automated_failure_marks_item_failed() {
        let scripted = ScriptedProbe::new();
        scripted.fail_check(HealthCheckKind::Database).await;
        let probe: Arc<dyn HealthProbe> = scripted;
        let checklist = GoLiveChecklist::standard();
        let report = checklist
            .verify(&probe, Color::Green, &[approval("release-signoff", "release-owner")])
            .await;
        assert!(!report.complete);
        let db_item = report.items.iter().find(|i| i.id == "database-migrations").unwrap();
        assert_eq!(db_item.status, ItemStatus::Failed);
    }
}
