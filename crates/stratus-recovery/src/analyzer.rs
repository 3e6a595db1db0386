//! Context analyzer: classifies raw error reports into a recovery
//! context carrying severity, business impact, affected components and
//! available headroom.

use chrono::Utc;
use uuid::Uuid;

use crate::types::{
    BusinessImpact, ErrorData, ErrorSeverity, RecoveryContext, ResourceShare,
};

pub struct ContextAnalyzer;

impl ContextAnalyzer {
    /// Classify an error report. `utilization` is the system's current
    /// resource usage; headroom is its complement.
    pub fn analyze(error: &ErrorData, utilization: &ResourceShare) -> RecoveryContext {
        let severity = Self::classify_severity(&error.error_type, &error.metrics);
        let business_impact = Self::classify_impact(&error.component, severity);
        let time_constraint_ms = match severity {
            ErrorSeverity::Critical => Some(5 * 60 * 1000),
            ErrorSeverity::High => Some(15 * 60 * 1000),
            _ => None,
        };

        RecoveryContext {
            id: Uuid::new_v4(),
            error_type: error.error_type.clone(),
            severity,
            affected_components: vec![error.component.clone()],
            available_resources: ResourceShare::full().subtract_clamped(utilization),
            business_impact,
            time_constraint_ms,
            deployment_id: error.deployment_id,
            detected_at: Utc::now(),
        }
    }

    fn classify_severity(
        error_type: &str,
        metrics: &std::collections::HashMap<String, f64>,
    ) -> ErrorSeverity {
        let base = if error_type.contains("corruption") || error_type.contains("outage") {
            ErrorSeverity::Critical
        } else if error_type.contains("connection-lost")
            || error_type.contains("unavailable")
            || error_type.contains("exhaustion")
            || error_type.contains("partition")
        {
            ErrorSeverity::High
        } else if error_type.contains("degradation")
            || error_type.contains("timeout")
            || error_type.contains("pressure")
        {
            ErrorSeverity::Medium
        } else {
            ErrorSeverity::Low
        };

        // A very high observed error rate escalates one level.
        let error_rate = metrics.get("error_rate").copied().unwrap_or(0.0);
        match (base, error_rate > 0.5) {
            (ErrorSeverity::High, true) => ErrorSeverity::Critical,
            (ErrorSeverity::Medium, true) => ErrorSeverity::High,
            (ErrorSeverity::Low, true) => ErrorSeverity::Medium,
            (severity, _) => severity,
        }
    }

    fn classify_impact(component: &str, severity: ErrorSeverity) -> BusinessImpact {
        let customer_facing = component.contains("payment")
            || component.contains("checkout")
            || component.contains("api")
            || component.contains("gateway");
        match (customer_facing, severity) {
            (true, ErrorSeverity::Critical) => BusinessImpact::Critical,
            (true, _) => BusinessImpact::High,
            (false, ErrorSeverity::Critical) => BusinessImpact::High,
            (false, ErrorSeverity::High) => BusinessImpact::Moderate,
            _ => BusinessImpact::Low,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn error(error_type: &str, component: &str) -> ErrorData {
        ErrorData {
            error_type: error_type.to_string(),
            message: "observed failure".to_string(),
            component: component.to_string(),
            deployment_id: None,
            metrics: HashMap::new(),
        }
    }

    #[test]
    fn connection_loss_is_high_severity() {
        let context =
            ContextAnalyzer::analyze(&error("database-connection-lost", "db"), &ResourceShare::default());
        assert_eq!(context.severity, ErrorSeverity::High);
        assert!(context.time_constraint_ms.is_some());
    }

    #[test]
    fn error_rate_escalates_severity() {
        let mut data = error("database-connection-lost", "db");
        data.metrics.insert("error_rate".to_string(), 0.8);
        let context = ContextAnalyzer::analyze(&data, &ResourceShare::default());
        assert_eq!(context.severity, ErrorSeverity::Critical);
    }

    #[test]
    fn customer_facing_component_raises_impact() {
        let context =
            ContextAnalyzer::analyze(&error("service-unavailable", "payment-api"), &ResourceShare::default());
        assert_eq!(context.business_impact, BusinessImpact::High);
    }

    #[test]
    fn headroom_is_complement_of_utilization() {
        let utilization = ResourceShare::new(0.7, 0.2, 0.0, 0.1);
        let context = ContextAnalyzer::analyze(&error("slow-degradation", "worker"), &utilization);
        assert!((context.available_resources.cpu - 0.3).abs() < 1e-9);
        assert!((context.available_resources.memory - 0.8).abs() < 1e-9);
    }
}
