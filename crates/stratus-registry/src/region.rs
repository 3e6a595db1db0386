//! Region views computed from node state.
//!
//! Regions are not stored entities: the registry derives them from node
//! tags and locations on every change, which keeps Node <-> Region free of
//! cyclic ownership.

use serde::{Deserialize, Serialize};

use stratus_core::{GeoLocation, Node};

/// Weighted health of a region. Weights follow the registry contract:
/// load 0.4, latency 0.3, availability 0.3.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegionHealth {
    /// 1 − mean utilization over member nodes.
    pub load_score: f64,
    /// 1 − mean latency / 1000ms, floored at 0.
    pub latency_score: f64,
    /// Mean availability over member nodes.
    pub availability_score: f64,
    pub overall: f64,
}

impl RegionHealth {
    const LOAD_WEIGHT: f64 = 0.4;
    const LATENCY_WEIGHT: f64 = 0.3;
    const AVAILABILITY_WEIGHT: f64 = 0.3;

    fn from_members(members: &[&Node]) -> Self {
        if members.is_empty() {
            return Self {
                load_score: 0.0,
                latency_score: 0.0,
                availability_score: 0.0,
                overall: 0.0,
            };
        }
        let count = members.len() as f64;
        let load_score =
            1.0 - members.iter().map(|n| n.utilization.mean()).sum::<f64>() / count;
        let latency_score = (1.0
            - members.iter().map(|n| n.performance.latency_ms).sum::<f64>() / count / 1000.0)
            .max(0.0);
        let availability_score =
            members.iter().map(|n| n.performance.availability).sum::<f64>() / count;
        let overall = Self::LOAD_WEIGHT * load_score
            + Self::LATENCY_WEIGHT * latency_score
            + Self::AVAILABILITY_WEIGHT * availability_score;
        Self { load_score, latency_score, availability_score, overall }
    }
}

/// A view over the nodes sharing one region tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionView {
    pub id: String,
    /// Mean of member node locations.
    pub centroid: GeoLocation,
    pub node_ids: Vec<String>,
    pub health: RegionHealth,
    /// Below the configured health threshold a region is excluded from
    /// default optimizer candidate sets; sovereignty-pinned tasks may
    /// still land here.
    pub healthy: bool,
}

impl RegionView {
    pub fn compute(region: &str, members: &[&Node], health_threshold: f64) -> Self {
        let count = members.len().max(1) as f64;
        let centroid = GeoLocation::new(
            members.iter().map(|n| n.location.latitude).sum::<f64>() / count,
            members.iter().map(|n| n.location.longitude).sum::<f64>() / count,
        );
        let mut node_ids: Vec<String> = members.iter().map(|n| n.id.clone()).collect();
        node_ids.sort();
        let health = RegionHealth::from_members(members);
        Self {
            id: region.to_string(),
            centroid,
            node_ids,
            healthy: health.overall >= health_threshold,
            health,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use stratus_core::{NodePerformance, NodeStatus, ResourceVector, UnitCosts};

    fn node(id: &str, util: f64, latency: f64, availability: f64) -> Node {
        Node {
            id: id.to_string(),
            region: "eu-west".to_string(),
            location: GeoLocation::new(53.0, -6.0),
            capacity: ResourceVector::new(100.0, 100.0, 100.0, 100.0),
            utilization: ResourceVector::new(util, util, util, util),
            unit_costs: UnitCosts::default(),
            performance: NodePerformance {
                latency_ms: latency,
                throughput: 1000.0,
                reliability: 0.99,
                availability,
            },
            capabilities: BTreeSet::new(),
            supported_tasks: BTreeSet::new(),
            status: NodeStatus::Healthy,
        }
    }

    #[test]
    fn health_weights_are_applied() {
        let a = node("a", 0.5, 100.0, 1.0);
        let b = node("b", 0.5, 300.0, 0.9);
        let view = RegionView::compute("eu-west", &[&a, &b], 0.5);
        // load 0.5·0.4 + latency 0.8·0.3 + availability 0.95·0.3 = 0.725
        assert!((view.health.overall - 0.725).abs() < 1e-9);
        assert!(view.healthy);
    }

    #[test]
    fn centroid_is_mean_of_member_locations() {
        let mut a = node("a", 0.0, 10.0, 1.0);
        let mut b = node("b", 0.0, 10.0, 1.0);
        a.location = GeoLocation::new(10.0, 20.0);
        b.location = GeoLocation::new(30.0, 40.0);
        let view = RegionView::compute("eu-west", &[&a, &b], 0.5);
        assert!((view.centroid.latitude - 20.0).abs() < 1e-9);
        assert!((view.centroid.longitude - 30.0).abs() < 1e-9);
    }

    #[test]
    fn saturated_high_latency_region_is_unhealthy() {
        let a = node("a", 1.0, 2000.0, 0.5);
        let view = RegionView::compute("eu-west", &[&a], 0.5);
        assert!(view.health.overall < 0.5);
        assert!(!view.healthy);
    }
}
