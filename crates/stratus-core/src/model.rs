//! Canonical node, task and placement types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Resource axes tracked for every node capacity and task demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceAxis {
    Compute,
    Memory,
    Bandwidth,
    Storage,
}

impl ResourceAxis {
    pub const ALL: [ResourceAxis; 4] = [
        ResourceAxis::Compute,
        ResourceAxis::Memory,
        ResourceAxis::Bandwidth,
        ResourceAxis::Storage,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ResourceAxis::Compute => "compute",
            ResourceAxis::Memory => "memory",
            ResourceAxis::Bandwidth => "bandwidth",
            ResourceAxis::Storage => "storage",
        }
    }
}

/// A vector over the four resource axes. Used both for capacities
/// (absolute units) and for task demands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceVector {
    pub compute: f64,
    pub memory: f64,
    pub bandwidth: f64,
    pub storage: f64,
}

impl ResourceVector {
    pub fn new(compute: f64, memory: f64, bandwidth: f64, storage: f64) -> Self {
        Self { compute, memory, bandwidth, storage }
    }

    pub fn zero() -> Self {
        Self::default()
    }

    pub fn axis(&self, axis: ResourceAxis) -> f64 {
        match axis {
            ResourceAxis::Compute => self.compute,
            ResourceAxis::Memory => self.memory,
            ResourceAxis::Bandwidth => self.bandwidth,
            ResourceAxis::Storage => self.storage,
        }
    }

    pub fn axis_mut(&mut self, axis: ResourceAxis) -> &mut f64 {
        match axis {
            ResourceAxis::Compute => &mut self.compute,
            ResourceAxis::Memory => &mut self.memory,
            ResourceAxis::Bandwidth => &mut self.bandwidth,
            ResourceAxis::Storage => &mut self.storage,
        }
    }

    pub fn add(&mut self, other: &ResourceVector) {
        self.compute += other.compute;
        self.memory += other.memory;
        self.bandwidth += other.bandwidth;
        self.storage += other.storage;
    }

    /// True when every axis of `self` fits inside `capacity`.
    pub fn fits_within(&self, capacity: &ResourceVector) -> bool {
        ResourceAxis::ALL
            .iter()
            .all(|axis| self.axis(*axis) <= capacity.axis(*axis))
    }

    /// Mean of the four axes; inputs are expected to be in comparable units
    /// (typically fractions of capacity).
    pub fn mean(&self) -> f64 {
        (self.compute + self.memory + self.bandwidth + self.storage) / 4.0
    }
}

/// Per-axis unit pricing for a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitCosts {
    pub per_compute: f64,
    pub per_memory: f64,
    pub per_bandwidth: f64,
    pub per_storage: f64,
}

/// Observed performance characteristics of a node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NodePerformance {
    /// Base network latency to the node in milliseconds.
    pub latency_ms: f64,
    /// Sustained throughput in requests per second.
    pub throughput: f64,
    /// Fraction of work completed without failure, in [0, 1].
    pub reliability: f64,
    /// Observed uptime fraction, in [0, 1].
    pub availability: f64,
}

impl Default for NodePerformance {
    fn default() -> Self {
        Self { latency_ms: 50.0, throughput: 1000.0, reliability: 0.99, availability: 0.999 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Geographic point used for region resolution and latency estimation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoLocation {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// Great-circle distance to another point in kilometres (Haversine).
    pub fn distance_km(&self, other: &GeoLocation) -> f64 {
        const EARTH_RADIUS_KM: f64 = 6371.0;
        let dlat = (other.latitude - self.latitude).to_radians();
        let dlon = (other.longitude - self.longitude).to_radians();
        let a = (dlat / 2.0).sin() * (dlat / 2.0).sin()
            + self.latitude.to_radians().cos()
                * other.latitude.to_radians().cos()
                * (dlon / 2.0).sin()
                * (dlon / 2.0).sin();
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
        EARTH_RADIUS_KM * c
    }
}

/// A worker node eligible to receive task assignments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    /// Opaque region tag (e.g. "eu-west").
    pub region: String,
    pub location: GeoLocation,
    pub capacity: ResourceVector,
    /// Current utilization as fractions of capacity, per axis, in [0, 1].
    pub utilization: ResourceVector,
    pub unit_costs: UnitCosts,
    pub performance: NodePerformance,
    /// Capability tags matched against task affinity sets.
    pub capabilities: BTreeSet<String>,
    /// Task ids this node may host; empty means any.
    pub supported_tasks: BTreeSet<String>,
    pub status: NodeStatus,
}

impl Node {
    pub fn is_healthy(&self) -> bool {
        self.status == NodeStatus::Healthy
    }

    /// Structural compatibility between a node and a task: explicit support
    /// list and anti-affinity. Capacity and compliance are checked by the
    /// optimizer against the full assignment set.
    pub fn can_host(&self, task: &Task) -> bool {
        if !self.supported_tasks.is_empty() && !self.supported_tasks.contains(&task.id) {
            return false;
        }
        task.anti_affinity.is_disjoint(&self.capabilities)
    }

    /// Number of affinity tags the node satisfies.
    pub fn affinity_matches(&self, task: &Task) -> usize {
        task.affinity.intersection(&self.capabilities).count()
    }
}

/// Where a task would prefer to run, short of a hard requirement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationPreference {
    Region(String),
    Point(GeoLocation),
}

/// A unit of work to place on a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub demand: ResourceVector,
    pub priority: u32,
    pub deadline: DateTime<Utc>,
    pub estimated_duration_ms: u64,
    #[serde(default)]
    pub affinity: BTreeSet<String>,
    #[serde(default)]
    pub anti_affinity: BTreeSet<String>,
    #[serde(default)]
    pub location_preference: Option<LocationPreference>,
    /// Region that MUST host this task, if set.
    #[serde(default)]
    pub data_sovereignty: Option<String>,
    /// Allow-list of regions this task may run in, if set.
    #[serde(default)]
    pub compliance_regions: Option<BTreeSet<String>>,
}

impl Task {
    /// The region a task is pinned to by sovereignty, if any.
    pub fn sovereign_region(&self) -> Option<&str> {
        self.data_sovereignty.as_deref()
    }

    /// Whether the given region satisfies sovereignty and compliance rules.
    pub fn region_allowed(&self, region: &str) -> bool {
        if let Some(required) = &self.data_sovereignty {
            if required != region {
                return false;
            }
        }
        if let Some(allowed) = &self.compliance_regions {
            if !allowed.contains(region) {
                return false;
            }
        }
        true
    }
}

/// A region hint for one task, produced by the geographic distributor and
/// consumed by the optimizer. Hard hints are compliance-mandated and must
/// not be overridden.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionHint {
    pub region: String,
    pub hard: bool,
}

/// Per-assignment scoring detail retained for auditability.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub latency_ms: f64,
    pub cost: f64,
    pub reliability: f64,
}

/// An immutable (task → node) decision produced by the optimizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub task_id: String,
    pub node_id: String,
    pub region: String,
    pub score: f64,
    pub strategy: String,
    pub breakdown: ScoreBreakdown,
}

/// Aggregate quality metrics of a placement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PlacementMetrics {
    pub avg_latency_ms: f64,
    pub total_cost: f64,
    pub avg_reliability: f64,
    /// Normalised spread of compute utilization over nodes receiving work;
    /// lower is better, 0 means perfectly even.
    pub load_balance_index: f64,
    pub avg_utilization: f64,
}

/// Constraint classes reported when a placement is infeasible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintClass {
    CapacityCompute,
    CapacityMemory,
    CapacityBandwidth,
    CapacityStorage,
    Latency,
    Cost,
    Sovereignty,
    Compliance,
}

impl ConstraintClass {
    pub fn name(&self) -> &'static str {
        match self {
            ConstraintClass::CapacityCompute => "capacity.compute",
            ConstraintClass::CapacityMemory => "capacity.memory",
            ConstraintClass::CapacityBandwidth => "capacity.bandwidth",
            ConstraintClass::CapacityStorage => "capacity.storage",
            ConstraintClass::Latency => "latency",
            ConstraintClass::Cost => "cost",
            ConstraintClass::Sovereignty => "sovereignty",
            ConstraintClass::Compliance => "compliance",
        }
    }

    pub fn for_axis(axis: ResourceAxis) -> Self {
        match axis {
            ResourceAxis::Compute => ConstraintClass::CapacityCompute,
            ResourceAxis::Memory => ConstraintClass::CapacityMemory,
            ResourceAxis::Bandwidth => ConstraintClass::CapacityBandwidth,
            ResourceAxis::Storage => ConstraintClass::CapacityStorage,
        }
    }
}

/// One violated constraint with enough detail to act on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintViolation {
    pub class: ConstraintClass,
    pub detail: String,
    /// Per-unit overage relative to the constraint threshold.
    pub magnitude: f64,
}

/// A complete assignment of tasks to nodes with derived metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub id: Uuid,
    pub assignments: Vec<Assignment>,
    pub metrics: PlacementMetrics,
    pub valid: bool,
    pub violations: Vec<ConstraintViolation>,
    pub strategy: String,
    pub created_at: DateTime<Utc>,
}

impl Placement {
    /// Empty placements are trivially valid.
    pub fn empty(strategy: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            assignments: Vec::new(),
            metrics: PlacementMetrics::default(),
            valid: true,
            violations: Vec::new(),
            strategy: strategy.to_string(),
            created_at: Utc::now(),
        }
    }

    /// The constraint class with the highest accumulated overage, used for
    /// best-effort diagnostics when no valid solution exists.
    pub fn most_violated_class(&self) -> Option<ConstraintClass> {
        use std::collections::HashMap;
        let mut totals: HashMap<&'static str, (ConstraintClass, f64)> = HashMap::new();
        for violation in &self.violations {
            let entry = totals
                .entry(violation.class.name())
                .or_insert((violation.class, 0.0));
            entry.1 += violation.magnitude;
        }
        totals
            .into_values()
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(class, _)| class)
    }
}

/// Thresholds the optimizer normalises its objective against.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OptimizationConstraints {
    /// Upper bound used to normalise the latency score, in milliseconds.
    pub max_latency_ms: f64,
    /// Upper bound used to normalise the cost score.
    pub max_cost: f64,
    /// Reliability floor; placements below it score poorly but are not
    /// rejected outright.
    pub min_reliability: f64,
}

impl Default for OptimizationConstraints {
    fn default() -> Self {
        Self { max_latency_ms: 1000.0, max_cost: 10_000.0, min_reliability: 0.90 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, region: &str) -> Node {
        Node {
            id: id.to_string(),
            region: region.to_string(),
            location: GeoLocation::new(0.0, 0.0),
            capacity: ResourceVector::new(100.0, 100.0, 100.0, 100.0),
            utilization: ResourceVector::zero(),
            unit_costs: UnitCosts::default(),
            performance: NodePerformance::default(),
            capabilities: BTreeSet::new(),
            supported_tasks: BTreeSet::new(),
            status: NodeStatus::Healthy,
        }
    }

    fn task(id: &str) -> Task {
        Task {
            id: id.to_string(),
            demand: ResourceVector::new(10.0, 10.0, 10.0, 10.0),
            priority: 1,
            deadline: Utc::now() + chrono::Duration::hours(1),
            estimated_duration_ms: 60_000,
            affinity: BTreeSet::new(),
            anti_affinity: BTreeSet::new(),
            location_preference: None,
            data_sovereignty: None,
            compliance_regions: None,
        }
    }

    #[test]
    fn haversine_matches_known_distance() {
        // Paris <-> London is roughly 344 km.
        let paris = GeoLocation::new(48.8566, 2.3522);
        let london = GeoLocation::new(51.5074, -0.1278);
        let d = paris.distance_km(&london);
        assert!((d - 344.0).abs() < 5.0, "got {d}");
    }

    #[test]
    fn resource_vector_fits_within() {
        let demand = ResourceVector::new(10.0, 20.0, 5.0, 0.0);
        let capacity = ResourceVector::new(10.0, 20.0, 5.0, 0.0);
        assert!(demand.fits_within(&capacity));
        let too_big = ResourceVector::new(10.1, 20.0, 5.0, 0.0);
        assert!(!too_big.fits_within(&capacity));
    }

    #[test]
    fn sovereignty_restricts_region() {
        let mut t = task("t1");
        t.data_sovereignty = Some("eu-west".to_string());
        assert!(t.region_allowed("eu-west"));
        assert!(!t.region_allowed("us-east"));
    }

    #[test]
    fn compliance_allow_list_is_honored() {
        let mut t = task("t1");
        t.compliance_regions = Some(["eu-west".to_string(), "eu-north".to_string()].into());
        assert!(t.region_allowed("eu-north"));
        assert!(!t.region_allowed("us-east"));
    }

    #[test]
    fn supported_task_list_gates_hosting() {
        let mut n = node("n1", "eu-west");
        let t = task("t1");
        assert!(n.can_host(&t));
        n.supported_tasks.insert("other".to_string());
        assert!(!n.can_host(&t));
        n.supported_tasks.insert("t1".to_string());
        assert!(n.can_host(&t));
    }

    #[test]
    fn most_violated_class_aggregates_magnitude() {
        let mut p = Placement::empty("genetic");
        p.valid = false;
        p.violations = vec![
            ConstraintViolation {
                class: ConstraintClass::CapacityCompute,
                detail: "node n1 over by 40".into(),
                magnitude: 40.0,
            },
            ConstraintViolation {
                class: ConstraintClass::CapacityCompute,
                detail: "node n2 over by 40".into(),
                magnitude: 40.0,
            },
            ConstraintViolation {
                class: ConstraintClass::Sovereignty,
                detail: "t3 outside eu-west".into(),
                magnitude: 1.0,
            },
        ];
        assert_eq!(p.most_violated_class(), Some(ConstraintClass::CapacityCompute));
    }

    #[test]
    fn node_task_serialization_round_trip() {
        let n = node("n1", "eu-west");
        let json = serde_json::to_string(&n).unwrap();
        let back: Node = serde_json::from_str(&json).unwrap();
        assert_eq!(n, back);

        let t = task("t1");
        let json = serde_json::to_string(&t).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(t, back);
    }
}
