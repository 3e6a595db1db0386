// Stratus engine configuration
// Typed options tree with documented defaults, TOML file loading and
// environment overrides. Constructed once at startup and passed explicitly.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the whole engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub swarm: SwarmConfig,
    pub bus: BusConfig,
    pub registry: RegistryConfig,
    pub predictor: PredictorConfig,
    pub geo: GeoConfig,
    pub optimizer: OptimizerConfig,
    pub deployment: DeploymentConfig,
    pub rollback: RollbackConfig,
    pub recovery: RecoveryConfig,
    pub logging: LoggingConfig,
}

/// Identity of this engine instance on the shared bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    pub swarm_id: String,
    pub producer_id: String,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            swarm_id: "stratus-default".to_string(),
            producer_id: format!("engine-{}", uuid::Uuid::new_v4()),
        }
    }
}

/// Which coordination bus backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusMode {
    /// Redis-backed, shared across processes.
    Redis,
    /// In-process only; used by tests and local single-process runs.
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub mode: BusMode,
    pub redis_host: String,
    pub redis_port: u16,
    /// Bounded retries for transient bus failures.
    pub max_retries: u32,
    /// Base delay for exponential backoff, in milliseconds.
    pub retry_base_delay_ms: u64,
    /// TTL for replayable event records, in seconds.
    pub event_replay_ttl_secs: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            mode: BusMode::Redis,
            redis_host: "127.0.0.1".to_string(),
            redis_port: 6379,
            max_retries: 4,
            retry_base_delay_ms: 100,
            event_replay_ttl_secs: 3600,
        }
    }
}

impl BusConfig {
    pub fn redis_url(&self) -> String {
        format!("redis://{}:{}/", self.redis_host, self.redis_port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// TTL for node records on the bus, in seconds.
    pub node_ttl_secs: u64,
    /// Grace period added to a task's deadline for its bus record TTL.
    pub task_ttl_grace_secs: u64,
    /// Regions scoring below this overall health are excluded from default
    /// optimizer candidate sets.
    pub region_health_threshold: f64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            node_ttl_secs: 24 * 3600,
            task_ttl_grace_secs: 300,
            region_health_threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictorConfig {
    /// Number of models in the ensemble.
    pub ensemble_size: usize,
    /// Minimum observations before training is attempted.
    pub min_training_samples: usize,
    /// Mean normalised prediction error above which a retrain is enqueued.
    pub model_update_threshold: f64,
    /// SGD settings for each member model.
    pub training_epochs: usize,
    pub learning_rate: f64,
    /// Fraction of the training set held out for validation weighting.
    pub validation_split: f64,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            ensemble_size: 5,
            min_training_samples: 200,
            model_update_threshold: 0.15,
            training_epochs: 40,
            learning_rate: 0.01,
            validation_split: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoConfig {
    pub region_weight: f64,
    pub latency_weight: f64,
    pub load_weight: f64,
    pub cost_weight: f64,
    pub compliance_weight: f64,
    /// Interval between `metrics:geo:{ts}` snapshots, in seconds.
    pub snapshot_interval_secs: u64,
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            region_weight: 0.30,
            latency_weight: 0.25,
            load_weight: 0.20,
            cost_weight: 0.15,
            compliance_weight: 0.10,
            snapshot_interval_secs: 60,
        }
    }
}

/// Cooling schedule for the annealing engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    Geometric,
    Logarithmic,
    Adaptive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    // Genetic engine
    pub population_size: usize,
    pub generations: usize,
    pub crossover_rate: f64,
    pub mutation_rate: f64,
    pub elitism_rate: f64,
    pub tournament_size: usize,
    pub convergence_threshold: f64,
    pub max_stagnant_generations: usize,

    // Annealing engine
    pub initial_temperature: f64,
    pub min_temperature: f64,
    pub cooling_rate: f64,
    pub max_iterations: usize,
    pub schedule: ScheduleType,
    pub equilibrium_iterations: usize,
    pub target_acceptance_rate: f64,
    pub reheating_threshold: f64,
    pub max_reheats: usize,

    /// Optional RNG seed for reproducible searches.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            population_size: 60,
            generations: 150,
            crossover_rate: 0.85,
            mutation_rate: 0.15,
            elitism_rate: 0.10,
            tournament_size: 5,
            convergence_threshold: 1e-4,
            max_stagnant_generations: 20,

            initial_temperature: 100.0,
            min_temperature: 0.01,
            cooling_rate: 0.95,
            max_iterations: 10_000,
            schedule: ScheduleType::Geometric,
            equilibrium_iterations: 100,
            target_acceptance_rate: 0.3,
            reheating_threshold: 0.05,
            max_reheats: 3,

            seed: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    /// Per-phase timeout, in milliseconds.
    pub phase_timeout_ms: u64,
    /// Base stabilization window between traffic steps, in milliseconds.
    pub stabilization_period_ms: u64,
    /// Traffic fraction routed to the new color during canary validation.
    pub canary_percentage: u8,
    /// Staged traffic ladder for canary rollouts.
    pub canary_steps: Vec<u8>,
    /// Minimum readiness score required before go-live.
    pub readiness_go_threshold: f64,
    /// Per-category readiness floor below which go-live is blocked.
    pub readiness_category_floor: f64,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            phase_timeout_ms: 300_000,
            stabilization_period_ms: 30_000,
            canary_percentage: 10,
            canary_steps: vec![10, 25, 50, 75, 100],
            readiness_go_threshold: 0.80,
            readiness_category_floor: 0.50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RollbackConfig {
    pub max_rollback_attempts: u32,
    /// Overall rollback timeout, in milliseconds.
    pub rollback_timeout_ms: u64,
    /// Snapshot retention on the bus, in seconds (default 7 days).
    pub snapshot_retention_secs: u64,
    /// Retention for placement/deployment metrics records, in seconds.
    pub metrics_retention_secs: u64,
    // Automatic trigger thresholds, each paired with a sustained window.
    pub error_rate_threshold: f64,
    pub error_rate_window_ms: u64,
    pub p95_response_threshold_ms: f64,
    pub p95_response_window_ms: u64,
    pub availability_threshold: f64,
    pub availability_window_ms: u64,
    pub health_pass_rate_threshold: f64,
    pub health_pass_rate_window_ms: u64,
    /// Substrings of log/error output that trigger rollback immediately
    /// once sustained.
    pub critical_error_patterns: Vec<String>,
    pub critical_error_window_ms: u64,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            max_rollback_attempts: 3,
            rollback_timeout_ms: 600_000,
            snapshot_retention_secs: 7 * 24 * 3600,
            metrics_retention_secs: 24 * 3600,
            error_rate_threshold: 0.05,
            error_rate_window_ms: 60_000,
            p95_response_threshold_ms: 2_000.0,
            p95_response_window_ms: 120_000,
            availability_threshold: 0.995,
            availability_window_ms: 120_000,
            health_pass_rate_threshold: 0.9,
            health_pass_rate_window_ms: 60_000,
            critical_error_patterns: vec![
                "OutOfMemory".to_string(),
                "data corruption".to_string(),
                "segfault".to_string(),
            ],
            critical_error_window_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub max_concurrent_recoveries: usize,
    /// Failure *rate* (failed / (completed + failed)) at or above which the
    /// strategy's rollback plan runs.
    pub rollback_threshold: f64,
    pub enable_automatic_rollback: bool,
    /// Queue length beyond which `recovery.queue.saturated` is published.
    pub queue_soft_bound: usize,
    /// Confidence at or above which self-healing schedules pre-emptive work.
    pub healing_confidence_threshold: f64,
    /// EMA factor for per-strategy rolling success rates.
    pub success_ema_factor: f64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_concurrent_recoveries: 3,
            rollback_threshold: 0.5,
            enable_automatic_rollback: true,
            queue_soft_bound: 32,
            healing_confidence_threshold: 0.8,
            success_ema_factor: 0.9,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "json" or "text".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: "text".to_string() }
    }
}

impl EngineConfig {
    /// Load configuration from defaults, an optional TOML file
    /// (`STRATUS_CONFIG_FILE`) and environment overrides.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("STRATUS_CONFIG_FILE") {
            config = Self::from_file(&path)?;
        } else {
            for path in &["./stratus.toml", "/etc/stratus/config.toml"] {
                if std::path::Path::new(path).exists() {
                    config = Self::from_file(path)?;
                    break;
                }
            }
        }

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Environment variables override file and default values.
    fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("REDIS_HOST") {
            self.bus.redis_host = host;
        }
        if let Ok(port) = std::env::var("REDIS_PORT") {
            if let Ok(port) = port.parse() {
                self.bus.redis_port = port;
            }
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(swarm) = std::env::var("STRATUS_SWARM_ID") {
            self.swarm.swarm_id = swarm;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bus.redis_port == 0 {
            anyhow::bail!("bus.redis_port must be greater than 0");
        }
        if self.optimizer.population_size < 2 {
            anyhow::bail!("optimizer.population_size must be at least 2");
        }
        if !(0.0..=1.0).contains(&self.optimizer.crossover_rate)
            || !(0.0..=1.0).contains(&self.optimizer.mutation_rate)
            || !(0.0..=1.0).contains(&self.optimizer.elitism_rate)
        {
            anyhow::bail!("optimizer rates must be within [0, 1]");
        }
        if self.optimizer.initial_temperature <= self.optimizer.min_temperature {
            anyhow::bail!("optimizer.initial_temperature must exceed min_temperature");
        }
        if !(0.0..=1.0).contains(&self.recovery.rollback_threshold) {
            anyhow::bail!("recovery.rollback_threshold is a rate and must be within [0, 1]");
        }
        if self.deployment.canary_steps.is_empty()
            || *self.deployment.canary_steps.last().unwrap_or(&0) != 100
        {
            anyhow::bail!("deployment.canary_steps must end at 100");
        }
        if self.recovery.max_concurrent_recoveries == 0 {
            anyhow::bail!("recovery.max_concurrent_recoveries must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.deployment.canary_steps, vec![10, 25, 50, 75, 100]);
        assert_eq!(config.bus.redis_url(), "redis://127.0.0.1:6379/");
    }

    #[test]
    fn bad_canary_ladder_is_rejected() {
        let mut config = EngineConfig::default();
        config.deployment.canary_steps = vec![10, 50];
        assert!(config.validate().is_err());
    }

    #[test]
    fn rollback_threshold_must_be_a_rate() {
        let mut config = EngineConfig::default();
        config.recovery.rollback_threshold = 3.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_round_trips_through_toml() {
        let config = EngineConfig::default();
        let text = toml::to_string(&config).unwrap();
        let back: EngineConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.optimizer.population_size, config.optimizer.population_size);
        assert_eq!(back.deployment.canary_steps, config.deployment.canary_steps);
    }
}
