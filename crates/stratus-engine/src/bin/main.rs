// Stratus CLI
// Operator commands for the placement and deployment engine.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use uuid::Uuid;

use stratus_core::{BusMode, EngineConfig, Node, OptimizationConstraints, Task};
use stratus_deploy::{ApplicationConfig, DeploymentOptions, RolloutStrategy};
use stratus_engine::{Engine, OptimizeOptions, StatusReport};
use stratus_geo::DistributionStrategy;
use stratus_optimizer::Algorithm;
use stratus_recovery::ErrorData;

/// Stratus: intelligent workload placement and deployment orchestration.
#[derive(Parser)]
#[command(name = "stratus")]
#[command(about = "Workload placement and deployment orchestration engine")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path (overrides STRATUS_CONFIG_FILE)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Use the in-process bus instead of Redis (local dry runs)
    #[arg(long, global = true)]
    memory_bus: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute a placement for a node/task set
    Optimize {
        /// JSON file containing the node list
        #[arg(long)]
        nodes: PathBuf,
        /// JSON file containing the task list
        #[arg(long)]
        tasks: PathBuf,
        /// Time budget in milliseconds
        #[arg(long, default_value_t = 5_000)]
        budget_ms: u64,
        /// Force an algorithm (genetic, simulated_annealing, ml_hybrid)
        #[arg(long)]
        algorithm: Option<String>,
        /// Geographic distribution strategy
        #[arg(long, default_value = "balanced")]
        distribution: String,
        /// Write the placement JSON here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Run a rollout for an application config
    Deploy {
        /// JSON file containing the application config
        #[arg(long)]
        app: PathBuf,
        /// Rollout strategy (blue_green or canary)
        #[arg(long, default_value = "blue_green")]
        strategy: String,
        /// Approver for the release sign-off checklist item
        #[arg(long, default_value = "release-owner")]
        approver: String,
    },
    /// Roll a deployment back to its last healthy snapshot
    Rollback {
        #[arg(long)]
        deployment: Uuid,
        #[arg(long)]
        snapshot: Option<Uuid>,
    },
    /// Initiate recovery for an observed error
    Recover {
        /// JSON file containing the error report
        #[arg(long)]
        error: PathBuf,
    },
    /// Show the status of a long-running id
    Status {
        #[arg(long)]
        id: Uuid,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(1)
        }
    }
}

async fn run() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_file(&path.display().to_string())?,
        None => EngineConfig::load()?,
    };
    if cli.memory_bus {
        config.bus.mode = BusMode::Memory;
    }

    init_tracing(&config);
    let engine = Engine::connect(config).await?;

    match cli.command {
        Commands::Optimize { nodes, tasks, budget_ms, algorithm, distribution, output } => {
            let nodes: Vec<Node> = read_json(&nodes)?;
            let tasks: Vec<Task> = read_json(&tasks)?;
            let options = OptimizeOptions {
                distribution: parse_distribution(&distribution)?,
                time_budget_ms: budget_ms,
                preferred_algorithm: algorithm.as_deref().map(parse_algorithm).transpose()?,
            };
            let (placement, report) = engine
                .optimize(nodes, tasks, OptimizationConstraints::default(), options)
                .await?;

            let rendered = serde_json::to_string_pretty(&serde_json::json!({
                "placement": placement,
                "report": report,
            }))?;
            match output {
                Some(path) => std::fs::write(path, rendered)?,
                None => println!("{rendered}"),
            }

            // Exit 2: completed with issues (best-effort invalid placement).
            if placement.valid {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::from(2))
            }
        }
        Commands::Deploy { app, strategy, approver } => {
            let app: ApplicationConfig = read_json(&app)?;
            let options = DeploymentOptions {
                strategy: parse_strategy(&strategy)?,
                approvals: vec![stratus_deploy::approval("release-signoff", &approver)],
            };
            let (id, status) = engine.deploy_and_wait(app, options).await?;
            println!(
                "{}",
                serde_json::json!({ "deploymentId": id, "status": status })
            );
            match status {
                stratus_deploy::DeploymentStatus::Completed => Ok(ExitCode::SUCCESS),
                _ => Ok(ExitCode::from(2)),
            }
        }
        Commands::Rollback { deployment, snapshot } => {
            let rollback_id = engine.rollback(deployment, snapshot).await?;
            println!("{}", serde_json::json!({ "rollbackId": rollback_id }));
            Ok(ExitCode::SUCCESS)
        }
        Commands::Recover { error } => {
            let error: ErrorData = read_json(&error)?;
            let id = engine.initiate_recovery(error).await?;
            println!("{}", serde_json::json!({ "recoveryId": id }));
            Ok(ExitCode::SUCCESS)
        }
        Commands::Status { id } => {
            let report: StatusReport = engine.status(id).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn init_tracing(config: &EngineConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.clone()));
    if config.logging.format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &PathBuf) -> anyhow::Result<T> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn parse_distribution(value: &str) -> anyhow::Result<DistributionStrategy> {
    match value {
        "latency_optimized" => Ok(DistributionStrategy::LatencyOptimized),
        "cost_optimized" => Ok(DistributionStrategy::CostOptimized),
        "balanced" => Ok(DistributionStrategy::Balanced),
        "compliance_aware" => Ok(DistributionStrategy::ComplianceAware),
        other => anyhow::bail!("unknown distribution strategy: {other}"),
    }
}

fn parse_algorithm(value: &str) -> anyhow::Result<Algorithm> {
    match value {
        "genetic" => Ok(Algorithm::Genetic),
        "simulated_annealing" => Ok(Algorithm::SimulatedAnnealing),
        "ml_hybrid" => Ok(Algorithm::MlHybrid),
        other => anyhow::bail!("unknown algorithm: {other}"),
    }
}

fn parse_strategy(value: &str) -> anyhow::Result<RolloutStrategy> {
    match value {
        "blue_green" => Ok(RolloutStrategy::BlueGreen),
        "canary" => Ok(RolloutStrategy::Canary),
        other => anyhow::bail!("unknown rollout strategy: {other}"),
    }
}
