//! Pool balancer command line.
//!
//! ```text
//! pool-balancer check --config pool.toml   validate and print the pool
//! pool-balancer run --config pool.toml     probe the pool until Ctrl-C
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use pool_balancer::config::{load_config, BalancerConfig};
use pool_balancer::health::active::{HealthMonitor, TcpProbe};
use pool_balancer::load_balancer::{LoadBalancingEngine, PoolObserver};
use pool_balancer::observability::{logging, metrics};
use pool_balancer::Shutdown;

#[derive(Parser)]
#[command(name = "pool-balancer", version, about = "Server pool load balancer")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a config file and print the resulting pool as JSON
    Check {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Run active health checks against the pool until interrupted
    Run {
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Check { config } => check(load_config(&config)?),
        Command::Run { config } => run(load_config(&config)?).await,
    }
}

fn check(config: BalancerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let engine = LoadBalancingEngine::from_config(&config, Vec::new())?;
    let summary = serde_json::json!({
        "algorithm": engine.algorithm_name(),
        "thresholds": {
            "stale_after_secs": config.health.stale_after_secs,
            "max_failure_ratio": config.health.max_failure_ratio,
        },
        "servers": engine.servers(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn run(config: BalancerConfig) -> Result<(), Box<dyn std::error::Error>> {
    logging::init(&config.observability.log_level);
    tracing::info!("pool-balancer v{} starting", env!("CARGO_PKG_VERSION"));

    let mut observers: Vec<Arc<dyn PoolObserver>> = Vec::new();
    if config.observability.metrics_enabled {
        metrics::init_metrics(config.observability.metrics_address.parse()?)?;
        observers.push(Arc::new(metrics::MetricsObserver::new(config.health.admit_unknown)));
    }

    let engine = Arc::new(LoadBalancingEngine::from_config(&config, observers)?);
    tracing::info!(pool = %engine, "Pool ready");

    let shutdown = Shutdown::new();
    let monitor = if config.health.probe_enabled {
        let monitor = HealthMonitor::new(engine.clone(), TcpProbe, &config.health);
        Some(tokio::spawn(monitor.run(shutdown.subscribe())))
    } else {
        tracing::info!("Active health checks disabled");
        None
    };

    shutdown.trigger_on_ctrl_c().await?;
    if let Some(handle) = monitor {
        handle.await?;
    }

    tracing::info!(pool = %engine, "Shutdown complete");
    Ok(())
}
