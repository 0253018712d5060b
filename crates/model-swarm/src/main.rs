//! Stellarium swarm - run an in-process model swarm or inspect configuration.

#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{Level, debug, info};

use stellarium_model_swarm::{
    FsModelRepository, MemoryStore, MemoryTransport, ModelSize, NetworkCoordinator, PoolDescriptor,
    PoolRecord, PoolStore, ResourceCapacity, SimulatedExecutor, SwarmConfig, TrainingBatch,
    logging,
};

#[derive(Parser)]
#[command(
    name = "stellarium-swarm",
    about = "Peer-to-peer model distribution and training coordination",
    version
)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: Level,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a create, join, train, update and resync scenario in memory
    Demo {
        /// Participants joining the pool besides its creator
        #[arg(short, long, default_value = "3")]
        participants: usize,

        /// Samples in the training batch
        #[arg(short, long, default_value = "1000")]
        samples: u64,

        /// Scale applied to simulated training time (0 runs instantly)
        #[arg(long, default_value = "0.01")]
        time_scale: f64,

        /// Directory of staged open-source models
        #[arg(long, default_value = "./models")]
        models_dir: PathBuf,
    },

    /// Print the effective configuration as YAML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_level, cli.json_logs);

    let config = match &cli.config {
        Some(path) => SwarmConfig::from_yaml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SwarmConfig::default(),
    };

    match cli.command {
        Commands::Demo {
            participants,
            samples,
            time_scale,
            models_dir,
        } => run_demo(config, participants, samples, time_scale, models_dir).await,
        Commands::Config => {
            print!("{}", config.to_yaml()?);
            Ok(())
        }
    }
}

async fn run_demo(
    config: SwarmConfig,
    participants: usize,
    samples: u64,
    time_scale: f64,
    models_dir: PathBuf,
) -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let coordinator = NetworkCoordinator::new(
        config,
        store.clone(),
        Arc::new(FsModelRepository::new(models_dir)),
        Arc::new(MemoryTransport::new()),
        Arc::new(SimulatedExecutor::new(time_scale)),
    );

    let mut events = coordinator.subscribe();
    let event_log = tokio::spawn(async move {
        let mut seen = 0usize;
        while let Ok(event) = events.recv().await {
            seen += 1;
            debug!(kind = event.kind(), "Swarm event");
        }
        seen
    });

    let pool_id = "demo-pool";
    let creator = "0xcreator";
    let mut record = PoolRecord::new(pool_id, "Demo Pool", "LLM");
    record.reward_per_hour = 0.05;
    store.create_pool(record).await?;

    let torrent = coordinator
        .create_pool(
            &PoolDescriptor {
                id: pool_id.to_string(),
                name: "Demo Pool".to_string(),
                model_type: "LLM".to_string(),
            },
            creator,
        )
        .await?;
    info!(locator = %torrent.locator, chunks = torrent.total_chunks, "Pool seeded");

    coordinator
        .join_pool_with_contribution(pool_id, creator, ResourceCapacity::default())
        .await?;
    for i in 0..participants {
        let identity = format!("0xparticipant{i}");
        coordinator
            .join_pool_with_contribution(pool_id, &identity, ResourceCapacity::default())
            .await?;
    }

    let used = coordinator
        .allocate_resources_for_training(
            pool_id,
            TrainingBatch::new("demo-batch", samples, ModelSize::Small),
        )
        .await?;
    info!(nodes = used.len(), "Training batch finished");

    let mut reports = Vec::new();
    for version in 1..=2u64 {
        let model_data = serde_json::json!({
            "weights": [0.1 * version as f64, 0.2, 0.3],
            "trainingMetrics": {
                "loss": 0.5 / version as f64,
                "accuracy": 0.7 + 0.05 * version as f64,
                "epochs": version * 10,
            },
        });
        reports.push(coordinator.update_pool(pool_id, model_data, version).await?);
    }

    // A participant that was offline during the updates
    let late = "0xlatecomer";
    coordinator
        .join_pool_with_contribution(pool_id, late, ResourceCapacity::default())
        .await?;
    let resync = coordinator.handle_reconnection(late).await?;

    let summary = serde_json::json!({
        "torrent": coordinator.torrent_info(pool_id),
        "training_nodes": used,
        "updates": reports,
        "resync": resync,
        "pool": store.get_pool(pool_id).await?,
        "network": coordinator.network_stats().await,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    coordinator.shutdown().await;
    drop(coordinator);
    if let Ok(Ok(seen)) =
        tokio::time::timeout(std::time::Duration::from_secs(1), event_log).await
    {
        info!(events = seen, "Demo complete");
    }
    Ok(())
}
