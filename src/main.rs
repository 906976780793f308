//! Tricortex daemon
//!
//! Runs the decision fabric: event bus, coordinator, soldier failover core
//! and the risk-control meta-learning stack. Engine backends (local and
//! remote inference, the strategy layer) are external; without them the
//! soldier serves its rule-based offline path, which keeps the fabric
//! honest end to end.

use anyhow::Result;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use serde_json::Map;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tricortex::bus::{BusConfig, EventBus, EventType};
use tricortex::coordinator::{BrainCoordinator, CoordinatorConfig, EngineRegistry};
use tricortex::meta::{IntelligentRouter, MetaLearner, RouterConfig};
use tricortex::soldier::{InferenceOutput, LocalInference, RemoteInference, SoldierConfig, SoldierCore};
use tricortex::store::LearningDataStore;

#[derive(Parser)]
#[command(name = "tricortex", about = "Decision-coordination fabric")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the fabric until SIGINT
    Start {
        /// Learning-sample directory
        #[arg(long, env = "TRICORTEX_DATA_DIR", default_value = "data/learning")]
        data_dir: String,
        /// Seconds between stats log lines
        #[arg(long, env = "TRICORTEX_STATS_INTERVAL", default_value_t = 30)]
        stats_interval: u64,
    },
    /// Print a JSON snapshot of bus statistics
    Status,
}

/// Placeholder backend used when no model is wired in; every call fails so
/// the soldier serves its offline rules
struct UnwiredInference;

#[async_trait]
impl LocalInference for UnwiredInference {
    async fn infer(&self, _prompt: &str) -> Result<InferenceOutput> {
        anyhow::bail!("no local inference backend configured")
    }
}

#[async_trait]
impl RemoteInference for UnwiredInference {
    async fn infer(&self, _prompt: &str) -> Result<InferenceOutput> {
        anyhow::bail!("no remote inference backend configured")
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tricortex=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv();
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Start {
            data_dir,
            stats_interval,
        } => start(&data_dir, stats_interval).await,
        Command::Status => {
            let bus = EventBus::new(BusConfig::default());
            println!("{}", serde_json::to_string_pretty(&bus.get_stats())?);
            Ok(())
        }
    }
}

async fn start(data_dir: &str, stats_interval: u64) -> Result<()> {
    info!("starting tricortex fabric");

    let bus = EventBus::new(BusConfig::default());
    bus.initialize();

    let registry = Arc::new(EngineRegistry::new());
    let coordinator = BrainCoordinator::new(bus.clone(), registry.clone(), CoordinatorConfig::default());
    coordinator.initialize();

    let soldier = SoldierCore::new(
        SoldierConfig::default(),
        bus.clone(),
        Arc::new(UnwiredInference),
        Arc::new(UnwiredInference),
    );
    soldier.initialize();

    let meta_learner = Arc::new(MetaLearner::with_bus(bus.clone()));
    let router = IntelligentRouter::new(meta_learner.clone(), RouterConfig::default())?;
    let store = LearningDataStore::new(data_dir, tricortex::store::DEFAULT_RETENTION_DAYS)?;
    let expired = store.cleanup_old_data();
    if expired > 0 {
        info!(expired, "removed expired learning files at startup");
    }

    // Periodic heartbeat plus a stats line; both stop with the runtime.
    let heartbeat_bus = bus.clone();
    let stats_bus = bus.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(10));
        loop {
            ticker.tick().await;
            let _ = heartbeat_bus.publish_simple(
                EventType::Heartbeat,
                "tricortex_daemon",
                Map::new(),
                None,
                None,
            );
        }
    });
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(stats_interval.max(1)));
        loop {
            ticker.tick().await;
            match serde_json::to_string(&stats_bus.get_stats()) {
                Ok(stats) => info!(stats = %stats, "bus statistics"),
                Err(err) => warn!(error = %err, "stats serialization failed"),
            }
        }
    });

    info!("fabric up; press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    info!("shutting down");
    info!(
        routes = router.get_statistics().total_routes,
        samples = meta_learner.experience_len(),
        "final learning state"
    );
    coordinator.shutdown();
    soldier.shutdown().await;
    bus.shutdown().await;
    Ok(())
}
