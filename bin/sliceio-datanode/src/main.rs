//! SliceIO Datanode
//!
//! This binary runs the storage buckets and connects their channels to the
//! broker backend.

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use sliceio_common::{DatanodeConfig, StorageBackend};
use sliceio_datanode::Datanode;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "sliceio-datanode")]
#[command(about = "SliceIO storage datanode")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/sliceio/datanode.toml")]
    config: String,

    /// Datanode identifier
    #[arg(long)]
    datanode_id: Option<u32>,

    /// Broker backend address
    #[arg(long)]
    broker: Option<String>,

    /// Number of buckets
    #[arg(long)]
    buckets: Option<u32>,

    /// Channels per bucket
    #[arg(long)]
    channels: Option<u32>,

    /// Data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Storage engine (none, logfile, redb, memory)
    #[arg(long)]
    backend: Option<StorageBackend>,

    /// Slice database capacity in bytes
    #[arg(long)]
    max_dbsize: Option<u64>,

    /// Heartbeat interval in milliseconds
    #[arg(long)]
    heartbeat_interval_ms: Option<u64>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(default)]
    datanode: DatanodeConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
struct LoggingConfig {
    #[serde(default = "default_log_level")]
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config: Config = if Path::new(&args.config).exists() {
        let config_str = std::fs::read_to_string(&args.config)
            .with_context(|| format!("reading {}", args.config))?;
        toml::from_str(&config_str).with_context(|| format!("parsing {}", args.config))?
    } else {
        Config::default()
    };

    let mut datanode_config = config.datanode;
    if let Some(id) = args.datanode_id {
        datanode_config.datanode_id = id;
    }
    if let Some(broker) = args.broker {
        datanode_config.broker_endpoint = broker;
    }
    if let Some(buckets) = args.buckets {
        datanode_config.total_buckets = buckets;
    }
    if let Some(channels) = args.channels {
        datanode_config.total_channels = channels;
    }
    if let Some(data_dir) = args.data_dir {
        datanode_config.data_dir = data_dir;
    }
    if let Some(backend) = args.backend {
        datanode_config.storage.backend = backend;
    }
    if let Some(max_dbsize) = args.max_dbsize {
        datanode_config.storage.max_dbsize = max_dbsize;
    }
    if let Some(interval_ms) = args.heartbeat_interval_ms {
        datanode_config.heartbeat.interval_ms = interval_ms;
    }
    let log_level = if args.log_level == "info" {
        config.logging.level
    } else {
        args.log_level
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting SliceIO datanode {}", datanode_config.datanode_id);
    info!("Config file: {}", args.config);
    info!("Data directory: {}", datanode_config.data_dir.display());
    info!(
        "Storage: {} backend, {} bytes per slice database",
        datanode_config.storage.backend, datanode_config.storage.max_dbsize
    );
    info!(
        "Pool: {} buckets x {} channels -> {}",
        datanode_config.total_buckets,
        datanode_config.total_channels,
        datanode_config.broker_endpoint
    );

    let mut datanode = Datanode::start(datanode_config)
        .await
        .context("starting datanode")?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Shutting down..."),
        () = datanode.wait() => info!("All buckets exited"),
    }

    match datanode.stats() {
        Ok(stats) => {
            for bucket in stats {
                info!(
                    bucket_id = bucket.bucket_id,
                    active_slicedb = bucket.active_slicedb_id,
                    open_slicedbs = bucket.open_slicedbs,
                    "Bucket stats"
                );
            }
        }
        Err(e) => info!("Bucket stats unavailable: {}", e),
    }

    datanode.shutdown().await?;
    info!("Datanode shut down gracefully");
    Ok(())
}
