//! SliceIO Broker
//!
//! This binary routes client requests to storage channels.

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use sliceio_broker::{Broker, HttpState, router};
use sliceio_common::BrokerConfig;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "sliceio-broker")]
#[command(about = "SliceIO request broker")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/sliceio/broker.toml")]
    config: String,

    /// Client-facing listen address
    #[arg(long)]
    frontend: Option<String>,

    /// Worker-facing listen address
    #[arg(long)]
    backend: Option<String>,

    /// Health and metrics listen address
    #[arg(long)]
    http_listen: Option<String>,

    /// Acknowledge every request without dispatching it
    #[arg(long)]
    stub: bool,

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
    broker: BrokerConfig,
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

    // CLI takes precedence over the config file
    let mut broker_config = config.broker;
    if let Some(frontend) = args.frontend {
        broker_config.frontend = frontend;
    }
    if let Some(backend) = args.backend {
        broker_config.backend = backend;
    }
    if args.http_listen.is_some() {
        broker_config.http_listen = args.http_listen;
    }
    if args.stub {
        broker_config.stub = true;
    }
    if let Some(interval_ms) = args.heartbeat_interval_ms {
        broker_config.heartbeat.interval_ms = interval_ms;
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

    info!("Starting SliceIO broker");
    info!("Config file: {}", args.config);
    info!(
        "Heartbeat: every {} ms, liveness {}",
        broker_config.heartbeat.interval_ms, broker_config.heartbeat.liveness
    );
    if broker_config.stub {
        info!("Stub mode: requests are acknowledged without dispatch");
    }

    let http_listen = broker_config.http_listen.clone();
    let broker = Broker::bind(broker_config).await?;
    info!("Frontend listening on {}", broker.frontend_addr()?);
    info!("Backend listening on {}", broker.backend_addr()?);

    if let Some(listen) = http_listen {
        let state = Arc::new(HttpState {
            metrics: broker.metrics(),
            registry: broker.registry(),
            start_time: Instant::now(),
        });
        let listener = TcpListener::bind(&listen)
            .await
            .with_context(|| format!("binding metrics listener {listen}"))?;
        info!("Metrics available at http://{listen}/metrics");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router(state)).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    broker
        .run(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down...");
        })
        .await?;

    info!("Broker shut down gracefully");
    Ok(())
}
