//! SliceIO CLI
//!
//! Stores, fetches and deletes objects through a running broker.

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use sliceio_client::{Client, DEFAULT_REQUEST_TIMEOUT, Reply};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "sliceio-cli")]
#[command(about = "SliceIO command-line client")]
#[command(version)]
struct Args {
    /// Broker frontend address
    #[arg(short, long, env = "SLICEIO_BROKER", default_value = "127.0.0.1:19977")]
    broker: String,

    /// Request timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Store an object
    Put {
        /// Object key
        key: String,
        /// Object value (ignored with --file)
        #[arg(required_unless_present = "file")]
        value: Option<String>,
        /// Read the value from a file
        #[arg(short, long, conflicts_with = "value")]
        file: Option<PathBuf>,
    },
    /// Fetch an object
    Get {
        /// Object key
        key: String,
        /// Write the value to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Delete an object
    Del {
        /// Object key
        key: String,
    },
}

/// Turn a non-success reply into an error naming the key
fn check(key: &str, reply: &Reply) -> Result<()> {
    match reply {
        Reply::Ack | Reply::Data { .. } => Ok(()),
        Reply::NotFound => bail!("{key}: not found"),
        Reply::Pending => bail!("{key}: request still pending"),
        Reply::Error => bail!("{key}: worker reported an error"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let timeout = args
        .timeout_ms
        .map_or(DEFAULT_REQUEST_TIMEOUT, Duration::from_millis);
    let mut client = Client::connect(&args.broker)
        .await
        .with_context(|| format!("connecting to broker {}", args.broker))?
        .with_timeout(timeout);
    debug!(broker = %args.broker, "Connected");

    match args.command {
        Commands::Put { key, value, file } => {
            let payload = match (file, value) {
                (Some(path), _) => Bytes::from(
                    tokio::fs::read(&path)
                        .await
                        .with_context(|| format!("reading {}", path.display()))?,
                ),
                (None, Some(value)) => Bytes::from(value),
                (None, None) => bail!("a value or --file is required"),
            };
            let size = payload.len();
            let reply = client.put(key.clone(), payload).await?;
            check(&key, &reply)?;
            println!("{key}: stored {size} bytes");
        }
        Commands::Get { key, output } => {
            let reply = client.get(key.clone()).await?;
            check(&key, &reply)?;
            let payload = reply.into_payload().unwrap_or_default();
            if let Some(path) = output {
                tokio::fs::write(&path, &payload)
                    .await
                    .with_context(|| format!("writing {}", path.display()))?;
                eprintln!("{key}: wrote {} bytes to {}", payload.len(), path.display());
            } else {
                let mut stdout = std::io::stdout().lock();
                stdout.write_all(&payload)?;
                stdout.flush()?;
            }
        }
        Commands::Del { key } => {
            let reply = client.delete(key.clone()).await?;
            check(&key, &reply)?;
            println!("{key}: deleted");
        }
    }

    Ok(())
}
