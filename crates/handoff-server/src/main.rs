//! Line echo server that can be restarted without refusing a connection.
//!
//! Send `SIGUSR2` to start a successor generation on the same socket,
//! `SIGTERM` or `SIGINT` to drain and exit.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use handoff::{HandoffServer, TracingLogger};
use tracing::info;

mod config;
mod echo;
mod telemetry;

use config::ConfigOverrides;
use echo::EchoService;

#[derive(Parser)]
#[command(name = "handoff-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Socket family: tcp, tcp4, tcp6 or unix
    #[arg(short, long)]
    network: Option<String>,

    /// Address (host:port) or socket path to listen on
    #[arg(short, long)]
    listen: Option<String>,

    /// File to record the serving pid in (default: handoff-server.pid)
    #[arg(short, long)]
    pid_file: Option<PathBuf>,

    /// Give up on draining connections after this many seconds
    #[arg(long)]
    drain_timeout_secs: Option<u64>,

    /// Log level: trace, debug, info, warn or error
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            network: self.network.clone(),
            listen_address: self.listen.clone(),
            pid_file: self.pid_file.clone(),
            drain_timeout_secs: self.drain_timeout_secs,
            log_level: self.log_level.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let overrides = cli.overrides().or(ConfigOverrides::from_env());
    let config = config::load_config(cli.config.as_deref(), overrides)
        .context("Failed to load configuration")?;

    telemetry::init(&config.logging)
        .map_err(|e| anyhow::anyhow!(e))
        .context("Failed to initialize telemetry")?;

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let handoff_config = config
        .handoff_config()
        .context("Invalid handoff configuration")?;
    handoff_config.log_config();

    let service = Arc::new(EchoService::new(handoff_config.process.pid));
    let mut server = HandoffServer::new(service, handoff_config, Some(Arc::new(TracingLogger)))
        .await
        .context("Failed to set up listener")?;

    server.serve().await.context("Server stopped with error")?;

    Ok(())
}
