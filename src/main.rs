//! CLI entry point.
//!
//! One binary, four roles. Each role reads the same config file and
//! finds the others over the bus relay:
//!
//! ```bash
//! obsctl relay                 # message bus, start first
//! obsctl station               # remote executor with mock hardware
//! obsctl ground                # schedule orchestrator
//! obsctl dashboard             # read-only HTTP JSON views
//! ```
//!
//! All roles accept `--config <path>`; keys can also be overridden via
//! `OBSCTL_`-prefixed environment variables.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use obsctl::bus::RelayServer;
use obsctl::config::{self, ObsConfig};
use obsctl::hardware::StationHardware;
use obsctl::{dashboard, ground, logging, station};

#[derive(Parser)]
#[command(name = "obsctl")]
#[command(about = "Remote observatory control over a stream bus", long_about = None)]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, global = true, default_value = config::DEFAULT_PATH)]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the message bus relay
    Relay {
        /// Listen address, defaults to the configured bus address
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run the ground orchestrator
    Ground,

    /// Run the station executor with mock hardware
    Station,

    /// Run the read-only HTTP dashboard
    Dashboard,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = ObsConfig::load_from(&cli.config)?;
    logging::init(&cfg.log);

    match cli.command {
        Commands::Relay { bind } => run_relay(cfg, bind).await,
        Commands::Ground => run_ground(cfg).await,
        Commands::Station => run_station(cfg).await,
        Commands::Dashboard => run_dashboard(cfg).await,
    }
}

async fn run_relay(cfg: ObsConfig, bind: Option<String>) -> Result<()> {
    let addr = bind.unwrap_or(cfg.bus.addr);
    let relay = RelayServer::bind(&addr).await?;
    tokio::select! {
        _ = relay.run() => {}
        _ = tokio::signal::ctrl_c() => info!("interrupt, relay shutting down"),
    }
    Ok(())
}

async fn run_ground(cfg: ObsConfig) -> Result<()> {
    let handle = ground::spawn(&cfg).await?;
    tokio::signal::ctrl_c().await?;
    info!("interrupt, stopping ground");
    handle.stop().await?;
    Ok(())
}

async fn run_station(cfg: ObsConfig) -> Result<()> {
    let sensors: Vec<&str> = cfg.station.sensors.iter().map(String::as_str).collect();
    let hw = StationHardware::mocked(&sensors);
    let handle = station::spawn(&cfg, hw).await?;
    tokio::signal::ctrl_c().await?;
    info!("interrupt, stopping station");
    handle.shutdown().await;
    Ok(())
}

async fn run_dashboard(cfg: ObsConfig) -> Result<()> {
    tokio::select! {
        result = dashboard::serve(&cfg) => result?,
        _ = tokio::signal::ctrl_c() => info!("interrupt, dashboard shutting down"),
    }
    Ok(())
}
