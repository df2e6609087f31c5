mod client;
mod config;
mod firewall;
mod logging;
mod metrics;
mod process;
mod runner;
mod server;
mod strategy;
mod watcher;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use client::{DaemonClient, Endpoint};
use config::DaemonConfig;
use firewall::BackendKind;
use runner::StrategyRunner;
use server::ApiState;

#[derive(Parser, Debug)]
#[command(name = "zapretd")]
#[command(about = "DPI-bypass strategy daemon and control CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon and listen for control commands
    Serve {
        /// Config file path
        #[arg(long, short)]
        config: Option<PathBuf>,
    },

    /// Ask a running daemon to reload its strategy
    Restart {
        /// Force restart even if one is already in progress
        #[arg(long, short)]
        force: bool,

        #[command(flatten)]
        conn: ConnectionArgs,
    },

    /// Print the strategy runner status
    Status {
        #[command(flatten)]
        conn: ConnectionArgs,
    },
}

#[derive(clap::Args, Debug)]
struct ConnectionArgs {
    /// Config file path
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Unix socket path (overrides config)
    #[arg(long, short)]
    socket: Option<PathBuf>,

    /// Network address (overrides config and socket)
    #[arg(long, short)]
    address: Option<String>,
}

impl ConnectionArgs {
    fn client(&self) -> anyhow::Result<DaemonClient> {
        let config = DaemonConfig::load(self.config.as_deref())?;
        let endpoint = Endpoint::resolve(self.socket.clone(), self.address.clone(), &config)?;
        Ok(DaemonClient::new(endpoint))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config } => serve(config).await,
        Command::Restart { force, conn } => restart(force, &conn).await,
        Command::Status { conn } => status(&conn).await,
    }
}

async fn serve(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = DaemonConfig::load(config_path.as_deref()).context("failed to load config")?;
    config.validate().context("invalid config")?;

    logging::init(&config.logging);
    tracing::info!(
        socket_path = %config.server.socket_path,
        network_address = %config.server.network_address,
        "starting zapret daemon"
    );

    let runner = if config.strategy_runner.enabled {
        let runner = StrategyRunner::new(&config.strategy_runner)
            .context("failed to create strategy runner")?;
        runner
            .start()
            .await
            .context("failed to start strategy runner")?;
        Some(runner)
    } else {
        None
    };

    if let Some(port) = config.server.metrics_port {
        // Rule counters are read back from the kernel table, so the
        // exporter only has per-queue gauges on the nftables backend;
        // otherwise it still serves interface totals.
        let mut table = String::new();
        if let Some(ref runner) = runner {
            if runner.status().await.firewall_backend == BackendKind::Nftables.as_str() {
                table = runner.table_name().await;
            }
        }
        metrics::start_server(port, table);
    }

    server::serve(&config, ApiState::new(runner)).await
}

async fn restart(force: bool, conn: &ConnectionArgs) -> anyhow::Result<()> {
    let client = conn.client()?;
    let response = client
        .restart(force)
        .await
        .context("restart failed")?;

    println!("{}", response.message);
    println!("Restarted at: {}", response.restarted_at);
    Ok(())
}

async fn status(conn: &ConnectionArgs) -> anyhow::Result<()> {
    let client = conn.client()?;
    let response = client.status().await.context("get status failed")?;

    let running = if response.running {
        "running"
    } else {
        "not running"
    };

    println!("Status:             {running}");
    println!("Strategy File:      {}", response.strategy_file);
    println!("Active Queues:      {}", response.active_queues);
    println!("Active Processes:   {}", response.active_processes);
    println!("Firewall Backend:   {}", response.firewall_backend);
    Ok(())
}
