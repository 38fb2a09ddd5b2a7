//! # securemux
//!
//! Host a node, connect to one, or run both ends in one process.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

use securemux::config::{self, Config};
use securemux::{CryptoCycle, EchoService, PrimaryCache, ServiceCatalog, ServiceManager, Supervisor};

/// Encrypted service multiplexer
#[derive(Parser)]
#[command(name = "securemux")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file (TOML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept connections until interrupted
    Host {
        /// Listen address (overrides the configuration)
        #[arg(short, long)]
        listen: Option<SocketAddr>,
    },

    /// Connect to a host and call its echo service
    Connect {
        addr: SocketAddr,

        #[arg(short, long, default_value = "hello")]
        message: String,
    },

    /// Host and client in one process on 127.0.0.1:3333
    Demo,

    /// Print a sample configuration
    SampleConfig,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match &cli.config {
        Some(path) => config::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => Config::default(),
    };

    match cli.command {
        Commands::Host { listen } => run_host(config, listen).await,
        Commands::Connect { addr, message } => run_connect(config, addr, &message).await,
        Commands::Demo => run_demo(config).await,
        Commands::SampleConfig => {
            print!("{}", config::generate_sample());
            Ok(())
        }
    }
}

fn supervisor(config: Config) -> Supervisor {
    Supervisor::new(ServiceCatalog::with_builtin(), PrimaryCache::shared(), config)
}

async fn run_host(config: Config, listen: Option<SocketAddr>) -> Result<()> {
    let addr = match listen {
        Some(addr) => addr,
        None => config
            .supervisor
            .listen_addr
            .parse()
            .context("Invalid listen address in configuration")?,
    };

    let node = supervisor(config);
    let bound = node
        .start_hosting(addr)
        .await
        .with_context(|| format!("Failed to listen on {}", addr))?;
    println!("Hosting on {} (Ctrl-C to stop)", bound);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for Ctrl-C")?;

    info!(peers = node.connected_peers().len(), "shutting down");
    node.stop();
    Ok(())
}

async fn run_connect(config: Config, addr: SocketAddr, message: &str) -> Result<()> {
    let standard = config.crypto.standard;
    let node = supervisor(config);
    let session = node
        .connect_to_host(addr, standard)
        .await
        .with_context(|| format!("Failed to connect to {}", addr))?;

    let result = echo(&session, message).await;
    node.stop();
    let reply = result?;
    println!("{}", reply);
    Ok(())
}

async fn run_demo(config: Config) -> Result<()> {
    let addr: SocketAddr = "127.0.0.1:3333".parse()?;

    let host = supervisor(config.clone());
    host.start_hosting(addr)
        .await
        .context("Failed to start the demo host")?;

    let client = supervisor(config.clone());
    let session = client
        .connect_to_host(addr, config.crypto.standard)
        .await
        .context("Failed to connect to the demo host")?;

    wait_for(|| session.crypto_cycle() == CryptoCycle::SteadyState)
        .await
        .context("Key exchange did not complete")?;
    println!("Key exchange complete with {}", session.remote_addr());

    session.request_new_key();
    let result = echo(&session, "hello from the demo").await;

    client.stop();
    host.stop();

    println!("{}", result?);
    Ok(())
}

/// Add an echo service, send one call and wait for the reply
async fn echo(session: &ServiceManager, message: &str) -> Result<String> {
    let service = Arc::new(Mutex::new(EchoService::default()));
    session.add_service(service.clone())?;
    service.lock().call(message)?;

    let expected = format!("Post:{}", message);
    wait_for(|| service.lock().previous_message() == Some(expected.as_str()))
        .await
        .context("No reply from the echo service")?;
    Ok(expected)
}

async fn wait_for(mut done: impl FnMut() -> bool) -> Result<()> {
    for _ in 0..1000 {
        if done() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    bail!("timed out after 10 seconds")
}
