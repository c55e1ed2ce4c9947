//! Tunnel server binary
//!
//! Public-facing half of simple-tunnel: accepts control connections from
//! tunnel clients on /connect and routes public HTTP to them by subdomain.

use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use simple_tunnel_server::{ServerConfig, TunnelServer};

/// Public edge server for simple-tunnel
#[derive(Parser, Debug)]
#[command(name = "simple-tunnel-server")]
#[command(about = "Accept tunnel clients and route public HTTP to them", long_about = None)]
#[command(version)]
struct Cli {
    /// Port for both the control channel and public HTTP
    #[arg(long, env = "PORT", default_value = "3000")]
    port: u16,

    /// Public base domain; tunnels are served at {subdomain}.{domain-base}
    #[arg(long, env = "DOMAIN_BASE", default_value = "localhost")]
    domain_base: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log every public request at info level
    #[arg(long)]
    log_all_requests: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    let log_all_requests = cli.log_all_requests || env_flag("LOG_ALL_REQUESTS");

    info!("Starting tunnel server");
    info!("Public domain: {}", cli.domain_base);
    info!("Subdomains will be: {{name}}.{}", cli.domain_base);

    let config = ServerConfig {
        bind_addr: SocketAddr::from(([0, 0, 0, 0], cli.port)),
        domain_base: cli.domain_base,
        log_all_requests,
        ..Default::default()
    };

    let server = TunnelServer::bind(config).await?;
    server.run().await?;

    Ok(())
}

/// Environment flags count as set unless empty, "0", or "false".
fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| !v.is_empty() && v != "0" && v != "false")
        .unwrap_or(false)
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
