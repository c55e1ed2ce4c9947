//! Tunnel client binary
//!
//! Connects to a tunnel server, registers a subdomain, and serves incoming
//! streams from a local HTTP origin until the connection dies or Ctrl+C.

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use simple_tunnel_client::{ClientConfig, ClientError, TunnelClient, DEFAULT_CONNECT_URL};

/// Expose a local HTTP server through a simple-tunnel server
#[derive(Parser, Debug)]
#[command(name = "simple-tunnel")]
#[command(about = "Expose a local HTTP server on a public subdomain", long_about = None)]
#[command(version)]
struct Cli {
    /// Local port to expose
    #[arg(short, long)]
    port: Option<u16>,

    /// Host of the local origin
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Requested subdomain (random if omitted or taken)
    #[arg(short, long)]
    subdomain: Option<String>,

    /// Control URL of the tunnel server
    #[arg(long, env = "SIMPLE_TUNNEL_CONNECT")]
    connect: Option<String>,

    /// Base domain used when printing the public URL
    #[arg(long, env = "SIMPLE_TUNNEL_DOMAIN_BASE")]
    domain_base: Option<String>,

    /// Opaque token echoed at handshake
    #[arg(short, long)]
    token: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "SIMPLE_TUNNEL_LOG", default_value = "info")]
    log_level: String,

    /// Positional fallback for environments where flag parsing is unreliable
    #[arg(value_name = "PORT")]
    port_pos: Option<u16>,

    #[arg(value_name = "CONNECT")]
    connect_pos: Option<String>,

    #[arg(value_name = "SUBDOMAIN")]
    subdomain_pos: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    let Some(port) = cli.port.or(cli.port_pos) else {
        error!("A local port is required: pass --port <n> or a positional <port>");
        std::process::exit(1);
    };

    let connect = cli
        .connect
        .or(cli.connect_pos)
        .unwrap_or_else(|| DEFAULT_CONNECT_URL.to_string());
    let subdomain = cli.subdomain.or(cli.subdomain_pos);
    let domain_base = cli
        .domain_base
        .or_else(|| std::env::var("DOMAIN_BASE").ok());

    let config = ClientConfig::builder()
        .local_host(cli.host.clone())
        .local_port(port)
        .connect_url(connect)
        .subdomain(subdomain)
        .token(cli.token)
        .domain_base(domain_base)
        .force_streaming(env_flag("SIMPLE_TUNNEL_STREAM"))
        .force_identity(env_flag("SIMPLE_TUNNEL_FORCE_IDENTITY"))
        .build()?;

    let tunnel = match TunnelClient::connect(config).await {
        Ok(tunnel) => tunnel,
        Err(e) => {
            error!("Failed to connect tunnel: {}", e);
            if let ClientError::Rejected(ref reason) = e {
                if reason.contains("SUBDOMAIN_TAKEN") {
                    error!("Tip: pick a different subdomain with --subdomain, or omit it for a random one");
                }
            }
            std::process::exit(1);
        }
    };

    println!();
    println!("🌍 Your local server is now public!");
    println!("📍 Local:  http://{}:{}", cli.host, port);
    println!("🌐 Public: {}", tunnel.public_url());
    println!();
    info!("Tunnel is active. Press Ctrl+C to stop.");

    tokio::select! {
        result = tunnel.run() => {
            if let Err(e) = result {
                error!("Tunnel closed: {}", e);
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down tunnel...");
        }
    }

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
