//! Server wiring: listener, connection sniffing, dispatch
//!
//! One TCP port carries everything. Each accepted connection has its request
//! head read off the socket; `/connect` upgrades become control channels,
//! `/health` answers inline, and every other request is public traffic.

use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

use crate::http;
use crate::rate_limit::RateLimiter;
use crate::registry::TunnelRegistry;
use crate::control;

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Public base domain; tunnels live at `{subdomain}.{domain_base}`.
    pub domain_base: String,
    /// Log every public request at info level.
    pub log_all_requests: bool,
    /// Time a stream may stay open before the server abandons it with 504.
    pub stream_deadline: Duration,
    pub heartbeat_interval: Duration,
    pub rate_limit_max: u32,
    pub rate_limit_window: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".parse().unwrap(),
            domain_base: "localhost".to_string(),
            log_all_requests: false,
            stream_deadline: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
            rate_limit_max: 200,
            rate_limit_window: Duration::from_secs(60),
        }
    }
}

/// State shared by every connection handler.
pub(crate) struct ServerShared {
    pub(crate) config: ServerConfig,
    pub(crate) registry: TunnelRegistry,
    pub(crate) limiter: RateLimiter,
}

pub struct TunnelServer {
    listener: TcpListener,
    shared: Arc<ServerShared>,
}

impl TunnelServer {
    /// Bind the listening socket. Failure here is the only fatal startup
    /// error.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        info!("Tunnel server listening on {}", listener.local_addr()?);

        let limiter = RateLimiter::new(config.rate_limit_max, config.rate_limit_window);
        let shared = Arc::new(ServerShared {
            config,
            registry: TunnelRegistry::new(),
            limiter,
        });

        Ok(Self { listener, shared })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever.
    pub async fn run(self) -> Result<(), ServerError> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let shared = self.shared.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, peer, shared).await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, peer: SocketAddr, shared: Arc<ServerShared>) {
    let mut buf = BytesMut::with_capacity(8 * 1024);

    let head = match http::read_request_head(&mut stream, &mut buf).await {
        Ok(head) => head,
        Err(e) => {
            debug!("Failed to read request head from {}: {}", peer, e);
            return;
        }
    };

    if head.is_websocket_upgrade() && head.path() == "/connect" {
        control::handle_control(stream, head, peer, shared).await;
        return;
    }

    if head.path() == "/health" {
        let _ = http::write_json_response(&mut stream, 200, "{\"ok\":true}").await;
        let _ = stream.shutdown().await;
        return;
    }

    if !shared.limiter.check(peer.ip()) {
        debug!("Rate limit exceeded for {}", peer.ip());
        let _ = http::write_json_response(&mut stream, 429, "{\"error\":\"Too many requests\"}")
            .await;
        let _ = stream.shutdown().await;
        return;
    }

    http::handle_public_request(stream, buf, head, peer, shared).await;
}
