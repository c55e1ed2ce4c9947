//! Tunnel client: bridges server-initiated HTTP streams to a local origin.

mod client;
mod config;
mod origin;

pub use client::{ClientError, ConnectedTunnel, TunnelClient};
pub use config::{ClientConfig, ClientConfigBuilder, DEFAULT_CONNECT_URL};
