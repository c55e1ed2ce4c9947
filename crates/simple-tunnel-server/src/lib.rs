//! Tunnel server: terminates public HTTP, owns the tunnel registry, and
//! drives request/response streams over the control channel.

mod control;
mod http;
mod rate_limit;
mod registry;
mod server;

pub use rate_limit::RateLimiter;
pub use registry::{RegistryError, Tunnel, TunnelRegistry};
pub use server::{ServerConfig, ServerError, TunnelServer};
