//! Tunnel registry
//!
//! Process-wide mapping from subdomain to live tunnel. A subdomain is
//! present iff exactly one control connection owns it; the map's entry API
//! serializes the insert so the invariant holds under racing registrations.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use simple_tunnel_proto::Frame;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Subdomain already taken: {0}")]
    SubdomainTaken(String),

    #[error("Control connection closed")]
    ControlClosed,
}

/// One registered tunnel: a subdomain bound to a control connection.
pub struct Tunnel {
    subdomain: String,
    tunnel_id: String,
    created_at: DateTime<Utc>,
    /// Feeds the control connection's writer task. Every frame this tunnel
    /// sends to its client goes through here, so frames are never
    /// interleaved within a message.
    frame_tx: mpsc::Sender<Frame>,
    next_stream_id: AtomicU64,
    /// Routes response frames to the public handler owning each stream.
    streams: DashMap<u64, mpsc::Sender<Frame>>,
}

impl Tunnel {
    pub fn new(subdomain: String, tunnel_id: String, frame_tx: mpsc::Sender<Frame>) -> Self {
        Self {
            subdomain,
            tunnel_id,
            created_at: Utc::now(),
            frame_tx,
            next_stream_id: AtomicU64::new(1),
            streams: DashMap::new(),
        }
    }

    pub fn subdomain(&self) -> &str {
        &self.subdomain
    }

    pub fn tunnel_id(&self) -> &str {
        &self.tunnel_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Allocate the next stream id. Strictly increasing, starts at 1.
    pub fn allocate_stream_id(&self) -> u64 {
        self.next_stream_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Send a frame to this tunnel's client. Blocks when the writer backlog
    /// is full, which is what stalls a fast producer behind a slow link.
    pub async fn send_frame(&self, frame: Frame) -> Result<(), RegistryError> {
        self.frame_tx
            .send(frame)
            .await
            .map_err(|_| RegistryError::ControlClosed)
    }

    /// Register the response channel for a freshly allocated stream.
    pub fn register_stream(&self, stream_id: u64, tx: mpsc::Sender<Frame>) {
        self.streams.insert(stream_id, tx);
    }

    /// Sender for an in-flight stream, if it is still tracked.
    pub fn stream_sender(&self, stream_id: u64) -> Option<mpsc::Sender<Frame>> {
        self.streams.get(&stream_id).map(|entry| entry.clone())
    }

    pub fn remove_stream(&self, stream_id: u64) {
        self.streams.remove(&stream_id);
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Drop every in-flight stream. Each public handler observes its channel
    /// closing and fails its request.
    pub fn fail_all_streams(&self) {
        let dropped = self.streams.len();
        self.streams.clear();
        if dropped > 0 {
            debug!(
                "Dropped {} in-flight streams for tunnel {}",
                dropped, self.subdomain
            );
        }
    }
}

/// Process-wide subdomain -> tunnel mapping.
pub struct TunnelRegistry {
    tunnels: DashMap<String, Arc<Tunnel>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self {
            tunnels: DashMap::new(),
        }
    }

    /// Bind a tunnel to its subdomain. Fails if the subdomain is taken; the
    /// check and insert are one atomic step.
    pub fn insert_if_absent(&self, tunnel: Arc<Tunnel>) -> Result<(), RegistryError> {
        match self.tunnels.entry(tunnel.subdomain().to_string()) {
            Entry::Occupied(_) => Err(RegistryError::SubdomainTaken(
                tunnel.subdomain().to_string(),
            )),
            Entry::Vacant(entry) => {
                entry.insert(tunnel);
                Ok(())
            }
        }
    }

    pub fn get(&self, subdomain: &str) -> Option<Arc<Tunnel>> {
        self.tunnels.get(subdomain).map(|entry| entry.clone())
    }

    /// Remove a binding, but only if it still belongs to the given tunnel.
    /// A connection tearing down must not evict a successor that re-bound
    /// the same subdomain in the meantime.
    pub fn remove_if_owner(&self, subdomain: &str, tunnel_id: &str) -> Option<Arc<Tunnel>> {
        self.tunnels
            .remove_if(subdomain, |_, tunnel| tunnel.tunnel_id() == tunnel_id)
            .map(|(_, tunnel)| tunnel)
    }

    pub fn count(&self) -> usize {
        self.tunnels.len()
    }
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_tunnel(subdomain: &str, tunnel_id: &str) -> Arc<Tunnel> {
        let (tx, _rx) = mpsc::channel(8);
        Arc::new(Tunnel::new(
            subdomain.to_string(),
            tunnel_id.to_string(),
            tx,
        ))
    }

    #[test]
    fn test_insert_and_get() {
        let registry = TunnelRegistry::new();
        registry
            .insert_if_absent(test_tunnel("myapp", "t-1"))
            .unwrap();

        let found = registry.get("myapp").unwrap();
        assert_eq!(found.tunnel_id(), "t-1");
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_insert_duplicate_fails() {
        let registry = TunnelRegistry::new();
        registry
            .insert_if_absent(test_tunnel("myapp", "t-1"))
            .unwrap();

        let result = registry.insert_if_absent(test_tunnel("myapp", "t-2"));
        assert!(matches!(result, Err(RegistryError::SubdomainTaken(_))));

        // Loser must not have displaced the winner.
        assert_eq!(registry.get("myapp").unwrap().tunnel_id(), "t-1");
    }

    #[test]
    fn test_remove_if_owner() {
        let registry = TunnelRegistry::new();
        registry
            .insert_if_absent(test_tunnel("myapp", "t-1"))
            .unwrap();

        // Wrong owner: no-op.
        assert!(registry.remove_if_owner("myapp", "t-2").is_none());
        assert_eq!(registry.count(), 1);

        assert!(registry.remove_if_owner("myapp", "t-1").is_some());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_stream_ids_monotonic_from_one() {
        let tunnel = test_tunnel("myapp", "t-1");

        let ids: Vec<u64> = (0..5).map(|_| tunnel.allocate_stream_id()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_stream_table() {
        let tunnel = test_tunnel("myapp", "t-1");

        let (tx, _rx) = mpsc::channel(1);
        tunnel.register_stream(1, tx);
        assert!(tunnel.stream_sender(1).is_some());
        assert!(tunnel.stream_sender(2).is_none());

        tunnel.remove_stream(1);
        assert!(tunnel.stream_sender(1).is_none());
    }

    #[tokio::test]
    async fn test_fail_all_streams_closes_channels() {
        let tunnel = test_tunnel("myapp", "t-1");

        let (tx, mut rx) = mpsc::channel(1);
        tunnel.register_stream(1, tx);
        tunnel.fail_all_streams();

        assert_eq!(tunnel.stream_count(), 0);
        // The handler side observes the closed channel.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_send_frame_after_control_closed() {
        let (tx, rx) = mpsc::channel(8);
        let tunnel = Tunnel::new("myapp".to_string(), "t-1".to_string(), tx);
        drop(rx);

        let result = tunnel.send_frame(Frame::Ping).await;
        assert!(matches!(result, Err(RegistryError::ControlClosed)));
    }
}
