//! Control-channel handling
//!
//! One WebSocket connection per tunnel client. The reader task (this module)
//! demultiplexes inbound frames into per-stream channels; a dedicated writer
//! task owns the sink so outbound frames are never interleaved.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use simple_tunnel_proto::{
    subdomain, Frame, FrameCodec, Phase, ERROR_SUBDOMAIN_TAKEN, PROTOCOL_VERSION,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::http::RequestHead;
use crate::registry::Tunnel;
use crate::server::ServerShared;

/// Missed heartbeats before a control connection is declared dead.
const MAX_MISSED_PONGS: u32 = 3;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Complete the WebSocket handshake on a hijacked socket and run the control
/// session until the connection dies.
pub(crate) async fn handle_control(
    mut stream: TcpStream,
    head: RequestHead,
    peer: SocketAddr,
    shared: Arc<ServerShared>,
) {
    let key = match head.header("sec-websocket-key") {
        Some(key) => key.to_string(),
        None => {
            debug!("Control upgrade from {} without Sec-WebSocket-Key", peer);
            let _ = crate::http::write_json_response(&mut stream, 400, "{\"error\":\"Bad request\"}")
                .await;
            return;
        }
    };

    let accept = derive_accept_key(key.as_bytes());
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\nconnection: Upgrade\r\nupgrade: websocket\r\nsec-websocket-accept: {}\r\n\r\n",
        accept
    );
    if stream.write_all(response.as_bytes()).await.is_err() {
        return;
    }

    let ws = WebSocketStream::from_raw_socket(stream, Role::Server, None).await;
    let (ws_sink, mut ws_source) = ws.split();

    let (frame_tx, frame_rx) = mpsc::channel(64);
    let writer = tokio::spawn(writer_task(ws_sink, frame_rx));

    debug!("Control connection established from {}", peer);

    if let Some(tunnel) = register(&mut ws_source, &frame_tx, peer, &shared).await {
        run_session(&mut ws_source, &frame_tx, &tunnel, &shared).await;

        shared
            .registry
            .remove_if_owner(tunnel.subdomain(), tunnel.tunnel_id());
        tunnel.fail_all_streams();
        info!("Tunnel {} disconnected", tunnel.subdomain());
    }

    drop(frame_tx);
    let _ = writer.await;
}

/// Writer task: the single owner of the WebSocket sink.
async fn writer_task(mut sink: WsSink, mut frame_rx: mpsc::Receiver<Frame>) {
    while let Some(frame) = frame_rx.recv().await {
        let payload = match FrameCodec::encode(&frame) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode outbound frame: {}", e);
                continue;
            }
        };

        if let Err(e) = sink.send(Message::Binary(payload)).await {
            debug!("Control write failed: {}", e);
            break;
        }
    }

    let _ = sink.close().await;
}

/// Drive the HELLO / REGISTER_TUNNEL exchange. Returns the bound tunnel, or
/// None when the connection ends or loses a registration race.
async fn register(
    ws_source: &mut WsSource,
    frame_tx: &mpsc::Sender<Frame>,
    peer: SocketAddr,
    shared: &ServerShared,
) -> Option<Arc<Tunnel>> {
    let (version, token) = loop {
        match next_frame(ws_source, peer).await? {
            Frame::Hello { version, token } => break (version, token),
            other => warn!("Expected HELLO from {}, got {:?}", peer, other),
        }
    };

    if version != PROTOCOL_VERSION {
        warn!(
            "Client {} speaks protocol v{}, server is v{}; continuing",
            peer, version, PROTOCOL_VERSION
        );
    }
    if token.is_some() {
        debug!("Client {} presented a token", peer);
    }

    let requested = loop {
        match next_frame(ws_source, peer).await? {
            Frame::RegisterTunnel { subdomain } => break subdomain,
            Frame::Ping => {
                let _ = frame_tx.send(Frame::Pong).await;
            }
            other => warn!("Expected REGISTER_TUNNEL from {}, got {:?}", peer, other),
        }
    };

    let label = match requested.filter(|s| subdomain::is_valid_subdomain(s)) {
        Some(requested) if shared.registry.get(&requested).is_none() => requested,
        Some(requested) => {
            debug!("Requested subdomain {} is taken, synthesizing", requested);
            subdomain::random_subdomain()
        }
        None => subdomain::random_subdomain(),
    };

    let tunnel = Arc::new(Tunnel::new(
        label.clone(),
        Uuid::new_v4().to_string(),
        frame_tx.clone(),
    ));

    if shared.registry.insert_if_absent(tunnel.clone()).is_err() {
        warn!("Subdomain {} lost a registration race", label);
        let _ = frame_tx
            .send(Frame::Error {
                code: ERROR_SUBDOMAIN_TAKEN.to_string(),
                message: Some(format!("Subdomain {} is already in use", label)),
            })
            .await;
        return None;
    }

    let registered = Frame::Registered {
        subdomain: label.clone(),
        tunnel_id: tunnel.tunnel_id().to_string(),
    };
    if frame_tx.send(registered).await.is_err() {
        shared.registry.remove_if_owner(&label, tunnel.tunnel_id());
        return None;
    }

    info!(
        "Tunnel registered: {}.{} from {}",
        label, shared.config.domain_base, peer
    );
    Some(tunnel)
}

/// Read the next decodable frame, skipping framing errors and non-binary
/// messages. None means the connection is gone.
async fn next_frame(ws_source: &mut WsSource, peer: SocketAddr) -> Option<Frame> {
    loop {
        match ws_source.next().await {
            Some(Ok(Message::Binary(payload))) => match FrameCodec::decode(&payload) {
                Ok(frame) => return Some(frame),
                Err(e) => warn!("Undecodable frame from {}: {}", peer, e),
            },
            Some(Ok(Message::Close(_))) | None => return None,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!("Control read error from {}: {}", peer, e);
                return None;
            }
        }
    }
}

/// Main session loop: route inbound frames to streams, keep the heartbeat.
async fn run_session(
    ws_source: &mut WsSource,
    frame_tx: &mpsc::Sender<Frame>,
    tunnel: &Tunnel,
    shared: &ServerShared,
) {
    let mut heartbeat = tokio::time::interval(shared.config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    heartbeat.tick().await;

    let mut missed_pongs = 0u32;

    loop {
        tokio::select! {
            message = ws_source.next() => match message {
                Some(Ok(Message::Binary(payload))) => {
                    missed_pongs = 0;
                    match FrameCodec::decode(&payload) {
                        Ok(frame) => route_frame(frame, tunnel, frame_tx).await,
                        Err(e) => warn!(
                            "Undecodable frame from tunnel {}: {}",
                            tunnel.subdomain(),
                            e
                        ),
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {
                    missed_pongs = 0;
                }
                Some(Err(e)) => {
                    debug!("Control read error for tunnel {}: {}", tunnel.subdomain(), e);
                    break;
                }
            },
            _ = heartbeat.tick() => {
                if missed_pongs >= MAX_MISSED_PONGS {
                    warn!(
                        "Tunnel {} missed {} heartbeats, dropping",
                        tunnel.subdomain(),
                        missed_pongs
                    );
                    break;
                }
                missed_pongs += 1;
                if frame_tx.send(Frame::Ping).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Dispatch one inbound frame. Response frames go to their stream channel;
/// frames for unknown streams are late writes and are discarded.
async fn route_frame(frame: Frame, tunnel: &Tunnel, frame_tx: &mpsc::Sender<Frame>) {
    let stream_id = match &frame {
        Frame::RespStart { stream_id, .. } | Frame::RespData { stream_id, .. } => Some(*stream_id),
        Frame::End {
            stream_id,
            phase: Phase::Res,
            ..
        } => Some(*stream_id),
        _ => None,
    };

    if let Some(stream_id) = stream_id {
        match tunnel.stream_sender(stream_id) {
            Some(tx) => {
                // A dropped receiver means the public side already gave up.
                let _ = tx.send(frame).await;
            }
            None => debug!(
                "Frame for unknown stream {} on tunnel {} discarded",
                stream_id,
                tunnel.subdomain()
            ),
        }
        return;
    }

    match frame {
        Frame::Ping => {
            let _ = frame_tx.send(Frame::Pong).await;
        }
        Frame::Pong => {}
        Frame::Error { code, message } => {
            warn!(
                "Error frame from tunnel {}: {} {}",
                tunnel.subdomain(),
                code,
                message.unwrap_or_default()
            );
        }
        other => debug!(
            "Unexpected frame on tunnel {}: {:?}",
            tunnel.subdomain(),
            other
        ),
    }
}
