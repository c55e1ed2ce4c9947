//! Control connection and stream dispatch
//!
//! One WebSocket to the server, one writer task owning the sink, and one
//! spawned origin task per open stream. The dispatch loop is the only reader
//! of the control channel.

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use simple_tunnel_proto::{CodecError, Frame, FrameCodec, Phase, PROTOCOL_VERSION};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::origin::{self, StreamContext};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Client errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timed out connecting to the tunnel server after {0:?}")]
    ConnectTimeout(Duration),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Registration rejected: {0}")]
    Rejected(String),

    #[error("Control connection closed")]
    ControlClosed,
}

/// Input to a stream's origin task.
pub(crate) enum StreamInput {
    Data(Bytes),
    End,
}

pub(crate) struct StreamHandle {
    pub(crate) input_tx: mpsc::Sender<StreamInput>,
}

/// Entry point: dial, register, hand back a connected tunnel.
pub struct TunnelClient;

impl TunnelClient {
    pub async fn connect(config: ClientConfig) -> Result<ConnectedTunnel, ClientError> {
        info!("Connecting to tunnel server at {}", config.connect_url);

        let (ws, _response) = tokio::time::timeout(
            config.connect_timeout,
            connect_async(config.connect_url.as_str()),
        )
        .await
        .map_err(|_| ClientError::ConnectTimeout(config.connect_timeout))??;

        let (ws_sink, mut ws_source) = ws.split();
        let (frame_tx, frame_rx) = mpsc::channel(64);
        tokio::spawn(writer_task(ws_sink, frame_rx));

        let hello = Frame::Hello {
            version: PROTOCOL_VERSION,
            token: config.token.clone(),
        };
        frame_tx
            .send(hello)
            .await
            .map_err(|_| ClientError::ControlClosed)?;

        let register = Frame::RegisterTunnel {
            subdomain: config.subdomain.clone(),
        };
        frame_tx
            .send(register)
            .await
            .map_err(|_| ClientError::ControlClosed)?;

        let (subdomain, tunnel_id) = await_registration(&mut ws_source, &frame_tx).await?;
        info!("Tunnel registered: {} ({})", subdomain, tunnel_id);

        Ok(ConnectedTunnel {
            subdomain,
            tunnel_id,
            config: Arc::new(config),
            ws_source,
            frame_tx,
            streams: Arc::new(DashMap::new()),
        })
    }
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

async fn await_registration(
    ws_source: &mut WsSource,
    frame_tx: &mpsc::Sender<Frame>,
) -> Result<(String, String), ClientError> {
    loop {
        match ws_source.next().await {
            Some(Ok(Message::Binary(payload))) => match FrameCodec::decode(&payload) {
                Ok(Frame::Registered {
                    subdomain,
                    tunnel_id,
                }) => return Ok((subdomain, tunnel_id)),
                Ok(Frame::Error { code, message }) => {
                    return Err(ClientError::Rejected(format!(
                        "{}: {}",
                        code,
                        message.unwrap_or_default()
                    )))
                }
                Ok(Frame::Ping) => {
                    let _ = frame_tx.send(Frame::Pong).await;
                }
                Ok(other) => debug!("Unexpected frame during registration: {:?}", other),
                Err(e) => warn!("Undecodable frame during registration: {}", e),
            },
            Some(Ok(Message::Close(_))) | None => return Err(ClientError::ControlClosed),
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!("Control read error during registration: {}", e);
                return Err(ClientError::ControlClosed);
            }
        }
    }
}

/// A live tunnel: registered and ready to serve streams.
pub struct ConnectedTunnel {
    subdomain: String,
    tunnel_id: String,
    config: Arc<ClientConfig>,
    ws_source: WsSource,
    frame_tx: mpsc::Sender<Frame>,
    streams: Arc<DashMap<u64, StreamHandle>>,
}

impl ConnectedTunnel {
    pub fn subdomain(&self) -> &str {
        &self.subdomain
    }

    pub fn tunnel_id(&self) -> &str {
        &self.tunnel_id
    }

    /// The public URL the server answers for this tunnel.
    pub fn public_url(&self) -> String {
        format!("https://{}.{}", self.subdomain, self.config.public_base())
    }

    /// Serve streams until the control connection dies.
    pub async fn run(mut self) -> Result<(), ClientError> {
        loop {
            match self.ws_source.next().await {
                Some(Ok(Message::Binary(payload))) => match FrameCodec::decode(&payload) {
                    Ok(frame) => self.dispatch(frame).await,
                    Err(e) => warn!("Undecodable frame on control channel: {}", e),
                },
                Some(Ok(Message::Close(_))) | None => {
                    return Err(ClientError::ControlClosed);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Control read error: {}", e);
                    return Err(ClientError::ControlClosed);
                }
            }
        }
    }

    async fn dispatch(&mut self, frame: Frame) {
        match frame {
            Frame::OpenStream {
                tunnel_id,
                stream_id,
                method,
                path,
                headers,
            } => {
                debug!("Stream {} opened: {} {}", stream_id, method, path);

                let (input_tx, input_rx) = mpsc::channel(32);
                self.streams.insert(stream_id, StreamHandle { input_tx });

                let ctx = StreamContext {
                    tunnel_id,
                    stream_id,
                    method,
                    path,
                    headers,
                };
                let config = self.config.clone();
                let frame_tx = self.frame_tx.clone();
                let streams = self.streams.clone();

                tokio::spawn(async move {
                    origin::run_stream(config, frame_tx, ctx, input_rx, streams).await;
                });
            }
            Frame::ReqData {
                stream_id, chunk, ..
            } => {
                self.feed_stream(stream_id, StreamInput::Data(Bytes::from(chunk)))
                    .await;
            }
            Frame::End {
                stream_id,
                phase: Phase::Req,
                ..
            } => {
                self.feed_stream(stream_id, StreamInput::End).await;
            }
            Frame::Ping => {
                let _ = self.frame_tx.send(Frame::Pong).await;
            }
            Frame::Pong => {}
            Frame::Error { code, message } => {
                warn!(
                    "Error frame from server: {} {}",
                    code,
                    message.unwrap_or_default()
                );
            }
            other => debug!("Unexpected frame on control channel: {:?}", other),
        }
    }

    async fn feed_stream(&self, stream_id: u64, input: StreamInput) {
        // Clone the sender out of the map before awaiting: the origin task
        // removes its own entry, and holding the shard guard across the send
        // would deadlock with it.
        let input_tx = match self.streams.get(&stream_id) {
            Some(handle) => handle.input_tx.clone(),
            None => {
                debug!("Frame for unknown stream {} discarded", stream_id);
                return;
            }
        };

        let _ = input_tx.send(input).await;
    }
}
