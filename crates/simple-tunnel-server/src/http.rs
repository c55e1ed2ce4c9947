//! Public HTTP relay path
//!
//! The server owns raw accepted sockets and parses HTTP/1.1 by hand. A
//! public request is bridged onto its tunnel as frames; the response is
//! written back manually from frames arriving on the stream channel, so the
//! socket stays open for as long as the origin keeps producing bytes.

use bytes::{Buf, Bytes, BytesMut};
use simple_tunnel_proto::{subdomain, Frame, Phase};
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::registry::Tunnel;
use crate::server::ServerShared;

/// Maximum number of headers to parse
const MAX_HEADERS: usize = 100;

/// Maximum size of a request head (request line + headers)
const MAX_HEAD_SIZE: usize = 16 * 1024;

/// Read/forward granularity for body bytes
const BODY_CHUNK_SIZE: usize = 16 * 1024;

/// HTTP relay errors
#[derive(Debug, Error)]
pub(crate) enum HttpError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed before the request head was complete")]
    UnexpectedEof,

    #[error("Request head exceeds {MAX_HEAD_SIZE} bytes")]
    HeadTooLarge,

    #[error("Malformed request: {0}")]
    Malformed(#[from] httparse::Error),
}

/// Parsed request line and headers of one public request.
#[derive(Debug, Clone)]
pub(crate) struct RequestHead {
    pub method: String,
    /// Raw request target, forwarded verbatim as the stream path.
    pub target: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// First value for a header, case-insensitive on the name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn path(&self) -> &str {
        self.target.split('?').next().unwrap_or(&self.target)
    }

    pub fn is_websocket_upgrade(&self) -> bool {
        let upgrade = self
            .header("upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false);
        let connection = self
            .header("connection")
            .map(|v| v.to_ascii_lowercase().contains("upgrade"))
            .unwrap_or(false);
        upgrade && connection
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length")
            .and_then(|v| v.trim().parse().ok())
    }

    pub fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }
}

/// Read one request head off the socket. Bytes past the head (the body
/// prefix) are left in `buf`.
pub(crate) async fn read_request_head(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
) -> Result<RequestHead, HttpError> {
    loop {
        if let Some((head, consumed)) = parse_request_head(buf)? {
            buf.advance(consumed);
            return Ok(head);
        }

        if buf.len() > MAX_HEAD_SIZE {
            return Err(HttpError::HeadTooLarge);
        }

        let n = stream.read_buf(buf).await?;
        if n == 0 {
            return Err(HttpError::UnexpectedEof);
        }
    }
}

/// Try to parse a request head from the buffer. Returns the head and the
/// number of bytes it consumed, or None if more data is needed.
fn parse_request_head(buf: &[u8]) -> Result<Option<(RequestHead, usize)>, HttpError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(buf)? {
        httparse::Status::Complete(header_len) => {
            let parsed_headers = req
                .headers
                .iter()
                .map(|h| {
                    (
                        h.name.to_string(),
                        String::from_utf8_lossy(h.value).to_string(),
                    )
                })
                .collect();

            Ok(Some((
                RequestHead {
                    method: req.method.unwrap_or("GET").to_string(),
                    target: req.path.unwrap_or("/").to_string(),
                    headers: parsed_headers,
                },
                header_len,
            )))
        }
        httparse::Status::Partial => Ok(None),
    }
}

/// Extract the tenant label from a Host header value.
///
/// Lowercases, strips any port, and accepts exactly one label in front of
/// `.{base}`. The bare base host and foreign hosts yield None.
pub(crate) fn extract_subdomain(host: &str, base: &str) -> Option<String> {
    let lowered = host.trim().to_ascii_lowercase();
    let bare = lowered.split(':').next().unwrap_or("");
    let base = base.to_ascii_lowercase();

    if bare == base {
        return None;
    }

    let suffix = format!(".{}", base);
    let label = bare.strip_suffix(suffix.as_str())?;

    if subdomain::is_valid_subdomain(label) {
        Some(label.to_string())
    } else {
        None
    }
}

/// Hop-by-hop headers stripped from tunnel responses. The edge transport
/// decides its own framing.
pub(crate) fn is_hop_by_hop(name: &str) -> bool {
    name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("keep-alive")
}

pub(crate) fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

/// Write a short self-contained JSON response and leave the socket open for
/// the caller to shut down.
pub(crate) async fn write_json_response<W>(
    writer: &mut W,
    status: u16,
    body: &str,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let head = format!(
        "HTTP/1.1 {} {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
        status,
        status_text(status),
        body.len()
    );
    writer.write_all(head.as_bytes()).await?;
    writer.write_all(body.as_bytes()).await?;
    writer.flush().await
}

/// How the public request body is framed on the wire.
enum BodyFraming {
    None,
    Length(u64),
    Chunked,
}

fn body_framing(head: &RequestHead) -> BodyFraming {
    if head.method.eq_ignore_ascii_case("GET") || head.method.eq_ignore_ascii_case("HEAD") {
        return BodyFraming::None;
    }

    if head.is_chunked() {
        return BodyFraming::Chunked;
    }

    match head.content_length() {
        Some(n) if n > 0 => BodyFraming::Length(n),
        _ => BodyFraming::None,
    }
}

/// Drive one public request through its tunnel.
pub(crate) async fn handle_public_request(
    mut stream: TcpStream,
    leftover: BytesMut,
    head: RequestHead,
    peer: SocketAddr,
    shared: Arc<ServerShared>,
) {
    let host = match head.header("host") {
        Some(h) => h.to_string(),
        None => {
            let _ = write_json_response(&mut stream, 404, "{\"error\":\"Not found\"}").await;
            let _ = stream.shutdown().await;
            return;
        }
    };

    let label = match extract_subdomain(&host, &shared.config.domain_base) {
        Some(label) => label,
        None => {
            debug!("No tunnel subdomain in host {:?}", host);
            let _ = write_json_response(&mut stream, 404, "{\"error\":\"Not found\"}").await;
            let _ = stream.shutdown().await;
            return;
        }
    };

    let tunnel = match shared.registry.get(&label) {
        Some(tunnel) => tunnel,
        None => {
            debug!("No tunnel registered for subdomain {}", label);
            let _ =
                write_json_response(&mut stream, 502, "{\"error\":\"Tunnel not connected\"}").await;
            let _ = stream.shutdown().await;
            return;
        }
    };

    let stream_id = tunnel.allocate_stream_id();
    let deadline = Instant::now() + shared.config.stream_deadline;
    let (resp_tx, resp_rx) = mpsc::channel(32);
    tunnel.register_stream(stream_id, resp_tx);

    let open = Frame::OpenStream {
        tunnel_id: tunnel.tunnel_id().to_string(),
        stream_id,
        method: head.method.clone(),
        path: head.target.clone(),
        headers: forwarded_headers(&head, peer, &host),
    };

    if tunnel.send_frame(open).await.is_err() {
        tunnel.remove_stream(stream_id);
        let _ = write_json_response(&mut stream, 502, "{\"error\":\"Tunnel not connected\"}").await;
        let _ = stream.shutdown().await;
        return;
    }

    let framing = body_framing(&head);
    let (read_half, mut write_half) = stream.into_split();

    let body_task = tokio::spawn(pump_request_body(
        read_half,
        leftover.freeze(),
        framing,
        tunnel.clone(),
        tunnel.tunnel_id().to_string(),
        stream_id,
    ));

    let status = respond(&mut write_half, resp_rx, deadline).await;

    tunnel.remove_stream(stream_id);
    body_task.abort();

    if shared.config.log_all_requests {
        match status {
            Some(status) => info!("{} {}{} -> {}", head.method, host, head.target, status),
            None => info!("{} {}{} -> (dropped)", head.method, host, head.target),
        }
    }
}

/// Request headers as forwarded to the client: everything verbatim, plus the
/// X-Forwarded trio when the edge has not already set it.
fn forwarded_headers(head: &RequestHead, peer: SocketAddr, host: &str) -> Vec<(String, String)> {
    let mut headers = head.headers.clone();

    if head.header("x-forwarded-for").is_none() {
        headers.push(("X-Forwarded-For".to_string(), peer.ip().to_string()));
    }
    if head.header("x-forwarded-proto").is_none() {
        headers.push(("X-Forwarded-Proto".to_string(), "https".to_string()));
    }
    if head.header("x-forwarded-host").is_none() {
        headers.push(("X-Forwarded-Host".to_string(), host.to_string()));
    }

    headers
}

/// Forward the public request body as `ReqData` frames, then terminate the
/// request side.
async fn pump_request_body(
    read_half: OwnedReadHalf,
    leftover: Bytes,
    framing: BodyFraming,
    tunnel: Arc<Tunnel>,
    tunnel_id: String,
    stream_id: u64,
) {
    let mut reader = BufReader::new(AsyncReadExt::chain(Cursor::new(leftover), read_half));

    match framing {
        BodyFraming::None => {}
        BodyFraming::Length(mut remaining) => {
            let mut buf = vec![0u8; BODY_CHUNK_SIZE];
            while remaining > 0 {
                let take = remaining.min(BODY_CHUNK_SIZE as u64) as usize;
                match reader.read(&mut buf[..take]).await {
                    Ok(0) => break,
                    Ok(n) => {
                        remaining -= n as u64;
                        let frame = Frame::ReqData {
                            tunnel_id: tunnel_id.clone(),
                            stream_id,
                            chunk: buf[..n].to_vec(),
                        };
                        if tunnel.send_frame(frame).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        debug!("Error reading public request body: {}", e);
                        break;
                    }
                }
            }
        }
        BodyFraming::Chunked => {
            if let Err(e) = pump_chunked_body(&mut reader, &tunnel, &tunnel_id, stream_id).await {
                debug!("Error reading chunked public request body: {}", e);
            }
        }
    }

    let _ = tunnel
        .send_frame(Frame::End {
            tunnel_id,
            stream_id,
            phase: Phase::Req,
            status: None,
        })
        .await;
}

/// Decode a chunked request body and forward the decoded bytes.
async fn pump_chunked_body<R>(
    reader: &mut R,
    tunnel: &Tunnel,
    tunnel_id: &str,
    stream_id: u64,
) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = vec![0u8; BODY_CHUNK_SIZE];

    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }

        let size_str = line.trim().split(';').next().unwrap_or("").trim();
        let mut remaining = match u64::from_str_radix(size_str, 16) {
            Ok(n) => n,
            Err(_) => {
                debug!("Malformed chunk size {:?} in public request body", size_str);
                return Ok(());
            }
        };

        if remaining == 0 {
            // Consume optional trailers up to the final blank line.
            loop {
                let mut trailer = String::new();
                if reader.read_line(&mut trailer).await? == 0 {
                    break;
                }
                if trailer == "\r\n" || trailer == "\n" {
                    break;
                }
            }
            return Ok(());
        }

        while remaining > 0 {
            let take = remaining.min(BODY_CHUNK_SIZE as u64) as usize;
            reader.read_exact(&mut buf[..take]).await?;
            remaining -= take as u64;

            let frame = Frame::ReqData {
                tunnel_id: tunnel_id.to_string(),
                stream_id,
                chunk: buf[..take].to_vec(),
            };
            if tunnel.send_frame(frame).await.is_err() {
                return Ok(());
            }
        }

        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf).await?;
    }
}

/// Write the response from stream frames. Returns the status written to the
/// public client, or None if the connection was dropped without one.
async fn respond(
    writer: &mut OwnedWriteHalf,
    mut resp_rx: mpsc::Receiver<Frame>,
    deadline: Instant,
) -> Option<u16> {
    let mut headers_sent = false;
    let mut status_written = None;

    loop {
        tokio::select! {
            frame = resp_rx.recv() => match frame {
                Some(Frame::RespStart { status, headers, .. }) => {
                    if headers_sent {
                        continue;
                    }
                    let headers = headers.unwrap_or_default();
                    if write_response_head(writer, status, &headers).await.is_err() {
                        return status_written;
                    }
                    headers_sent = true;
                    status_written = Some(status);
                }
                Some(Frame::RespData { chunk, .. }) => {
                    if !headers_sent || chunk.is_empty() {
                        continue;
                    }
                    if writer.write_all(&chunk).await.is_err() {
                        return status_written;
                    }
                }
                Some(Frame::End { phase: Phase::Res, .. }) => break,
                Some(other) => {
                    debug!("Unexpected frame on response stream: {:?}", other);
                }
                None => {
                    // Control connection went away mid-stream.
                    if !headers_sent {
                        let _ = write_json_response(
                            writer,
                            502,
                            "{\"error\":\"Tunnel disconnected\"}",
                        )
                        .await;
                        status_written = Some(502);
                    }
                    break;
                }
            },
            _ = tokio::time::sleep_until(deadline) => {
                if !headers_sent {
                    warn!("Stream deadline exceeded, responding 504");
                    let _ = write_json_response(writer, 504, "{\"error\":\"Gateway timeout\"}").await;
                    status_written = Some(504);
                }
                // Headers already out: drop the connection silently.
                break;
            }
        }
    }

    let _ = writer.flush().await;
    let _ = writer.shutdown().await;
    status_written
}

async fn write_response_head(
    writer: &mut OwnedWriteHalf,
    status: u16,
    headers: &[(String, String)],
) -> std::io::Result<()> {
    let mut head = format!("HTTP/1.1 {} {}\r\n", status, status_text(status));

    for (name, value) in headers {
        if is_hop_by_hop(name) {
            continue;
        }
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }

    head.push_str("connection: close\r\n\r\n");
    writer.write_all(head.as_bytes()).await
}
