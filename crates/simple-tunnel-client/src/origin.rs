//! Origin forwarding
//!
//! Each stream becomes one HTTP/1.1 request against the local origin,
//! written and parsed by hand over a TcpStream. Response bytes are forwarded
//! as frames as they arrive; transfer-encoding framing is decoded here so
//! the server can apply its own, but content-encoding is left untouched.

use bytes::{Buf, BytesMut};
use dashmap::DashMap;
use simple_tunnel_proto::{Frame, Phase};
use std::io::Cursor;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::client::{StreamHandle, StreamInput};
use crate::config::ClientConfig;

/// Maximum number of headers to parse
const MAX_HEADERS: usize = 100;

/// Maximum size of a response head
const MAX_HEAD_SIZE: usize = 16 * 1024;

/// Read/forward granularity for body bytes
const BODY_CHUNK_SIZE: usize = 16 * 1024;

#[derive(Debug, Error)]
enum OriginError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Origin closed the connection before a complete response head")]
    TruncatedResponse,

    #[error("Response head exceeds {MAX_HEAD_SIZE} bytes")]
    HeadTooLarge,

    #[error("Malformed response: {0}")]
    Malformed(#[from] httparse::Error),

    /// The control channel went away; nothing left to report to.
    #[error("Control connection closed")]
    Control,
}

/// Request context carried over from `OpenStream`.
pub(crate) struct StreamContext {
    pub tunnel_id: String,
    pub stream_id: u64,
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
}

impl StreamContext {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn end_frame(&self, status: Option<u16>) -> Frame {
        Frame::End {
            tunnel_id: self.tunnel_id.clone(),
            stream_id: self.stream_id,
            phase: Phase::Res,
            status,
        }
    }
}

/// Whether a stream buffers its request body before contacting the origin.
/// Non-GET bodies are buffered so origins that refuse chunked request bodies
/// see a plain `content-length` request.
fn is_buffered(method: &str, force_streaming: bool) -> bool {
    !force_streaming
        && !method.eq_ignore_ascii_case("GET")
        && !method.eq_ignore_ascii_case("HEAD")
}

/// How the outbound request body is framed.
enum OriginBody {
    None,
    /// Buffered body with an exact `content-length`.
    Fixed(usize),
    /// Streamed body counted by the incoming `content-length` header.
    PassThrough,
    /// Streamed body with no known length; chunked on the way out.
    Chunked,
}

/// Drive one stream to completion, then drop it from the client map.
pub(crate) async fn run_stream(
    config: Arc<ClientConfig>,
    frame_tx: mpsc::Sender<Frame>,
    ctx: StreamContext,
    input_rx: mpsc::Receiver<StreamInput>,
    streams: Arc<DashMap<u64, StreamHandle>>,
) {
    let mut resp_started = false;

    let result = if is_buffered(&ctx.method, config.force_streaming) {
        forward_buffered(&config, &frame_tx, &ctx, input_rx, &mut resp_started).await
    } else {
        forward_streaming(&config, &frame_tx, &ctx, input_rx, &mut resp_started).await
    };

    match result {
        Ok(status) => debug!("Stream {} completed with status {}", ctx.stream_id, status),
        Err(OriginError::Control) => {}
        Err(e) => {
            warn!("Stream {}: origin request failed: {}", ctx.stream_id, e);

            if resp_started {
                // Headers are already on the wire; all we can do is end.
                let _ = frame_tx.send(ctx.end_frame(None)).await;
            } else {
                let start = Frame::RespStart {
                    tunnel_id: ctx.tunnel_id.clone(),
                    stream_id: ctx.stream_id,
                    status: 502,
                    headers: None,
                };
                let _ = frame_tx.send(start).await;
                let _ = frame_tx.send(ctx.end_frame(Some(502))).await;
            }
        }
    }

    streams.remove(&ctx.stream_id);
}

/// Buffered mode: collect the whole request body, then issue the origin
/// request with a fixed content-length.
async fn forward_buffered(
    config: &ClientConfig,
    frame_tx: &mpsc::Sender<Frame>,
    ctx: &StreamContext,
    mut input_rx: mpsc::Receiver<StreamInput>,
    resp_started: &mut bool,
) -> Result<u16, OriginError> {
    let mut body = BytesMut::new();
    loop {
        match input_rx.recv().await {
            Some(StreamInput::Data(chunk)) => body.extend_from_slice(&chunk),
            Some(StreamInput::End) => break,
            None => return Err(OriginError::Control),
        }
    }

    let mut stream =
        TcpStream::connect((config.local_host.as_str(), config.local_port)).await?;

    let head = build_origin_head(ctx, config, &OriginBody::Fixed(body.len()));
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(&body).await?;
    stream.flush().await?;

    relay_response(stream, frame_tx, ctx, resp_started).await
}

/// Streaming mode: issue the request immediately and pipe body chunks into
/// it as they arrive.
async fn forward_streaming(
    config: &ClientConfig,
    frame_tx: &mpsc::Sender<Frame>,
    ctx: &StreamContext,
    mut input_rx: mpsc::Receiver<StreamInput>,
    resp_started: &mut bool,
) -> Result<u16, OriginError> {
    let stream = TcpStream::connect((config.local_host.as_str(), config.local_port)).await?;
    let (read_half, mut write_half) = stream.into_split();

    let bodyless =
        ctx.method.eq_ignore_ascii_case("GET") || ctx.method.eq_ignore_ascii_case("HEAD");
    let body = if bodyless {
        OriginBody::None
    } else if ctx.header("content-length").is_some() {
        OriginBody::PassThrough
    } else {
        OriginBody::Chunked
    };
    let chunked_out = matches!(body, OriginBody::Chunked);

    let head = build_origin_head(ctx, config, &body);
    write_half.write_all(head.as_bytes()).await?;
    write_half.flush().await?;

    // The origin may respond before the request body is complete, so the
    // body is piped by its own task while this one reads the response. The
    // task returns the write half so the socket stays fully open until the
    // response is done.
    let body_writer = tokio::spawn(async move {
        loop {
            match input_rx.recv().await {
                Some(StreamInput::Data(chunk)) => {
                    if chunked_out {
                        let framed = format!("{:x}\r\n", chunk.len());
                        if write_half.write_all(framed.as_bytes()).await.is_err() {
                            break;
                        }
                        if write_half.write_all(&chunk).await.is_err() {
                            break;
                        }
                        if write_half.write_all(b"\r\n").await.is_err() {
                            break;
                        }
                    } else if write_half.write_all(&chunk).await.is_err() {
                        break;
                    }
                }
                Some(StreamInput::End) => {
                    if chunked_out {
                        let _ = write_half.write_all(b"0\r\n\r\n").await;
                    }
                    let _ = write_half.flush().await;
                    break;
                }
                None => break,
            }
        }
        write_half
    });

    let result = relay_response(read_half, frame_tx, ctx, resp_started).await;
    body_writer.abort();
    result
}

/// Build the origin request head. Incoming headers pass through verbatim
/// except `accept-encoding` and whatever body framing this request replaces.
fn build_origin_head(ctx: &StreamContext, config: &ClientConfig, body: &OriginBody) -> String {
    let mut head = format!("{} {} HTTP/1.1\r\n", ctx.method, ctx.path);

    // PassThrough is the only mode where the incoming content-length still
    // describes the body this request carries.
    let keep_length = matches!(body, OriginBody::PassThrough);

    for (name, value) in &ctx.headers {
        if name.eq_ignore_ascii_case("accept-encoding") {
            continue;
        }
        // The request body was already de-framed by the server.
        if name.eq_ignore_ascii_case("transfer-encoding") {
            continue;
        }
        if !keep_length && name.eq_ignore_ascii_case("content-length") {
            continue;
        }

        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }

    if config.force_identity {
        head.push_str("accept-encoding: identity\r\n");
    }

    match body {
        OriginBody::Fixed(len) => {
            head.push_str("content-length: ");
            head.push_str(&len.to_string());
            head.push_str("\r\n");
        }
        OriginBody::Chunked => head.push_str("transfer-encoding: chunked\r\n"),
        OriginBody::None | OriginBody::PassThrough => {}
    }

    head.push_str("\r\n");
    head
}

/// Parsed origin response head.
struct ResponseHead {
    status: u16,
    headers: Vec<(String, String)>,
    content_length: Option<u64>,
    is_chunked: bool,
}

/// Read the response head off the origin socket. Body bytes past the head
/// are left in `buf`.
async fn read_response_head<R>(
    reader: &mut R,
    buf: &mut BytesMut,
) -> Result<ResponseHead, OriginError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some((head, consumed)) = parse_response_head(buf)? {
            buf.advance(consumed);
            return Ok(head);
        }

        if buf.len() > MAX_HEAD_SIZE {
            return Err(OriginError::HeadTooLarge);
        }

        let n = reader.read_buf(buf).await?;
        if n == 0 {
            return Err(OriginError::TruncatedResponse);
        }
    }
}

fn parse_response_head(buf: &[u8]) -> Result<Option<(ResponseHead, usize)>, OriginError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);

    match resp.parse(buf)? {
        httparse::Status::Complete(header_len) => {
            let mut parsed_headers = Vec::new();
            let mut content_length = None;
            let mut is_chunked = false;

            for header in resp.headers.iter() {
                let name = header.name.to_string();
                let value = String::from_utf8_lossy(header.value).to_string();

                if name.eq_ignore_ascii_case("content-length") {
                    content_length = value.trim().parse().ok();
                }
                if name.eq_ignore_ascii_case("transfer-encoding")
                    && value.to_ascii_lowercase().contains("chunked")
                {
                    is_chunked = true;
                }

                parsed_headers.push((name, value));
            }

            Ok(Some((
                ResponseHead {
                    status: resp.code.unwrap_or(200),
                    headers: parsed_headers,
                    content_length,
                    is_chunked,
                },
                header_len,
            )))
        }
        httparse::Status::Partial => Ok(None),
    }
}

/// Forward the origin response as frames: one `RespStart`, a `RespData` per
/// body chunk, one terminal `End`.
async fn relay_response<R>(
    mut reader: R,
    frame_tx: &mpsc::Sender<Frame>,
    ctx: &StreamContext,
    resp_started: &mut bool,
) -> Result<u16, OriginError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(8 * 1024);
    let head = read_response_head(&mut reader, &mut buf).await?;

    let start = Frame::RespStart {
        tunnel_id: ctx.tunnel_id.clone(),
        stream_id: ctx.stream_id,
        status: head.status,
        headers: Some(head.headers),
    };
    frame_tx
        .send(start)
        .await
        .map_err(|_| OriginError::Control)?;
    *resp_started = true;

    let bodyless = ctx.method.eq_ignore_ascii_case("HEAD")
        || matches!(head.status, 100..=199 | 204 | 304);

    if !bodyless {
        let mut reader = BufReader::new(AsyncReadExt::chain(Cursor::new(buf.freeze()), reader));

        if let Some(length) = head.content_length {
            relay_exact(&mut reader, length, frame_tx, ctx).await?;
        } else if head.is_chunked {
            relay_chunked(&mut reader, frame_tx, ctx).await?;
        } else {
            relay_until_eof(&mut reader, frame_tx, ctx).await?;
        }
    }

    frame_tx
        .send(ctx.end_frame(None))
        .await
        .map_err(|_| OriginError::Control)?;

    Ok(head.status)
}

async fn send_chunk(
    frame_tx: &mpsc::Sender<Frame>,
    ctx: &StreamContext,
    chunk: Vec<u8>,
) -> Result<(), OriginError> {
    if chunk.is_empty() {
        return Ok(());
    }

    let frame = Frame::RespData {
        tunnel_id: ctx.tunnel_id.clone(),
        stream_id: ctx.stream_id,
        chunk,
    };
    frame_tx
        .send(frame)
        .await
        .map_err(|_| OriginError::Control)
}

/// Body framed by content-length: forward exactly that many bytes.
async fn relay_exact<R>(
    reader: &mut R,
    length: u64,
    frame_tx: &mpsc::Sender<Frame>,
    ctx: &StreamContext,
) -> Result<(), OriginError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; BODY_CHUNK_SIZE];
    let mut remaining = length;

    while remaining > 0 {
        let take = remaining.min(BODY_CHUNK_SIZE as u64) as usize;
        let n = reader.read(&mut buf[..take]).await?;
        if n == 0 {
            return Err(OriginError::TruncatedResponse);
        }
        remaining -= n as u64;
        send_chunk(frame_tx, ctx, buf[..n].to_vec()).await?;
    }

    Ok(())
}

/// Chunked body: decode the framing here and forward the decoded bytes. The
/// server re-frames the body for the public side.
async fn relay_chunked<R>(
    reader: &mut R,
    frame_tx: &mpsc::Sender<Frame>,
    ctx: &StreamContext,
) -> Result<(), OriginError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = vec![0u8; BODY_CHUNK_SIZE];

    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(OriginError::TruncatedResponse);
        }

        let size_str = line.trim().split(';').next().unwrap_or("").trim();
        let mut remaining = u64::from_str_radix(size_str, 16)
            .map_err(|_| OriginError::TruncatedResponse)?;

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
            send_chunk(frame_tx, ctx, buf[..take].to_vec()).await?;
        }

        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf).await?;
    }
}

/// No length information: the body runs until the origin closes.
async fn relay_until_eof<R>(
    reader: &mut R,
    frame_tx: &mpsc::Sender<Frame>,
    ctx: &StreamContext,
) -> Result<(), OriginError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; BODY_CHUNK_SIZE];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        send_chunk(frame_tx, ctx, buf[..n].to_vec()).await?;
    }
}
