//! End-to-end tests: real server, real client, scripted origin
//!
//! Each test binds everything on 127.0.0.1 ephemeral ports and talks to the
//! public side with raw sockets, the same way an edge proxy would.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use simple_tunnel_client::{ClientConfig, ConnectedTunnel, TunnelClient};
use simple_tunnel_proto::{Frame, FrameCodec, PROTOCOL_VERSION};
use simple_tunnel_server::{ServerConfig, TunnelServer};

async fn start_server(stream_deadline: Duration) -> SocketAddr {
    let config = ServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        domain_base: "localhost".to_string(),
        stream_deadline,
        ..Default::default()
    };

    let server = TunnelServer::bind(config).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    addr
}

/// A minimal origin: GET /ping -> "pong", POST /echo -> the request body.
async fn start_origin() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };

            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut tmp = [0u8; 4096];

                let head_end = loop {
                    let Ok(n) = socket.read(&mut tmp).await else {
                        return;
                    };
                    if n == 0 {
                        return;
                    }
                    buf.extend_from_slice(&tmp[..n]);
                    if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                        break pos + 4;
                    }
                };

                let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
                let request_line = head.lines().next().unwrap_or("").to_string();
                let content_length = head
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        if name.trim().eq_ignore_ascii_case("content-length") {
                            value.trim().parse::<usize>().ok()
                        } else {
                            None
                        }
                    })
                    .unwrap_or(0);

                let mut body = buf[head_end..].to_vec();
                while body.len() < content_length {
                    let Ok(n) = socket.read(&mut tmp).await else {
                        return;
                    };
                    if n == 0 {
                        break;
                    }
                    body.extend_from_slice(&tmp[..n]);
                }

                let response = if request_line.starts_with("GET /ping") {
                    b"HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: 4\r\n\r\npong"
                        .to_vec()
                } else if request_line.starts_with("POST /echo") {
                    let mut response = format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n",
                        body.len()
                    )
                    .into_bytes();
                    response.extend_from_slice(&body);
                    response
                } else {
                    b"HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\n\r\n".to_vec()
                };

                let _ = socket.write_all(&response).await;
                let _ = socket.flush().await;
            });
        }
    });

    port
}

async fn connect_client(
    server_addr: SocketAddr,
    origin_port: u16,
    subdomain: &str,
) -> ConnectedTunnel {
    let config = ClientConfig::builder()
        .local_port(origin_port)
        .connect_url(format!("ws://{}/connect", server_addr))
        .subdomain(Some(subdomain.to_string()))
        .build()
        .unwrap();

    TunnelClient::connect(config).await.unwrap()
}

/// Issue one raw public request and read the whole response.
async fn public_request(server_addr: SocketAddr, raw: &[u8]) -> String {
    let mut stream = TcpStream::connect(server_addr).await.unwrap();
    stream.write_all(raw).await.unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8_lossy(&response).to_string()
}

#[tokio::test(flavor = "multi_thread")]
async fn e2e_get_passthrough() {
    let server_addr = start_server(Duration::from_secs(10)).await;
    let origin_port = start_origin().await;

    let tunnel = connect_client(server_addr, origin_port, "get-pass").await;
    assert_eq!(tunnel.subdomain(), "get-pass");
    tokio::spawn(tunnel.run());

    let response = public_request(
        server_addr,
        b"GET /ping HTTP/1.1\r\nHost: get-pass.localhost\r\naccept: */*\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
    assert!(response.to_ascii_lowercase().contains("content-length: 4"));
    assert!(response.ends_with("pong"));

    // Hop-by-hop framing never leaks through.
    assert!(!response.to_ascii_lowercase().contains("transfer-encoding"));
    assert!(!response.to_ascii_lowercase().contains("keep-alive"));
}

#[tokio::test(flavor = "multi_thread")]
async fn e2e_post_body_roundtrip() {
    let server_addr = start_server(Duration::from_secs(10)).await;
    let origin_port = start_origin().await;

    let tunnel = connect_client(server_addr, origin_port, "post-echo").await;
    tokio::spawn(tunnel.run());

    let body = br#"{"n":3}"#;
    let request = format!(
        "POST /echo HTTP/1.1\r\nHost: post-echo.localhost\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n",
        body.len()
    );
    let mut raw = request.into_bytes();
    raw.extend_from_slice(body);

    let response = public_request(server_addr, &raw).await;

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
    assert!(response.ends_with(r#"{"n":3}"#));
}

#[tokio::test(flavor = "multi_thread")]
async fn e2e_unknown_subdomain_is_502() {
    let server_addr = start_server(Duration::from_secs(10)).await;

    let response = public_request(
        server_addr,
        b"GET / HTTP/1.1\r\nHost: none.localhost\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 502"), "{response}");
    assert!(response.contains(r#"{"error":"Tunnel not connected"}"#));
}

#[tokio::test(flavor = "multi_thread")]
async fn e2e_bare_base_host_is_404() {
    let server_addr = start_server(Duration::from_secs(10)).await;

    let response =
        public_request(server_addr, b"GET /x HTTP/1.1\r\nHost: localhost\r\n\r\n").await;

    assert!(response.starts_with("HTTP/1.1 404"), "{response}");
}

#[tokio::test(flavor = "multi_thread")]
async fn e2e_health() {
    let server_addr = start_server(Duration::from_secs(10)).await;

    let response = public_request(
        server_addr,
        b"GET /health HTTP/1.1\r\nHost: localhost\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.ends_with(r#"{"ok":true}"#));
}

#[tokio::test(flavor = "multi_thread")]
async fn e2e_origin_down_is_502() {
    let server_addr = start_server(Duration::from_secs(10)).await;

    // Grab a port that nothing listens on.
    let closed_port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let tunnel = connect_client(server_addr, closed_port, "origin-down").await;
    tokio::spawn(tunnel.run());

    let response = public_request(
        server_addr,
        b"GET /ping HTTP/1.1\r\nHost: origin-down.localhost\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 502"), "{response}");
}

#[tokio::test(flavor = "multi_thread")]
async fn e2e_taken_subdomain_gets_random_label() {
    let server_addr = start_server(Duration::from_secs(10)).await;
    let origin_port = start_origin().await;

    let first = connect_client(server_addr, origin_port, "shared").await;
    assert_eq!(first.subdomain(), "shared");
    tokio::spawn(first.run());

    let second = connect_client(server_addr, origin_port, "shared").await;
    assert_ne!(second.subdomain(), "shared");
    assert_eq!(second.subdomain().len(), 7);
}

#[tokio::test(flavor = "multi_thread")]
async fn e2e_silent_tunnel_times_out_with_504() {
    let server_addr = start_server(Duration::from_millis(500)).await;

    // A tunnel client that registers and then never answers its streams.
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/connect", server_addr))
        .await
        .unwrap();
    let (mut sink, mut source) = ws.split();

    let hello = FrameCodec::encode(&Frame::Hello {
        version: PROTOCOL_VERSION,
        token: None,
    })
    .unwrap();
    sink.send(tokio_tungstenite::tungstenite::Message::Binary(hello))
        .await
        .unwrap();

    let register = FrameCodec::encode(&Frame::RegisterTunnel {
        subdomain: Some("silent1".to_string()),
    })
    .unwrap();
    sink.send(tokio_tungstenite::tungstenite::Message::Binary(register))
        .await
        .unwrap();

    // Wait for Registered, then swallow everything else.
    loop {
        match source.next().await {
            Some(Ok(tokio_tungstenite::tungstenite::Message::Binary(payload))) => {
                if matches!(FrameCodec::decode(&payload), Ok(Frame::Registered { .. })) {
                    break;
                }
            }
            other => panic!("Unexpected control message: {:?}", other),
        }
    }
    tokio::spawn(async move { while source.next().await.is_some() {} });

    let response = public_request(
        server_addr,
        b"GET / HTTP/1.1\r\nHost: silent1.localhost\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 504"), "{response}");
    assert!(response.contains(r#"{"error":"Gateway timeout"}"#));
}
