//! Control-channel frame types

use serde::{Deserialize, Serialize};

/// Protocol version carried in `Hello`. A mismatch is logged by the server
/// but does not reject the connection.
pub const PROTOCOL_VERSION: u16 = 1;

/// Error code sent when a subdomain registration loses a race.
pub const ERROR_SUBDOMAIN_TAKEN: &str = "SUBDOMAIN_TAKEN";

/// Which half of a stream an `End` frame terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// Request side: no more `ReqData` will follow.
    Req,
    /// Response side: no more `RespData` will follow; the stream is done.
    Res,
}

/// One frame on the control channel.
///
/// Headers are single-valued, case-preserved pairs. Keys are only lowercased
/// at the point of the hop-by-hop strip check, never on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Frame {
    /// First frame on every connection, client to server.
    Hello {
        version: u16,
        token: Option<String>,
    },
    /// Request a tunnel, optionally under a specific subdomain.
    RegisterTunnel {
        subdomain: Option<String>,
    },
    /// Registration accepted; the tunnel is live.
    Registered {
        subdomain: String,
        tunnel_id: String,
    },
    /// A public request arrived; open a stream for it.
    OpenStream {
        tunnel_id: String,
        stream_id: u64,
        method: String,
        path: String,
        headers: Vec<(String, String)>,
    },
    /// A chunk of the public request body.
    ReqData {
        tunnel_id: String,
        stream_id: u64,
        #[serde(with = "serde_bytes")]
        chunk: Vec<u8>,
    },
    /// Origin produced a status and headers.
    RespStart {
        tunnel_id: String,
        stream_id: u64,
        status: u16,
        headers: Option<Vec<(String, String)>>,
    },
    /// A chunk of the origin response body.
    RespData {
        tunnel_id: String,
        stream_id: u64,
        #[serde(with = "serde_bytes")]
        chunk: Vec<u8>,
    },
    /// Terminates one half of a stream.
    End {
        tunnel_id: String,
        stream_id: u64,
        phase: Phase,
        status: Option<u16>,
    },
    Error {
        code: String,
        message: Option<String>,
    },
    Ping,
    Pong,
}

// Serde helper so chunks serialize as a byte string instead of a sequence
// of individually tagged elements.
mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<u8>::deserialize(deserializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let frame = Frame::OpenStream {
            tunnel_id: "t-1".to_string(),
            stream_id: 7,
            method: "POST".to_string(),
            path: "/api/items?page=2".to_string(),
            headers: vec![("Host".to_string(), "demo.tunnel.test".to_string())],
        };

        let encoded = bincode::serialize(&frame).unwrap();
        let decoded: Frame = bincode::deserialize(&encoded).unwrap();
        assert_eq!(frame, decoded);
    }

    #[test]
    fn test_chunk_bytes_roundtrip() {
        let frame = Frame::RespData {
            tunnel_id: "t-1".to_string(),
            stream_id: 3,
            chunk: vec![0, 1, 2, 253, 254, 255],
        };

        let encoded = bincode::serialize(&frame).unwrap();
        let decoded: Frame = bincode::deserialize(&encoded).unwrap();

        if let Frame::RespData { chunk, .. } = decoded {
            assert_eq!(chunk, vec![0, 1, 2, 253, 254, 255]);
        } else {
            panic!("Expected RespData frame");
        }
    }

    #[test]
    fn test_end_phase_distinguished() {
        let req_end = Frame::End {
            tunnel_id: "t".to_string(),
            stream_id: 1,
            phase: Phase::Req,
            status: None,
        };
        let res_end = Frame::End {
            tunnel_id: "t".to_string(),
            stream_id: 1,
            phase: Phase::Res,
            status: Some(502),
        };

        let req_bytes = bincode::serialize(&req_end).unwrap();
        let res_bytes = bincode::serialize(&res_end).unwrap();
        assert_ne!(req_bytes, res_bytes);

        let back: Frame = bincode::deserialize(&res_bytes).unwrap();
        assert_eq!(back, res_end);
    }
}
