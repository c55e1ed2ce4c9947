//! Codec for encoding/decoding control frames
//!
//! Frames are not length-prefixed: the WebSocket transport preserves message
//! boundaries, so one frame maps to exactly one binary message.

use crate::frame::Frame;
use thiserror::Error;

/// Maximum encoded frame size (16MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),
}

/// Control frame codec
pub struct FrameCodec;

impl FrameCodec {
    /// Encode a frame into the payload of one binary message.
    pub fn encode(frame: &Frame) -> Result<Vec<u8>, CodecError> {
        let payload = bincode::serialize(frame)?;

        if payload.len() > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(payload.len()));
        }

        Ok(payload)
    }

    /// Decode a frame from one binary message payload.
    pub fn decode(payload: &[u8]) -> Result<Frame, CodecError> {
        if payload.len() > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(payload.len()));
        }

        let frame: Frame = bincode::deserialize(payload)?;
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Phase;

    #[test]
    fn test_encode_decode() {
        let frame = Frame::Registered {
            subdomain: "myapp".to_string(),
            tunnel_id: "tunnel-1".to_string(),
        };

        let encoded = FrameCodec::encode(&frame).unwrap();
        let decoded = FrameCodec::decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_decode_garbage_is_an_error() {
        let result = FrameCodec::decode(&[0xff, 0xff, 0xff, 0xff, 0xff]);
        assert!(result.is_err());
    }

    #[test]
    fn test_decode_truncated_is_an_error() {
        let frame = Frame::End {
            tunnel_id: "tunnel-1".to_string(),
            stream_id: 9,
            phase: Phase::Res,
            status: None,
        };
        let encoded = FrameCodec::encode(&frame).unwrap();

        let result = FrameCodec::decode(&encoded[..encoded.len() - 2]);
        assert!(result.is_err());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let frame = Frame::RespData {
            tunnel_id: "tunnel-1".to_string(),
            stream_id: 1,
            chunk: vec![0u8; MAX_FRAME_SIZE + 1],
        };

        let result = FrameCodec::encode(&frame);
        assert!(matches!(result, Err(CodecError::FrameTooLarge(_))));
    }
}
