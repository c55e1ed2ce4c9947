//! Wire protocol shared by the tunnel server and client.
//!
//! The control channel carries self-describing binary frames, one per
//! WebSocket message. This crate owns the frame model, the codec, and the
//! subdomain naming rules both ends agree on.

mod codec;
mod frame;
pub mod subdomain;

pub use codec::{CodecError, FrameCodec, MAX_FRAME_SIZE};
pub use frame::{Frame, Phase, ERROR_SUBDOMAIN_TAKEN, PROTOCOL_VERSION};
