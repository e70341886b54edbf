//! Fixed-header wire codec for portbus frames.
//!
//! Every message exchanged over a port is one frame:
//! - A 1-byte magic (`b'C'`) for frame validation
//! - A 1-byte type: low 7 bits are the message kind, bit 7 is the broadcast
//!   flag
//! - 2 reserved bytes, written zero and ignored on read
//! - A 4-byte little-endian payload length, 0 allowed
//!
//! Payloads are opaque byte buffers; no application schema is imposed here.

pub mod codec;
pub mod error;

pub use codec::{
    decode_frame, encode_frame, Frame, MessageKind, BROADCAST_FLAG, DEFAULT_MAX_PAYLOAD,
    HEADER_SIZE, MAGIC,
};
pub use error::{FrameError, Result};
