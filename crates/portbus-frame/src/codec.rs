use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Frame header: magic (1) + type (1) + reserved (2) + length (4) = 8 bytes.
pub const HEADER_SIZE: usize = 8;

/// Magic byte identifying a valid frame.
pub const MAGIC: u8 = b'C';

/// Bit 7 of the type byte: requests server-side relay to all other clients.
/// Only meaningful on [`MessageKind::Message`] frames sent by a client; the
/// server never sets it.
pub const BROADCAST_FLAG: u8 = 0x80;

/// Default maximum payload size: 64 KiB (one datagram).
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024;

/// Message kind, carried in the low 7 bits of the type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    /// Client announces itself; payload is its chosen port name.
    ClientConnection = 1,
    /// Client leaves; payload is its port name.
    ClientDisconnection = 2,
    /// Application payload.
    Message = 3,
    /// Server acknowledges a client connection.
    ServerConnectionResponse = 4,
}

impl MessageKind {
    /// Parse the low 7 bits of a type byte.
    pub fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::ClientConnection),
            2 => Some(Self::ClientDisconnection),
            3 => Some(Self::Message),
            4 => Some(Self::ServerConnectionResponse),
            _ => None,
        }
    }
}

/// One decoded header-plus-payload unit.
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: MessageKind,
    pub broadcast: bool,
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(kind: MessageKind, broadcast: bool, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            broadcast,
            payload: payload.into(),
        }
    }

    /// The total wire size of this frame (header + payload).
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Encode a frame into the wire format.
pub fn encode_frame(
    kind: MessageKind,
    broadcast: bool,
    payload: &[u8],
    dst: &mut BytesMut,
    max_payload: usize,
) -> Result<()> {
    if payload.len() > max_payload || payload.len() > u32::MAX as usize {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: max_payload.min(u32::MAX as usize),
        });
    }
    let mut type_byte = kind as u8;
    if broadcast {
        type_byte |= BROADCAST_FLAG;
    }
    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_u8(MAGIC);
    dst.put_u8(type_byte);
    dst.put_u16_le(0); // reserved
    dst.put_u32_le(payload.len() as u32);
    dst.put_slice(payload);
    Ok(())
}

/// Decode one complete frame from a buffer.
///
/// Ports are message-oriented, so `buf` must hold exactly one frame: a
/// declared length disagreeing with the remaining bytes is a protocol
/// violation. Never allocates more than the declared length.
pub fn decode_frame(buf: &[u8], max_payload: usize) -> Result<Frame> {
    if buf.len() < HEADER_SIZE {
        return Err(FrameError::Malformed("truncated header"));
    }
    if buf[0] != MAGIC {
        return Err(FrameError::Malformed("bad magic byte"));
    }
    let type_byte = buf[1];
    let kind = MessageKind::from_wire(type_byte & !BROADCAST_FLAG)
        .ok_or(FrameError::Malformed("unknown message kind"))?;
    let broadcast = type_byte & BROADCAST_FLAG != 0;
    // buf[2..4] reserved, ignored on read.
    let declared = u32::from_le_bytes(buf[4..8].try_into().expect("slice is 4 bytes")) as usize;
    if declared > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: declared,
            max: max_payload,
        });
    }
    if buf.len() - HEADER_SIZE != declared {
        return Err(FrameError::Malformed("length does not match buffer"));
    }
    let payload = Bytes::copy_from_slice(&buf[HEADER_SIZE..HEADER_SIZE + declared]);
    Ok(Frame::new(kind, broadcast, payload))
}
