use portbus_frame::FrameError;
use portbus_transport::TransportError;

/// Errors that can occur in client/server bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// The operation requires a connected client.
    #[error("not connected")]
    NotConnected,

    /// A connection attempt is already active on this client.
    #[error("connection attempt already active")]
    AlreadyConnecting,

    /// Every generated client port name collided with a live port.
    #[error("exhausted {attempts} attempts to claim a client port name")]
    NameExhausted { attempts: u32 },

    /// The server is shutting down and rejects new sends.
    #[error("server is shutting down")]
    ShuttingDown,
}

pub type Result<T> = std::result::Result<T, BusError>;
