/// Errors that can occur in message port operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The port name is empty or contains characters that cannot appear in a
    /// socket path.
    #[error("invalid port name: {reason}: {name:?}")]
    InvalidName { name: String, reason: &'static str },

    /// Another live process already owns this port name.
    #[error("port name already in use: {name:?}")]
    NameInUse { name: String },

    /// No port with this name exists.
    #[error("no port found with name {name:?}")]
    NotFound { name: String },

    /// The socket path derived from the name is too long for the platform.
    #[error("socket path too long ({len} bytes, max {max}): {name:?}")]
    PathTooLong {
        name: String,
        len: usize,
        max: usize,
    },

    /// The peer endpoint has gone away (closed or removed).
    #[error("peer port {name:?} disconnected")]
    Disconnected { name: String },

    /// An I/O error occurred on the underlying socket.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;
