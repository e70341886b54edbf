/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The buffer is not a valid frame. A malformed inbound frame is a
    /// protocol violation to be dropped by the receiver, never a crash.
    #[error("malformed frame: {0}")]
    Malformed(&'static str),

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },
}

pub type Result<T> = std::result::Result<T, FrameError>;
