use std::io;

use thiserror::Error;

/// Errors surfaced by the relay, its clients and the framing layer.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed message: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
    #[error("unknown frame kind {0:#04x}")]
    UnknownFrameKind(u8),
    #[error("channel closed")]
    ChannelClosed,
    #[error("relay host unavailable")]
    HostUnavailable,
    #[error("cannot determine inspected tab")]
    TabUnresolved,
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("relay already running with pid {0}")]
    AlreadyRunning(u32),
}

impl RelayError {
    /// Transient failures are recovered by reconnecting; everything else is
    /// either terminal for the component or a caller bug.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RelayError::Io(_) | RelayError::ChannelClosed | RelayError::Handshake(_)
        )
    }
}
