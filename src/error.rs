//! Error type shared by the protocol client, transport and playback engine.

use tokio_tungstenite::tungstenite::Error as WsError;

/// Error type for live-session operations
#[derive(Debug, thiserror::Error)]
pub enum LiveError {
    /// Transport-level failure. Non-fatal for the process; the caller decides
    /// whether to reconnect.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("Connection error: {0}")]
    Connection(String),

    /// Malformed inbound message. The session stays active.
    #[error("Failed to parse inbound message: {0}")]
    Parse(String),

    /// A send was attempted while the connection was not open.
    #[error("Connection is not ready (state: {0})")]
    NotReady(&'static str),

    #[error("Timed out waiting for connection")]
    Timeout,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Audio file error: {0}")]
    Audio(#[from] hound::Error),
}

pub type Result<T> = std::result::Result<T, LiveError>;

impl LiveError {
    /// Whether the session can keep running after this error.
    pub fn is_fatal_for_session(&self) -> bool {
        matches!(self, LiveError::WebSocket(_) | LiveError::Connection(_))
    }
}
