use crate::error::LiveError;
use crate::wire::ToolCall;

/// Event raised by the protocol client while dispatching inbound messages.
#[derive(Debug)]
pub enum ProtocolEvent {
    SetupComplete,
    /// Decoded PCM16 payload of one partial model message
    AudioData(Vec<u8>),
    Interrupted,
    TurnComplete,
    ToolCall(ToolCall),
    Error(LiveError),
    Closed { reason: Option<String> },
}

/// Event exposed by the session controller to the surrounding application.
#[derive(Debug)]
pub enum SessionEvent {
    Connected,
    Disconnected { reason: Option<String> },
    Interrupted,
    TurnComplete,
    /// The playback stream drained (or was completed explicitly)
    PlaybackComplete,
    ToolCall(ToolCall),
    Error(LiveError),
}

/// Event raised by the playback scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    Complete,
}
