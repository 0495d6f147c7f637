//! interview-live - real-time voice client for the interview assistant
//!
//! Streams candidate audio to a conversational model behind a WebSocket
//! relay, plays the model's audio back gaplessly and runs the turn-taking,
//! interruption and tool-call protocol between the two.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod events;
pub mod live_client;
pub mod media_in;
pub mod media_out;
pub mod session;
pub mod transport;
pub mod wire;

pub use config::{LiveConfig, PlaybackConfig};
pub use error::{LiveError, Result};
pub use events::{PlaybackEvent, ProtocolEvent, SessionEvent};
pub use live_client::{ensure_connected, LiveClient, SessionState};
pub use session::{SessionController, SessionHandle, ToolCallHandler, ToolResponder};
pub use transport::{Connector, WsConnector};
