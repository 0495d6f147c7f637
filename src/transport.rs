//! WebSocket transport for one connection to the relay.
//!
//! Each connection runs in its own task which owns both halves of the
//! socket. Outbound JSON frames arrive over an unbounded channel; inbound
//! frames and lifecycle changes are reported over a second channel that
//! belongs to that connection alone. Dropping the [`Connection`] closes
//! both channels, which detaches the task and makes it close the socket.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::error::{LiveError, Result};

/// Lifecycle and data events of one connection.
#[derive(Debug)]
pub enum TransportEvent {
    Open,
    /// A JSON frame (binary frames are decoded as UTF-8)
    Text(String),
    Error(LiveError),
    Closed { reason: Option<String> },
}

/// Handle to one live connection.
#[derive(Debug)]
pub struct Connection {
    generation: u64,
    outbound: mpsc::UnboundedSender<String>,
    inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

impl Connection {
    pub fn new(
        generation: u64,
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        Self {
            generation,
            outbound,
            inbound,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Queue a text frame for the socket.
    pub fn send(&self, json: String) -> Result<()> {
        self.outbound.send(json).map_err(|_| LiveError::ChannelClosed)
    }

    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.inbound.recv().await
    }
}

/// Opens connections. The real implementation is [`WsConnector`]; tests
/// substitute in-memory ones.
pub trait Connector: Send {
    fn open(&self, url: &str, generation: u64) -> Connection;
}

/// Connector backed by `tokio-tungstenite`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn open(&self, url: &str, generation: u64) -> Connection {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_socket(url.to_string(), generation, out_rx, in_tx));
        Connection::new(generation, out_tx, in_rx)
    }
}

async fn run_socket(
    url: String,
    generation: u64,
    mut outbound: mpsc::UnboundedReceiver<String>,
    inbound: mpsc::UnboundedSender<TransportEvent>,
) {
    info!("[conn {}] Connecting to {}", generation, url);

    let ws = match connect_async(&url).await {
        Ok((ws, resp)) => {
            debug!("[conn {}] Handshake response: {:?}", generation, resp.status());
            ws
        }
        Err(e) => {
            error!("[conn {}] Connection failed: {}", generation, e);
            let reason = e.to_string();
            let _ = inbound.send(TransportEvent::Error(LiveError::WebSocket(e)));
            let _ = inbound.send(TransportEvent::Closed { reason: Some(reason) });
            return;
        }
    };

    if inbound.send(TransportEvent::Open).is_err() {
        debug!("[conn {}] Detached before open", generation);
        return;
    }

    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            out = outbound.recv() => match out {
                Some(json) => {
                    if let Err(e) = sink.send(Message::text(json)).await {
                        error!("[conn {}] Send failed: {}", generation, e);
                        let reason = e.to_string();
                        let _ = inbound.send(TransportEvent::Error(LiveError::WebSocket(e)));
                        let _ = inbound.send(TransportEvent::Closed { reason: Some(reason) });
                        break;
                    }
                }
                None => {
                    debug!("[conn {}] Detached, closing socket", generation);
                    let _ = sink.close().await;
                    break;
                }
            },
            msg = stream.next() => {
                let event = match msg {
                    Some(Ok(Message::Text(text))) => TransportEvent::Text(text.as_str().to_owned()),
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => TransportEvent::Text(text),
                        Err(_) => TransportEvent::Error(LiveError::Parse(format!(
                            "binary frame of {} bytes is not UTF-8",
                            bytes.len()
                        ))),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        info!("[conn {}] Closed by peer: {:?}", generation, frame);
                        let _ = inbound.send(TransportEvent::Closed {
                            reason: frame.map(|f| f.reason.as_str().to_owned()),
                        });
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!("[conn {}] Socket error: {}", generation, e);
                        let reason = e.to_string();
                        let _ = inbound.send(TransportEvent::Error(LiveError::WebSocket(e)));
                        let _ = inbound.send(TransportEvent::Closed { reason: Some(reason) });
                        break;
                    }
                    None => {
                        let _ = inbound.send(TransportEvent::Closed { reason: None });
                        break;
                    }
                };
                if inbound.send(event).is_err() {
                    debug!("[conn {}] Detached, dropping inbound frame", generation);
                    let _ = sink.close().await;
                    break;
                }
            }
        }
    }

    info!("[conn {}] Socket task terminated", generation);
}
