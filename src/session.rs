//! Session controller: one task that owns the protocol client, the playback
//! scheduler and the capture subscription, plus the cloneable handle the
//! application drives it with.
//!
//! Every transport event, command, capture chunk and timer is handled to
//! completion inside a single `select!` branch, so queue and clock updates
//! never interleave.

use std::fmt;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::config::{LiveConfig, PlaybackConfig};
use crate::error::{LiveError, Result};
use crate::events::{PlaybackEvent, ProtocolEvent, SessionEvent};
use crate::live_client::{self, LiveClient, SessionState};
use crate::media_in::CaptureSource;
use crate::media_out::{OutputSink, PlaybackScheduler, TapRegistry};
use crate::transport::Connector;
use crate::wire::ToolCall;

/// Receives tool calls from the model. Every call must eventually be
/// answered through its [`ToolResponder`], otherwise the model's turn never
/// resumes.
pub trait ToolCallHandler: Send {
    fn on_tool_call(&mut self, call: ToolCall, responder: ToolResponder);
}

impl<F> ToolCallHandler for F
where
    F: FnMut(ToolCall, ToolResponder) + Send,
{
    fn on_tool_call(&mut self, call: ToolCall, responder: ToolResponder) {
        self(call, responder)
    }
}

/// One-shot reply slot for a tool call.
pub struct ToolResponder {
    label: String,
    tx: mpsc::UnboundedSender<Vec<Value>>,
    answered: bool,
}

impl ToolResponder {
    fn new(call: &ToolCall, tx: mpsc::UnboundedSender<Vec<Value>>) -> Self {
        let label = call
            .calls
            .iter()
            .map(|c| c.name.as_str())
            .collect::<Vec<_>>()
            .join(",");
        Self {
            label,
            tx,
            answered: false,
        }
    }

    /// Send the function responses back to the model.
    pub fn respond(mut self, results: Vec<Value>) -> Result<()> {
        self.answered = true;
        self.tx.send(results).map_err(|_| LiveError::ChannelClosed)
    }
}

impl fmt::Debug for ToolResponder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolResponder")
            .field("call", &self.label)
            .field("answered", &self.answered)
            .finish()
    }
}

impl Drop for ToolResponder {
    fn drop(&mut self) {
        if !self.answered {
            error!(
                "Tool call [{}] dropped without a response; the model turn will stall",
                self.label
            );
        }
    }
}

/// Error responses for a tool call nobody is registered to handle.
fn unhandled_responses(call: &ToolCall) -> Vec<Value> {
    call.calls
        .iter()
        .map(|c| {
            let mut response = json!({
                "name": c.name,
                "response": {"error": "no tool handler registered"},
            });
            if let Some(id) = &c.id {
                response["id"] = json!(id);
            }
            response
        })
        .collect()
}

type Reply = oneshot::Sender<Result<()>>;

enum Command {
    Connect(Reply),
    Disconnect(Reply),
    EndTurn(Reply),
    SetMuted(bool, Reply),
    ToolResponse(Vec<Value>, Reply),
    CompletePlayback(Reply),
    Subscribe(mpsc::UnboundedSender<SessionEvent>),
    Unsubscribe,
    Shutdown(Reply),
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Connect(_) => "connect",
            Command::Disconnect(_) => "disconnect",
            Command::EndTurn(_) => "end_turn",
            Command::SetMuted(..) => "set_muted",
            Command::ToolResponse(..) => "tool_response",
            Command::CompletePlayback(_) => "complete_playback",
            Command::Subscribe(_) => "subscribe",
            Command::Unsubscribe => "unsubscribe",
            Command::Shutdown(_) => "shutdown",
        }
    }
}

/// Cloneable handle to a running [`SessionController`].
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionState>,
    taps: TapRegistry,
    config: LiveConfig,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("state", &*self.state.borrow())
            .field("taps", &self.taps)
            .finish()
    }
}

impl SessionHandle {
    async fn request(&self, make: impl FnOnce(Reply) -> Command) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| LiveError::ChannelClosed)?;
        rx.await.map_err(|_| LiveError::ChannelClosed)?
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Taps offered every frame the session schedules for playback.
    pub fn taps(&self) -> &TapRegistry {
        &self.taps
    }

    /// Start a connection attempt. Any existing connection is torn down
    /// first. Resolves once the attempt is under way, not when it is open.
    pub async fn connect(&self) -> Result<()> {
        self.request(Command::Connect).await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.request(Command::Disconnect).await
    }

    /// Tell the model the candidate finished speaking.
    pub async fn end_turn(&self) -> Result<()> {
        self.request(Command::EndTurn).await
    }

    /// Pause or resume streaming capture audio.
    pub async fn set_muted(&self, muted: bool) -> Result<()> {
        self.request(|reply| Command::SetMuted(muted, reply)).await
    }

    pub async fn send_tool_response(&self, results: Vec<Value>) -> Result<()> {
        self.request(|reply| Command::ToolResponse(results, reply)).await
    }

    /// Mark model playback finished without waiting for the queue to drain.
    pub async fn complete_playback(&self) -> Result<()> {
        self.request(Command::CompletePlayback).await
    }

    /// Stop the controller task. The task's join handle yields the sink.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(Command::Shutdown).await
    }

    /// Register the event listener, replacing any previous one.
    pub fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<SessionEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.commands
            .send(Command::Subscribe(tx))
            .map_err(|_| LiveError::ChannelClosed)?;
        Ok(rx)
    }

    /// Drop the event listener; events are discarded until the next
    /// `subscribe`.
    pub fn unsubscribe(&self) -> Result<()> {
        self.commands
            .send(Command::Unsubscribe)
            .map_err(|_| LiveError::ChannelClosed)
    }

    /// Wait until the connection is open or `limit` elapses.
    pub async fn ensure_connected(&self, limit: Duration) -> Result<()> {
        live_client::ensure_connected(self.state.clone(), limit).await
    }

    /// Connect, retrying per `reconnect_attempts` / `reconnect_delay`.
    ///
    /// This is the only retry loop in the crate and it runs on the caller's
    /// side; the controller itself never reconnects on its own.
    pub async fn connect_with_retry(&self) -> Result<()> {
        let attempts = self.config.reconnect_attempts.max(1);
        let mut last = LiveError::Timeout;
        for attempt in 1..=attempts {
            self.connect().await?;
            match self.ensure_connected(self.config.connect_timeout).await {
                Ok(()) => {
                    info!("Connected on attempt {}/{}", attempt, attempts);
                    return Ok(());
                }
                Err(e) => {
                    warn!("Connect attempt {}/{} failed: {}", attempt, attempts, e);
                    last = e;
                }
            }
            self.disconnect().await?;
            if attempt < attempts {
                tokio::time::sleep(self.config.reconnect_delay).await;
            }
        }
        Err(last)
    }
}

pub struct SessionController<S: OutputSink> {
    client: LiveClient,
    protocol_rx: mpsc::UnboundedReceiver<ProtocolEvent>,
    scheduler: PlaybackScheduler<S>,
    commands: mpsc::UnboundedReceiver<Command>,
    capture: Option<Box<dyn CaptureSource>>,
    capture_rx: Option<mpsc::Receiver<String>>,
    capturing: bool,
    muted: bool,
    tool_handler: Option<Box<dyn ToolCallHandler>>,
    tool_tx: mpsc::UnboundedSender<Vec<Value>>,
    tool_rx: mpsc::UnboundedReceiver<Vec<Value>>,
    listener: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl<S: OutputSink> SessionController<S> {
    pub fn new(
        config: LiveConfig,
        playback: PlaybackConfig,
        connector: impl Connector + 'static,
        sink: S,
    ) -> (Self, SessionHandle) {
        let taps = TapRegistry::new();
        let mut client = LiveClient::new(config.clone(), connector);
        let protocol_rx = client.subscribe();
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (tool_tx, tool_rx) = mpsc::unbounded_channel();

        let handle = SessionHandle {
            commands: command_tx,
            state: client.watch_state(),
            taps: taps.clone(),
            config,
        };

        let controller = Self {
            client,
            protocol_rx,
            scheduler: PlaybackScheduler::with_taps(playback, sink, taps),
            commands,
            capture: None,
            capture_rx: None,
            capturing: false,
            muted: false,
            tool_handler: None,
            tool_tx,
            tool_rx,
            listener: None,
        };
        (controller, handle)
    }

    /// Stream this source to the model while the session is active and
    /// not muted.
    pub fn with_capture(mut self, source: impl CaptureSource + 'static) -> Self {
        self.capture = Some(Box::new(source));
        self
    }

    pub fn with_tool_handler(mut self, handler: impl ToolCallHandler + 'static) -> Self {
        self.tool_handler = Some(Box::new(handler));
        self
    }

    /// Run until shutdown or until every handle is dropped. Returns the sink
    /// so callers can finalize it.
    pub async fn run(mut self) -> S {
        info!("Session controller started");
        let mut shutdown_reply = None;

        loop {
            let deadline = self.next_deadline();

            tokio::select! {
                event = self.client.next_transport_event() => {
                    self.client.handle_transport_event(event);
                }
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Shutdown(reply)) => {
                        shutdown_reply = Some(reply);
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        info!("All session handles dropped");
                        break;
                    }
                },
                chunk = recv_capture(&mut self.capture_rx) => match chunk {
                    Some(data) => {
                        if let Err(e) = self.client.send_audio_base64(data) {
                            self.emit(SessionEvent::Error(e));
                        }
                    }
                    None => {
                        info!("Capture source ran dry");
                        self.capture_rx = None;
                    }
                },
                Some(results) = self.tool_rx.recv() => {
                    if let Err(e) = self.client.send_tool_response(results) {
                        error!("Failed to send tool response: {}", e);
                        self.emit(SessionEvent::Error(e));
                    }
                }
                _ = sleep_until(deadline.unwrap_or_else(far_future)), if deadline.is_some() => {
                    self.client.poll_timers(Instant::now());
                    self.scheduler.on_timer();
                }
            }

            self.pump();
        }

        self.stop_capture();
        self.client.disconnect();
        info!("Session controller stopped");
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(Ok(()));
        }
        self.scheduler.into_sink()
    }

    fn handle_command(&mut self, cmd: Command) {
        debug!("Command: {}", cmd.name());
        match cmd {
            Command::Connect(reply) => {
                self.client.connect();
                let _ = reply.send(Ok(()));
            }
            Command::Disconnect(reply) => {
                let was_connected = self.client.state() != SessionState::Disconnected;
                self.client.disconnect();
                self.scheduler.stop();
                if was_connected {
                    self.emit(SessionEvent::Disconnected { reason: None });
                }
                let _ = reply.send(Ok(()));
            }
            Command::EndTurn(reply) => {
                let _ = reply.send(self.client.send_turn_signal(true));
            }
            Command::SetMuted(muted, reply) => {
                if self.muted != muted {
                    info!("Capture {}", if muted { "muted" } else { "unmuted" });
                }
                self.muted = muted;
                let _ = reply.send(Ok(()));
            }
            Command::ToolResponse(results, reply) => {
                let _ = reply.send(self.client.send_tool_response(results));
            }
            Command::CompletePlayback(reply) => {
                self.scheduler.complete();
                let _ = reply.send(Ok(()));
            }
            Command::Subscribe(tx) => self.listener = Some(tx),
            Command::Unsubscribe => self.listener = None,
            Command::Shutdown(_) => {}
        }
    }

    /// Route everything the client and scheduler produced, then bring the
    /// capture subscription in line with the new state.
    fn pump(&mut self) {
        while let Ok(event) = self.protocol_rx.try_recv() {
            self.on_protocol_event(event);
        }
        self.scheduler.poll_finished();
        for event in self.scheduler.drain_events() {
            match event {
                PlaybackEvent::Complete => self.emit(SessionEvent::PlaybackComplete),
            }
        }
        self.sync_capture();
    }

    fn on_protocol_event(&mut self, event: ProtocolEvent) {
        match event {
            ProtocolEvent::SetupComplete => self.emit(SessionEvent::Connected),
            ProtocolEvent::AudioData(pcm) => self.scheduler.add_chunk(&pcm),
            ProtocolEvent::Interrupted => {
                self.scheduler.stop();
                self.emit(SessionEvent::Interrupted);
            }
            ProtocolEvent::TurnComplete => self.emit(SessionEvent::TurnComplete),
            ProtocolEvent::ToolCall(call) => self.on_tool_call(call),
            ProtocolEvent::Error(e) => self.emit(SessionEvent::Error(e)),
            ProtocolEvent::Closed { reason } => {
                self.emit(SessionEvent::Disconnected { reason });
            }
        }
    }

    fn on_tool_call(&mut self, call: ToolCall) {
        self.emit(SessionEvent::ToolCall(call.clone()));
        match self.tool_handler.as_mut() {
            Some(handler) => {
                let responder = ToolResponder::new(&call, self.tool_tx.clone());
                handler.on_tool_call(call, responder);
            }
            None => {
                warn!("No tool handler registered, answering with an error");
                if let Err(e) = self.client.send_tool_response(unhandled_responses(&call)) {
                    self.emit(SessionEvent::Error(e));
                }
            }
        }
    }

    fn sync_capture(&mut self) {
        let want = self.client.state() == SessionState::Active && !self.muted;
        if want && !self.capturing {
            let Some(source) = self.capture.as_mut() else {
                return;
            };
            match source.subscribe() {
                Ok(rx) => {
                    info!("Capture started");
                    self.capture_rx = Some(rx);
                    self.capturing = true;
                }
                Err(e) => {
                    error!("Failed to start capture: {}", e);
                    self.capture = None;
                    self.emit(SessionEvent::Error(e));
                }
            }
        } else if !want && self.capturing {
            self.stop_capture();
        }
    }

    fn stop_capture(&mut self) {
        if let Some(source) = self.capture.as_mut() {
            source.unsubscribe();
        }
        if self.capturing {
            info!("Capture stopped");
        }
        self.capture_rx = None;
        self.capturing = false;
    }

    /// Earliest client or playback timer, on the tokio clock.
    fn next_deadline(&self) -> Option<Instant> {
        let playback = self.scheduler.next_deadline().map(|at| {
            let wait = (at - self.scheduler.sink().now()).max(0.0);
            Instant::now() + Duration::from_secs_f64(wait)
        });
        match (self.client.next_deadline(), playback) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn emit(&mut self, event: SessionEvent) {
        let Some(tx) = &self.listener else {
            debug!("No session listener, dropping {:?}", event);
            return;
        };
        if tx.send(event).is_err() {
            debug!("Session listener went away");
            self.listener = None;
        }
    }
}

async fn recv_capture(rx: &mut Option<mpsc::Receiver<String>>) -> Option<String> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(3600)
}
