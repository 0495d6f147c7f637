//! Protocol client for the live interview session.
//!
//! The client owns at most one [`Connection`] and runs the handshake,
//! dispatch and turn-taking rules on top of it. It never blocks and never
//! spawns: the owner feeds it transport events in delivery order
//! (`handle_transport_event`) and fires its timers (`poll_timers`), which
//! keeps every state mutation inside one task.
//!
//! ```text
//! Disconnected --connect()--> Connecting --Open/send setup--> AwaitingSetupAck
//!      ^                                                           |
//!      +------------- Closed / disconnect() ---- Active <--SetupAck-+
//! ```

use std::fmt;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::LiveConfig;
use crate::error::{LiveError, Result};
use crate::events::ProtocolEvent;
use crate::transport::{Connection, Connector, TransportEvent};
use crate::wire::{InboundMessage, OutboundMessage};

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    AwaitingSetupAck,
    Active,
}

impl SessionState {
    pub fn name(self) -> &'static str {
        match self {
            SessionState::Disconnected => "Disconnected",
            SessionState::Connecting => "Connecting",
            SessionState::AwaitingSetupAck => "AwaitingSetupAck",
            SessionState::Active => "Active",
        }
    }

    /// Whether the socket is open (setup may still be pending).
    pub fn is_open(self) -> bool {
        matches!(self, SessionState::AwaitingSetupAck | SessionState::Active)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Scripted opening utterance, armed once per session on entering Active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Opener {
    Pending { due: Instant },
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Disconnected,
    Connecting,
    /// Setup has been sent on this connection; it is never sent again.
    AwaitingSetupAck,
    Active { opener: Opener },
}

impl Phase {
    fn state(self) -> SessionState {
        match self {
            Phase::Disconnected => SessionState::Disconnected,
            Phase::Connecting => SessionState::Connecting,
            Phase::AwaitingSetupAck => SessionState::AwaitingSetupAck,
            Phase::Active { .. } => SessionState::Active,
        }
    }
}

pub struct LiveClient {
    config: LiveConfig,
    connector: Box<dyn Connector>,
    conn: Option<Connection>,
    phase: Phase,
    next_generation: u64,
    state_tx: watch::Sender<SessionState>,
    listener: Option<mpsc::UnboundedSender<ProtocolEvent>>,
}

impl fmt::Debug for LiveClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveClient")
            .field("url", &self.config.url)
            .field("phase", &self.phase)
            .field("generation", &self.conn.as_ref().map(|c| c.generation()))
            .finish()
    }
}

impl LiveClient {
    pub fn new(config: LiveConfig, connector: impl Connector + 'static) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        Self {
            config,
            connector: Box::new(connector),
            conn: None,
            phase: Phase::Disconnected,
            next_generation: 1,
            state_tx,
            listener: None,
        }
    }

    pub fn config(&self) -> &LiveConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.phase.state()
    }

    /// Receiver that follows every state change; used by `ensure_connected`.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Generation of the current connection, if any.
    pub fn generation(&self) -> Option<u64> {
        self.conn.as_ref().map(|c| c.generation())
    }

    /// Register the single event listener, replacing any previous one.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ProtocolEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.listener.replace(tx).is_some() {
            debug!("Replacing existing protocol listener");
        }
        rx
    }

    pub fn unsubscribe(&mut self) {
        self.listener = None;
    }

    /// Open a new connection. An existing one is torn down first.
    pub fn connect(&mut self) {
        if self.conn.is_some() {
            warn!("connect() called while {}, tearing down first", self.state());
            self.disconnect();
        }

        let generation = self.next_generation;
        self.next_generation += 1;

        info!("Connecting to {} (generation {})", self.config.url, generation);
        self.conn = Some(self.connector.open(&self.config.url, generation));
        self.set_phase(Phase::Connecting);
    }

    /// Detach from the current connection. Idempotent.
    ///
    /// Dropping the [`Connection`] closes its event channel, so nothing the
    /// old socket delivers afterwards can reach this client.
    pub fn disconnect(&mut self) {
        if let Some(conn) = self.conn.take() {
            info!("Disconnecting generation {}", conn.generation());
            drop(conn);
        }
        self.set_phase(Phase::Disconnected);
    }

    /// Next event from the current connection; pending forever when there is
    /// none.
    pub async fn next_transport_event(&mut self) -> TransportEvent {
        match self.conn.as_mut() {
            Some(conn) => conn.recv().await.unwrap_or(TransportEvent::Closed {
                reason: Some("transport task ended".to_string()),
            }),
            None => std::future::pending().await,
        }
    }

    pub fn send_audio_chunk(&mut self, pcm: &[u8]) -> Result<()> {
        self.send(OutboundMessage::audio(pcm))
    }

    /// Send audio that is already base64 encoded (as capture sources deliver it).
    pub fn send_audio_base64(&mut self, data: String) -> Result<()> {
        self.send(OutboundMessage::AudioChunk { data })
    }

    /// `complete = true` ends the user's turn; `false` is the continue signal.
    pub fn send_turn_signal(&mut self, complete: bool) -> Result<()> {
        self.send(OutboundMessage::TurnSignal { complete })
    }

    pub fn send_tool_response(&mut self, results: Vec<Value>) -> Result<()> {
        self.send(OutboundMessage::ToolResponse { results })
    }

    pub fn send_utterance(&mut self, text: impl Into<String>) -> Result<()> {
        self.send(OutboundMessage::Utterance { text: text.into() })
    }

    fn send(&mut self, msg: OutboundMessage) -> Result<()> {
        let state = self.state();
        if state != SessionState::Active {
            warn!("Cannot send {}: connection is {}", msg.kind(), state);
            return Err(LiveError::NotReady(state.name()));
        }
        self.transmit(&msg)
    }

    fn transmit(&mut self, msg: &OutboundMessage) -> Result<()> {
        let conn = self
            .conn
            .as_ref()
            .ok_or(LiveError::NotReady(SessionState::Disconnected.name()))?;
        let json = msg.to_json()?;
        debug!("-> {} ({} bytes)", msg.kind(), json.len());
        conn.send(json)
    }

    /// Apply one event from the current connection.
    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Open => self.on_open(),
            TransportEvent::Text(text) => self.dispatch(InboundMessage::parse(&text)),
            TransportEvent::Error(e) => {
                error!("Transport error: {}", e);
                self.emit(ProtocolEvent::Error(e));
            }
            TransportEvent::Closed { reason } => {
                info!("Connection closed: {:?}", reason);
                self.conn = None;
                self.set_phase(Phase::Disconnected);
                self.emit(ProtocolEvent::Closed { reason });
            }
        }
    }

    fn on_open(&mut self) {
        if self.phase != Phase::Connecting {
            warn!("Ignoring open event while {}", self.state());
            return;
        }

        let setup = OutboundMessage::Setup {
            session_context: self.config.session_context.clone(),
        };
        info!("Connection open, sending setup");
        if let Err(e) = self.transmit(&setup) {
            error!("Failed to send setup: {}", e);
            self.conn = None;
            self.set_phase(Phase::Disconnected);
            self.emit(ProtocolEvent::Error(e));
            self.emit(ProtocolEvent::Closed {
                reason: Some("setup could not be sent".to_string()),
            });
            return;
        }
        self.set_phase(Phase::AwaitingSetupAck);
    }

    fn dispatch(&mut self, msg: InboundMessage) {
        match msg {
            InboundMessage::AuthAck => info!("Relay authentication complete"),
            InboundMessage::SetupAck => self.on_setup_ack(),
            InboundMessage::ToolCall(call) => {
                info!("Tool call: {:?}", call.calls.iter().map(|c| &c.name).collect::<Vec<_>>());
                self.emit(ProtocolEvent::ToolCall(call));
            }
            InboundMessage::Content {
                interrupted: true, ..
            } => {
                info!("Model interrupted");
                self.emit(ProtocolEvent::Interrupted);
            }
            InboundMessage::Content {
                audio,
                bad_audio,
                turn_complete,
                ..
            } => {
                let carried_audio = audio.is_some() || bad_audio.is_some();
                if let Some(pcm) = audio {
                    debug!("<- audio ({} bytes)", pcm.len());
                    self.emit(ProtocolEvent::AudioData(pcm));
                }
                if let Some(reason) = bad_audio {
                    warn!("Undecodable audio part: {}", reason);
                    self.emit(ProtocolEvent::Error(LiveError::Parse(reason)));
                }
                if carried_audio && !turn_complete {
                    if let Err(e) = self.send_turn_signal(false) {
                        error!("Failed to send continue signal: {}", e);
                        self.emit(ProtocolEvent::Error(e));
                    }
                }
                if turn_complete {
                    info!("Model turn complete");
                    self.emit(ProtocolEvent::TurnComplete);
                }
            }
            InboundMessage::Other(keys) => debug!("Ignoring message with keys {:?}", keys),
            InboundMessage::ParseError(reason) => {
                warn!("Malformed inbound message: {}", reason);
                self.emit(ProtocolEvent::Error(LiveError::Parse(reason)));
            }
        }
    }

    fn on_setup_ack(&mut self) {
        match self.phase {
            Phase::AwaitingSetupAck => {
                let opener = match &self.config.opening_prompt {
                    Some(_) => Opener::Pending {
                        due: Instant::now() + self.config.opening_delay,
                    },
                    None => Opener::Done,
                };
                info!("Setup complete, session active");
                self.set_phase(Phase::Active { opener });
                self.emit(ProtocolEvent::SetupComplete);
            }
            Phase::Active { .. } => warn!("Duplicate setup acknowledgement ignored"),
            _ => warn!("Setup acknowledgement while {}, ignored", self.state()),
        }
    }

    /// Earliest instant at which `poll_timers` has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.phase {
            Phase::Active {
                opener: Opener::Pending { due },
            } => Some(due),
            _ => None,
        }
    }

    pub fn poll_timers(&mut self, now: Instant) {
        let Phase::Active {
            opener: Opener::Pending { due },
        } = self.phase
        else {
            return;
        };
        if now < due {
            return;
        }

        self.phase = Phase::Active { opener: Opener::Done };
        if let Some(prompt) = self.config.opening_prompt.clone() {
            info!("Sending opening prompt");
            if let Err(e) = self.send_utterance(prompt) {
                error!("Failed to send opening prompt: {}", e);
                self.emit(ProtocolEvent::Error(e));
            }
        }
    }

    fn set_phase(&mut self, phase: Phase) {
        let before = self.phase.state();
        self.phase = phase;
        let after = phase.state();
        if before != after {
            debug!("State {} -> {}", before, after);
            self.state_tx.send_replace(after);
        }
    }

    fn emit(&mut self, event: ProtocolEvent) {
        let Some(tx) = &self.listener else {
            debug!("No protocol listener, dropping {:?}", event);
            return;
        };
        if tx.send(event).is_err() {
            debug!("Protocol listener went away");
            self.listener = None;
        }
    }
}

/// Wait until the connection observed through `state` is open.
///
/// Fails with `Connection` if a connect attempt falls back to Disconnected and
/// with `Timeout` once `limit` elapses. The receiver is consumed, so nothing
/// stays registered on either path.
pub async fn ensure_connected(
    mut state: watch::Receiver<SessionState>,
    limit: Duration,
) -> Result<()> {
    let wait = async move {
        let mut attempting = false;
        loop {
            let current = *state.borrow_and_update();
            match current {
                s if s.is_open() => return Ok(()),
                SessionState::Connecting => attempting = true,
                _ if attempting => {
                    return Err(LiveError::Connection(
                        "connection closed before opening".to_string(),
                    ))
                }
                _ => {}
            }
            if state.changed().await.is_err() {
                return Err(LiveError::ChannelClosed);
            }
        }
    };

    tokio::time::timeout(limit, wait)
        .await
        .map_err(|_| LiveError::Timeout)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose;
    use base64::Engine;
    use crate::transport::fake::{FakeConnector, FakePeer};
    use serde_json::json;

    fn text(value: Value) -> TransportEvent {
        TransportEvent::Text(value.to_string())
    }

    fn audio_message(bytes: &[u8], turn_complete: bool) -> TransportEvent {
        text(json!({
            "serverContent": {
                "modelTurn": {"parts": [{"inlineData": {"data": general_purpose::STANDARD.encode(bytes)}}]},
                "turnComplete": turn_complete,
            }
        }))
    }

    fn is_continue(frame: &Value) -> bool {
        frame["client_content"]["turn_complete"] == json!(false)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ProtocolEvent>) -> Vec<ProtocolEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn active_client(
        config: LiveConfig,
    ) -> (LiveClient, FakePeer, mpsc::UnboundedReceiver<ProtocolEvent>) {
        let connector = FakeConnector::default();
        let mut client = LiveClient::new(config, connector.clone());
        let mut events = client.subscribe();
        client.connect();
        let mut peer = connector.take_peer();
        client.handle_transport_event(TransportEvent::Open);
        client.handle_transport_event(text(json!({"setupComplete": {}})));
        assert_eq!(client.state(), SessionState::Active);
        peer.sent_frames();
        drain(&mut events);
        (client, peer, events)
    }

    #[test]
    fn test_handshake_sends_setup_once() {
        let connector = FakeConnector::default();
        let config = LiveConfig {
            session_context: Some(json!({"interview_id": "iv-7"})),
            ..LiveConfig::default()
        };
        let mut client = LiveClient::new(config, connector.clone());
        let mut events = client.subscribe();

        client.connect();
        assert_eq!(client.state(), SessionState::Connecting);
        let mut peer = connector.take_peer();

        client.handle_transport_event(TransportEvent::Open);
        client.handle_transport_event(TransportEvent::Open);
        assert_eq!(client.state(), SessionState::AwaitingSetupAck);

        let frames = peer.sent_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["setup"]["session_context"]["interview_id"], "iv-7");

        client.handle_transport_event(text(json!({"authComplete": true})));
        assert_eq!(client.state(), SessionState::AwaitingSetupAck);

        client.handle_transport_event(text(json!({"setupComplete": {}})));
        assert_eq!(client.state(), SessionState::Active);
        assert!(matches!(drain(&mut events)[..], [ProtocolEvent::SetupComplete]));
    }

    #[test]
    fn test_sends_before_active_are_not_ready() {
        let connector = FakeConnector::default();
        let mut client = LiveClient::new(LiveConfig::default(), connector.clone());

        assert!(matches!(
            client.send_audio_chunk(&[0, 0]),
            Err(LiveError::NotReady("Disconnected"))
        ));

        client.connect();
        client.handle_transport_event(TransportEvent::Open);
        assert!(matches!(
            client.send_turn_signal(true),
            Err(LiveError::NotReady("AwaitingSetupAck"))
        ));
        assert!(matches!(
            client.send_tool_response(vec![]),
            Err(LiveError::NotReady("AwaitingSetupAck"))
        ));
    }

    #[test]
    fn test_active_sends_audio_envelope() {
        let (mut client, mut peer, _events) = active_client(LiveConfig::default());
        client.send_audio_chunk(&[1, 2]).unwrap();
        client.send_audio_base64("AAA=".into()).unwrap();
        client.send_turn_signal(true).unwrap();

        let frames = peer.sent_frames();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0]["realtime_input"]["media_chunks"][0]["mime_type"], "audio/pcm");
        assert_eq!(frames[1]["realtime_input"]["media_chunks"][0]["data"], "AAA=");
        assert_eq!(frames[2]["client_content"]["turn_complete"], true);
    }

    #[test]
    fn test_partial_audio_sends_exactly_one_continue() {
        let (mut client, mut peer, mut events) = active_client(LiveConfig::default());

        for i in 0..3u8 {
            client.handle_transport_event(audio_message(&[i, 0], false));
            let frames = peer.sent_frames();
            assert_eq!(frames.len(), 1);
            assert!(is_continue(&frames[0]));
        }

        let events = drain(&mut events);
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[2], ProtocolEvent::AudioData(pcm) if pcm == &vec![2, 0]));
    }

    #[test]
    fn test_final_audio_completes_turn_without_continue() {
        let (mut client, mut peer, mut events) = active_client(LiveConfig::default());

        client.handle_transport_event(audio_message(&[9, 9], true));
        assert!(peer.sent_frames().is_empty());

        let events = drain(&mut events);
        assert!(matches!(
            &events[..],
            [ProtocolEvent::AudioData(_), ProtocolEvent::TurnComplete]
        ));

        client.handle_transport_event(text(json!({"serverContent": {"turnComplete": true}})));
        assert!(peer.sent_frames().is_empty());
    }

    #[test]
    fn test_interruption_takes_priority_over_audio() {
        let (mut client, mut peer, mut events) = active_client(LiveConfig::default());

        client.handle_transport_event(text(json!({
            "serverContent": {
                "interrupted": true,
                "modelTurn": {"parts": [{"inlineData": {"data": "AAA="}}]},
            }
        })));

        assert!(peer.sent_frames().is_empty());
        assert!(matches!(drain(&mut events)[..], [ProtocolEvent::Interrupted]));
    }

    #[test]
    fn test_interruption_wins_over_undecodable_audio() {
        let (mut client, mut peer, mut events) = active_client(LiveConfig::default());

        client.handle_transport_event(text(json!({
            "serverContent": {
                "interrupted": true,
                "modelTurn": {"parts": [{"inlineData": {"data": "%%%"}}]},
            }
        })));

        assert_eq!(client.state(), SessionState::Active);
        assert!(peer.sent_frames().is_empty());
        assert!(matches!(drain(&mut events)[..], [ProtocolEvent::Interrupted]));
    }

    #[test]
    fn test_undecodable_audio_still_completes_turn() {
        let (mut client, mut peer, mut events) = active_client(LiveConfig::default());

        client.handle_transport_event(text(json!({
            "serverContent": {
                "modelTurn": {"parts": [{"inlineData": {"data": "%%%"}}]},
                "turnComplete": true,
            }
        })));
        assert!(peer.sent_frames().is_empty());
        assert!(matches!(
            drain(&mut events)[..],
            [ProtocolEvent::Error(LiveError::Parse(_)), ProtocolEvent::TurnComplete]
        ));

        // Mid-turn, the continue signal still goes out.
        client.handle_transport_event(text(json!({
            "serverContent": {"modelTurn": {"parts": [{"inlineData": {"data": "%%%"}}]}}
        })));
        let frames = peer.sent_frames();
        assert_eq!(frames.len(), 1);
        assert!(is_continue(&frames[0]));
        assert!(matches!(
            drain(&mut events)[..],
            [ProtocolEvent::Error(LiveError::Parse(_))]
        ));
    }

    #[test]
    fn test_failed_setup_send_returns_to_disconnected() {
        let connector = FakeConnector::default();
        let mut client = LiveClient::new(LiveConfig::default(), connector.clone());
        let mut events = client.subscribe();
        client.connect();
        // Dropping the peer closes the outbound side of the connection.
        drop(connector.take_peer());

        client.handle_transport_event(TransportEvent::Open);
        assert_eq!(client.state(), SessionState::Disconnected);
        assert_eq!(client.generation(), None);
        assert!(matches!(
            drain(&mut events)[..],
            [ProtocolEvent::Error(_), ProtocolEvent::Closed { .. }]
        ));
    }

    #[test]
    fn test_tool_call_is_forwarded() {
        let (mut client, _peer, mut events) = active_client(LiveConfig::default());
        client.handle_transport_event(text(json!({
            "toolCall": {"function_name": "save_answer", "args": {"score": 4}}
        })));

        match &drain(&mut events)[..] {
            [ProtocolEvent::ToolCall(call)] => {
                assert_eq!(call.calls[0].name, "save_answer");
                assert_eq!(call.raw["args"]["score"], 4);
            }
            other => panic!("Unexpected events: {:?}", other),
        }
    }

    #[test]
    fn test_parse_error_keeps_session_active() {
        let (mut client, _peer, mut events) = active_client(LiveConfig::default());
        client.handle_transport_event(TransportEvent::Text("{nope".into()));

        assert_eq!(client.state(), SessionState::Active);
        assert!(matches!(
            drain(&mut events)[..],
            [ProtocolEvent::Error(LiveError::Parse(_))]
        ));
    }

    #[test]
    fn test_opening_prompt_sent_once_after_delay() {
        let config = LiveConfig {
            opening_prompt: Some("Olá, vamos começar?".into()),
            ..LiveConfig::default()
        };
        let (mut client, mut peer, _events) = active_client(config);

        let due = client.next_deadline().expect("opener armed");
        client.poll_timers(due - Duration::from_millis(1));
        assert!(peer.sent_frames().is_empty());

        // A repeated acknowledgement neither re-arms nor resends.
        client.handle_transport_event(text(json!({"setupComplete": {}})));
        assert_eq!(client.next_deadline(), Some(due));

        client.poll_timers(due);
        let frames = peer.sent_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(
            frames[0]["client_content"]["turns"][0]["parts"][0]["text"],
            "Olá, vamos começar?"
        );
        assert_eq!(client.next_deadline(), None);

        client.handle_transport_event(text(json!({"setupComplete": {}})));
        client.poll_timers(due + Duration::from_secs(5));
        assert!(peer.sent_frames().is_empty());
    }

    #[test]
    fn test_close_returns_to_disconnected() {
        let (mut client, _peer, mut events) = active_client(LiveConfig::default());
        client.handle_transport_event(TransportEvent::Closed {
            reason: Some("going away".into()),
        });

        assert_eq!(client.state(), SessionState::Disconnected);
        assert_eq!(client.generation(), None);
        assert!(matches!(
            &drain(&mut events)[..],
            [ProtocolEvent::Closed { reason: Some(r) }] if r == "going away"
        ));
    }

    #[test]
    fn test_disconnect_detaches_old_connection() {
        let connector = FakeConnector::default();
        let mut client = LiveClient::new(LiveConfig::default(), connector.clone());
        client.connect();
        let old_peer = connector.take_peer();
        let first_gen = old_peer.generation;

        client.disconnect();
        client.disconnect();
        assert_eq!(client.state(), SessionState::Disconnected);
        assert!(old_peer.events.send(TransportEvent::Open).is_err());

        client.connect();
        let second_gen = connector.take_peer().generation;
        assert!(second_gen > first_gen);
        assert_eq!(client.generation(), Some(second_gen));
    }

    #[test]
    fn test_connect_while_connected_tears_down_first() {
        let connector = FakeConnector::default();
        let mut client = LiveClient::new(LiveConfig::default(), connector.clone());
        client.connect();
        client.connect();

        let first = connector.take_peer();
        assert!(first.events.send(TransportEvent::Open).is_err());
        assert_eq!(client.state(), SessionState::Connecting);
    }

    #[tokio::test]
    async fn test_next_transport_event_reads_current_connection() {
        let connector = FakeConnector::default();
        let mut client = LiveClient::new(LiveConfig::default(), connector.clone());
        client.connect();
        let peer = connector.take_peer();

        peer.events.send(TransportEvent::Open).unwrap();
        assert!(matches!(client.next_transport_event().await, TransportEvent::Open));

        drop(peer);
        assert!(matches!(
            client.next_transport_event().await,
            TransportEvent::Closed { reason: Some(_) }
        ));
    }

    #[tokio::test]
    async fn test_ensure_connected_resolves_on_open() {
        let connector = FakeConnector::default();
        let mut client = LiveClient::new(LiveConfig::default(), connector.clone());
        client.connect();

        let waiter = tokio::spawn(ensure_connected(client.watch_state(), Duration::from_secs(5)));
        tokio::task::yield_now().await;
        client.handle_transport_event(TransportEvent::Open);

        waiter.await.unwrap().unwrap();
        // Already open resolves immediately.
        ensure_connected(client.watch_state(), Duration::from_millis(10))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_ensure_connected_times_out() {
        let connector = FakeConnector::default();
        let mut client = LiveClient::new(LiveConfig::default(), connector.clone());
        client.connect();

        let result = ensure_connected(client.watch_state(), Duration::from_millis(20)).await;
        assert!(matches!(result, Err(LiveError::Timeout)));
    }

    #[tokio::test]
    async fn test_ensure_connected_fails_when_attempt_closes() {
        let connector = FakeConnector::default();
        let mut client = LiveClient::new(LiveConfig::default(), connector.clone());
        client.connect();

        let waiter = tokio::spawn(ensure_connected(client.watch_state(), Duration::from_secs(5)));
        tokio::task::yield_now().await;
        client.handle_transport_event(TransportEvent::Closed { reason: None });

        assert!(matches!(waiter.await.unwrap(), Err(LiveError::Connection(_))));
    }
}
