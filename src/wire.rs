//! Wire messages exchanged with the relay.
//!
//! Outbound messages use snake_case envelopes (`setup`, `realtime_input`,
//! `client_content`, `tool_response`). Inbound messages arrive camelCased
//! from the model (`setupComplete`, `serverContent`, `toolCall`) plus the
//! relay's own `authComplete` acknowledgement.

use base64::engine::general_purpose;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{LiveError, Result};

/// MIME type attached to every outbound audio chunk.
pub const AUDIO_MIME_TYPE: &str = "audio/pcm";

/// Setup handshake. The relay fills in model and generation settings.
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct Setup {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_context: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MediaChunk {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RealtimeInput {
    pub media_chunks: Vec<MediaChunk>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Turn {
    pub role: String,
    pub parts: Vec<Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ClientContent {
    pub turns: Vec<Turn>,
    pub turn_complete: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ToolResponse {
    pub function_responses: Vec<Value>,
}

/// Envelope as it appears on the wire: `{"<variant>": {...}}`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ClientEnvelope {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
    ClientContent(ClientContent),
    ToolResponse(ToolResponse),
}

/// Message sent from client to relay.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Setup { session_context: Option<Value> },
    /// Base64-encoded raw PCM
    AudioChunk { data: String },
    /// Turn-boundary marker; `complete = false` is the continue signal
    TurnSignal { complete: bool },
    /// Scripted user utterance that completes the turn
    Utterance { text: String },
    ToolResponse { results: Vec<Value> },
}

impl OutboundMessage {
    /// Wrap raw PCM bytes into an audio chunk message.
    pub fn audio(bytes: &[u8]) -> Self {
        OutboundMessage::AudioChunk {
            data: general_purpose::STANDARD.encode(bytes),
        }
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::Setup { .. } => "setup",
            OutboundMessage::AudioChunk { .. } => "audio_chunk",
            OutboundMessage::TurnSignal { complete: true } => "turn_complete",
            OutboundMessage::TurnSignal { complete: false } => "continue",
            OutboundMessage::Utterance { .. } => "utterance",
            OutboundMessage::ToolResponse { .. } => "tool_response",
        }
    }

    pub fn envelope(&self) -> ClientEnvelope {
        match self {
            OutboundMessage::Setup { session_context } => ClientEnvelope::Setup(Setup {
                session_context: session_context.clone(),
            }),
            OutboundMessage::AudioChunk { data } => ClientEnvelope::RealtimeInput(RealtimeInput {
                media_chunks: vec![MediaChunk {
                    mime_type: AUDIO_MIME_TYPE.to_string(),
                    data: data.clone(),
                }],
            }),
            OutboundMessage::TurnSignal { complete } => ClientEnvelope::ClientContent(ClientContent {
                turns: vec![Turn {
                    role: "user".to_string(),
                    parts: Vec::new(),
                }],
                turn_complete: *complete,
            }),
            OutboundMessage::Utterance { text } => ClientEnvelope::ClientContent(ClientContent {
                turns: vec![Turn {
                    role: "user".to_string(),
                    parts: vec![serde_json::json!({ "text": text })],
                }],
                turn_complete: true,
            }),
            OutboundMessage::ToolResponse { results } => ClientEnvelope::ToolResponse(ToolResponse {
                function_responses: results.clone(),
            }),
        }
    }

    /// Serialize to the JSON text frame sent on the socket.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(&self.envelope()).map_err(LiveError::Serialization)
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    #[serde(default)]
    interrupted: bool,
    model_turn: Option<ModelTurn>,
    #[serde(default)]
    turn_complete: bool,
}

#[derive(Debug, Deserialize, Default)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct Part {
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
struct InlineData {
    data: String,
}

/// One function invocation requested by the model
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub id: Option<String>,
    pub name: String,
    pub args: Value,
}

/// A tool call as delivered, with the calls it names.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    /// The `toolCall` payload exactly as received
    pub raw: Value,
    pub calls: Vec<FunctionCall>,
}

impl ToolCall {
    fn from_value(raw: Value) -> Self {
        let calls = match raw.get("functionCalls").and_then(|c| c.as_array()) {
            Some(list) => list.iter().map(function_call).collect(),
            None => vec![function_call(&raw)],
        };
        Self { raw, calls }
    }
}

fn function_call(value: &Value) -> FunctionCall {
    let name = value
        .get("name")
        .or_else(|| value.get("function_name"))
        .or_else(|| value.get("functionName"))
        .and_then(|n| n.as_str())
        .unwrap_or_default()
        .to_string();
    FunctionCall {
        id: value.get("id").and_then(|i| i.as_str()).map(str::to_string),
        name,
        args: value.get("args").cloned().unwrap_or(Value::Null),
    }
}

/// Message received from the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    AuthAck,
    SetupAck,
    ToolCall(ToolCall),
    Content {
        interrupted: bool,
        audio: Option<Vec<u8>>,
        /// Decode failure of an audio part that was present
        bad_audio: Option<String>,
        turn_complete: bool,
    },
    /// Well-formed but not something the session acts on (e.g. `goAway`)
    Other(Vec<String>),
    ParseError(String),
}

impl InboundMessage {
    /// Classify one inbound text frame. Never fails; malformed input becomes
    /// `ParseError`.
    pub fn parse(text: &str) -> Self {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => return InboundMessage::ParseError(e.to_string()),
        };
        let Some(obj) = value.as_object() else {
            return InboundMessage::ParseError("expected a JSON object".to_string());
        };

        if is_set(obj.get("authComplete")) {
            return InboundMessage::AuthAck;
        }
        if is_set(obj.get("setupComplete")) {
            return InboundMessage::SetupAck;
        }
        if let Some(tool_call) = obj.get("toolCall").filter(|v| !v.is_null()) {
            return InboundMessage::ToolCall(ToolCall::from_value(tool_call.clone()));
        }
        if let Some(content) = obj.get("serverContent") {
            return parse_server_content(content.clone());
        }

        InboundMessage::Other(obj.keys().cloned().collect())
    }
}

/// `{"setupComplete": {}}` and `{"authComplete": true}` both count, `false`
/// and `null` do not.
fn is_set(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) | Some(Value::Bool(false)) => false,
        Some(_) => true,
    }
}

fn parse_server_content(content: Value) -> InboundMessage {
    let content: ServerContent = match serde_json::from_value(content) {
        Ok(c) => c,
        Err(e) => return InboundMessage::ParseError(format!("serverContent: {}", e)),
    };

    // Audio riding along with an interruption is discarded undecoded.
    if content.interrupted {
        return InboundMessage::Content {
            interrupted: true,
            audio: None,
            bad_audio: None,
            turn_complete: content.turn_complete,
        };
    }

    let inline = content
        .model_turn
        .as_ref()
        .and_then(|turn| turn.parts.iter().find_map(|p| p.inline_data.as_ref()));

    let (audio, bad_audio) = match inline {
        Some(inline) => match general_purpose::STANDARD.decode(&inline.data) {
            Ok(bytes) => (Some(bytes), None),
            Err(e) => (None, Some(format!("inlineData: {}", e))),
        },
        None => (None, None),
    };

    InboundMessage::Content {
        interrupted: false,
        audio,
        bad_audio,
        turn_complete: content.turn_complete,
    }
}
