//! Gemini Live API wire protocol
//!
//! Message types exchanged over the `BidiGenerateContent` WebSocket, the client
//! configuration and the crate error type.

use crate::events::{ControlMessage, FunctionCall, InboundEvent, OutboundChunk};
use crate::tools::ToolDeclaration;
use base64::engine::general_purpose;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::{debug, warn};

/// Default Live endpoint; the API key is appended as a query parameter.
pub const DEFAULT_WS_URL: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1alpha.GenerativeService.BidiGenerateContent";

/// Error type for the live session engine
#[derive(Debug, thiserror::Error)]
pub enum LiveError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("session is not connected")]
    NotConnected,

    #[error("a session is already active on this client")]
    SessionActive,

    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("malformed server frame: {0}")]
    ProtocolDecode(String),

    #[error("no handler registered for function `{0}`")]
    UnroutableToolCall(String),

    #[error("invalid arguments for `{name}`: {reason}")]
    InvalidArguments { name: String, reason: String },

    #[error("handler for `{name}` failed: {message}")]
    Handler { name: String, message: String },

    #[error("handler for `{name}` did not finish within {timeout:?}")]
    HandlerTimeout { name: String, timeout: Duration },

    #[error("tool `{0}` is already registered")]
    DuplicateTool(String),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("frame encoding error: {0}")]
    Encode(#[from] image::ImageError),

    #[error("configuration error: {0}")]
    Config(String),
}

impl LiveError {
    /// Error code reported to the model in a failed function response.
    pub fn tool_error_code(&self) -> &'static str {
        match self {
            Self::UnroutableToolCall(_) => "UNROUTABLE",
            Self::InvalidArguments { .. } => "INVALID_ARGUMENTS",
            Self::HandlerTimeout { .. } => "HANDLER_TIMEOUT",
            _ => "HANDLER_FAILED",
        }
    }
}

pub type Result<T> = std::result::Result<T, LiveError>;

/// Response modality options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseModality {
    Text,
    Audio,
}

impl ResponseModality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Audio => "AUDIO",
        }
    }
}

impl std::str::FromStr for ResponseModality {
    type Err = LiveError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "audio" => Ok(Self::Audio),
            other => Err(LiveError::Config(format!("unknown response modality `{other}`"))),
        }
    }
}

/// Media resolution options for video input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaResolution {
    Low,
    Medium,
    High,
}

impl MediaResolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "MEDIA_RESOLUTION_LOW",
            Self::Medium => "MEDIA_RESOLUTION_MEDIUM",
            Self::High => "MEDIA_RESOLUTION_HIGH",
        }
    }
}

/// Configuration for a live session. Fixed once the session is connected.
#[derive(Debug, Clone)]
pub struct LiveConfig {
    /// Full WebSocket URL including the `key` query parameter.
    pub url: String,
    pub model: String,
    pub response_modality: ResponseModality,
    /// Prebuilt voice used for audio responses.
    pub voice: Option<String>,
    pub system_instruction: Option<String>,
    pub temperature: Option<f32>,
    pub media_resolution: Option<MediaResolution>,
    /// Declare the built-in Google Search tool next to the function tools.
    pub google_search: bool,
    pub input_transcription: bool,
    pub output_transcription: bool,
    /// Function declarations sent with the setup frame.
    pub tools: Vec<ToolDeclaration>,
    pub setup_timeout: Duration,
    pub reconnect_attempts: usize,
    pub reconnect_delay: Duration,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            model: "models/gemini-2.0-flash-exp".to_string(),
            response_modality: ResponseModality::Audio,
            voice: Some("Aoede".to_string()),
            system_instruction: None,
            temperature: None,
            media_resolution: None,
            google_search: false,
            input_transcription: false,
            output_transcription: false,
            tools: Vec::new(),
            setup_timeout: Duration::from_secs(10),
            reconnect_attempts: 3,
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

impl LiveConfig {
    /// Create a configuration for the default endpoint from an API key.
    pub fn from_api_key(api_key: &str) -> Self {
        Self {
            url: format!("{DEFAULT_WS_URL}?key={api_key}"),
            ..Default::default()
        }
    }

    /// Build a configuration from `GEMINI_*` environment variables.
    ///
    /// `GEMINI_API_KEY` is required unless `GEMINI_WS_URL` supplies a complete URL.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var("GEMINI_WS_URL") {
            Ok(url) => Self {
                url,
                ..Default::default()
            },
            Err(_) => {
                let key = std::env::var("GEMINI_API_KEY")
                    .map_err(|_| LiveError::Config("set GEMINI_API_KEY in the environment or .env".into()))?;
                Self::from_api_key(&key)
            }
        };
        if let Ok(model) = std::env::var("GEMINI_MODEL") {
            config.model = model;
        }
        if let Ok(voice) = std::env::var("GEMINI_VOICE") {
            config.voice = Some(voice).filter(|v| !v.is_empty());
        }
        if let Ok(modality) = std::env::var("GEMINI_RESPONSE_MODALITY") {
            config.response_modality = modality.parse()?;
        }
        Ok(config)
    }

    /// Build the setup frame for this configuration.
    pub fn setup_message(&self) -> BidiGenerateContentSetup {
        let speech_config = match (self.response_modality, &self.voice) {
            (ResponseModality::Audio, Some(voice)) => Some(SpeechConfig {
                voice_config: VoiceConfig {
                    prebuilt_voice_config: PrebuiltVoiceConfig {
                        voice_name: voice.clone(),
                    },
                },
            }),
            _ => None,
        };

        let mut tools = Vec::new();
        if self.google_search {
            tools.push(Tool {
                google_search: Some(serde_json::json!({})),
                function_declarations: Vec::new(),
            });
        }
        if !self.tools.is_empty() {
            tools.push(Tool {
                google_search: None,
                function_declarations: self.tools.clone(),
            });
        }

        BidiGenerateContentSetup {
            model: self.model.clone(),
            generation_config: Some(GenerationConfig {
                response_modalities: vec![self.response_modality.as_str().to_string()],
                temperature: self.temperature,
                media_resolution: self.media_resolution.map(|r| r.as_str().to_string()),
                speech_config,
            }),
            system_instruction: self.system_instruction.as_ref().map(|text| Content {
                role: None,
                parts: vec![Part { text: text.clone() }],
            }),
            tools,
            input_audio_transcription: self.input_transcription.then(|| serde_json::json!({})),
            output_audio_transcription: self.output_transcription.then(|| serde_json::json!({})),
        }
    }
}

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

/// Message sent from client to server.
#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(BidiGenerateContentSetup),
    ClientContent(ClientContent),
    RealtimeInput(RealtimeInput),
    ToolResponse(ToolResponse),
}

/// Session setup message.
#[derive(Debug, Serialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BidiGenerateContentSetup {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Tool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<serde_json::Value>,
}

/// Generation configuration for setup.
#[derive(Debug, Serialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_resolution: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Serialize, Clone)]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub parts: Vec<Part>,
}

#[derive(Debug, Serialize, Clone)]
pub struct Part {
    pub text: String,
}

/// One entry of the setup `tools` list.
#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub google_search: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub function_declarations: Vec<ToolDeclaration>,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ClientContent {
    pub turns: Vec<Content>,
    pub turn_complete: bool,
}

/// A batch of realtime media (audio/video) or a stream marker.
#[derive(Debug, Serialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub media_chunks: Vec<Blob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_stream_end: Option<bool>,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    /// Base64 payload
    pub data: String,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub function_responses: Vec<FunctionResponse>,
}

/// Answer to a single function call.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct FunctionResponse {
    pub id: String,
    pub response: serde_json::Value,
}

impl FunctionResponse {
    pub fn success(id: impl Into<String>, output: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            response: serde_json::json!({ "output": output }),
        }
    }

    pub fn failure(id: impl Into<String>, error: &LiveError) -> Self {
        Self {
            id: id.into(),
            response: serde_json::json!({
                "error": {
                    "code": error.tool_error_code(),
                    "message": error.to_string(),
                }
            }),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.response.get("error").is_some()
    }
}

impl From<OutboundChunk> for ClientMessage {
    fn from(chunk: OutboundChunk) -> Self {
        match chunk {
            OutboundChunk::AudioChunk(media) | OutboundChunk::VideoFrame(media) => {
                ClientMessage::RealtimeInput(RealtimeInput {
                    media_chunks: vec![Blob {
                        mime_type: media.mime_type,
                        data: general_purpose::STANDARD.encode(&media.data),
                    }],
                    audio_stream_end: None,
                })
            }
            OutboundChunk::ToolResponse(function_responses) => {
                ClientMessage::ToolResponse(ToolResponse { function_responses })
            }
            OutboundChunk::Control(ControlMessage::ClientText(text)) => {
                ClientMessage::ClientContent(ClientContent {
                    turns: vec![Content {
                        role: Some("user".to_string()),
                        parts: vec![Part { text }],
                    }],
                    turn_complete: true,
                })
            }
            OutboundChunk::Control(ControlMessage::AudioStreamEnd) => {
                ClientMessage::RealtimeInput(RealtimeInput {
                    media_chunks: Vec::new(),
                    audio_stream_end: Some(true),
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

/// Server -> client messages. Exactly one field is populated per frame.
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    pub setup_complete: Option<serde_json::Value>,
    pub server_content: Option<ServerContent>,
    pub tool_call: Option<ToolCallFrame>,
    pub tool_call_cancellation: Option<ToolCallCancellationFrame>,
    pub go_away: Option<GoAwayFrame>,
    pub error: Option<ErrorFrame>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    pub model_turn: Option<ModelTurn>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
    pub input_transcription: Option<Transcription>,
    pub output_transcription: Option<Transcription>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<ServerPart>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerPart {
    pub text: Option<String>,
    pub inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    #[serde(default)]
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Deserialize)]
pub struct Transcription {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallFrame {
    #[serde(default)]
    pub function_calls: Vec<FunctionCall>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ToolCallCancellationFrame {
    #[serde(default)]
    pub ids: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GoAwayFrame {
    pub time_left: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ErrorFrame {
    #[serde(default)]
    pub message: String,
}

impl ServerMessage {
    /// Parse one wire frame.
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| LiveError::ProtocolDecode(e.to_string()))
    }

    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Demultiplex the frame into inbound events, in wire order.
    ///
    /// Returns an empty list for frames of a kind this client does not handle.
    pub fn into_events(self) -> Vec<InboundEvent> {
        let mut events = Vec::new();

        if let Some(content) = self.server_content {
            push_server_content(content, &mut events);
        }
        if let Some(tool_call) = self.tool_call {
            events.push(InboundEvent::ToolCall {
                function_calls: tool_call.function_calls,
            });
        }
        if let Some(cancellation) = self.tool_call_cancellation {
            events.push(InboundEvent::ToolCallCancellation {
                ids: cancellation.ids,
            });
        }
        if let Some(go_away) = self.go_away {
            events.push(InboundEvent::GoAway {
                time_left: go_away.time_left,
            });
        }
        if let Some(error) = self.error {
            events.push(InboundEvent::Error {
                message: error.message,
            });
        }

        events
    }
}

fn push_server_content(content: ServerContent, events: &mut Vec<InboundEvent>) {
    if content.interrupted {
        events.push(InboundEvent::Interrupted);
    }

    if let Some(t) = content.input_transcription.filter(|t| !t.text.is_empty()) {
        events.push(InboundEvent::InputTranscription { text: t.text });
    }

    if let Some(model_turn) = content.model_turn {
        // Audio parts are concatenated into one chunk, text parts into one string.
        let mut audio: Option<(String, Vec<u8>)> = None;
        let mut text = String::new();

        for part in model_turn.parts {
            if let Some(inline) = part.inline_data {
                if !inline.mime_type.starts_with("audio/pcm") {
                    debug!("Skipping inline data of type {}", inline.mime_type);
                    continue;
                }
                match general_purpose::STANDARD.decode(inline.data.as_bytes()) {
                    Ok(bytes) => {
                        let entry = audio.get_or_insert_with(|| (inline.mime_type.clone(), Vec::new()));
                        entry.1.extend_from_slice(&bytes);
                    }
                    Err(e) => warn!("Failed to decode base64 audio data: {:?}", e),
                }
            } else if let Some(t) = part.text {
                text.push_str(&t);
            }
        }

        if let Some((mime_type, data)) = audio.filter(|(_, d)| !d.is_empty()) {
            events.push(InboundEvent::AudioOut { data, mime_type });
        }
        if !text.is_empty() {
            events.push(InboundEvent::TextOut { text });
        }
    }

    if let Some(t) = content.output_transcription.filter(|t| !t.text.is_empty()) {
        events.push(InboundEvent::OutputTranscription { text: t.text });
    }

    if content.turn_complete {
        events.push(InboundEvent::TurnComplete);
    }
}
