//! # Wire Protocols
//!
//! Message types for both sides of the bridge. Both peers speak JSON text
//! frames over WebSockets, but the two vocabularies are unrelated:
//!
//! ## Telephony side (carrier -> bridge):
//! - `{"event":"start","data":{"ucid":"..."}}` binds the call identifier
//! - `{"event":"media","data":{"samples":[...]}}` carries 8kHz PCM16
//! - `{"event":"stop"}` ends the call
//! - `{"command":"clearBuffer"}` / `{"command":"callDisconnect"}` control frames
//!
//! ## Agent side (bridge <-> realtime speech API):
//! - Outbound: `session.update`, `input_audio_buffer.append`, `input_audio_buffer.clear`,
//!   `conversation.item.create` (function results), `response.create`
//! - Inbound: transcripts, audio deltas, function-call completions, VAD markers
//!
//! Every inbound vocabulary is a closed enum; unknown tags land in an explicit
//! catch-all variant instead of failing the parse.

use crate::config::AgentConfig;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Name of the tool the agent calls to hand the caller to a human.
pub const TRANSFER_TOOL_NAME: &str = "transfer_call";

/// Something that arrived from (or happened to) a peer connection.
///
/// Both socket adapters translate their transport into this shape, so the relay
/// never sees transport types.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerSignal {
    /// One JSON text frame, not yet parsed
    Frame(String),
    /// The peer closed the connection normally
    Closed,
    /// The connection failed (protocol or I/O error)
    Failed(String),
}

// ── Telephony side ────────────────────────────────────────────────

/// Any frame the carrier can send.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum TelephonyMessage {
    Event(TelephonyEvent),
    Command(TelephonyCommand),
}

/// Media stream events, tagged by `event`.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum TelephonyEvent {
    /// Call start. Carriers put the identifier either in `data` or at the top level.
    Start {
        #[serde(default)]
        ucid: Option<String>,
        #[serde(default)]
        data: Option<StartData>,
    },

    /// One buffer of 8kHz PCM16 samples
    Media { data: MediaData },

    /// The carrier ended the call
    Stop,

    #[serde(other)]
    Unknown,
}

impl TelephonyEvent {
    /// Call identifier carried by a `start` frame, if any.
    pub fn call_id(&self) -> Option<&str> {
        match self {
            TelephonyEvent::Start { ucid, data } => data
                .as_ref()
                .and_then(|d| d.ucid.as_deref())
                .or(ucid.as_deref())
                .filter(|id| !id.trim().is_empty()),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize, PartialEq)]
pub struct StartData {
    #[serde(default)]
    pub ucid: Option<String>,
}

#[derive(Debug, Deserialize, PartialEq)]
pub struct MediaData {
    pub samples: Vec<i16>,
}

/// Out-of-band control frames, tagged by `command`.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "command")]
pub enum TelephonyCommand {
    /// Drop whatever caller audio the agent has buffered
    #[serde(rename = "clearBuffer")]
    ClearBuffer,

    /// Hang up
    #[serde(rename = "callDisconnect")]
    CallDisconnect,

    #[serde(other)]
    Unknown,
}

/// Frames the bridge sends back to the carrier.
#[derive(Debug, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum TelephonyOutbound {
    /// 8kHz PCM16 for the caller to hear
    Media { samples: Vec<i16> },
}

// ── Agent side: outbound ──────────────────────────────────────────

/// Client events sent to the realtime speech agent.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum AgentCommand {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },

    /// Base64 PCM16 at 24kHz
    #[serde(rename = "input_audio_buffer.append")]
    AppendAudio { audio: String },

    #[serde(rename = "input_audio_buffer.clear")]
    ClearAudio,

    #[serde(rename = "conversation.item.create")]
    CreateItem { item: ConversationItem },

    #[serde(rename = "response.create")]
    CreateResponse,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationItem {
    FunctionCallOutput { call_id: String, output: String },
}

/// The `session` object of the handshake.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SessionConfig {
    pub modalities: Vec<String>,
    pub instructions: String,
    pub voice: String,
    pub input_audio_format: String,
    pub output_audio_format: String,
    pub input_audio_transcription: TranscriptionSettings,
    pub turn_detection: TurnDetection,
    pub tools: Vec<serde_json::Value>,
    pub tool_choice: String,
    pub temperature: f32,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TranscriptionSettings {
    pub model: String,
}

/// Server-side voice activity detection parameters.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: String,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

impl SessionConfig {
    /// Build the handshake from agent settings and the resolved instructions text.
    pub fn new(agent: &AgentConfig, instructions: String) -> Self {
        Self {
            modalities: vec!["text".to_string(), "audio".to_string()],
            instructions,
            voice: agent.voice.clone(),
            input_audio_format: "pcm16".to_string(),
            output_audio_format: "pcm16".to_string(),
            input_audio_transcription: TranscriptionSettings {
                model: agent.transcription_model.clone(),
            },
            turn_detection: TurnDetection {
                kind: "server_vad".to_string(),
                threshold: agent.vad_threshold,
                prefix_padding_ms: agent.vad_prefix_padding_ms,
                silence_duration_ms: agent.vad_silence_duration_ms,
            },
            tools: vec![transfer_tool()],
            tool_choice: "auto".to_string(),
            temperature: agent.temperature,
        }
    }
}

/// JSON-schema declaration of the transfer tool.
pub fn transfer_tool() -> serde_json::Value {
    json!({
        "type": "function",
        "name": TRANSFER_TOOL_NAME,
        "description": "Transfer the call to a human agent. Use after collecting the customer's details or when the customer asks to speak with a person.",
        "parameters": {
            "type": "object",
            "properties": {
                "reason": {
                    "type": "string",
                    "enum": ["data_collected", "customer_request", "issue_resolution"],
                    "description": "Reason for transfer"
                }
            },
            "required": ["reason"]
        }
    })
}

// ── Agent side: inbound ───────────────────────────────────────────

/// Server events the relay acts on. Everything else is [`AgentEvent::Ignored`].
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum AgentEvent {
    #[serde(rename = "session.created")]
    SessionCreated,

    #[serde(rename = "session.updated")]
    SessionUpdated,

    /// Final transcript of what the caller said
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    TranscriptionCompleted {
        #[serde(default)]
        transcript: String,
    },

    /// Base64 PCM16 at 24kHz
    #[serde(rename = "response.audio.delta", alias = "response.output_audio.delta")]
    AudioDelta { delta: String },

    /// Incremental text of what the agent is saying
    #[serde(
        rename = "response.audio_transcript.delta",
        alias = "response.output_audio_transcript.delta"
    )]
    AudioTranscriptDelta {
        #[serde(default)]
        delta: String,
    },

    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallArgumentsDone {
        name: String,
        call_id: String,
        #[serde(default)]
        arguments: String,
    },

    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,

    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped,

    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        error: serde_json::Value,
    },

    #[serde(other)]
    Ignored,
}

// ── Transfer tool payloads ────────────────────────────────────────

/// Why the agent wants the caller transferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferReason {
    DataCollected,
    CustomerRequest,
    IssueResolution,
}

impl TransferReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferReason::DataCollected => "data_collected",
            TransferReason::CustomerRequest => "customer_request",
            TransferReason::IssueResolution => "issue_resolution",
        }
    }

    /// Read the `reason` out of the tool-call arguments.
    ///
    /// Agents sometimes send empty or half-formed arguments; those fall back to
    /// `data_collected` rather than blocking the transfer.
    pub fn from_arguments(arguments: &str) -> Self {
        #[derive(Deserialize)]
        struct Arguments {
            reason: TransferReason,
        }

        serde_json::from_str::<Arguments>(arguments)
            .map(|args| args.reason)
            .unwrap_or(TransferReason::DataCollected)
    }
}

/// The `output` of a function call, as the agent reads it.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FunctionResult {
    pub success: bool,
    pub message: String,
}

impl FunctionResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self { success: true, message: message.into() }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self { success: false, message: message.into() }
    }

    /// Render as the JSON string the agent expects in `function_call_output.output`.
    pub fn to_output(&self) -> String {
        json!({ "success": self.success, "message": self.message }).to_string()
    }
}
