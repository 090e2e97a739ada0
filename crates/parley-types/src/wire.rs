//! Wire format of the browser ↔ server voice connection.
//!
//! A single WebSocket carries both directions and both kinds of payload:
//!
//! | Direction | Frame | Payload |
//! |-----------|-------|---------|
//! | client → server | binary | raw 16-bit LE mono PCM at [`crate::TARGET_SAMPLE_RATE`] |
//! | client → server | text | [`ClientControl`] JSON, tagged by `"type"` |
//! | server → client | text | [`ServerEvent`] JSON, tagged by `"type"` |
//! | server → client | binary | [`AUDIO_FRAME_TAG`] followed by 16-bit LE mono PCM |

use crate::AgentState;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// First byte of every server → client binary audio frame.
pub const AUDIO_FRAME_TAG: u8 = 0x01;

/// Control frames sent by the client as JSON text messages.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum ClientControl {
    /// (Re)configures the session and (re)connects speech recognition.
    #[serde(rename = "config")]
    Config {
        #[serde(rename = "conversationId", default)]
        conversation_id: Option<String>,
        #[serde(rename = "sampleRate", default)]
        sample_rate: Option<u32>,
        #[serde(default)]
        language: Option<String>,
    },
    /// Client-side request to stop the agent mid-reply.
    #[serde(rename = "interrupt")]
    Interrupt,
}

impl ClientControl {
    /// Parses a text frame. Returns `None` for malformed or unknown frames.
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}

/// Who a transcript line belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptRole {
    User,
    Agent,
}

/// Events sent to the client as JSON text messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// Sent once after the connection is admitted.
    #[serde(rename = "ready")]
    Ready {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "conversationId")]
        conversation_id: String,
    },
    /// Interim or final transcript of the caller or the agent.
    #[serde(rename = "transcript")]
    Transcript {
        role: TranscriptRole,
        text: String,
        #[serde(rename = "final")]
        is_final: bool,
        #[serde(rename = "turnId", skip_serializing_if = "Option::is_none", default)]
        turn_id: Option<u64>,
    },
    /// The session's [`AgentState`] changed.
    #[serde(rename = "agent_state")]
    AgentState { state: AgentState },
    /// The in-flight turn was interrupted; buffered playback should be dropped.
    #[serde(rename = "interrupted")]
    Interrupted {
        #[serde(rename = "turnId")]
        turn_id: u64,
    },
    /// A human-readable failure report.
    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn agent_text(text: impl Into<String>, is_final: bool, turn_id: u64) -> Self {
        Self::Transcript {
            role: TranscriptRole::Agent,
            text: text.into(),
            is_final,
            turn_id: Some(turn_id),
        }
    }

    pub fn user_text(text: impl Into<String>, is_final: bool) -> Self {
        Self::Transcript {
            role: TranscriptRole::User,
            text: text.into(),
            is_final,
            turn_id: None,
        }
    }
}

/// A frame queued for delivery to one client.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Event(ServerEvent),
    /// Synthesized PCM belonging to a turn. Frames of an interrupted turn
    /// are discarded by the connection writer.
    Audio { turn_id: u64, pcm: Vec<u8> },
}

/// Errors decoding a tagged binary frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty binary frame")]
    Empty,

    #[error("unknown binary frame tag: {0:#04x}")]
    UnknownTag(u8),

    #[error("odd PCM payload length: {0} bytes")]
    OddLength(usize),
}

/// Prefixes raw PCM with [`AUDIO_FRAME_TAG`].
pub fn encode_audio_frame(pcm: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(pcm.len() + 1);
    frame.push(AUDIO_FRAME_TAG);
    frame.extend_from_slice(pcm);
    frame
}

/// Strips and checks the tag of a server → client audio frame.
pub fn decode_audio_frame(frame: &[u8]) -> Result<&[u8], FrameError> {
    let (&tag, pcm) = frame.split_first().ok_or(FrameError::Empty)?;
    if tag != AUDIO_FRAME_TAG {
        return Err(FrameError::UnknownTag(tag));
    }
    if pcm.len() % crate::BYTES_PER_SAMPLE != 0 {
        return Err(FrameError::OddLength(pcm.len()));
    }
    Ok(pcm)
}
