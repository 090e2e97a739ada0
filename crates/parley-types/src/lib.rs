//! Shared types and constants for the Parley voice platform.
//!
//! This crate provides the foundational types used across all Parley crates:
//! the per-session [`AgentState`] machine states, the PCM format every
//! component agrees on, and the wire format of the bidirectional connection
//! between the browser and the server (see [`wire`]).
//!
//! Nothing here performs I/O. Both `parley-voice` and `parley-server` depend
//! on this crate for cross-cutting definitions so that neither has to depend
//! on the other's internals.

pub mod wire;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use wire::{
    decode_audio_frame, encode_audio_frame, ClientControl, FrameError, OutboundFrame, ServerEvent,
    TranscriptRole, AUDIO_FRAME_TAG,
};

/// Sample rate (Hz) of all PCM audio exchanged with the recognition provider.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Number of samples in one captured PCM frame (100 ms at 16 kHz).
pub const FRAME_SAMPLES: usize = 1_600;

/// Bytes per PCM sample (16-bit signed, little-endian, mono).
pub const BYTES_PER_SAMPLE: usize = 2;

/// Conversational state of one session.
///
/// Sessions move `idle → connecting → listening → thinking → speaking →
/// listening → …`. Transitions only happen inside the session orchestrator
/// and every change is mirrored to the client as an `agent_state` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Connection open, no recognition stream yet.
    #[default]
    Idle,
    /// Opening the recognition stream.
    Connecting,
    /// Waiting for the caller to speak.
    Listening,
    /// A turn is in flight and the agent has not produced text yet.
    Thinking,
    /// The agent's reply is being synthesized and streamed.
    Speaking,
}

impl AgentState {
    /// Returns the wire label for this state.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Listening => "listening",
            Self::Thinking => "thinking",
            Self::Speaking => "speaking",
        }
    }

    /// Whether a turn is currently occupying the agent (barge-in applies).
    pub fn is_busy(self) -> bool {
        matches!(self, Self::Thinking | Self::Speaking)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
