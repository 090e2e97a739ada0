//! Voice pipeline for Parley sessions.
//!
//! Each stage talks to an external provider behind a trait so sessions can
//! be driven by real services in production and by fakes in tests:
//!
//! - [`capture`] resamples microphone audio into recognition frames.
//! - [`stt`] streams caller audio to a recognition provider.
//! - [`agent`] streams reply fragments from a chat-completions agent.
//! - [`fragments`] hands those fragments to synthesis as they arrive.
//! - [`tts`] segments, sanitizes and speaks reply text.

pub mod agent;
pub mod capture;
pub mod config;
pub mod error;
pub mod fragments;
pub mod stt;
pub mod tts;

pub use agent::{
    AgentBridge, AgentFragment, AgentRequest, ConversationMemory, FragmentStream, HttpAgentBridge,
};
pub use capture::{Downsampler, PcmFrame};
pub use config::{AgentConfig, FunctionDefinition, RecognitionConfig, SynthesisConfig};
pub use error::VoiceError;
pub use fragments::{fragment_buffer, FragmentReader, FragmentWriter};
pub use stt::{
    RecognitionBackend, RecognitionEvent, RecognitionInput, RecognitionOptions, RecognitionStream,
    Recognizer, StreamingRecognizer,
};
pub use tts::{
    sanitize_for_speech, AudioSink, SentenceSegmenter, SpeechSynthesizer, StreamingSynthesizer,
    SynthesisStreamer,
};
