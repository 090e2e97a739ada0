use serde::{Deserialize, Serialize};
use std::fmt;

fn default_recognition_url() -> String {
    "wss://api.deepgram.com/v1/listen".to_string()
}

fn default_recognition_model() -> String {
    "nova-2".to_string()
}

fn default_language() -> String {
    "en-US".to_string()
}

fn default_keepalive_secs() -> u64 {
    8
}

fn default_endpointing_ms() -> u64 {
    300
}

fn default_agent_url() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}

fn default_agent_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_system_prompt() -> String {
    "You are a friendly voice assistant on a phone call. Answer in short, \
     natural spoken sentences without markdown, lists, or links."
        .to_string()
}

fn default_memory_messages() -> usize {
    40
}

fn default_max_conversations() -> usize {
    1000
}

fn default_max_tool_rounds() -> usize {
    3
}

fn default_function_timeout_secs() -> u64 {
    15
}

fn default_synthesis_url() -> String {
    "wss://api.elevenlabs.io/v1/text-to-speech".to_string()
}

fn default_synthesis_model() -> String {
    "eleven_turbo_v2_5".to_string()
}

fn default_output_format() -> String {
    "pcm_16000".to_string()
}

fn default_max_unit_chars() -> usize {
    120
}

/// Streaming speech-to-text provider settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct RecognitionConfig {
    #[serde(default = "default_recognition_url")]
    pub url: String,
    #[serde(default, skip_serializing)]
    pub api_key: String,
    #[serde(default = "default_recognition_model")]
    pub model: String,
    #[serde(default = "default_language")]
    pub language: String,
    /// Seconds between keep-alive messages while the caller is silent.
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    /// Silence (ms) after which the provider finalizes an utterance.
    #[serde(default = "default_endpointing_ms")]
    pub endpointing_ms: u64,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            url: default_recognition_url(),
            api_key: String::new(),
            model: default_recognition_model(),
            language: default_language(),
            keepalive_secs: default_keepalive_secs(),
            endpointing_ms: default_endpointing_ms(),
        }
    }
}

impl fmt::Debug for RecognitionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecognitionConfig")
            .field("url", &self.url)
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("language", &self.language)
            .field("keepalive_secs", &self.keepalive_secs)
            .field("endpointing_ms", &self.endpointing_ms)
            .finish()
    }
}

/// A function the agent may call mid-turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON schema of the arguments object.
    #[serde(default = "default_parameters")]
    pub parameters: serde_json::Value,
}

fn default_parameters() -> serde_json::Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

/// Conversational agent settings (OpenAI-compatible chat completions).
#[derive(Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_url")]
    pub url: String,
    #[serde(default, skip_serializing)]
    pub api_key: String,
    #[serde(default = "default_agent_model")]
    pub model: String,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    /// Messages retained per conversation (system prompt excluded).
    #[serde(default = "default_memory_messages")]
    pub memory_messages: usize,
    /// Conversations whose history is retained; least recently used go first.
    #[serde(default = "default_max_conversations")]
    pub max_conversations: usize,
    /// HTTP endpoint that executes function calls. Function calling is off
    /// when unset.
    #[serde(default)]
    pub function_endpoint: Option<String>,
    #[serde(default)]
    pub functions: Vec<FunctionDefinition>,
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,
    #[serde(default = "default_function_timeout_secs")]
    pub function_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            url: default_agent_url(),
            api_key: String::new(),
            model: default_agent_model(),
            system_prompt: default_system_prompt(),
            memory_messages: default_memory_messages(),
            max_conversations: default_max_conversations(),
            function_endpoint: None,
            functions: Vec::new(),
            max_tool_rounds: default_max_tool_rounds(),
            function_timeout_secs: default_function_timeout_secs(),
        }
    }
}

impl fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentConfig")
            .field("url", &self.url)
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("memory_messages", &self.memory_messages)
            .field("max_conversations", &self.max_conversations)
            .field("function_endpoint", &self.function_endpoint)
            .field("functions", &self.functions.len())
            .field("max_tool_rounds", &self.max_tool_rounds)
            .finish()
    }
}

/// Streaming text-to-speech provider settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct SynthesisConfig {
    #[serde(default = "default_synthesis_url")]
    pub url: String,
    #[serde(default, skip_serializing)]
    pub api_key: String,
    #[serde(default)]
    pub voice_id: String,
    #[serde(default = "default_synthesis_model")]
    pub model: String,
    /// Provider output format; must be 16-bit PCM.
    #[serde(default = "default_output_format")]
    pub output_format: String,
    /// Buffer size at which text is force-flushed without punctuation.
    #[serde(default = "default_max_unit_chars")]
    pub max_unit_chars: usize,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            url: default_synthesis_url(),
            api_key: String::new(),
            voice_id: String::new(),
            model: default_synthesis_model(),
            output_format: default_output_format(),
            max_unit_chars: default_max_unit_chars(),
        }
    }
}

impl fmt::Debug for SynthesisConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SynthesisConfig")
            .field("url", &self.url)
            .field("api_key", &"[REDACTED]")
            .field("voice_id", &self.voice_id)
            .field("model", &self.model)
            .field("output_format", &self.output_format)
            .field("max_unit_chars", &self.max_unit_chars)
            .finish()
    }
}
