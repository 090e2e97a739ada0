use thiserror::Error;

#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Speech recognition error: {0}")]
    Recognition(String),

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Function call error: {0}")]
    Function(String),

    #[error("Speech synthesis error: {0}")]
    Synthesis(String),

    #[error("Provider connection closed: {0}")]
    ConnectionClosed(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("operation cancelled")]
    Cancelled,
}

impl VoiceError {
    /// Cancellation is a control-flow outcome, never reported to the caller.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
