use crate::config::RecognitionConfig;
use crate::error::VoiceError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parley_types::TARGET_SAMPLE_RATE;
use reqwest::Url;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Frames buffered towards the provider before capture audio is dropped.
const AUDIO_QUEUE_CAPACITY: usize = 64;

/// Events buffered towards the session before the provider is back-pressured.
const EVENT_QUEUE_CAPACITY: usize = 128;

/// Timeout for the provider WebSocket handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Reported when the provider sends an error without a readable message.
const GENERIC_PROVIDER_ERROR: &str = "speech recognition provider error";

/// Something the recognition provider told us about the caller's speech.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionEvent {
    /// Non-final transcript of the utterance so far; may be superseded.
    Interim(String),
    /// Stabilized utterance text.
    Final(String),
    /// The caller started speaking.
    SpeechStarted,
    /// The provider ended an utterance without finalizing any new text.
    UtteranceEnd,
    /// A provider-side failure that leaves the stream usable.
    Error(String),
    /// The provider connection is gone.
    Closed,
}

/// Per-session options for opening a recognition stream.
#[derive(Debug, Clone)]
pub struct RecognitionOptions {
    pub sample_rate: u32,
    pub language: Option<String>,
}

impl Default for RecognitionOptions {
    fn default() -> Self {
        Self {
            sample_rate: TARGET_SAMPLE_RATE,
            language: None,
        }
    }
}

/// Caller-facing audio input of an open recognition stream.
#[derive(Debug, Clone)]
pub struct RecognitionInput {
    audio_tx: mpsc::Sender<Vec<u8>>,
    shutdown: CancellationToken,
}

impl RecognitionInput {
    /// Queues one PCM frame. Returns `false` if the frame was dropped because
    /// the provider is not keeping up or the stream is closed.
    pub fn send_audio(&self, pcm: Vec<u8>) -> bool {
        match self.audio_tx.try_send(pcm) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("dropping capture frame for slow recognition provider");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Asks the provider task to finish and close its connection.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

/// An open recognition stream: audio goes in, events come out.
#[derive(Debug)]
pub struct RecognitionStream {
    pub input: RecognitionInput,
    pub events: mpsc::Receiver<RecognitionEvent>,
}

/// Provider-side ends of a [`RecognitionStream`].
#[derive(Debug)]
pub struct RecognitionBackend {
    pub audio_rx: mpsc::Receiver<Vec<u8>>,
    pub events_tx: mpsc::Sender<RecognitionEvent>,
    pub shutdown: CancellationToken,
}

impl RecognitionStream {
    /// Creates a stream and the provider-side handles that feed it.
    pub fn channel() -> (Self, RecognitionBackend) {
        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_QUEUE_CAPACITY);
        let (events_tx, events) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let shutdown = CancellationToken::new();
        (
            Self {
                input: RecognitionInput {
                    audio_tx,
                    shutdown: shutdown.clone(),
                },
                events,
            },
            RecognitionBackend {
                audio_rx,
                events_tx,
                shutdown,
            },
        )
    }
}

/// A streaming speech-to-text provider.
#[async_trait]
pub trait Recognizer: Send + Sync {
    async fn connect(&self, options: RecognitionOptions) -> Result<RecognitionStream, VoiceError>;
}

/// Live transcription over a Deepgram-compatible WebSocket API.
#[derive(Debug, Clone)]
pub struct StreamingRecognizer {
    config: RecognitionConfig,
}

impl StreamingRecognizer {
    pub fn new(config: RecognitionConfig) -> Self {
        Self { config }
    }

    fn endpoint(&self, options: &RecognitionOptions) -> Result<Url, VoiceError> {
        let language = options
            .language
            .clone()
            .unwrap_or_else(|| self.config.language.clone());
        Url::parse_with_params(
            &self.config.url,
            &[
                ("encoding", "linear16".to_string()),
                ("sample_rate", options.sample_rate.to_string()),
                ("channels", "1".to_string()),
                ("language", language),
                ("model", self.config.model.clone()),
                ("punctuate", "true".to_string()),
                ("smart_format", "true".to_string()),
                ("interim_results", "true".to_string()),
                ("vad_events", "true".to_string()),
                ("endpointing", self.config.endpointing_ms.to_string()),
                ("utterance_end_ms", "1000".to_string()),
            ],
        )
        .map_err(|e| VoiceError::Config(format!("invalid recognition url: {}", e)))
    }
}

#[async_trait]
impl Recognizer for StreamingRecognizer {
    async fn connect(&self, options: RecognitionOptions) -> Result<RecognitionStream, VoiceError> {
        let url = self.endpoint(&options)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| VoiceError::Recognition(format!("invalid request: {}", e)))?;
        if !self.config.api_key.is_empty() {
            let value = HeaderValue::from_str(&format!("Token {}", self.config.api_key))
                .map_err(|_| VoiceError::Config("recognition api key is not a valid header".to_string()))?;
            request.headers_mut().insert("Authorization", value);
        }

        let (socket, _) = tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| {
                VoiceError::Recognition(format!(
                    "recognition provider did not answer within {} seconds",
                    CONNECT_TIMEOUT.as_secs()
                ))
            })?
            .map_err(|e| VoiceError::Recognition(format!("failed to connect to recognition provider: {}", e)))?;

        info!(model = %self.config.model, sample_rate = options.sample_rate, "recognition stream connected");

        let (stream, backend) = RecognitionStream::channel();
        let keepalive = Duration::from_secs(self.config.keepalive_secs.max(1));
        tokio::spawn(pump_provider(socket, backend, keepalive));
        Ok(stream)
    }
}

async fn pump_provider<S>(socket: tokio_tungstenite::WebSocketStream<S>, backend: RecognitionBackend, keepalive: Duration)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let RecognitionBackend {
        mut audio_rx,
        events_tx,
        shutdown,
    } = backend;
    let (mut sink, mut stream) = socket.split();
    let mut assembler = UtteranceAssembler::default();
    let mut last_audio = Instant::now();
    let mut ticker = tokio::time::interval(keepalive);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = sink.send(Message::Text(r#"{"type":"CloseStream"}"#.into())).await;
                let _ = sink.close().await;
                debug!("recognition stream closed by session");
                return;
            }
            audio = audio_rx.recv() => match audio {
                Some(pcm) => {
                    last_audio = Instant::now();
                    if let Err(e) = sink.send(Message::Binary(pcm.into())).await {
                        warn!("recognition provider write failed: {}", e);
                        let _ = events_tx.send(RecognitionEvent::Closed).await;
                        return;
                    }
                }
                None => {
                    let _ = sink.send(Message::Text(r#"{"type":"CloseStream"}"#.into())).await;
                    let _ = sink.close().await;
                    return;
                }
            },
            _ = ticker.tick() => {
                if last_audio.elapsed() >= keepalive {
                    if let Err(e) = sink.send(Message::Text(r#"{"type":"KeepAlive"}"#.into())).await {
                        warn!("recognition keep-alive failed: {}", e);
                    }
                }
            }
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    let Some(event) = parse_provider_message(&text) else {
                        continue;
                    };
                    for out in assembler.apply(event) {
                        if events_tx.send(out).await.is_err() {
                            return;
                        }
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(?frame, "recognition provider closed the stream");
                    let _ = events_tx.send(RecognitionEvent::Closed).await;
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("recognition provider connection failed: {}", e);
                    let _ = events_tx.send(RecognitionEvent::Closed).await;
                    return;
                }
                None => {
                    let _ = events_tx.send(RecognitionEvent::Closed).await;
                    return;
                }
            },
        }
    }
}

/// One decoded provider message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    Transcript {
        text: String,
        is_final: bool,
        speech_final: bool,
    },
    SpeechStarted,
    UtteranceEnd,
    Error(String),
}

/// Decodes a provider text message. Unknown message kinds and unparseable
/// payloads yield `None`.
pub fn parse_provider_message(text: &str) -> Option<ProviderEvent> {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!("ignoring malformed recognition payload: {}", e);
            return None;
        }
    };

    match value.get("type").and_then(Value::as_str) {
        Some("Results") => {
            let transcript = value
                .pointer("/channel/alternatives/0/transcript")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .trim()
                .to_string();
            Some(ProviderEvent::Transcript {
                text: transcript,
                is_final: value.get("is_final").and_then(Value::as_bool).unwrap_or(false),
                speech_final: value.get("speech_final").and_then(Value::as_bool).unwrap_or(false),
            })
        }
        Some("SpeechStarted") => Some(ProviderEvent::SpeechStarted),
        Some("UtteranceEnd") => Some(ProviderEvent::UtteranceEnd),
        Some("Error") => Some(ProviderEvent::Error(error_message(&value))),
        Some(_) => None,
        None if value.get("err_code").is_some() || value.get("err_msg").is_some() => {
            Some(ProviderEvent::Error(error_message(&value)))
        }
        None => None,
    }
}

fn error_message(value: &Value) -> String {
    ["description", "err_msg", "message"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .filter(|msg| !msg.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| GENERIC_PROVIDER_ERROR.to_string())
}

/// Joins provider `is_final` segments into whole utterances.
#[derive(Debug, Default)]
pub struct UtteranceAssembler {
    segments: Vec<String>,
}

impl UtteranceAssembler {
    pub fn apply(&mut self, event: ProviderEvent) -> Vec<RecognitionEvent> {
        match event {
            ProviderEvent::Transcript {
                text,
                is_final,
                speech_final,
            } => {
                if is_final && !text.is_empty() {
                    self.segments.push(text.clone());
                }
                if speech_final {
                    return self.finalize().into_iter().collect();
                }
                let preview = if is_final {
                    self.segments.join(" ")
                } else {
                    self.preview_with(&text)
                };
                if preview.is_empty() {
                    Vec::new()
                } else {
                    vec![RecognitionEvent::Interim(preview)]
                }
            }
            ProviderEvent::SpeechStarted => vec![RecognitionEvent::SpeechStarted],
            ProviderEvent::UtteranceEnd => match self.finalize() {
                Some(done) => vec![done],
                None => vec![RecognitionEvent::UtteranceEnd],
            },
            ProviderEvent::Error(message) => vec![RecognitionEvent::Error(message)],
        }
    }

    fn preview_with(&self, interim: &str) -> String {
        let mut parts: Vec<&str> = self.segments.iter().map(String::as_str).collect();
        if !interim.is_empty() {
            parts.push(interim);
        }
        parts.join(" ")
    }

    fn finalize(&mut self) -> Option<RecognitionEvent> {
        if self.segments.is_empty() {
            return None;
        }
        let text = std::mem::take(&mut self.segments).join(" ");
        Some(RecognitionEvent::Final(text))
    }
}
