use crate::config::SynthesisConfig;
use crate::error::VoiceError;
use crate::fragments::FragmentReader;
use async_trait::async_trait;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use parley_types::{OutboundFrame, ServerEvent};
use regex::Regex;
use reqwest::Url;
use serde::Deserialize;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Maximum text input size for one synthesis request (64 KiB).
const MAX_TTS_INPUT_BYTES: usize = 64 * 1024;

/// Timeout for the provider WebSocket handshake.
const TTS_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest silence tolerated from the provider mid-unit.
const TTS_IDLE_TIMEOUT: Duration = Duration::from_secs(20);

/// Default force-flush threshold for unpunctuated text.
pub const DEFAULT_MAX_UNIT_CHARS: usize = 120;

const TERMINATORS: &[char] = &['.', '!', '?'];

/// Trailing marks that stay with the sentence they close.
const CLOSERS: &[char] = &['"', '\'', '\u{201D}', '\u{2019}', ')', '*', '_', '~'];

/// Splits streamed text into sentence-sized speakable units.
#[derive(Debug, Clone)]
pub struct SentenceSegmenter {
    buffer: String,
    max_chars: usize,
}

impl Default for SentenceSegmenter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_UNIT_CHARS)
    }
}

impl SentenceSegmenter {
    pub fn new(max_chars: usize) -> Self {
        Self {
            buffer: String::new(),
            max_chars: max_chars.max(1),
        }
    }

    /// Appends a fragment and returns every unit it completed.
    pub fn push(&mut self, fragment: &str) -> Vec<String> {
        self.buffer.push_str(fragment);
        let mut units = Vec::new();

        while let Some(end) = self.sentence_end() {
            let unit: String = self.buffer.drain(..end).collect();
            push_unit(&mut units, &unit);
        }

        if self.buffer.chars().count() > self.max_chars {
            let unit = std::mem::take(&mut self.buffer);
            push_unit(&mut units, &unit);
        }
        units
    }

    /// Flushes the remainder at end of input.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let trimmed = rest.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }

    /// Byte offset just past the first complete sentence.
    ///
    /// A terminator run such as `?!` or `...`, plus any closing quotes or
    /// emphasis, ends a sentence only when whitespace follows it. A run at the
    /// end of the buffer waits for the next fragment or [`Self::finish`].
    /// Terminators inside a code span, a code fence or a markdown link never
    /// split.
    fn sentence_end(&self) -> Option<usize> {
        let mut markup = OpenMarkup::default();
        let mut chars = self.buffer.char_indices().peekable();
        while let Some((i, c)) = chars.next() {
            if !markup.is_open() && TERMINATORS.contains(&c) {
                let mut end = i + c.len_utf8();
                while let Some(&(j, next)) = chars.peek() {
                    if !TERMINATORS.contains(&next) && !CLOSERS.contains(&next) {
                        break;
                    }
                    end = j + next.len_utf8();
                    chars.next();
                }
                match chars.peek() {
                    Some((_, next)) if next.is_whitespace() => return Some(end),
                    Some(_) => continue,
                    None => return None,
                }
            }
            let skip = markup.advance(&self.buffer[i..]);
            for _ in 0..skip {
                chars.next();
            }
        }
        None
    }
}

/// Markdown constructs still open at a position in the buffer.
#[derive(Debug, Default)]
struct OpenMarkup {
    fence: bool,
    code: bool,
    brackets: usize,
    link_target: bool,
}

impl OpenMarkup {
    fn is_open(&self) -> bool {
        self.fence || self.code || self.brackets > 0 || self.link_target
    }

    /// Consumes the first char of `rest`. Returns how many following chars
    /// belong to the same token.
    fn advance(&mut self, rest: &str) -> usize {
        if rest.starts_with("```") {
            self.fence = !self.fence;
            return 2;
        }
        if self.fence {
            return 0;
        }
        if rest.starts_with('`') {
            self.code = !self.code;
            return 0;
        }
        if self.code {
            return 0;
        }
        if self.link_target {
            self.link_target = !rest.starts_with(')');
            return 0;
        }
        if rest.starts_with('[') {
            self.brackets += 1;
        } else if rest.starts_with(']') && self.brackets > 0 {
            self.brackets -= 1;
            if self.brackets == 0 && rest[1..].starts_with('(') {
                self.link_target = true;
                return 1;
            }
        }
        0
    }
}

fn push_unit(units: &mut Vec<String>, unit: &str) {
    let trimmed = unit.trim();
    if !trimmed.is_empty() {
        units.push(trimmed.to_string());
    }
}

static FENCED_CODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)```.*?```").unwrap());
static STRAY_FENCE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"```[^\n]*").unwrap());
static INLINE_CODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"`([^`]*)`").unwrap());
static LINK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"!?\[([^\]]*)\]\([^)]*\)").unwrap());
static CITATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\^?\d+(?:[,\s]+\d+)*\]|【[^】]*】|\[\[\d+\]\]").unwrap());
static HEADING: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^\s*#{1,6}\s*").unwrap());
static BULLET: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^\s*(?:[-*+]|>)\s+").unwrap());
static EMPHASIS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*+|~~").unwrap());
static LEADING_UNDERSCORE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(^|\s)_+(\S)").unwrap());
static TRAILING_UNDERSCORE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\S)_+(\s|$|[.,!?;:])").unwrap());
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static SPACE_BEFORE_PUNCT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r" ([.,!?;:])").unwrap());

/// Strips markdown and citation markup so text reads naturally aloud.
///
/// Code fences are dropped, inline code and link text are kept, and the
/// result has single spaces only. Applying it twice changes nothing.
pub fn sanitize_for_speech(text: &str) -> String {
    let text = FENCED_CODE.replace_all(text, " ");
    let text = STRAY_FENCE.replace_all(&text, " ");
    let text = INLINE_CODE.replace_all(&text, "$1");
    let text = LINK.replace_all(&text, "$1");
    let text = CITATION.replace_all(&text, "");
    let text = HEADING.replace_all(&text, "");
    let text = BULLET.replace_all(&text, "");
    let text = EMPHASIS.replace_all(&text, "");
    let text = LEADING_UNDERSCORE.replace_all(&text, "$1$2");
    let text = TRAILING_UNDERSCORE.replace_all(&text, "$1$2");
    let text = WHITESPACE.replace_all(&text, " ");
    let text = SPACE_BEFORE_PUNCT.replace_all(&text, "$1");
    text.trim().to_string()
}

/// Delivers synthesized audio for one turn to the client connection.
///
/// Backed by the connection's bounded outbound queue: when the client falls
/// behind, sends wait for capacity, which paces synthesis.
#[derive(Debug, Clone)]
pub struct AudioSink {
    tx: mpsc::Sender<OutboundFrame>,
    turn_id: u64,
}

impl AudioSink {
    pub fn new(tx: mpsc::Sender<OutboundFrame>, turn_id: u64) -> Self {
        Self { tx, turn_id }
    }

    pub fn turn_id(&self) -> u64 {
        self.turn_id
    }

    /// Queues one audio chunk, giving up as soon as `cancel` fires.
    pub async fn send_audio(&self, pcm: Vec<u8>, cancel: &CancellationToken) -> Result<(), VoiceError> {
        if pcm.is_empty() {
            return Ok(());
        }
        let frame = OutboundFrame::Audio {
            turn_id: self.turn_id,
            pcm,
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(VoiceError::Cancelled),
            sent = self.tx.send(frame) => sent
                .map_err(|_| VoiceError::ConnectionClosed("client connection closed".to_string())),
        }
    }

    pub async fn send_event(&self, event: ServerEvent) -> Result<(), VoiceError> {
        self.tx
            .send(OutboundFrame::Event(event))
            .await
            .map_err(|_| VoiceError::ConnectionClosed("client connection closed".to_string()))
    }
}

/// A text-to-speech provider that streams audio as it is produced.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Speaks `text`, pushing audio into `sink` chunk by chunk. Must return
    /// promptly once `cancel` fires and release its provider connection on
    /// every exit path.
    async fn synthesize(
        &self,
        text: &str,
        sink: &AudioSink,
        cancel: &CancellationToken,
    ) -> Result<(), VoiceError>;
}

#[derive(Debug, Deserialize)]
struct ProviderAudio {
    #[serde(default)]
    audio: Option<String>,
    #[serde(default, rename = "isFinal")]
    is_final: Option<bool>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Streaming synthesis over an ElevenLabs-style `stream-input` WebSocket.
#[derive(Debug, Clone)]
pub struct StreamingSynthesizer {
    config: SynthesisConfig,
}

impl StreamingSynthesizer {
    pub fn new(config: SynthesisConfig) -> Result<Self, VoiceError> {
        if config.voice_id.trim().is_empty() {
            return Err(VoiceError::Config("synthesis.voice_id must be set".to_string()));
        }
        Ok(Self { config })
    }

    fn endpoint(&self) -> Result<Url, VoiceError> {
        let base = format!(
            "{}/{}/stream-input",
            self.config.url.trim_end_matches('/'),
            self.config.voice_id
        );
        Url::parse_with_params(
            &base,
            &[
                ("model_id", self.config.model.as_str()),
                ("output_format", self.config.output_format.as_str()),
            ],
        )
        .map_err(|e| VoiceError::Config(format!("invalid synthesis url: {}", e)))
    }

    async fn stream_unit<S>(
        &self,
        socket: &mut tokio_tungstenite::WebSocketStream<S>,
        text: &str,
        sink: &AudioSink,
        cancel: &CancellationToken,
    ) -> Result<(), VoiceError>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        for payload in [
            serde_json::json!({ "text": " " }),
            serde_json::json!({ "text": format!("{} ", text), "try_trigger_generation": true }),
            serde_json::json!({ "text": "" }),
        ] {
            socket.send(Message::Text(payload.to_string().into())).await?;
        }

        loop {
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(VoiceError::Cancelled),
                m = tokio::time::timeout(TTS_IDLE_TIMEOUT, socket.next()) => m.map_err(|_| {
                    VoiceError::Synthesis(format!(
                        "synthesis provider silent for {} seconds",
                        TTS_IDLE_TIMEOUT.as_secs()
                    ))
                })?,
            };

            match message {
                Some(Ok(Message::Text(body))) => {
                    let chunk: ProviderAudio = serde_json::from_str(&body)?;
                    if let Some(error) = chunk.error.or(chunk.message) {
                        return Err(VoiceError::Synthesis(error));
                    }
                    if let Some(audio) = chunk.audio.filter(|a| !a.is_empty()) {
                        let pcm = base64::engine::general_purpose::STANDARD
                            .decode(audio.as_bytes())
                            .map_err(|e| VoiceError::Synthesis(format!("invalid audio payload: {}", e)))?;
                        sink.send_audio(pcm, cancel).await?;
                    }
                    if chunk.is_final.unwrap_or(false) {
                        return Ok(());
                    }
                }
                Some(Ok(Message::Binary(pcm))) => sink.send_audio(pcm.to_vec(), cancel).await?,
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(VoiceError::WebSocket(e)),
            }
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for StreamingSynthesizer {
    async fn synthesize(
        &self,
        text: &str,
        sink: &AudioSink,
        cancel: &CancellationToken,
    ) -> Result<(), VoiceError> {
        if text.len() > MAX_TTS_INPUT_BYTES {
            return Err(VoiceError::Synthesis(format!(
                "text exceeds maximum size: {} bytes (limit: {} bytes)",
                text.len(),
                MAX_TTS_INPUT_BYTES
            )));
        }

        let mut request = self
            .endpoint()?
            .as_str()
            .into_client_request()
            .map_err(|e| VoiceError::Synthesis(format!("invalid request: {}", e)))?;
        if !self.config.api_key.is_empty() {
            let key = HeaderValue::from_str(&self.config.api_key)
                .map_err(|_| VoiceError::Config("synthesis api key is not a valid header".to_string()))?;
            request.headers_mut().insert("xi-api-key", key);
        }

        let connect = tokio::time::timeout(TTS_CONNECT_TIMEOUT, tokio_tungstenite::connect_async(request));
        let (mut socket, _) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(VoiceError::Cancelled),
            r = connect => r
                .map_err(|_| VoiceError::Synthesis("synthesis provider connect timed out".to_string()))?
                .map_err(|e| VoiceError::Synthesis(format!("failed to connect to synthesis provider: {}", e)))?,
        };

        let result = self.stream_unit(&mut socket, text, sink, cancel).await;
        if let Err(e) = socket.close(None).await {
            debug!("synthesis provider close failed: {}", e);
        }
        result
    }
}

/// Turns one turn's incremental reply text into incremental audio.
#[derive(Clone)]
pub struct SynthesisStreamer {
    synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
    max_unit_chars: usize,
}

impl SynthesisStreamer {
    pub fn new(synthesizer: Option<Arc<dyn SpeechSynthesizer>>, max_unit_chars: usize) -> Self {
        Self {
            synthesizer,
            max_unit_chars,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.synthesizer.is_some()
    }

    /// Speaks every unit read from `reader`, in order, until the buffer is
    /// done or `cancel` fires.
    pub async fn run(
        &self,
        mut reader: FragmentReader,
        sink: AudioSink,
        cancel: CancellationToken,
    ) -> Result<(), VoiceError> {
        let Some(synthesizer) = self.synthesizer.as_deref() else {
            warn!(turn_id = sink.turn_id(), "no synthesis provider configured");
            return sink
                .send_event(ServerEvent::error("Speech synthesis is not configured"))
                .await;
        };

        let mut segmenter = SentenceSegmenter::new(self.max_unit_chars);
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(VoiceError::Cancelled),
                next = reader.next() => next,
            };
            match next {
                Some(fragment) => {
                    for unit in segmenter.push(&fragment) {
                        speak_unit(synthesizer, &unit, &sink, &cancel).await?;
                    }
                }
                None => {
                    if let Some(rest) = segmenter.finish() {
                        speak_unit(synthesizer, &rest, &sink, &cancel).await?;
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Speaks a single standalone phrase. No-op without a provider.
    pub async fn speak(
        &self,
        text: &str,
        sink: &AudioSink,
        cancel: &CancellationToken,
    ) -> Result<(), VoiceError> {
        match self.synthesizer.as_deref() {
            Some(synthesizer) => speak_unit(synthesizer, text, sink, cancel).await,
            None => Ok(()),
        }
    }
}

async fn speak_unit(
    synthesizer: &dyn SpeechSynthesizer,
    unit: &str,
    sink: &AudioSink,
    cancel: &CancellationToken,
) -> Result<(), VoiceError> {
    if cancel.is_cancelled() {
        return Err(VoiceError::Cancelled);
    }
    let text = sanitize_for_speech(unit);
    if !text.chars().any(char::is_alphanumeric) {
        return Ok(());
    }
    debug!(turn_id = sink.turn_id(), chars = text.len(), "synthesizing unit");
    synthesizer.synthesize(&text, sink, cancel).await
}
