//! Scripted providers and frame helpers shared by the server tests.

#![allow(dead_code)]

use async_trait::async_trait;
use parley_server::session::{
    client_link, spawn_session, ClientFeed, Providers, SessionHandle, SessionSettings,
};
use parley_types::{AgentState, ClientControl, OutboundFrame, ServerEvent, TranscriptRole};
use parley_voice::{
    AgentBridge, AgentFragment, AgentRequest, AudioSink, FragmentStream, RecognitionBackend,
    RecognitionOptions, RecognitionStream, Recognizer, SpeechSynthesizer, SynthesisStreamer,
    VoiceError,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Upper bound for any single wait in a test.
pub const WAIT: Duration = Duration::from_secs(60);

/// Hands every opened stream's provider side to the test.
pub struct ScriptedRecognizer {
    backends: mpsc::UnboundedSender<RecognitionBackend>,
    pub fail: AtomicBool,
    pub options: Mutex<Vec<RecognitionOptions>>,
}

impl ScriptedRecognizer {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<RecognitionBackend>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let recognizer = Arc::new(Self {
            backends: tx,
            fail: AtomicBool::new(false),
            options: Mutex::new(Vec::new()),
        });
        (recognizer, rx)
    }
}

#[async_trait]
impl Recognizer for ScriptedRecognizer {
    async fn connect(&self, options: RecognitionOptions) -> Result<RecognitionStream, VoiceError> {
        self.options.lock().unwrap().push(options);
        if self.fail.load(Ordering::SeqCst) {
            return Err(VoiceError::Recognition("provider unreachable".to_string()));
        }
        let (stream, backend) = RecognitionStream::channel();
        let _ = self.backends.send(backend);
        Ok(stream)
    }
}

/// What the scripted agent observed.
#[derive(Default)]
pub struct AgentLog {
    pub requests: Mutex<Vec<AgentRequest>>,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub cancelled: AtomicUsize,
    pub ended: Mutex<Vec<String>>,
}

impl AgentLog {
    pub fn texts(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.text.clone())
            .collect()
    }

    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn ended(&self) -> Vec<String> {
        self.ended.lock().unwrap().clone()
    }
}

/// The reply the scripted agent gives to `text`.
///
/// Utterances mentioning a story get a long multi-sentence reply; anything
/// else is echoed back in two fragments.
pub fn reply_for(text: &str) -> Vec<String> {
    if text.contains("story") {
        (1..=8)
            .map(|i| format!("Chapter {} begins here. ", i))
            .collect()
    } else {
        vec![format!("You said {}.", text), " Anything else?".to_string()]
    }
}

/// Streams [`reply_for`] with a fixed delay before each fragment. Requests
/// mentioning "fail" get a provider error instead.
pub struct ScriptedAgent {
    chunk_delay: Duration,
    pub log: Arc<AgentLog>,
}

impl ScriptedAgent {
    pub fn new(chunk_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            chunk_delay,
            log: Arc::new(AgentLog::default()),
        })
    }
}

#[async_trait]
impl AgentBridge for ScriptedAgent {
    async fn respond(
        &self,
        request: AgentRequest,
        cancel: CancellationToken,
    ) -> Result<FragmentStream, VoiceError> {
        let (tx, rx) = mpsc::channel(64);
        let log = self.log.clone();
        let delay = self.chunk_delay;
        let now = log.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        log.max_in_flight.fetch_max(now, Ordering::SeqCst);
        log.requests.lock().unwrap().push(request.clone());

        tokio::spawn(async move {
            if request.text.contains("fail") {
                log.in_flight.fetch_sub(1, Ordering::SeqCst);
                let _ = tx
                    .send(Err(VoiceError::Agent("model overloaded".to_string())))
                    .await;
                return;
            }
            for chunk in reply_for(&request.text) {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        log.cancelled.fetch_add(1, Ordering::SeqCst);
                        log.in_flight.fetch_sub(1, Ordering::SeqCst);
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                if tx.send(Ok(AgentFragment::Chunk(chunk))).await.is_err() {
                    log.in_flight.fetch_sub(1, Ordering::SeqCst);
                    return;
                }
            }
            log.in_flight.fetch_sub(1, Ordering::SeqCst);
            let _ = tx.send(Ok(AgentFragment::Done)).await;
        });
        Ok(rx)
    }

    fn end_conversation(&self, conversation_id: &str) {
        self.log.ended.lock().unwrap().push(conversation_id.to_string());
    }
}

/// Sample chunk the echo synthesizer emits; four bytes of 16-bit PCM.
pub const ECHO_PCM: [u8; 4] = [0x10, 0x00, 0x20, 0x00];

/// Records every unit it speaks and emits `chunks` PCM chunks per unit,
/// sleeping `delay` before each.
pub struct EchoSynth {
    chunks: usize,
    delay: Duration,
    pub units: Mutex<Vec<String>>,
    pub cancelled: AtomicUsize,
}

impl EchoSynth {
    pub fn new(chunks: usize, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            chunks,
            delay,
            units: Mutex::new(Vec::new()),
            cancelled: AtomicUsize::new(0),
        })
    }

    pub fn units(&self) -> Vec<String> {
        self.units.lock().unwrap().clone()
    }

    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    async fn stream(
        &self,
        sink: &AudioSink,
        cancel: &CancellationToken,
    ) -> Result<(), VoiceError> {
        for _ in 0..self.chunks {
            tokio::select! {
                _ = cancel.cancelled() => return Err(VoiceError::Cancelled),
                _ = tokio::time::sleep(self.delay) => {}
            }
            sink.send_audio(ECHO_PCM.to_vec(), cancel).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl SpeechSynthesizer for EchoSynth {
    async fn synthesize(
        &self,
        text: &str,
        sink: &AudioSink,
        cancel: &CancellationToken,
    ) -> Result<(), VoiceError> {
        self.units.lock().unwrap().push(text.to_string());
        let result = self.stream(sink, cancel).await;
        if matches!(result, Err(VoiceError::Cancelled)) {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }
        result
    }
}

pub fn providers(
    recognizer: &Arc<ScriptedRecognizer>,
    agent: &Arc<ScriptedAgent>,
    synth: Option<&Arc<EchoSynth>>,
) -> Providers {
    let synthesizer = synth.map(|s| s.clone() as Arc<dyn SpeechSynthesizer>);
    Providers {
        recognizer: recognizer.clone() as Arc<dyn Recognizer>,
        agent: agent.clone() as Arc<dyn AgentBridge>,
        synthesis: SynthesisStreamer::new(synthesizer, 120),
    }
}

/// Settings with both timers off.
pub fn quiet_settings() -> SessionSettings {
    SessionSettings {
        idle_timeout: None,
        encouragement_delay: None,
        ..SessionSettings::default()
    }
}

/// A session wired to scripted providers, driven directly without a socket.
pub struct TestSession {
    pub handle: SessionHandle,
    pub feed: ClientFeed,
    pub backends: mpsc::UnboundedReceiver<RecognitionBackend>,
    pub recognizer: Arc<ScriptedRecognizer>,
    pub agent: Arc<ScriptedAgent>,
    pub synth: Arc<EchoSynth>,
    pub shutdown: CancellationToken,
}

impl TestSession {
    pub fn start(
        settings: SessionSettings,
        agent: Arc<ScriptedAgent>,
        synth: Arc<EchoSynth>,
        with_synthesis: bool,
    ) -> Self {
        let (recognizer, backends) = ScriptedRecognizer::new();
        let providers = providers(&recognizer, &agent, with_synthesis.then_some(&synth));
        let (link, feed) = client_link(64);
        let shutdown = CancellationToken::new();
        let handle = spawn_session(
            "session-test".to_string(),
            providers,
            settings,
            link,
            shutdown.clone(),
        );
        Self {
            handle,
            feed,
            backends,
            recognizer,
            agent,
            synth,
            shutdown,
        }
    }

    /// Sends a config frame and waits until the session is listening.
    pub async fn configure(&mut self) -> RecognitionBackend {
        self.handle
            .send_control(ClientControl::Config {
                conversation_id: Some("conv-1".to_string()),
                sample_rate: None,
                language: None,
            })
            .await;
        let backend = tokio::time::timeout(WAIT, self.backends.recv())
            .await
            .expect("recognizer was never connected")
            .expect("recognizer dropped");
        frames_until(&mut self.feed, is_state(AgentState::Listening)).await;
        backend
    }
}

pub async fn next_frame(feed: &mut ClientFeed) -> Option<OutboundFrame> {
    tokio::time::timeout(WAIT, feed.next())
        .await
        .expect("timed out waiting for a frame")
}

/// Collects frames up to and including the first one matching `pred`.
pub async fn frames_until(
    feed: &mut ClientFeed,
    pred: impl Fn(&OutboundFrame) -> bool,
) -> Vec<OutboundFrame> {
    let mut frames = Vec::new();
    loop {
        let frame = next_frame(feed)
            .await
            .unwrap_or_else(|| panic!("feed ended; saw {:?}", frames));
        let done = pred(&frame);
        frames.push(frame);
        if done {
            return frames;
        }
    }
}

/// Drains the feed until the session is gone.
pub async fn drain(feed: &mut ClientFeed) -> Vec<OutboundFrame> {
    let mut frames = Vec::new();
    while let Some(frame) = next_frame(feed).await {
        frames.push(frame);
    }
    frames
}

pub fn is_state(state: AgentState) -> impl Fn(&OutboundFrame) -> bool {
    move |frame| {
        matches!(frame, OutboundFrame::Event(ServerEvent::AgentState { state: s }) if *s == state)
    }
}

pub fn is_agent_final(turn: u64) -> impl Fn(&OutboundFrame) -> bool {
    move |frame| agent_final(frame).is_some_and(|(id, _)| id == turn)
}

pub fn is_error(frame: &OutboundFrame) -> bool {
    matches!(frame, OutboundFrame::Event(ServerEvent::Error { .. }))
}

pub fn error_message(frame: &OutboundFrame) -> Option<&str> {
    match frame {
        OutboundFrame::Event(ServerEvent::Error { message }) => Some(message),
        _ => None,
    }
}

/// Turn id and text of a final agent transcript.
pub fn agent_final(frame: &OutboundFrame) -> Option<(u64, String)> {
    match frame {
        OutboundFrame::Event(ServerEvent::Transcript {
            role: TranscriptRole::Agent,
            text,
            is_final: true,
            turn_id: Some(turn_id),
        }) => Some((*turn_id, text.clone())),
        _ => None,
    }
}

pub fn audio_turns(frames: &[OutboundFrame]) -> Vec<u64> {
    frames
        .iter()
        .filter_map(|frame| match frame {
            OutboundFrame::Audio { turn_id, .. } => Some(*turn_id),
            _ => None,
        })
        .collect()
}

/// Polls `cond` until it holds.
pub async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let waited = tokio::time::timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}
