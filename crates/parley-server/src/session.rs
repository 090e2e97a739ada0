//! Session orchestrator.
//!
//! Each connection gets one actor task that exclusively owns its [`Session`]:
//! the agent state, the FIFO turn queue, the in-flight turn with its
//! cancellation tokens, the idle and encouragement timers, and the
//! recognition stream. Everything that can happen to a session (client audio
//! and control frames, recognition events, agent fragments, synthesis
//! completion, timer firings) arrives as a [`SessionInput`] on one inbox, so
//! state changes are strictly serialized without locks.
//!
//! Work that may suspend on a provider runs in spawned tasks bound to a
//! child of the session's root token and reports back tagged with its turn
//! id. Results for a turn that is no longer current are discarded.

use crate::config::SessionConfig;
use parley_types::{AgentState, ClientControl, OutboundFrame, ServerEvent};
use parley_voice::{
    fragment_buffer, AgentBridge, AgentFragment, AgentRequest, AudioSink, FragmentReader,
    FragmentWriter, RecognitionEvent, RecognitionInput, RecognitionOptions, RecognitionStream,
    Recognizer, SynthesisStreamer, VoiceError,
};
use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Inputs buffered per session before producers wait.
const INBOX_CAPACITY: usize = 256;

/// Provider adapters shared by every session.
#[derive(Clone)]
pub struct Providers {
    pub recognizer: Arc<dyn Recognizer>,
    pub agent: Arc<dyn AgentBridge>,
    pub synthesis: SynthesisStreamer,
}

/// Per-session timing and phrasing.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub idle_timeout: Option<Duration>,
    pub encouragement_delay: Option<Duration>,
    pub idle_prompt: String,
    pub encouragement_text: String,
}

impl From<&SessionConfig> for SessionSettings {
    fn from(config: &SessionConfig) -> Self {
        let secs = |s: u64| (s > 0).then(|| Duration::from_secs(s));
        Self {
            idle_timeout: secs(config.idle_timeout_secs),
            encouragement_delay: secs(config.encouragement_delay_secs),
            idle_prompt: config.idle_prompt.clone(),
            encouragement_text: config.encouragement_text.clone(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

/// Marks turns whose audio must no longer reach the client.
///
/// Turn ids grow monotonically, so one high-water mark covers every
/// interrupted turn. Shared between the session (which raises it on
/// barge-in) and the connection writer (which checks each audio frame).
#[derive(Debug, Clone, Default)]
pub struct PlaybackGate {
    silenced_through: Arc<AtomicU64>,
}

impl PlaybackGate {
    pub fn silence_through(&self, turn_id: u64) {
        self.silenced_through.fetch_max(turn_id, Ordering::SeqCst);
    }

    pub fn allows(&self, turn_id: u64) -> bool {
        turn_id > self.silenced_through.load(Ordering::SeqCst)
    }
}

/// Session side of the connection to one client.
///
/// Events go on an unbounded queue so the actor never waits on a slow
/// client; audio goes on a bounded queue so synthesis is paced by it.
#[derive(Debug, Clone)]
pub struct ClientLink {
    events: mpsc::UnboundedSender<ServerEvent>,
    media: mpsc::Sender<OutboundFrame>,
    gate: PlaybackGate,
}

impl ClientLink {
    fn emit(&self, event: ServerEvent) {
        if self.events.send(event).is_err() {
            debug!("client writer gone, dropping event");
        }
    }

    fn audio_sink(&self, turn_id: u64) -> AudioSink {
        AudioSink::new(self.media.clone(), turn_id)
    }
}

/// Writer side of the connection to one client.
#[derive(Debug)]
pub struct ClientFeed {
    events: mpsc::UnboundedReceiver<ServerEvent>,
    media: mpsc::Receiver<OutboundFrame>,
    gate: PlaybackGate,
}

impl ClientFeed {
    /// Next frame to write, events first. Audio of silenced turns is
    /// skipped. Returns `None` once the session is gone.
    pub async fn next(&mut self) -> Option<OutboundFrame> {
        loop {
            let frame = tokio::select! {
                biased;
                event = self.events.recv() => return event.map(OutboundFrame::Event),
                frame = self.media.recv() => frame?,
            };
            match frame {
                OutboundFrame::Audio { turn_id, .. } if !self.gate.allows(turn_id) => {
                    debug!(turn_id, "discarding audio of interrupted turn");
                }
                frame => return Some(frame),
            }
        }
    }
}

/// Creates the paired link and feed for one connection.
pub fn client_link(audio_capacity: usize) -> (ClientLink, ClientFeed) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (media_tx, media_rx) = mpsc::channel(audio_capacity.max(1));
    let gate = PlaybackGate::default();
    (
        ClientLink {
            events: events_tx,
            media: media_tx,
            gate: gate.clone(),
        },
        ClientFeed {
            events: events_rx,
            media: media_rx,
            gate,
        },
    )
}

enum SessionInput {
    Audio(Vec<u8>),
    Control(ClientControl),
    RecognitionReady {
        generation: u64,
        result: Result<RecognitionStream, VoiceError>,
    },
    Recognition {
        generation: u64,
        event: RecognitionEvent,
    },
    Agent {
        turn_id: u64,
        fragment: Result<AgentFragment, VoiceError>,
    },
    SynthesisFinished {
        turn_id: u64,
        result: Result<(), VoiceError>,
    },
    IdleTimeout {
        generation: u64,
    },
    Encouragement {
        turn_id: u64,
    },
    Close,
}

/// Handle used by the connection to feed its session.
#[derive(Debug)]
pub struct SessionHandle {
    id: String,
    inbox: mpsc::Sender<SessionInput>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for SessionInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionInput::Audio(_) => "Audio",
            SessionInput::Control(_) => "Control",
            SessionInput::RecognitionReady { .. } => "RecognitionReady",
            SessionInput::Recognition { .. } => "Recognition",
            SessionInput::Agent { .. } => "Agent",
            SessionInput::SynthesisFinished { .. } => "SynthesisFinished",
            SessionInput::IdleTimeout { .. } => "IdleTimeout",
            SessionInput::Encouragement { .. } => "Encouragement",
            SessionInput::Close => "Close",
        };
        f.write_str(name)
    }
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Forwards caller audio. Returns `false` if the frame was dropped.
    pub fn send_audio(&self, pcm: Vec<u8>) -> bool {
        match self.inbox.try_send(SessionInput::Audio(pcm)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(session_id = %self.id, "session inbox full, dropping caller audio");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub async fn send_control(&self, control: ClientControl) {
        if self.inbox.send(SessionInput::Control(control)).await.is_err() {
            debug!(session_id = %self.id, "control frame after session ended");
        }
    }

    /// Whether the session ended on its own (fatal error or shutdown).
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Closes the session and waits until it has torn down.
    pub async fn close(self) {
        let _ = self.inbox.send(SessionInput::Close).await;
        if let Err(e) = self.task.await {
            warn!(session_id = %self.id, "session task failed: {}", e);
        }
    }
}

/// Starts a session actor. It stops on [`SessionHandle::close`], on a fatal
/// recognition failure, or when `shutdown` fires.
pub fn spawn_session(
    id: String,
    providers: Providers,
    settings: SessionSettings,
    link: ClientLink,
    shutdown: CancellationToken,
) -> SessionHandle {
    let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
    let minted = Uuid::new_v4().to_string();
    let session = Session {
        id: id.clone(),
        conversation_id: minted.clone(),
        minted_conversation: minted,
        state: AgentState::Idle,
        queue: VecDeque::new(),
        turn: None,
        last_turn_id: 0,
        partial: String::new(),
        awaiting_utterance: false,
        started: false,
        options: RecognitionOptions::default(),
        recognition: None,
        recognition_cancel: None,
        recognition_generation: 0,
        idle_timer: None,
        idle_generation: 0,
        providers,
        settings,
        link,
        inbox: tx.clone(),
        root: shutdown.child_token(),
    };
    let task = tokio::spawn(session.run(rx, shutdown));
    SessionHandle {
        id,
        inbox: tx,
        task,
    }
}

/// A finalized caller utterance, or a synthetic idle prompt.
struct Turn {
    text: String,
    synthetic: bool,
    arrived: Instant,
}

/// The single turn in flight.
struct ActiveTurn {
    id: u64,
    writer: FragmentWriter,
    reader: Option<FragmentReader>,
    agent_cancel: CancellationToken,
    synth_cancel: Option<CancellationToken>,
    filler_cancel: Option<CancellationToken>,
    filler_task: Option<JoinHandle<()>>,
    encouragement: Option<JoinHandle<()>>,
    agent_done: bool,
    synth_done: bool,
}

impl ActiveTurn {
    fn stop_encouragement(&mut self) {
        if let Some(timer) = self.encouragement.take() {
            timer.abort();
        }
    }

    fn is_complete(&self) -> bool {
        self.agent_done && (self.synth_done || self.synth_cancel.is_none())
    }

    fn cancel(&mut self) {
        self.stop_encouragement();
        self.agent_cancel.cancel();
        if let Some(token) = &self.synth_cancel {
            token.cancel();
        }
        if let Some(token) = &self.filler_cancel {
            token.cancel();
        }
        self.writer.clear();
    }
}

struct Session {
    id: String,
    conversation_id: String,
    /// Server-generated id; its history dies with the session.
    minted_conversation: String,
    state: AgentState,
    queue: VecDeque<Turn>,
    turn: Option<ActiveTurn>,
    last_turn_id: u64,
    /// Latest non-final caller transcript.
    partial: String,
    /// Set by barge-in until the caller's next utterance resolves.
    awaiting_utterance: bool,
    started: bool,
    options: RecognitionOptions,
    recognition: Option<RecognitionInput>,
    recognition_cancel: Option<CancellationToken>,
    recognition_generation: u64,
    idle_timer: Option<JoinHandle<()>>,
    idle_generation: u64,
    providers: Providers,
    settings: SessionSettings,
    link: ClientLink,
    inbox: mpsc::Sender<SessionInput>,
    root: CancellationToken,
}

impl Session {
    async fn run(mut self, mut inbox: mpsc::Receiver<SessionInput>, shutdown: CancellationToken) {
        info!(session_id = %self.id, conversation_id = %self.conversation_id, "session started");
        self.link.emit(ServerEvent::Ready {
            session_id: self.id.clone(),
            conversation_id: self.conversation_id.clone(),
        });

        loop {
            let input = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!(session_id = %self.id, "session stopped by server shutdown");
                    self.link.emit(ServerEvent::error("The server is shutting down"));
                    break;
                }
                input = inbox.recv() => match input {
                    Some(input) => input,
                    None => break,
                },
            };
            if self.handle(input).is_break() {
                break;
            }
        }

        self.teardown();
    }

    fn handle(&mut self, input: SessionInput) -> ControlFlow<()> {
        match input {
            SessionInput::Audio(pcm) => self.on_audio(pcm),
            SessionInput::Control(control) => self.on_control(control),
            SessionInput::RecognitionReady { generation, result } => {
                self.on_recognition_ready(generation, result)
            }
            SessionInput::Recognition { generation, event } => {
                if generation != self.recognition_generation {
                    debug!(session_id = %self.id, generation, "ignoring event from replaced recognizer");
                    return ControlFlow::Continue(());
                }
                return self.on_recognition(event);
            }
            SessionInput::Agent { turn_id, fragment } => self.on_agent(turn_id, fragment),
            SessionInput::SynthesisFinished { turn_id, result } => {
                self.on_synthesis_finished(turn_id, result)
            }
            SessionInput::IdleTimeout { generation } => self.on_idle_timeout(generation),
            SessionInput::Encouragement { turn_id } => self.on_encouragement(turn_id),
            SessionInput::Close => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    fn set_state(&mut self, state: AgentState) {
        if self.state == state {
            return;
        }
        debug!(session_id = %self.id, from = %self.state, to = %state, "agent state");
        self.state = state;
        self.link.emit(ServerEvent::AgentState { state });
    }

    fn enter_listening(&mut self) {
        self.set_state(AgentState::Listening);
        self.restart_idle();
    }

    // Client input

    fn on_audio(&mut self, pcm: Vec<u8>) {
        if !self.started {
            debug!(session_id = %self.id, "audio before config, starting with defaults");
            self.start_recognition();
        }
        if let Some(input) = &self.recognition {
            input.send_audio(pcm);
        }
    }

    fn on_control(&mut self, control: ClientControl) {
        match control {
            ClientControl::Config {
                conversation_id,
                sample_rate,
                language,
            } => {
                if let Some(id) = conversation_id.filter(|c| !c.trim().is_empty()) {
                    self.conversation_id = id;
                }
                if let Some(rate) = sample_rate {
                    self.options.sample_rate = rate;
                }
                if language.is_some() {
                    self.options.language = language;
                }
                info!(
                    session_id = %self.id,
                    conversation_id = %self.conversation_id,
                    sample_rate = self.options.sample_rate,
                    "session configured"
                );
                self.start_recognition();
            }
            ClientControl::Interrupt => {
                self.barge_in("client");
                if self.turn.is_none() && self.state.is_busy() {
                    self.awaiting_utterance = false;
                    self.enter_listening();
                }
            }
        }
    }

    // Recognition

    fn start_recognition(&mut self) {
        self.started = true;
        self.stop_recognition();
        self.recognition_generation += 1;
        let generation = self.recognition_generation;
        let cancel = self.root.child_token();
        self.recognition_cancel = Some(cancel.clone());

        if self.turn.is_none() {
            self.cancel_idle();
            self.set_state(AgentState::Connecting);
        }

        let recognizer = self.providers.recognizer.clone();
        let options = self.options.clone();
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                result = recognizer.connect(options) => result,
            };
            let _ = inbox
                .send(SessionInput::RecognitionReady { generation, result })
                .await;
        });
    }

    fn stop_recognition(&mut self) {
        if let Some(input) = self.recognition.take() {
            input.close();
        }
        if let Some(cancel) = self.recognition_cancel.take() {
            cancel.cancel();
        }
    }

    fn on_recognition_ready(&mut self, generation: u64, result: Result<RecognitionStream, VoiceError>) {
        if generation != self.recognition_generation {
            if let Ok(stream) = result {
                stream.input.close();
            }
            return;
        }

        match result {
            Ok(RecognitionStream { input, mut events }) => {
                info!(session_id = %self.id, "speech recognition connected");
                self.recognition = Some(input);
                let cancel = match &self.recognition_cancel {
                    Some(token) => token.clone(),
                    None => self.root.child_token(),
                };
                let inbox = self.inbox.clone();
                tokio::spawn(async move {
                    loop {
                        let event = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => break,
                            event = events.recv() => event.unwrap_or(RecognitionEvent::Closed),
                        };
                        let closed = matches!(event, RecognitionEvent::Closed);
                        if inbox
                            .send(SessionInput::Recognition { generation, event })
                            .await
                            .is_err()
                            || closed
                        {
                            break;
                        }
                    }
                });
            }
            Err(e) => {
                warn!(session_id = %self.id, "speech recognition unavailable: {}", e);
                self.link
                    .emit(ServerEvent::error(format!("Speech recognition is unavailable: {}", e)));
            }
        }

        if self.turn.is_none() {
            self.enter_listening();
        }
    }

    fn on_recognition(&mut self, event: RecognitionEvent) -> ControlFlow<()> {
        match event {
            RecognitionEvent::Interim(text) => {
                self.partial = text.clone();
                self.link.emit(ServerEvent::user_text(text, false));
                self.touch_idle();
            }
            RecognitionEvent::Final(text) => {
                self.partial.clear();
                self.awaiting_utterance = false;
                self.link.emit(ServerEvent::user_text(text.clone(), true));
                self.enqueue(Turn {
                    text,
                    synthetic: false,
                    arrived: Instant::now(),
                });
            }
            RecognitionEvent::SpeechStarted => {
                if self.state.is_busy() {
                    self.barge_in("speech");
                } else {
                    self.touch_idle();
                }
            }
            RecognitionEvent::UtteranceEnd => {
                if self.awaiting_utterance && self.turn.is_none() && self.queue.is_empty() {
                    debug!(session_id = %self.id, "barge-in ended without an utterance");
                    self.awaiting_utterance = false;
                    self.partial.clear();
                    self.enter_listening();
                }
            }
            RecognitionEvent::Error(message) => {
                warn!(session_id = %self.id, "speech recognition error: {}", message);
                self.link
                    .emit(ServerEvent::error(format!("Speech recognition error: {}", message)));
            }
            RecognitionEvent::Closed => {
                warn!(session_id = %self.id, "speech recognition connection lost");
                self.link
                    .emit(ServerEvent::error("Speech recognition connection lost"));
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    // Turns

    fn enqueue(&mut self, turn: Turn) {
        self.queue.push_back(turn);
        debug!(session_id = %self.id, queued = self.queue.len(), "turn queued");
        self.process_next();
    }

    /// Starts the oldest queued turn unless one is already in flight.
    fn process_next(&mut self) {
        if self.turn.is_some() {
            return;
        }
        let Some(turn) = self.queue.pop_front() else {
            return;
        };

        self.cancel_idle();
        self.last_turn_id += 1;
        let turn_id = self.last_turn_id;
        info!(
            session_id = %self.id,
            turn_id,
            synthetic = turn.synthetic,
            waited_ms = turn.arrived.elapsed().as_millis() as u64,
            "turn started"
        );
        self.set_state(AgentState::Thinking);

        let agent_cancel = self.root.child_token();
        let (writer, reader) = fragment_buffer();
        tokio::spawn(pump_agent(
            self.providers.agent.clone(),
            AgentRequest {
                text: turn.text,
                conversation_id: self.conversation_id.clone(),
            },
            agent_cancel.clone(),
            self.inbox.clone(),
            turn_id,
        ));

        let encouragement = self.settings.encouragement_delay.map(|delay| {
            let inbox = self.inbox.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = inbox.send(SessionInput::Encouragement { turn_id }).await;
            })
        });

        self.turn = Some(ActiveTurn {
            id: turn_id,
            writer,
            reader: Some(reader),
            agent_cancel,
            synth_cancel: None,
            filler_cancel: None,
            filler_task: None,
            encouragement,
            agent_done: false,
            synth_done: false,
        });
    }

    fn on_agent(&mut self, turn_id: u64, fragment: Result<AgentFragment, VoiceError>) {
        let Some(turn) = self.turn.as_mut().filter(|t| t.id == turn_id) else {
            debug!(session_id = %self.id, turn_id, "discarding agent output of finished turn");
            return;
        };

        match fragment {
            Ok(AgentFragment::Chunk(text)) => {
                let first = turn.writer.is_empty();
                turn.writer.push(text);
                self.link
                    .emit(ServerEvent::agent_text(turn.writer.text(), false, turn_id));
                if first {
                    self.begin_speaking(turn_id);
                }
            }
            Ok(AgentFragment::Done) => {
                turn.stop_encouragement();
                turn.writer.finish();
                turn.agent_done = true;
                let reply = turn.writer.text();
                if !reply.trim().is_empty() {
                    self.link.emit(ServerEvent::agent_text(reply, true, turn_id));
                }
                self.finish_turn_if_complete();
            }
            Err(e) if e.is_cancellation() => {}
            Err(e) => {
                warn!(session_id = %self.id, turn_id, "agent failed: {}", e);
                self.link
                    .emit(ServerEvent::error(format!("The agent could not respond: {}", e)));
                self.fail_turn();
            }
        }
    }

    /// Starts synthesis over the live fragment buffer on the first fragment.
    fn begin_speaking(&mut self, turn_id: u64) {
        let Some(turn) = self.turn.as_mut().filter(|t| t.id == turn_id) else {
            return;
        };
        turn.stop_encouragement();
        let Some(reader) = turn.reader.take() else {
            return;
        };

        let cancel = self.root.child_token();
        turn.synth_cancel = Some(cancel.clone());
        let filler = turn.filler_task.take();
        let sink = self.link.audio_sink(turn_id);
        let streamer = self.providers.synthesis.clone();
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            if let Some(filler) = filler {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = filler => {}
                }
            }
            let result = streamer.run(reader, sink, cancel).await;
            let _ = inbox
                .send(SessionInput::SynthesisFinished { turn_id, result })
                .await;
        });

        self.set_state(AgentState::Speaking);
    }

    fn on_synthesis_finished(&mut self, turn_id: u64, result: Result<(), VoiceError>) {
        let Some(turn) = self.turn.as_mut().filter(|t| t.id == turn_id) else {
            return;
        };
        match result {
            Ok(()) => {
                turn.synth_done = true;
                self.finish_turn_if_complete();
            }
            Err(e) if e.is_cancellation() => {}
            Err(e) => {
                warn!(session_id = %self.id, turn_id, "speech synthesis failed: {}", e);
                self.link
                    .emit(ServerEvent::error(format!("Speech synthesis failed: {}", e)));
                self.fail_turn();
            }
        }
    }

    fn finish_turn_if_complete(&mut self) {
        if !self.turn.as_ref().is_some_and(ActiveTurn::is_complete) {
            return;
        }
        if let Some(mut turn) = self.turn.take() {
            turn.stop_encouragement();
            info!(session_id = %self.id, turn_id = turn.id, "turn completed");
        }
        self.enter_listening();
        self.process_next();
    }

    /// Ends the current turn after a provider error; the session heals to
    /// `listening`.
    fn fail_turn(&mut self) {
        if let Some(mut turn) = self.turn.take() {
            turn.cancel();
        }
        self.enter_listening();
        self.process_next();
    }

    /// Cancels the in-flight turn because the caller started talking.
    /// The state is left alone; the caller's next utterance drives it.
    fn barge_in(&mut self, source: &'static str) {
        if !self.state.is_busy() {
            return;
        }
        let Some(mut turn) = self.turn.take() else {
            return;
        };
        turn.cancel();
        self.link.gate.silence_through(turn.id);
        self.link.emit(ServerEvent::Interrupted { turn_id: turn.id });
        self.awaiting_utterance = true;
        info!(session_id = %self.id, turn_id = turn.id, source, "barge-in");
        self.process_next();
    }

    // Timers

    fn cancel_idle(&mut self) {
        self.idle_generation += 1;
        if let Some(timer) = self.idle_timer.take() {
            timer.abort();
        }
    }

    fn restart_idle(&mut self) {
        self.cancel_idle();
        let Some(timeout) = self.settings.idle_timeout else {
            return;
        };
        let generation = self.idle_generation;
        let inbox = self.inbox.clone();
        self.idle_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = inbox.send(SessionInput::IdleTimeout { generation }).await;
        }));
    }

    /// Caller activity while listening pushes the idle prompt back.
    fn touch_idle(&mut self) {
        if self.state == AgentState::Listening {
            self.restart_idle();
        }
    }

    fn on_idle_timeout(&mut self, generation: u64) {
        if generation != self.idle_generation
            || self.state != AgentState::Listening
            || self.turn.is_some()
        {
            return;
        }
        self.idle_timer = None;
        info!(session_id = %self.id, "caller idle, prompting");
        self.enqueue(Turn {
            text: self.settings.idle_prompt.clone(),
            synthetic: true,
            arrived: Instant::now(),
        });
    }

    fn on_encouragement(&mut self, turn_id: u64) {
        let Some(turn) = self
            .turn
            .as_mut()
            .filter(|t| t.id == turn_id && t.writer.is_empty() && t.synth_cancel.is_none())
        else {
            return;
        };
        turn.encouragement = None;
        let text = self.settings.encouragement_text.trim().to_string();
        if text.is_empty() {
            return;
        }

        debug!(session_id = %self.id, turn_id, "agent slow, sending filler");
        self.link.emit(ServerEvent::agent_text(text.clone(), true, turn_id));
        if !self.providers.synthesis.is_configured() {
            return;
        }

        let cancel = self.root.child_token();
        let sink = self.link.audio_sink(turn_id);
        let streamer = self.providers.synthesis.clone();
        let task_cancel = cancel.clone();
        let session_id = self.id.clone();
        turn.filler_cancel = Some(cancel);
        turn.filler_task = Some(tokio::spawn(async move {
            if let Err(e) = streamer.speak(&text, &sink, &task_cancel).await {
                if !e.is_cancellation() {
                    warn!(session_id = %session_id, turn_id, "filler synthesis failed: {}", e);
                }
            }
        }));
    }

    fn teardown(&mut self) {
        if let Some(mut turn) = self.turn.take() {
            turn.cancel();
        }
        self.queue.clear();
        self.cancel_idle();
        self.stop_recognition();
        self.root.cancel();
        self.providers
            .agent
            .end_conversation(&self.minted_conversation);
        info!(session_id = %self.id, state = %self.state, "session closed");
    }
}

/// Forwards one turn's agent output to the session inbox.
async fn pump_agent(
    agent: Arc<dyn AgentBridge>,
    request: AgentRequest,
    cancel: CancellationToken,
    inbox: mpsc::Sender<SessionInput>,
    turn_id: u64,
) {
    let started = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        started = agent.respond(request, cancel.clone()) => started,
    };
    let mut stream = match started {
        Ok(stream) => stream,
        Err(e) => {
            let _ = inbox
                .send(SessionInput::Agent {
                    turn_id,
                    fragment: Err(e),
                })
                .await;
            return;
        }
    };

    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            item = stream.recv() => item,
        };
        let fragment = match item {
            Some(fragment) => fragment,
            None => Err(VoiceError::Agent(
                "agent stream ended before completing".to_string(),
            )),
        };
        let last = !matches!(fragment, Ok(AgentFragment::Chunk(_)));
        if inbox
            .send(SessionInput::Agent { turn_id, fragment })
            .await
            .is_err()
            || last
        {
            return;
        }
    }
}
