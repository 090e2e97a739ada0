use crate::config::AgentConfig;
use crate::error::VoiceError;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Fragments buffered between the HTTP stream and the session.
const FRAGMENT_QUEUE_CAPACITY: usize = 256;

/// Highest tool-call `index` accepted from a completion stream.
const MAX_TOOL_CALLS: usize = 32;

/// One piece of the agent's reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentFragment {
    /// Next slice of reply text, in generation order.
    Chunk(String),
    /// Generation finished normally. Never sent after cancellation.
    Done,
}

/// A finalized utterance to answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRequest {
    pub text: String,
    /// Stable across a conversation's turns; selects the agent's context.
    pub conversation_id: String,
}

/// Incremental reply: fragments in order, then [`AgentFragment::Done`].
pub type FragmentStream = mpsc::Receiver<Result<AgentFragment, VoiceError>>;

/// A conversational agent producing text incrementally.
#[async_trait]
pub trait AgentBridge: Send + Sync {
    /// Starts answering `request`. Fragments are yielded as soon as the agent
    /// produces them; when `cancel` fires the stream ends without `Done`.
    async fn respond(
        &self,
        request: AgentRequest,
        cancel: CancellationToken,
    ) -> Result<FragmentStream, VoiceError>;

    /// Releases whatever the agent keeps for `conversation_id`.
    fn end_conversation(&self, _conversation_id: &str) {}
}

/// Per-conversation chat history, bounded to the most recent messages and
/// the most recently used conversations.
///
/// Uses `std::sync::Mutex`: every critical section is a short map operation
/// that never spans an `.await`.
#[derive(Debug, Clone)]
pub struct ConversationMemory {
    limit: usize,
    max_conversations: usize,
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    clock: u64,
    conversations: HashMap<String, Conversation>,
}

#[derive(Debug)]
struct Conversation {
    last_used: u64,
    messages: Vec<Value>,
}

impl ConversationMemory {
    pub fn new(limit: usize, max_conversations: usize) -> Self {
        Self {
            limit: limit.max(2),
            max_conversations: max_conversations.max(1),
            inner: Arc::new(Mutex::new(MemoryInner::default())),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("conversation memory lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Messages retained for `conversation_id`, oldest first.
    pub fn history(&self, conversation_id: &str) -> Vec<Value> {
        let mut inner = self.lock();
        inner.clock += 1;
        let now = inner.clock;
        match inner.conversations.get_mut(conversation_id) {
            Some(conversation) => {
                conversation.last_used = now;
                conversation.messages.clone()
            }
            None => Vec::new(),
        }
    }

    /// Records a completed exchange, evicting the least recently used
    /// conversation when over capacity.
    pub fn commit(&self, conversation_id: &str, user_text: &str, reply: &str) {
        let mut inner = self.lock();
        inner.clock += 1;
        let now = inner.clock;
        let conversation = inner
            .conversations
            .entry(conversation_id.to_string())
            .or_insert_with(|| Conversation {
                last_used: now,
                messages: Vec::new(),
            });
        conversation.last_used = now;
        conversation.messages.push(json!({ "role": "user", "content": user_text }));
        conversation.messages.push(json!({ "role": "assistant", "content": reply }));
        if conversation.messages.len() > self.limit {
            let excess = conversation.messages.len() - self.limit;
            conversation.messages.drain(..excess);
        }

        while inner.conversations.len() > self.max_conversations {
            let oldest = inner
                .conversations
                .iter()
                .min_by_key(|(_, c)| c.last_used)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => {
                    debug!(conversation_id = %id, "evicting conversation history");
                    inner.conversations.remove(&id);
                }
                None => break,
            }
        }
    }

    /// Drops a conversation's history.
    pub fn forget(&self, conversation_id: &str) {
        self.lock().conversations.remove(conversation_id);
    }

    /// Number of conversations with retained history.
    pub fn len(&self) -> usize {
        self.lock().conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Executes agent function calls against the external HTTP endpoint.
#[derive(Debug, Clone)]
pub struct FunctionEndpoint {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl FunctionEndpoint {
    pub fn new(client: reqwest::Client, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            url: url.into(),
            timeout,
        }
    }

    /// POSTs `{name, arguments}` and returns the JSON result.
    pub async fn call(&self, name: &str, arguments: &str) -> Result<Value, VoiceError> {
        let arguments: Value = if arguments.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(arguments).unwrap_or_else(|_| Value::String(arguments.to_string()))
        };

        let response = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&json!({ "name": name, "arguments": arguments }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VoiceError::Function(format!(
                "function '{}' returned {}: {}",
                name,
                status,
                body.trim()
            )));
        }
        Ok(response.json::<Value>().await?)
    }
}

/// OpenAI-compatible streaming chat completions with optional function calling.
#[derive(Debug, Clone)]
pub struct HttpAgentBridge {
    client: reqwest::Client,
    config: Arc<AgentConfig>,
    memory: ConversationMemory,
    functions: Option<FunctionEndpoint>,
}

impl HttpAgentBridge {
    pub fn new(config: AgentConfig) -> Self {
        let client = reqwest::Client::new();
        let functions = config.function_endpoint.as_ref().map(|url| {
            FunctionEndpoint::new(
                client.clone(),
                url.clone(),
                Duration::from_secs(config.function_timeout_secs),
            )
        });
        Self {
            memory: ConversationMemory::new(config.memory_messages, config.max_conversations),
            client,
            config: Arc::new(config),
            functions,
        }
    }

    pub fn memory(&self) -> &ConversationMemory {
        &self.memory
    }

    fn request_body(&self, messages: &[Value]) -> Value {
        let mut body = json!({
            "model": self.config.model,
            "stream": true,
            "messages": messages,
        });
        if self.functions.is_some() && !self.config.functions.is_empty() {
            let tools: Vec<Value> = self
                .config
                .functions
                .iter()
                .map(|f| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": f.name,
                            "description": f.description,
                            "parameters": f.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = Value::Array(tools);
        }
        body
    }
}

#[async_trait]
impl AgentBridge for HttpAgentBridge {
    async fn respond(
        &self,
        request: AgentRequest,
        cancel: CancellationToken,
    ) -> Result<FragmentStream, VoiceError> {
        if request.text.trim().is_empty() {
            return Err(VoiceError::Agent("empty utterance".to_string()));
        }
        let (tx, rx) = mpsc::channel(FRAGMENT_QUEUE_CAPACITY);
        let bridge = self.clone();
        tokio::spawn(async move {
            if let Err(e) = bridge.run(&request, &tx, &cancel).await {
                if !e.is_cancellation() {
                    let _ = tx.send(Err(e)).await;
                }
            }
        });
        Ok(rx)
    }

    fn end_conversation(&self, conversation_id: &str) {
        self.memory.forget(conversation_id);
    }
}

/// Outcome of streaming one completion.
enum Completion {
    Reply(String),
    ToolCalls { content: String, calls: Vec<ToolCall> },
}

impl HttpAgentBridge {
    async fn run(
        &self,
        request: &AgentRequest,
        tx: &mpsc::Sender<Result<AgentFragment, VoiceError>>,
        cancel: &CancellationToken,
    ) -> Result<(), VoiceError> {
        let mut messages = vec![json!({ "role": "system", "content": self.config.system_prompt })];
        messages.extend(self.memory.history(&request.conversation_id));
        messages.push(json!({ "role": "user", "content": request.text }));

        let mut spoken = String::new();
        for round in 0..=self.config.max_tool_rounds {
            match self.complete(&messages, tx, cancel).await? {
                Completion::Reply(text) => {
                    spoken.push_str(&text);
                    if cancel.is_cancelled() {
                        return Err(VoiceError::Cancelled);
                    }
                    self.memory
                        .commit(&request.conversation_id, &request.text, &spoken);
                    tx.send(Ok(AgentFragment::Done))
                        .await
                        .map_err(|_| VoiceError::Cancelled)?;
                    return Ok(());
                }
                Completion::ToolCalls { content, calls } => {
                    spoken.push_str(&content);
                    let Some(endpoint) = &self.functions else {
                        return Err(VoiceError::Agent(
                            "agent requested a function but no function endpoint is configured"
                                .to_string(),
                        ));
                    };
                    if round == self.config.max_tool_rounds {
                        break;
                    }
                    let assistant_content = if content.is_empty() {
                        Value::Null
                    } else {
                        Value::String(content)
                    };
                    let requested: Vec<Value> = calls.iter().map(ToolCall::to_message).collect();
                    messages.push(json!({
                        "role": "assistant",
                        "content": assistant_content,
                        "tool_calls": requested,
                    }));
                    for call in &calls {
                        info!(function = %call.name, conversation_id = %request.conversation_id, "agent function call");
                        let result = tokio::select! {
                            _ = cancel.cancelled() => return Err(VoiceError::Cancelled),
                            r = endpoint.call(&call.name, &call.arguments) => r,
                        };
                        let content = match result {
                            Ok(value) => value.to_string(),
                            Err(e) => {
                                warn!(function = %call.name, "function call failed: {}", e);
                                json!({ "error": e.to_string() }).to_string()
                            }
                        };
                        messages.push(json!({
                            "role": "tool",
                            "tool_call_id": call.id,
                            "content": content,
                        }));
                    }
                }
            }
        }

        Err(VoiceError::Agent(format!(
            "agent exceeded {} function-call rounds",
            self.config.max_tool_rounds
        )))
    }

    /// Streams one completion, forwarding text deltas as they arrive.
    async fn complete(
        &self,
        messages: &[Value],
        tx: &mpsc::Sender<Result<AgentFragment, VoiceError>>,
        cancel: &CancellationToken,
    ) -> Result<Completion, VoiceError> {
        let mut builder = self.client.post(&self.config.url).json(&self.request_body(messages));
        if !self.config.api_key.is_empty() {
            builder = builder.bearer_auth(&self.config.api_key);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(VoiceError::Cancelled),
            r = builder.send() => r?,
        };
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VoiceError::Agent(format!("agent returned {}: {}", status, body.trim())));
        }

        let mut body = response.bytes_stream();
        let mut decoder = SseDecoder::default();
        let mut text = String::new();
        let mut calls = ToolCallAccumulator::default();

        'stream: loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(VoiceError::Cancelled),
                chunk = body.next() => chunk,
            };
            let bytes = match chunk {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => return Err(VoiceError::Http(e)),
                None => break,
            };
            for data in decoder.feed(&bytes) {
                if data == "[DONE]" {
                    break 'stream;
                }
                let delta = match serde_json::from_str::<Value>(&data) {
                    Ok(value) => value,
                    Err(e) => {
                        debug!("skipping unparseable completion chunk: {}", e);
                        continue;
                    }
                };
                if let Some(message) = delta.pointer("/error/message").and_then(Value::as_str) {
                    return Err(VoiceError::Agent(message.to_string()));
                }
                let Some(choice) = delta.pointer("/choices/0/delta") else {
                    continue;
                };
                if let Some(content) = choice.get("content").and_then(Value::as_str) {
                    if !content.is_empty() {
                        text.push_str(content);
                        tx.send(Ok(AgentFragment::Chunk(content.to_string())))
                            .await
                            .map_err(|_| VoiceError::Cancelled)?;
                    }
                }
                if let Some(tool_calls) = choice.get("tool_calls").and_then(Value::as_array) {
                    for call in tool_calls {
                        calls.apply(call)?;
                    }
                }
            }
        }

        if calls.is_empty() {
            Ok(Completion::Reply(text))
        } else {
            Ok(Completion::ToolCalls {
                content: text,
                calls: calls.finish(),
            })
        }
    }
}

/// Splits a server-sent-events byte stream into `data:` payloads.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);
            if let Some(data) = line.strip_prefix("data:") {
                payloads.push(data.trim_start().to_string());
            }
        }
        payloads
    }
}

/// A fully assembled function call requested by the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl ToolCall {
    fn to_message(&self) -> Value {
        json!({
            "id": self.id,
            "type": "function",
            "function": { "name": self.name, "arguments": self.arguments },
        })
    }
}

/// Merges streamed tool-call deltas by their `index`.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: Vec<ToolCall>,
}

impl ToolCallAccumulator {
    /// Folds one delta in. Indices at or above the tool-call cap are
    /// rejected before anything is allocated.
    pub fn apply(&mut self, delta: &Value) -> Result<(), VoiceError> {
        let index = delta.get("index").and_then(Value::as_u64).unwrap_or(0);
        let index = match usize::try_from(index) {
            Ok(index) if index < MAX_TOOL_CALLS => index,
            _ => {
                return Err(VoiceError::Agent(format!(
                    "tool call index {} exceeds the limit of {}",
                    index, MAX_TOOL_CALLS
                )))
            }
        };
        while self.calls.len() <= index {
            self.calls.push(ToolCall {
                id: String::new(),
                name: String::new(),
                arguments: String::new(),
            });
        }
        let call = &mut self.calls[index];
        if let Some(id) = delta.get("id").and_then(Value::as_str) {
            call.id = id.to_string();
        }
        if let Some(name) = delta.pointer("/function/name").and_then(Value::as_str) {
            call.name.push_str(name);
        }
        if let Some(arguments) = delta.pointer("/function/arguments").and_then(Value::as_str) {
            call.arguments.push_str(arguments);
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.calls.iter().all(|c| c.name.is_empty())
    }

    pub fn finish(self) -> Vec<ToolCall> {
        self.calls.into_iter().filter(|c| !c.name.is_empty()).collect()
    }
}
