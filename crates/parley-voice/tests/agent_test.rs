use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use parley_voice::{
    AgentBridge, AgentConfig, AgentFragment, AgentRequest, FunctionDefinition, HttpAgentBridge,
    VoiceError,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct MockAgent {
    requests: Mutex<Vec<Value>>,
    function_calls: Mutex<Vec<Value>>,
}

fn sse(chunks: &[Value]) -> String {
    let mut body = String::new();
    for chunk in chunks {
        body.push_str(&format!("data: {}\n\n", chunk));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

fn text_delta(text: &str) -> Value {
    json!({ "choices": [{ "delta": { "content": text } }] })
}

async fn completions(State(mock): State<Arc<MockAgent>>, Json(body): Json<Value>) -> impl IntoResponse {
    let has_tool_result = body["messages"]
        .as_array()
        .map(|m| m.iter().any(|msg| msg["role"] == "tool"))
        .unwrap_or(false);
    let asks_for_hours = body["messages"]
        .as_array()
        .and_then(|m| m.last())
        .map(|msg| msg["content"] == "When do you open?")
        .unwrap_or(false);
    mock.requests.lock().unwrap().push(body);

    let events = if asks_for_hours && !has_tool_result {
        vec![
            json!({ "choices": [{ "delta": { "tool_calls": [
                { "index": 0, "id": "call_1", "function": { "name": "opening_", "arguments": "{\"day\":" } }
            ] } }] }),
            json!({ "choices": [{ "delta": { "tool_calls": [
                { "index": 0, "function": { "name": "hours", "arguments": "\"monday\"}" } }
            ] } }] }),
        ]
    } else if has_tool_result {
        vec![text_delta("We open "), text_delta("at nine.")]
    } else {
        vec![text_delta("Hello! "), text_delta("How can I help?")]
    };
    ([(header::CONTENT_TYPE, "text/event-stream")], sse(&events))
}

async fn functions(State(mock): State<Arc<MockAgent>>, Json(body): Json<Value>) -> Json<Value> {
    mock.function_calls.lock().unwrap().push(body);
    Json(json!({ "opens": "09:00" }))
}

async fn slow(Json(_body): Json<Value>) -> impl IntoResponse {
    tokio::time::sleep(Duration::from_secs(10)).await;
    ([(header::CONTENT_TYPE, "text/event-stream")], sse(&[text_delta("too late")]))
}

async fn failing(Json(_body): Json<Value>) -> impl IntoResponse {
    (StatusCode::INTERNAL_SERVER_ERROR, "model overloaded")
}

async fn start_mock() -> (String, Arc<MockAgent>) {
    let mock = Arc::new(MockAgent::default());
    let app = Router::new()
        .route("/v1/chat/completions", post(completions))
        .route("/functions", post(functions))
        .route("/slow", post(slow))
        .route("/failing", post(failing))
        .with_state(mock.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), mock)
}

fn config(base: &str) -> AgentConfig {
    AgentConfig {
        url: format!("{}/v1/chat/completions", base),
        function_endpoint: Some(format!("{}/functions", base)),
        functions: vec![FunctionDefinition {
            name: "opening_hours".to_string(),
            description: "Opening hours for a day".to_string(),
            parameters: json!({ "type": "object", "properties": { "day": { "type": "string" } } }),
        }],
        ..AgentConfig::default()
    }
}

async fn collect(bridge: &HttpAgentBridge, text: &str, conversation: &str) -> Vec<AgentFragment> {
    let mut stream = bridge
        .respond(
            AgentRequest {
                text: text.to_string(),
                conversation_id: conversation.to_string(),
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();
    let mut fragments = Vec::new();
    while let Some(item) = stream.recv().await {
        fragments.push(item.unwrap());
    }
    fragments
}

#[tokio::test]
async fn streams_fragments_then_done_and_remembers_the_turn() {
    let (base, mock) = start_mock().await;
    let bridge = HttpAgentBridge::new(config(&base));

    let fragments = collect(&bridge, "Hi there", "conv-1").await;
    assert_eq!(
        fragments,
        vec![
            AgentFragment::Chunk("Hello! ".to_string()),
            AgentFragment::Chunk("How can I help?".to_string()),
            AgentFragment::Done,
        ]
    );

    let history = bridge.memory().history("conv-1");
    assert_eq!(history.len(), 2);
    assert_eq!(history[1]["content"], "Hello! How can I help?");

    // The second turn carries the first as context.
    collect(&bridge, "Thanks", "conv-1").await;
    let requests = mock.requests.lock().unwrap();
    let messages = requests[1]["messages"].as_array().unwrap();
    assert_eq!(messages[0]["role"], "system");
    assert_eq!(messages[1]["content"], "Hi there");
    assert_eq!(messages.last().unwrap()["content"], "Thanks");
    assert!(requests[1]["tools"].is_array());
}

#[tokio::test]
async fn function_calls_are_executed_and_fed_back() {
    let (base, mock) = start_mock().await;
    let bridge = HttpAgentBridge::new(config(&base));

    let fragments = collect(&bridge, "When do you open?", "conv-2").await;
    assert_eq!(
        fragments,
        vec![
            AgentFragment::Chunk("We open ".to_string()),
            AgentFragment::Chunk("at nine.".to_string()),
            AgentFragment::Done,
        ]
    );

    let calls = mock.function_calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0]["name"], "opening_hours");
    assert_eq!(calls[0]["arguments"]["day"], "monday");

    let requests = mock.requests.lock().unwrap();
    assert_eq!(requests.len(), 2);
    let follow_up = requests[1]["messages"].as_array().unwrap();
    let tool = follow_up.iter().find(|m| m["role"] == "tool").unwrap();
    assert_eq!(tool["tool_call_id"], "call_1");
    assert!(tool["content"].as_str().unwrap().contains("09:00"));
}

#[tokio::test]
async fn cancellation_ends_stream_without_done() {
    let (base, _mock) = start_mock().await;
    let bridge = HttpAgentBridge::new(AgentConfig {
        url: format!("{}/slow", base),
        ..AgentConfig::default()
    });

    let cancel = CancellationToken::new();
    let mut stream = bridge
        .respond(
            AgentRequest {
                text: "Hello".to_string(),
                conversation_id: "conv-3".to_string(),
            },
            cancel.clone(),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let next = tokio::time::timeout(Duration::from_secs(2), stream.recv())
        .await
        .expect("stream should close promptly after cancel");
    assert!(next.is_none());
    assert!(bridge.memory().history("conv-3").is_empty());
}

#[tokio::test]
async fn provider_failure_is_reported_on_the_stream() {
    let (base, _mock) = start_mock().await;
    let bridge = HttpAgentBridge::new(AgentConfig {
        url: format!("{}/failing", base),
        ..AgentConfig::default()
    });

    let mut stream = bridge
        .respond(
            AgentRequest {
                text: "Hello".to_string(),
                conversation_id: "conv-4".to_string(),
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();

    match stream.recv().await {
        Some(Err(VoiceError::Agent(message))) => assert!(message.contains("500")),
        other => panic!("expected agent error, got {:?}", other),
    }
    assert!(stream.recv().await.is_none());
}

#[tokio::test]
async fn empty_utterance_is_rejected() {
    let bridge = HttpAgentBridge::new(AgentConfig::default());
    let result = bridge
        .respond(
            AgentRequest {
                text: "   ".to_string(),
                conversation_id: "conv-5".to_string(),
            },
            CancellationToken::new(),
        )
        .await;
    assert!(matches!(result, Err(VoiceError::Agent(_))));
}
