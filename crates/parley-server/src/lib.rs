//! Parley voice server library logic.

pub mod api_ws;
pub mod config;
pub mod middleware;
pub mod registry;
pub mod session;

use axum::{routing::get, Extension, Json, Router};
use chrono::{DateTime, Utc};
use config::Config;
use middleware::AdmissionPolicy;
use parley_voice::{
    HttpAgentBridge, SpeechSynthesizer, StreamingRecognizer, StreamingSynthesizer,
    SynthesisStreamer,
};
use registry::SessionRegistry;
use serde_json::{json, Value};
use session::{Providers, SessionSettings};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Loaded configuration.
    pub config: Arc<Config>,
    /// Live voice sessions.
    pub registry: SessionRegistry,
    /// Origin and capacity checks for new connections.
    pub admission: AdmissionPolicy,
    /// Provider adapters handed to every session.
    pub providers: Providers,
    /// Session timers and phrasing.
    pub settings: SessionSettings,
    /// When this server started.
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: Config, providers: Providers) -> Self {
        Self {
            admission: AdmissionPolicy::new(
                &config.server.allowed_origins,
                config.server.max_connections,
            ),
            settings: SessionSettings::from(&config.session),
            registry: SessionRegistry::new(),
            providers,
            config: Arc::new(config),
            started_at: Utc::now(),
        }
    }

    /// Builds state with the production provider adapters.
    pub fn from_config(config: Config) -> Self {
        let providers = providers_from_config(&config);
        Self::new(config, providers)
    }
}

/// Creates the recognition, agent and synthesis adapters from config.
///
/// Synthesis is optional: without a voice the streamer reports one error
/// per turn and sessions continue text-only.
pub fn providers_from_config(config: &Config) -> Providers {
    let synthesizer: Option<Arc<dyn SpeechSynthesizer>> =
        match StreamingSynthesizer::new(config.synthesis.clone()) {
            Ok(synthesizer) => Some(Arc::new(synthesizer)),
            Err(e) => {
                tracing::warn!("speech synthesis disabled: {}", e);
                None
            }
        };

    Providers {
        recognizer: Arc::new(StreamingRecognizer::new(config.recognition.clone())),
        agent: Arc::new(HttpAgentBridge::new(config.agent.clone())),
        synthesis: SynthesisStreamer::new(synthesizer, config.synthesis.max_unit_chars),
    }
}

/// Drains live sessions after a shutdown signal.
///
/// `on_deadline` runs `timeout` after this is called unless the process has
/// exited first; the drain itself gets the same window. Returns whether every
/// session closed in time.
pub async fn drain_sessions<F>(
    registry: &SessionRegistry,
    timeout: Duration,
    on_deadline: F,
) -> bool
where
    F: FnOnce() + Send + 'static,
{
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        on_deadline();
    });
    let drained = registry.shutdown(timeout).await;
    if drained {
        tracing::info!("all voice sessions drained");
    } else {
        tracing::warn!(
            remaining = registry.len(),
            timeout_secs = timeout.as_secs(),
            "voice sessions did not drain in time"
        );
    }
    drained
}

/// Health check handler.
async fn health(Extension(state): Extension<Arc<AppState>>) -> Json<Value> {
    let status = if state.registry.is_accepting() {
        "ok"
    } else {
        "draining"
    };
    Json(json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": state.registry.len(),
        "startedAt": state.started_at.to_rfc3339(),
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(api_ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(Arc::new(state)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::Mutex;
    use tokio::time::Instant;
    use tower::ServiceExt;

    #[tokio::test]
    async fn health_check_reports_sessions() {
        let state = AppState::from_config(Config::default());
        let registry = state.registry.clone();
        let _lease = registry.register(10).unwrap();
        let app = app(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(json["sessions"], 1);
    }

    #[test]
    fn synthesis_without_voice_is_disabled() {
        let providers = providers_from_config(&Config::default());
        assert!(!providers.synthesis.is_configured());
    }

    #[tokio::test(start_paused = true)]
    async fn drain_deadline_counts_from_the_signal() {
        let registry = SessionRegistry::new();
        let _stuck = registry.register(4).unwrap();
        let fired: Arc<Mutex<Option<Instant>>> = Arc::default();
        let record = fired.clone();
        let timeout = Duration::from_secs(10);

        let signalled = Instant::now();
        let drained = drain_sessions(&registry, timeout, move || {
            *record.lock().unwrap() = Some(Instant::now());
        })
        .await;
        assert!(!drained);
        tokio::time::sleep(Duration::from_millis(1)).await;

        let fired_at = fired.lock().unwrap().expect("deadline never fired");
        assert_eq!(fired_at - signalled, timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_returns_early_when_sessions_close() {
        let registry = SessionRegistry::new();
        let lease = registry.register(4).unwrap();
        let token = lease.token();
        tokio::spawn(async move {
            token.cancelled().await;
            drop(lease);
        });

        let started = Instant::now();
        assert!(drain_sessions(&registry, Duration::from_secs(10), || {}).await);
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
