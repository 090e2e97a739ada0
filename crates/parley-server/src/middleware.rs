//! Connection admission for the voice WebSocket.

use crate::registry::{SessionLease, SessionRegistry};
use axum::{
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Why a connection was refused before the upgrade.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("origin not allowed: {0}")]
    OriginNotAllowed(String),

    #[error("connection limit of {limit} reached")]
    AtCapacity { limit: usize },

    #[error("server is shutting down")]
    ShuttingDown,
}

impl AdmissionError {
    pub fn status(&self) -> StatusCode {
        match self {
            AdmissionError::OriginNotAllowed(_) => StatusCode::FORBIDDEN,
            AdmissionError::AtCapacity { .. } | AdmissionError::ShuttingDown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        }
    }
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            return (status, [(header::RETRY_AFTER, "5")], self.to_string()).into_response();
        }
        (status, self.to_string()).into_response()
    }
}

/// Origin allow-list and connection cap applied to upgrade requests.
#[derive(Debug, Clone)]
pub struct AdmissionPolicy {
    allowed_origins: Vec<String>,
    allow_any_origin: bool,
    max_connections: usize,
}

impl AdmissionPolicy {
    pub fn new(allowed_origins: &[String], max_connections: usize) -> Self {
        let allowed_origins: Vec<String> = allowed_origins
            .iter()
            .map(|o| normalize_origin(o))
            .filter(|o| !o.is_empty())
            .collect();
        let allow_any_origin = allowed_origins.is_empty() || allowed_origins.iter().any(|o| o == "*");
        Self {
            allowed_origins,
            allow_any_origin,
            max_connections,
        }
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Checks the `Origin` header. A missing header is refused once an
    /// allow-list is configured.
    pub fn check_origin(&self, headers: &HeaderMap) -> Result<(), AdmissionError> {
        if self.allow_any_origin {
            return Ok(());
        }
        let origin = headers
            .get(header::ORIGIN)
            .and_then(|value| value.to_str().ok())
            .map(normalize_origin)
            .unwrap_or_default();
        if !origin.is_empty() && self.allowed_origins.iter().any(|o| *o == origin) {
            Ok(())
        } else {
            Err(AdmissionError::OriginNotAllowed(if origin.is_empty() {
                "<none>".to_string()
            } else {
                origin
            }))
        }
    }

    /// Runs every admission check and reserves a registry slot.
    pub fn admit(
        &self,
        headers: &HeaderMap,
        registry: &SessionRegistry,
    ) -> Result<SessionLease, AdmissionError> {
        self.check_origin(headers)?;
        registry.register(self.max_connections)
    }
}

fn normalize_origin(origin: &str) -> String {
    origin.trim().trim_end_matches('/').to_ascii_lowercase()
}
