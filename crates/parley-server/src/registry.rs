//! Process-wide registry of live voice sessions.

use crate::middleware::AdmissionError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct RegistryInner {
    sessions: Mutex<HashMap<String, CancellationToken>>,
    accepting: AtomicBool,
    drained: Notify,
}

/// Live sessions keyed by id, each with the token that stops it.
///
/// Created once at server start. Entries are added at admission and removed
/// when their [`SessionLease`] drops; [`SessionRegistry::shutdown`] cancels
/// and drains whatever is left.
///
/// Uses `std::sync::Mutex`: every critical section is a short map operation
/// that never spans an `.await`.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: Mutex::new(HashMap::new()),
                accepting: AtomicBool::new(true),
                drained: Notify::new(),
            }),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        match self.inner.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("session registry lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Reserves a slot for a new session, enforcing `max_connections`.
    pub fn register(&self, max_connections: usize) -> Result<SessionLease, AdmissionError> {
        let mut sessions = self.sessions();
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(AdmissionError::ShuttingDown);
        }
        if sessions.len() >= max_connections {
            return Err(AdmissionError::AtCapacity {
                limit: max_connections,
            });
        }

        let id = Uuid::new_v4().to_string();
        let token = CancellationToken::new();
        sessions.insert(id.clone(), token.clone());
        Ok(SessionLease {
            id,
            token,
            registry: self.clone(),
        })
    }

    /// Removes a session. Returns whether it was present.
    pub fn remove(&self, id: &str) -> bool {
        let mut sessions = self.sessions();
        let removed = sessions.remove(id).is_some();
        if sessions.is_empty() {
            self.inner.drained.notify_waiters();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }

    /// Stops admissions, cancels every live session and waits for the map
    /// to drain. Returns `false` if `timeout` elapsed first.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let live: Vec<CancellationToken> = {
            let sessions = self.sessions();
            self.inner.accepting.store(false, Ordering::SeqCst);
            sessions.values().cloned().collect()
        };
        tracing::info!(sessions = live.len(), "draining voice sessions");
        for token in &live {
            token.cancel();
        }

        let drained = async {
            loop {
                let notified = self.inner.drained.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.is_empty() {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, drained).await.is_ok()
    }
}

/// A registered session slot; dropping it deregisters the session.
pub struct SessionLease {
    id: String,
    token: CancellationToken,
    registry: SessionRegistry,
}

impl SessionLease {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Fires when the server wants this session gone.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
    }
}

impl std::fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease").field("id", &self.id).finish()
    }
}
