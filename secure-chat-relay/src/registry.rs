use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use chrono::{DateTime, Local};
use tokio::sync::Mutex;
use tracing::info;

use crate::{
    crypto::MAX_PLAINTEXT_LEN,
    error::SessionError,
    session::{CLOCK_FORMAT, SessionHandle, SessionId, SessionState},
};

/// Point-in-time view of one registered session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: SessionId,
    pub username: String,
    pub connected_at: DateTime<Local>,
}

/// Shared set of authenticated sessions.
///
/// Every mutation and every broadcast goes through the same lock, so a
/// broadcast never interleaves with an add or a remove. Entries are keyed by
/// id, and ids only grow, so key order is registration order.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    sessions: Mutex<BTreeMap<SessionId, Arc<SessionHandle>>>,
    next_id: AtomicU64,
}

impl Default for RegistryInner {
    fn default() -> Self {
        Self {
            sessions: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the next session id. Ids are never reused.
    pub fn next_id(&self) -> SessionId {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers an authenticated session. Returns `false` if the session is
    /// not authenticated or its id is already present.
    pub async fn add(&self, session: Arc<SessionHandle>) -> bool {
        if session.state() != SessionState::Authenticated {
            return false;
        }
        let mut sessions = self.inner.sessions.lock().await;
        if sessions.contains_key(&session.id()) {
            return false;
        }
        sessions.insert(session.id(), session);
        true
    }

    /// Removes a session; absent ids are a no-op.
    pub async fn remove_by_id(&self, id: SessionId) -> Option<Arc<SessionHandle>> {
        self.inner.sessions.lock().await.remove(&id)
    }

    pub async fn snapshot(&self) -> Vec<SessionSummary> {
        self.inner
            .sessions
            .lock()
            .await
            .values()
            .map(|session| SessionSummary {
                id: session.id(),
                username: session.username().to_string(),
                connected_at: session.connected_at(),
            })
            .collect()
    }

    pub async fn handles(&self) -> Vec<Arc<SessionHandle>> {
        self.inner.sessions.lock().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Sends `"<time> - <text>\n"` to every registered session.
    ///
    /// Walks newest to oldest. A session reported undeliverable is dropped from
    /// the registry on the spot. Returns the number of sessions reached.
    ///
    /// A line too long for one frame is refused before any session is touched.
    pub async fn broadcast(&self, text: &str) -> Result<usize, SessionError> {
        let line = format!("{} - {}\n", Local::now().format(CLOCK_FORMAT), text);
        if line.len() > MAX_PLAINTEXT_LEN {
            return Err(SessionError::LineTooLong {
                len: line.len(),
                max: MAX_PLAINTEXT_LEN,
            });
        }
        let mut sessions = self.inner.sessions.lock().await;
        info!(target: "room", "{}", line.trim_end());

        let recipients: Vec<SessionId> = sessions.keys().rev().copied().collect();
        let mut delivered = 0;
        for id in recipients {
            let Some(session) = sessions.get(&id).cloned() else {
                continue;
            };
            if session.write_encrypted(&line).await {
                delivered += 1;
            } else {
                sessions.remove(&id);
                info!(
                    id,
                    username = %session.username(),
                    "disconnected client removed from list"
                );
            }
        }
        Ok(delivered)
    }
}
