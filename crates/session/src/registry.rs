//! Registry of live sessions.
//!
//! One handle per running session, keyed by session id. The registry is a
//! plain injectable value; hosts construct one and thread clones through,
//! there is no process-wide singleton.

use std::{
    collections::HashMap,
    sync::{
        Arc, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use tracing::debug;

use crate::events::{EventSender, SessionEvent};

static NEXT_NONCE: AtomicU64 = AtomicU64::new(1);

/// Terminate handle for one live session. The nonce distinguishes a handle
/// from a later session registered under the same id.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    events: EventSender,
    nonce: u64,
}

impl SessionHandle {
    #[must_use]
    pub fn new(events: EventSender) -> Self {
        Self {
            events,
            nonce: NEXT_NONCE.fetch_add(1, Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// Ask the session to shut down. Best-effort: a session already
    /// finalizing suppresses the event.
    pub async fn terminate(&self) {
        self.events.send(SessionEvent::HostRequested).await;
    }
}

/// Id-keyed map of live sessions. Cloning shares the underlying map.
#[derive(Debug, Clone, Default)]
pub struct ActiveSessionRegistry {
    inner: Arc<RwLock<HashMap<String, SessionHandle>>>,
}

impl ActiveSessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session, returning the handle it displaced when the id
    /// was already live.
    pub fn insert(&self, id: &str, handle: SessionHandle) -> Option<SessionHandle> {
        let previous = match self.inner.write() {
            Ok(mut map) => map.insert(id.to_string(), handle),
            Err(_) => None,
        };
        debug!(id, replaced = previous.is_some(), "session registered");
        previous
    }

    pub fn remove(&self, id: &str) -> Option<SessionHandle> {
        match self.inner.write() {
            Ok(mut map) => map.remove(id),
            Err(_) => None,
        }
    }

    /// Remove the entry only when it is still the given session, so a
    /// finalizing session that was displaced cannot unregister its
    /// replacement.
    pub fn remove_if(&self, id: &str, nonce: u64) -> bool {
        match self.inner.write() {
            Ok(mut map) => {
                if map.get(id).is_some_and(|h| h.nonce == nonce) {
                    map.remove(id);
                    return true;
                }
                false
            },
            Err(_) => false,
        }
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<SessionHandle> {
        self.inner.read().ok().and_then(|map| map.get(id).cloned())
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.inner
            .read()
            .map(|map| map.contains_key(id))
            .unwrap_or(false)
    }

    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.inner
            .read()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Ask one session to shut down.
    pub async fn terminate(&self, id: &str) -> bool {
        match self.get(id) {
            Some(handle) => {
                handle.terminate().await;
                true
            },
            None => false,
        }
    }

    /// Ask every live session to shut down.
    pub async fn terminate_all(&self) {
        for id in self.ids() {
            self.terminate(&id).await;
        }
    }
}
