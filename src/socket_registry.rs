//! Socket registry (C9): the one process-global piece of state spec.md
//! allows — a map from session id to socket, with insert-replace semantics
//! that gracefully close whatever the new socket displaces.
//!
//! Grounded on the teacher's `socket::NoiseSocket::close`, generalized from a
//! single owned connection to a registry of swappable entries behind a
//! caller-supplied [`RegisteredSocket`] trait, so this crate does not need to
//! name a concrete transport.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::warn;

/// Budget for a graceful close before the registry forces termination.
pub const GRACEFUL_CLOSE_TIMEOUT: Duration = Duration::from_millis(1500);

/// A socket the registry can hold. `close` is expected to resolve once the
/// remote side has acknowledged the close (or the transport decides it
/// never will); `terminate` is the hard fallback when `close` doesn't
/// resolve inside [`GRACEFUL_CLOSE_TIMEOUT`].
#[async_trait]
pub trait RegisteredSocket: Send + Sync {
    async fn close(&self);
    async fn terminate(&self);
}

/// Process-wide `sessionId -> socket` table (spec.md §5, "Shared resources").
/// Implementations should prefer an explicit instance over global statics;
/// nothing here requires a singleton.
#[derive(Default)]
pub struct SocketRegistry {
    sockets: RwLock<HashMap<String, Arc<dyn RegisteredSocket>>>,
}

impl SocketRegistry {
    pub fn new() -> Self {
        Self { sockets: RwLock::new(HashMap::new()) }
    }

    /// Register `socket` under `session_id`. If an entry already exists
    /// there, it is gracefully closed (1.5s budget, then terminated) before
    /// the new socket takes its place — the map holds the new entry as soon
    /// as the old one's close is *requested*, not once it completes, so a
    /// concurrent lookup never sees a stale socket racing a slow close.
    pub async fn register(&self, session_id: &str, socket: Arc<dyn RegisteredSocket>) {
        let previous = {
            let mut sockets = self.sockets.write().await;
            sockets.insert(session_id.to_string(), socket)
        };

        if let Some(previous) = previous {
            match tokio::time::timeout(GRACEFUL_CLOSE_TIMEOUT, previous.close()).await {
                Ok(()) => {}
                Err(_) => {
                    warn!(session_id, "graceful close timed out, terminating socket");
                    previous.terminate().await;
                }
            }
        }
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<dyn RegisteredSocket>> {
        self.sockets.read().await.get(session_id).cloned()
    }

    /// Remove `session_id` from the map, but only if `socket` is still its
    /// current entry — a socket that has already been replaced must not
    /// deregister the one that replaced it.
    pub async fn deregister_if_current(&self, session_id: &str, socket: &Arc<dyn RegisteredSocket>) {
        let mut sockets = self.sockets.write().await;
        if let Some(current) = sockets.get(session_id) {
            if Arc::ptr_eq(current, socket) {
                sockets.remove(session_id);
            }
        }
    }
}
