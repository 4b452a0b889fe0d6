//! Tracks the single live connection per user.
//!
//! Admission is last-connection-wins: a new handle for a user closes the
//! previous one with a "superseded" reason under the same lock that stores
//! the new handle, so two handles are never valid for one user at once.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::protocol::ServerMessage;

/// Close code sent to a connection evicted by a newer one.
pub const CLOSE_SUPERSEDED: u16 = 4000;
/// Close code sent after `session_complete`.
pub const CLOSE_COMPLETE: u16 = 1000;
/// Close code sent when the inbound rate limit is exhausted.
pub const CLOSE_RATE_LIMITED: u16 = 1008;

/// Work items for a connection's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Serialize and send as a text frame.
    Message(ServerMessage),
    /// Send a close frame and stop writing.
    Close { code: u16, reason: String },
}

/// One live transport connection and the user it authenticated as.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: Uuid,
    user_id: String,
    tx: mpsc::Sender<Outbound>,
    closed: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(user_id: impl Into<String>, tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            tx,
            closed: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Still open from both our side and the writer's side.
    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.closed.is_cancelled() && !self.tx.is_closed()
    }

    /// Resolves once [`ConnectionHandle::close`] has been called.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Queue a message. Returns `false` if the connection is gone.
    pub async fn send(&self, message: ServerMessage) -> bool {
        if self.closed.is_cancelled() {
            return false;
        }
        self.tx.send(Outbound::Message(message)).await.is_ok()
    }

    /// Ask the writer to close with `code`/`reason` and mark the handle dead.
    pub fn close(&self, code: u16, reason: &str) {
        if self.closed.is_cancelled() {
            return;
        }
        // A full queue still ends the connection: the reader stops on cancel.
        let _ = self.tx.try_send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
        self.closed.cancel();
    }
}

/// Snapshot reported by the liveness endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    /// Live connections right now.
    pub active: usize,
    /// Connections admitted since start.
    pub admitted: u64,
    /// Connections closed because the same user connected again.
    pub superseded: u64,
}

/// Concurrency-safe map of user id to their one live connection.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<String, ConnectionHandle>>,
    admitted: AtomicU64,
    superseded: AtomicU64,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ConnectionHandle>> {
        // The map holds no invariants a panicking holder could break halfway.
        self.connections
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Store `handle` for `user_id`, closing any live predecessor first.
    pub fn admit(&self, user_id: &str, handle: ConnectionHandle) {
        let mut conns = self.lock();
        if let Some(previous) = conns.remove(user_id) {
            if previous.is_live() {
                previous.close(CLOSE_SUPERSEDED, "superseded");
                self.superseded.fetch_add(1, Ordering::Relaxed);
                info!(
                    name: "gateway.connection.superseded",
                    user_id = %user_id,
                    previous = %previous.id(),
                    current = %handle.id(),
                    "Closed previous connection for user"
                );
            }
        }
        conns.insert(user_id.to_string(), handle);
        self.admitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop the mapping for `user_id`. Missing entries are fine.
    pub fn remove(&self, user_id: &str) -> Option<ConnectionHandle> {
        self.lock().remove(user_id)
    }

    /// Drop the mapping only if it still points at `connection_id`.
    ///
    /// Used on connection teardown so a superseded connection never removes
    /// its successor.
    pub fn remove_connection(&self, user_id: &str, connection_id: Uuid) -> bool {
        let mut conns = self.lock();
        if conns.get(user_id).is_some_and(|h| h.id() == connection_id) {
            conns.remove(user_id);
            true
        } else {
            false
        }
    }

    /// Current handle for `user_id`, if any.
    pub fn get(&self, user_id: &str) -> Option<ConnectionHandle> {
        self.lock().get(user_id).cloned()
    }

    /// Deliver to the user's live connection.
    ///
    /// A dead handle is dropped from the map and `false` returned.
    pub async fn send(&self, user_id: &str, message: ServerMessage) -> bool {
        let Some(handle) = self.get(user_id) else {
            return false;
        };
        if handle.is_live() && handle.send(message).await {
            return true;
        }
        debug!(user_id = %user_id, connection = %handle.id(), "dropping dead connection");
        self.remove_connection(user_id, handle.id());
        false
    }

    /// Number of live connections, evicting dead handles on the way.
    pub fn count(&self) -> usize {
        let mut conns = self.lock();
        conns.retain(|_, h| h.is_live());
        conns.len()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            active: self.count(),
            admitted: self.admitted.load(Ordering::Relaxed),
            superseded: self.superseded.load(Ordering::Relaxed),
        }
    }
}
