//! Session registry: the identity <-> live-connection binding.
//!
//! One identity holds at most one session. Binding an identity that is
//! already bound evicts the previous connection; the evicted handle is
//! returned so the caller can signal and close it. All operations are
//! short lock-guarded critical sections and never hold the lock across
//! an await point.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::models::ServerEvent;

/// Frame pushed to a connection's writer task.
#[derive(Debug)]
pub enum Outbound {
    Event(ServerEvent),
    /// Tells the writer to send a close frame and stop. Used to signal an
    /// evicted connection before it is dropped.
    Close,
}

/// Cheap, cloneable handle to one live connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: u64,
    tx: UnboundedSender<Outbound>,
}

impl ConnectionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Push an event to the connection. A send to a connection whose
    /// writer already hung up is silently dropped; teardown will unbind it.
    pub fn send(&self, event: ServerEvent) {
        let _ = self.tx.send(Outbound::Event(event));
    }

    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }
}

struct SessionEntry {
    conn: ConnectionHandle,
    /// Counterpart whose conversation this identity currently has open.
    viewing: Option<String>,
}

/// Registry of all live sessions.
pub struct SessionRegistry {
    next_conn_id: AtomicU64,
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            next_conn_id: AtomicU64::new(1),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Wrap a writer channel into a handle with a fresh connection id.
    pub fn new_connection(&self, tx: UnboundedSender<Outbound>) -> ConnectionHandle {
        ConnectionHandle {
            id: self.next_conn_id.fetch_add(1, Ordering::Relaxed),
            tx,
        }
    }

    /// Bind an identity to a connection, returning any evicted connection.
    /// The caller must signal and close the evicted handle.
    pub fn bind(&self, identity: &str, conn: ConnectionHandle) -> Option<ConnectionHandle> {
        let mut sessions = self.sessions.lock();
        let evicted = sessions
            .insert(
                identity.to_string(),
                SessionEntry {
                    conn,
                    viewing: None,
                },
            )
            .map(|entry| entry.conn);
        if evicted.is_some() {
            debug!("[Registry] Replaced live session for {}", identity);
        }
        evicted
    }

    /// Unbind by connection id. Idempotent, and a no-op when the identity
    /// has already been rebound to a newer connection.
    pub fn unbind(&self, conn_id: u64) -> Option<String> {
        let mut sessions = self.sessions.lock();
        let identity = sessions
            .iter()
            .find(|(_, entry)| entry.conn.id == conn_id)
            .map(|(identity, _)| identity.clone())?;
        sessions.remove(&identity);
        Some(identity)
    }

    /// Point-in-time lookup of an identity's live connection.
    pub fn lookup(&self, identity: &str) -> Option<ConnectionHandle> {
        self.sessions.lock().get(identity).map(|e| e.conn.clone())
    }

    pub fn is_online(&self, identity: &str) -> bool {
        self.sessions.lock().contains_key(identity)
    }

    /// Record which conversation an identity currently has open.
    pub fn set_viewing(&self, identity: &str, other: Option<&str>) {
        if let Some(entry) = self.sessions.lock().get_mut(identity) {
            entry.viewing = other.map(str::to_string);
        }
    }

    /// Whether `identity` currently has `other`'s conversation open.
    pub fn is_viewing(&self, identity: &str, other: &str) -> bool {
        self.sessions
            .lock()
            .get(identity)
            .map(|e| e.viewing.as_deref() == Some(other))
            .unwrap_or(false)
    }

    /// Identities currently holding a session.
    pub fn online_ids(&self) -> Vec<String> {
        self.sessions.lock().keys().cloned().collect()
    }

    /// Snapshot of every live connection except the given identity's.
    pub fn connections_except(&self, identity: &str) -> Vec<ConnectionHandle> {
        self.sessions
            .lock()
            .iter()
            .filter(|(id, _)| id.as_str() != identity)
            .map(|(_, entry)| entry.conn.clone())
            .collect()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
