use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
};

use tokio::sync::{Mutex, mpsc};

pub type SessionId = u64;

/// Sending half of a session's mailbox. The worker task that owns the
/// connection drains the other half, so "deliver one message" is a single
/// enqueue and never a socket write on the caller's task.
pub type Outbound = mpsc::UnboundedSender<String>;

/// Table of live sessions, the sole point of synchronization between
/// workers. Keyed by a monotonically increasing id, so iteration order is
/// registration order and username lookup resolves ties deterministically.
pub struct Registry {
    sessions: Mutex<BTreeMap<SessionId, Session>>,
    next_id: AtomicU64,
}

struct Session {
    username: String,
    outbound: Outbound,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Inserts a session under the lock. Usernames are taken as-is; two
    /// sessions may share one.
    pub async fn register(&self, username: String, outbound: Outbound) -> SessionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut sessions = self.sessions.lock().await;
        sessions.insert(id, Session { username, outbound });
        id
    }

    /// Removes a session. Safe to call more than once per id; only the
    /// first call observes the entry. Dropping the entry drops its mailbox
    /// sender, which lets the owning worker's receive loop wind down.
    pub async fn unregister(&self, id: SessionId) -> Option<String> {
        let mut sessions = self.sessions.lock().await;
        sessions.remove(&id).map(|session| session.username)
    }

    /// Linear scan in registration order; the earliest-registered session
    /// with a matching username wins.
    pub async fn lookup_by_username(&self, username: &str) -> Option<(SessionId, Outbound)> {
        let sessions = self.sessions.lock().await;
        sessions
            .iter()
            .find(|(_, session)| session.username == username)
            .map(|(id, session)| (*id, session.outbound.clone()))
    }

    /// Point-in-time copy of the table. The lock covers only the copy, so
    /// callers enqueue deliveries outside any critical section; a session
    /// unregistered after the snapshot may still receive a queued message.
    pub async fn snapshot(&self) -> Vec<(SessionId, String, Outbound)> {
        let sessions = self.sessions.lock().await;
        sessions
            .iter()
            .map(|(id, session)| (*id, session.username.clone(), session.outbound.clone()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
