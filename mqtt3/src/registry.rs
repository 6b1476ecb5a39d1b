//! Registry of live sessions.
//!
//! Fan-out takes a snapshot (an `Arc` clone of the current list) and
//! iterates it without holding any lock. Adding or removing a session
//! builds a new list and swaps it in, so a snapshot never observes a
//! half-applied change.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

use crate::session::SessionHandle;

/// Copy-on-write list of session handles.
#[derive(Default)]
pub struct Registry {
    sessions: RwLock<Arc<Vec<Arc<SessionHandle>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current set of sessions.
    pub fn snapshot(&self) -> Arc<Vec<Arc<SessionHandle>>> {
        Arc::clone(&self.sessions.read())
    }

    pub(crate) fn add(&self, session: Arc<SessionHandle>) {
        let mut sessions = self.sessions.write();
        let mut next = Vec::with_capacity(sessions.len() + 1);
        next.extend(sessions.iter().cloned());
        next.push(session);
        *sessions = Arc::new(next);
        trace!("Registry now holds {} sessions", sessions.len());
    }

    /// Remove a session by id. Returns whether it was present.
    pub(crate) fn remove(&self, id: u64) -> bool {
        let mut sessions = self.sessions.write();
        if !sessions.iter().any(|s| s.id() == id) {
            return false;
        }
        let next: Vec<_> = sessions.iter().filter(|s| s.id() != id).cloned().collect();
        *sessions = Arc::new(next);
        trace!("Registry now holds {} sessions", sessions.len());
        true
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
