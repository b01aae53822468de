//! In-memory PID allocator for engine sessions.
//!
//! The engine distinguishes concurrent sessions for the same content by an
//! integer PID. Players such as VLC drop and immediately re-open their
//! connection on probe/seek; handing the same (content, viewer) pair the
//! same PID across that bounce keeps the engine from spawning a phantom
//! second session. PIDs come from a monotonic counter that never rewinds,
//! so they are unique for the lifetime of the process.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

use crate::errors::types::SessionError;
use crate::models::{ClientFingerprint, ContentId};

/// One (content, viewer) pairing and the PID issued for it.
#[derive(Debug, Clone)]
pub struct Session {
    pub content_id: ContentId,
    pub fingerprint: ClientFingerprint,
    pub pid: u64,
    pub connected: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct SessionsInner {
    sessions: HashMap<String, Session>,
    pids: HashMap<u64, String>,
    next_pid: u64,
}

#[derive(Debug)]
pub struct SessionManager {
    inner: RwLock<SessionsInner>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(SessionsInner {
                sessions: HashMap::new(),
                pids: HashMap::new(),
                next_pid: 1,
            }),
        }
    }

    fn session_key(content_id: &ContentId, fingerprint: &ClientFingerprint) -> String {
        format!(
            "{}|{}|{}",
            content_id, fingerprint.ip, fingerprint.user_agent
        )
    }

    /// Return the PID for this (content, viewer) pair, allocating a fresh
    /// one if no session exists. Marks the session connected either way.
    pub fn get_or_create_pid(
        &self,
        content_id: &ContentId,
        fingerprint: &ClientFingerprint,
    ) -> u64 {
        let key = Self::session_key(content_id, fingerprint);
        let mut inner = self.inner.write().expect("session lock poisoned");
        if let Some(session) = inner.sessions.get_mut(&key) {
            session.connected = true;
            debug!(pid = session.pid, client = %fingerprint, "reusing session pid");
            return session.pid;
        }

        let pid = inner.next_pid;
        inner.next_pid += 1;
        inner.pids.insert(pid, key.clone());
        inner.sessions.insert(
            key,
            Session {
                content_id: content_id.clone(),
                fingerprint: fingerprint.clone(),
                pid,
                connected: true,
                created_at: Utc::now(),
            },
        );
        debug!(pid, client = %fingerprint, "allocated session pid");
        pid
    }

    /// Mark the session as disconnected; it stays reusable until the next
    /// sweep. Unknown PIDs are an error.
    pub fn release_pid(&self, pid: u64) -> Result<(), SessionError> {
        let mut inner = self.inner.write().expect("session lock poisoned");
        let key = inner
            .pids
            .get(&pid)
            .cloned()
            .ok_or(SessionError::PidNotFound { pid })?;
        if let Some(session) = inner.sessions.get_mut(&key) {
            session.connected = false;
            debug!(pid, "released session pid");
        }
        Ok(())
    }

    /// Delete every disconnected session, returning how many were removed.
    /// The PID counter is untouched; released PIDs are never reissued.
    pub fn cleanup_disconnected(&self) -> usize {
        let mut inner = self.inner.write().expect("session lock poisoned");
        let stale: Vec<(String, u64)> = inner
            .sessions
            .iter()
            .filter(|(_, session)| !session.connected)
            .map(|(key, session)| (key.clone(), session.pid))
            .collect();
        for (key, pid) in &stale {
            inner.sessions.remove(key);
            inner.pids.remove(pid);
        }
        stale.len()
    }

    /// Count of sessions currently marked connected.
    pub fn active_sessions(&self) -> usize {
        self.inner
            .read()
            .expect("session lock poisoned")
            .sessions
            .values()
            .filter(|session| session.connected)
            .count()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases its PID (and opportunistically sweeps disconnected sessions)
/// when dropped, however the request ends.
pub struct SessionGuard {
    manager: Arc<SessionManager>,
    pid: u64,
}

impl SessionGuard {
    pub fn new(manager: Arc<SessionManager>, pid: u64) -> Self {
        Self { manager, pid }
    }

    pub fn pid(&self) -> u64 {
        self.pid
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Err(err) = self.manager.release_pid(self.pid) {
            warn!(pid = self.pid, error = %err, "failed to release pid");
        }
        let swept = self.manager.cleanup_disconnected();
        if swept > 0 {
            debug!(swept, "swept disconnected sessions");
        }
    }
}
