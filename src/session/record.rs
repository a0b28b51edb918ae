//! A single instrumentation session and its lifecycle state.

use super::queue::MessageQueue;
use super::types::{SessionInfo, SessionState};
use crate::backend::{BackendScript, BackendSession};
use crate::error::ToolError;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// A script currently loaded (or loading) in a session.
#[derive(Clone)]
pub struct LoadedScript {
    /// Per-session handle, unique for the record's lifetime.
    pub id: u64,
    pub handle: Arc<dyn BackendScript>,
    /// Resident script (hooks/RPC) as opposed to a one-shot evaluation.
    pub keep_alive: bool,
}

impl std::fmt::Debug for LoadedScript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedScript")
            .field("id", &self.id)
            .field("keep_alive", &self.keep_alive)
            .finish()
    }
}

struct RecordInner {
    state: SessionState,
    /// Load order; teardown walks it front to back.
    scripts: Vec<LoadedScript>,
    detached_reason: Option<String>,
}

/// One attached (or spawned) process and everything injected into it.
///
/// Field access goes through the record's own lock, never the registry's.
/// The lock is only held for in-memory mutation; backend calls happen with
/// it released, and their effects are applied afterwards under a fresh
/// acquisition that re-checks the state.
pub struct SessionRecord {
    id: String,
    pid: u32,
    device_id: Option<String>,
    created_at: DateTime<Utc>,
    backend_session: Arc<dyn BackendSession>,
    inner: Mutex<RecordInner>,
    messages: Arc<MessageQueue>,
    /// Serializes execute/resume on this session. Never taken by detach or
    /// by backend callbacks.
    operations: tokio::sync::Mutex<()>,
    next_script_id: AtomicU64,
}

impl SessionRecord {
    pub fn new(
        id: String,
        pid: u32,
        device_id: Option<String>,
        backend_session: Arc<dyn BackendSession>,
        state: SessionState,
    ) -> Self {
        Self {
            id,
            pid,
            device_id,
            created_at: Utc::now(),
            backend_session,
            inner: Mutex::new(RecordInner {
                state,
                scripts: Vec::new(),
                detached_reason: None,
            }),
            messages: Arc::new(MessageQueue::new()),
            operations: tokio::sync::Mutex::new(()),
            next_script_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RecordInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn backend_session(&self) -> Arc<dyn BackendSession> {
        self.backend_session.clone()
    }

    pub fn messages(&self) -> &Arc<MessageQueue> {
        &self.messages
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn script_count(&self) -> usize {
        self.lock().scripts.len()
    }

    /// Wait for exclusive use of the session for a multi-step operation.
    pub async fn lock_operations(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.operations.lock().await
    }

    fn detached_error(&self, inner: &RecordInner) -> ToolError {
        ToolError::SessionDetached {
            session_id: self.id.clone(),
            reason: inner.detached_reason.clone(),
        }
    }

    /// Current state, or `SessionDetached` if the session is terminal.
    pub fn ensure_live(&self) -> Result<SessionState, ToolError> {
        let inner = self.lock();
        match inner.state {
            SessionState::Detached => Err(self.detached_error(&inner)),
            state => Ok(state),
        }
    }

    /// Track a script. Refused once the session is detached.
    pub fn add_script(
        &self,
        handle: Arc<dyn BackendScript>,
        keep_alive: bool,
    ) -> Result<u64, ToolError> {
        let mut inner = self.lock();
        if inner.state == SessionState::Detached {
            return Err(self.detached_error(&inner));
        }
        let id = self.next_script_id.fetch_add(1, Ordering::Relaxed);
        inner.scripts.push(LoadedScript {
            id,
            handle,
            keep_alive,
        });
        Ok(id)
    }

    /// Stop tracking a script. Whoever gets `Some` owns its unload.
    pub fn remove_script(&self, script_id: u64) -> Option<LoadedScript> {
        let mut inner = self.lock();
        let pos = inner.scripts.iter().position(|s| s.id == script_id)?;
        Some(inner.scripts.remove(pos))
    }

    /// Take every tracked script, leaving the session state untouched.
    pub fn take_scripts(&self) -> Vec<LoadedScript> {
        std::mem::take(&mut self.lock().scripts)
    }

    /// Transition to `Detached`.
    ///
    /// Returns the scripts that were tracked, for the caller to tear down,
    /// or `None` if the session was already detached.
    pub fn mark_detached(&self, reason: impl Into<String>) -> Option<Vec<LoadedScript>> {
        let mut inner = self.lock();
        if inner.state == SessionState::Detached {
            return None;
        }
        inner.state = SessionState::Detached;
        inner.detached_reason = Some(reason.into());
        Some(std::mem::take(&mut inner.scripts))
    }

    /// Apply a non-terminal transition. The only one is suspended -> attached.
    pub fn set_state(&self, new_state: SessionState) -> Result<SessionState, ToolError> {
        let mut inner = self.lock();
        let current = inner.state;
        match (current, new_state) {
            (SessionState::Detached, _) => Err(self.detached_error(&inner)),
            (SessionState::SpawnedSuspended, SessionState::Attached) => {
                inner.state = new_state;
                Ok(current)
            }
            _ => Err(ToolError::InvalidState {
                session_id: self.id.clone(),
                state: current,
            }),
        }
    }

    pub fn info(&self) -> SessionInfo {
        let (state, detached_reason, scripts) = {
            let inner = self.lock();
            (inner.state, inner.detached_reason.clone(), inner.scripts.len())
        };
        SessionInfo {
            session_id: self.id.clone(),
            pid: self.pid,
            device_id: self.device_id.clone(),
            created_at: self.created_at,
            state,
            detached_reason,
            scripts,
            pending_messages: self.messages.len(),
        }
    }
}
