//! Process-wide session registry.
//!
//! The registry lock guards map membership only. Record contents are guarded
//! by each record's own lock, and no backend I/O ever runs under this one.

use super::record::SessionRecord;
use super::types::SessionState;
use super::watcher;
use crate::backend::BackendSession;
use crate::error::ToolError;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Default)]
struct RegistryInner {
    live: HashMap<String, Arc<SessionRecord>>,
    /// Fully detached sessions kept for a final drain, oldest first.
    retired: HashMap<String, Arc<SessionRecord>>,
    retired_order: VecDeque<String>,
}

/// Mapping from session id to record.
pub struct Registry {
    inner: Mutex<RegistryInner>,
    retired_capacity: usize,
}

/// Generate a fresh session id.
fn generate_session_id(pid: u32) -> String {
    format!("session_{pid}_{}", Uuid::new_v4().simple())
}

impl Registry {
    pub fn new(retired_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            retired_capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new session and install its detach watcher.
    pub fn create(
        &self,
        pid: u32,
        device_id: Option<String>,
        backend_session: Arc<dyn BackendSession>,
        state: SessionState,
    ) -> Result<Arc<SessionRecord>, ToolError> {
        let id = generate_session_id(pid);
        let record = Arc::new(SessionRecord::new(
            id.clone(),
            pid,
            device_id,
            backend_session,
            state,
        ));
        watcher::install(&record);

        let mut inner = self.lock();
        if inner.live.contains_key(&id) || inner.retired.contains_key(&id) {
            return Err(ToolError::DuplicateId(id));
        }
        inner.live.insert(id, record.clone());
        Ok(record)
    }

    /// Look up a live or retired record.
    pub fn get(&self, id: &str) -> Option<Arc<SessionRecord>> {
        let inner = self.lock();
        inner
            .live
            .get(id)
            .or_else(|| inner.retired.get(id))
            .cloned()
    }

    /// Drop a record entirely, without leaving a tombstone.
    pub fn remove(&self, id: &str) -> Option<Arc<SessionRecord>> {
        let mut inner = self.lock();
        if let Some(record) = inner.live.remove(id) {
            return Some(record);
        }
        let record = inner.retired.remove(id)?;
        inner.retired_order.retain(|r| r != id);
        Some(record)
    }

    /// Move a record from the live map to the retired set. No-op if it is
    /// not live.
    pub fn retire(&self, id: &str) -> Option<Arc<SessionRecord>> {
        let mut inner = self.lock();
        let record = inner.live.remove(id)?;
        if self.retired_capacity > 0 {
            while inner.retired_order.len() >= self.retired_capacity {
                if let Some(oldest) = inner.retired_order.pop_front() {
                    inner.retired.remove(&oldest);
                }
            }
            inner.retired.insert(id.to_string(), record.clone());
            inner.retired_order.push_back(id.to_string());
        }
        Some(record)
    }

    /// Ids of live sessions.
    pub fn list(&self) -> Vec<String> {
        self.lock().live.keys().cloned().collect()
    }

    /// Snapshot of live records.
    pub fn records(&self) -> Vec<Arc<SessionRecord>> {
        self.lock().live.values().cloned().collect()
    }

    /// Live records tracking `pid`.
    pub fn find_by_pid(&self, pid: u32) -> Vec<Arc<SessionRecord>> {
        self.lock()
            .live
            .values()
            .filter(|r| r.pid() == pid)
            .cloned()
            .collect()
    }

    pub fn is_retired(&self, id: &str) -> bool {
        self.lock().retired.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
