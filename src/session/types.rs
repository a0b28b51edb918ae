//! Session state, attach targets, and result types.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// Lifecycle state of an instrumentation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Process created halted, waiting for resume.
    SpawnedSuspended,
    /// Instrumentation session live, process running.
    Attached,
    /// Terminal. Backend session and scripts are invalid.
    Detached,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::SpawnedSuspended => write!(f, "spawned_suspended"),
            SessionState::Attached => write!(f, "attached"),
            SessionState::Detached => write!(f, "detached"),
        }
    }
}

/// What `attach` was pointed at, resolved once from the caller's string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachTarget {
    /// A running process id.
    Pid(u32),
    /// An application identifier or program to spawn suspended.
    Named(String),
}

impl AttachTarget {
    pub fn parse(target: &str) -> Option<Self> {
        let target = target.trim();
        if target.is_empty() {
            return None;
        }
        Some(match target.parse::<u32>() {
            Ok(pid) => AttachTarget::Pid(pid),
            Err(_) => AttachTarget::Named(target.to_string()),
        })
    }

    pub fn is_spawn(&self) -> bool {
        matches!(self, AttachTarget::Named(_))
    }
}

/// Entry in a session's message queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum QueuedMessage {
    Send {
        payload: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    Log { level: String, payload: Value },
}

/// Error/status notice kept alongside queued messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    ScriptError {
        description: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
    },
    Detached { reason: String },
}

/// Snapshot of a session for listings.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub pid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detached_reason: Option<String>,
    pub scripts: usize,
    pub pending_messages: usize,
}

/// Outcome of evaluating code inside a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Error,
    Timeout,
}

/// Result of `execute`, also embedded in `attach` when a script is supplied.
#[derive(Debug, Clone, Serialize)]
pub struct ExecuteResult {
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub initial_logs: Vec<String>,
    pub script_unloaded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resumed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_error: Option<String>,
    pub state: SessionState,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttachResult {
    pub session_id: String,
    pub pid: u32,
    pub state: SessionState,
    pub spawned: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script_result: Option<ExecuteResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessagesResult {
    pub session_id: String,
    pub state: SessionState,
    pub messages_retrieved: usize,
    pub messages: Vec<QueuedMessage>,
    pub notices: Vec<Notice>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DetachResult {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub scripts_unloaded: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<SessionState>,
    /// True when the call changed nothing (already detached or unknown).
    pub noop: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResumeResult {
    pub session_id: String,
    pub pid: u32,
    pub state: SessionState,
}

#[derive(Debug, Clone, Serialize)]
pub struct KillResult {
    pub pid: u32,
    /// Live sessions tracking this pid; the detach watcher reconciles them.
    pub tracked_sessions: Vec<String>,
}
