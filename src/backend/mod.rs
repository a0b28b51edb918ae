//! Boundary with the instrumentation backend.
//!
//! The backend is an opaque, blocking capability: it spawns, attaches to,
//! resumes and kills processes, and creates scripts inside attached sessions.
//! Two registrations are asynchronous: `on_detached` on a session and
//! `on_message` on a script. Their callbacks fire on a context the backend
//! owns, concurrently with any tool call.
//!
//! All trait methods may block on device or process state. Callers run them
//! from `tokio::task::spawn_blocking` and never while holding a lock.

pub mod bridge;
#[cfg(test)]
pub(crate) mod fake;

pub use bridge::BridgeBackend;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Failure reported by the instrumentation backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Process, application or device does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// Handle is no longer usable (typically: session already detached).
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    /// Device or transport to the backend is gone.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("{0}")]
    Failed(String),
}

/// Why a backend session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetachReason {
    ApplicationRequested,
    ProcessReplaced,
    ProcessTerminated,
    ConnectionTerminated,
    DeviceLost,
    #[serde(untagged)]
    Other(String),
}

impl fmt::Display for DetachReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetachReason::ApplicationRequested => write!(f, "application-requested"),
            DetachReason::ProcessReplaced => write!(f, "process-replaced"),
            DetachReason::ProcessTerminated => write!(f, "process-terminated"),
            DetachReason::ConnectionTerminated => write!(f, "connection-terminated"),
            DetachReason::DeviceLost => write!(f, "device-lost"),
            DetachReason::Other(reason) => write!(f, "{reason}"),
        }
    }
}

/// A message emitted by a loaded script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ScriptMessage {
    /// Payload passed to `send()`, with optional binary side data.
    Send {
        #[serde(default)]
        payload: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    /// Uncaught exception inside the script.
    Error {
        description: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
    },
    /// Console output.
    Log {
        #[serde(default = "default_log_level")]
        level: String,
        #[serde(default)]
        payload: Value,
    },
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ScriptMessage {
    pub fn send(payload: Value) -> Self {
        ScriptMessage::Send {
            payload,
            data: None,
        }
    }

    pub fn log(payload: impl Into<Value>) -> Self {
        ScriptMessage::Log {
            level: default_log_level(),
            payload: payload.into(),
        }
    }
}

/// Callback fired once when a session detaches.
pub type DetachCallback = Arc<dyn Fn(DetachReason) + Send + Sync>;
/// Callback fired for every script message, in delivery order.
pub type MessageCallback = Arc<dyn Fn(ScriptMessage) + Send + Sync>;

/// Process-level operations of the instrumentation backend.
pub trait InstrumentationBackend: Send + Sync {
    /// Spawn `program` suspended and return its pid.
    fn spawn(&self, device: Option<&str>, program: &str, argv: &[String])
        -> Result<u32, BackendError>;

    /// Attach to a running (or spawned-suspended) process.
    fn attach(&self, device: Option<&str>, pid: u32)
        -> Result<Arc<dyn BackendSession>, BackendError>;

    fn resume(&self, device: Option<&str>, pid: u32) -> Result<(), BackendError>;

    fn kill(&self, device: Option<&str>, pid: u32) -> Result<(), BackendError>;
}

/// An attached instrumentation session.
pub trait BackendSession: Send + Sync {
    /// Register the detach callback. Fires at most once.
    fn on_detached(&self, callback: DetachCallback);

    fn create_script(&self, source: &str) -> Result<Arc<dyn BackendScript>, BackendError>;

    fn detach(&self) -> Result<(), BackendError>;
}

/// A script created inside a session.
pub trait BackendScript: Send + Sync {
    /// Register the message callback. Must be called before `load`.
    fn on_message(&self, callback: MessageCallback);

    fn load(&self) -> Result<(), BackendError>;

    fn unload(&self) -> Result<(), BackendError>;
}
