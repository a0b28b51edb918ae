//! Error types for the Frida MCP server.
//!
//! Tool execution errors are returned with `is_error: true` in CallToolResult,
//! while protocol errors (invalid tool name, malformed args) are handled by rmcp.

use crate::backend::BackendError;
use crate::session::SessionState;
use rmcp::model::{CallToolResult, Content};
use thiserror::Error;

/// Tool execution errors - returned with is_error: true in CallToolResult
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error("Target not found: {0}")]
    TargetNotFound(String),

    #[error("Failed to spawn {target}: {cause}")]
    SpawnFailed { target: String, cause: String },

    #[error("Script injection failed in session {session_id}: {cause}")]
    InjectionFailed { session_id: String, cause: String },

    #[error("Session with ID {0} not found")]
    SessionNotFound(String),

    #[error("Session {session_id} is detached (reason: {}). Close it with detach and create a new one.", .reason.as_deref().unwrap_or("unknown"))]
    SessionDetached {
        session_id: String,
        reason: Option<String>,
    },

    #[error("Session {session_id} is {state}, operation not allowed")]
    InvalidState {
        session_id: String,
        state: SessionState,
    },

    #[error("Instrumentation backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Session id already issued: {0}")]
    DuplicateId(String),

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("{operation} failed: {cause}")]
    OperationFailed { operation: String, cause: String },
}

impl ToolError {
    /// Convert to MCP CallToolResult with is_error: true
    pub fn to_tool_result(&self) -> CallToolResult {
        CallToolResult::error(vec![Content::text(self.to_string())])
    }

    /// Map a backend failure of a pid/session level operation that has no
    /// narrower category.
    pub(crate) fn from_backend(operation: &str, err: BackendError) -> Self {
        match err {
            BackendError::Unavailable(msg) => ToolError::BackendUnavailable(msg),
            BackendError::NotFound(msg) => ToolError::TargetNotFound(msg),
            other => ToolError::OperationFailed {
                operation: operation.to_string(),
                cause: other.to_string(),
            },
        }
    }
}

impl From<tokio::task::JoinError> for ToolError {
    fn from(e: tokio::task::JoinError) -> Self {
        ToolError::OperationFailed {
            operation: "backend call".to_string(),
            cause: e.to_string(),
        }
    }
}
