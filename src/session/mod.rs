//! Session state management.
//!
//! Tracks every instrumentation session, the scripts injected into each, and
//! the messages those scripts produce. Two timelines meet here: tool calls
//! (attach, execute, resume, detach) and backend events (script messages,
//! unrequested detach).
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │ SessionManager (tool calls)                                │
//! │   attach / execute / resume / get_messages / detach / kill │
//! │                                                            │
//! │   Registry ── Mutex<{live, retired}>                       │
//! │      └─ SessionRecord ── Mutex<{state, scripts, reason}>   │
//! │            ├─ operations gate (serializes execute/resume)  │
//! │            └─ MessageQueue ◀── MessageRouter (per script)  │
//! └──────────────────────────┬─────────────────────────────────┘
//!          spawn_blocking    │        ▲ on_detached / on_message
//!                            ▼        │
//!                  InstrumentationBackend
//! ```
//!
//! The registry, record and queue locks are never nested, and backend calls
//! never run with any of them held.

mod manager;
mod queue;
mod receipt;
mod record;
mod registry;
mod types;
mod watcher;

pub use manager::SessionManager;
pub use queue::{Drained, MessageQueue, MAX_DRAIN_WAIT_SECS};
pub use record::SessionRecord;
pub use registry::Registry;
pub use types::{
    AttachResult, AttachTarget, DetachResult, ExecuteResult, ExecutionStatus, KillResult,
    MessagesResult, Notice, QueuedMessage, ResumeResult, SessionInfo, SessionState,
};
