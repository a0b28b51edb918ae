//! Frida MCP Server
//!
//! This library provides an MCP (Model Context Protocol) server that lets LLM
//! agents attach to processes, inject JavaScript instrumentation, and collect
//! what the injected scripts report.
//!
//! # Architecture
//!
//! - **SessionManager**: Owns the session registry and runs every lifecycle
//!   operation. Backend calls run on tokio's blocking pool; no lock is held
//!   while they block.
//!
//! - **InstrumentationBackend**: The process/session/script capability. The
//!   shipped implementation is [`backend::BridgeBackend`], which talks
//!   newline-delimited JSON to a helper process that drives Frida.
//!
//! - **FridaMcpServer**: The MCP server that exposes the manager as tools.
//!   Uses the `rmcp` crate for MCP protocol handling.
//!
//! Backend events (script messages, unrequested detach) arrive on the
//! bridge's reader thread and are applied to the affected session record
//! directly, concurrently with tool calls.
//!
//! # Tools
//!
//! - `attach`: Attach to a pid, or spawn an application suspended, optionally
//!   injecting a resident script (spawned targets resume once it succeeds)
//! - `execute`: Evaluate JavaScript in a session
//! - `resume`: Resume a spawned-suspended process
//! - `kill`: Kill a process
//! - `get_messages`: Drain queued script messages, optionally waiting first
//! - `detach`: Unload scripts, or end the session
//! - `list_sessions`: Snapshot of tracked sessions

pub mod backend;
pub mod config;
pub mod error;
pub mod server;
pub mod session;

pub use backend::{BridgeBackend, InstrumentationBackend};
pub use config::{BridgeConfig, ManagerConfig};
pub use error::ToolError;
pub use server::FridaMcpServer;
pub use session::{SessionManager, SessionState};
