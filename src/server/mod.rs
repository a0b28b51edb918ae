//! MCP server exposing instrumentation sessions as tools.

mod requests;

pub use requests::*;

use crate::error::ToolError;
use crate::session::SessionManager;
use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{CallToolResult, Content, ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler,
};
use serde::Serialize;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// MCP server for Frida-style dynamic instrumentation
#[derive(Clone)]
pub struct FridaMcpServer {
    manager: Arc<SessionManager>,
    tool_router: ToolRouter<FridaMcpServer>,
}

fn json_result<T: Serialize + Debug>(value: &T) -> CallToolResult {
    CallToolResult::success(vec![Content::text(
        serde_json::to_string_pretty(value).unwrap_or_else(|_| format!("{value:?}")),
    )])
}

fn to_call_result<T: Serialize + Debug>(result: Result<T, ToolError>) -> CallToolResult {
    match result {
        Ok(value) => json_result(&value),
        Err(e) => e.to_tool_result(),
    }
}

impl FridaMcpServer {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        info!("Creating Frida MCP server");
        Self {
            manager,
            tool_router: Self::tool_router(),
        }
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    fn instructions(&self) -> String {
        format!(
            "Dynamic instrumentation server: attach to processes, inject JavaScript, collect what it reports. \
             \n\nWorkflow: \
             \n1. attach: target is a pid (attach to a running process) or an app identifier (spawn suspended). \
             \n   Pass script to install hooks before the app runs; spawned targets resume after it succeeds. \
             \n2. execute: evaluate JavaScript in the session. keep_alive=true keeps hooks resident. \
             \n3. get_messages: drain messages from resident scripts, optionally waiting `duration` seconds (capped at {max_wait}s). \
             \n4. resume: start a spawned-suspended process if it is still halted. \
             \n5. detach: unload scripts (unload_only=true) or end the session. \
             \n\nSessions can end on their own (process exit, crash, device loss). Tools then report \
             the session as detached; get_messages still returns what was queued before the end. \
             \nlist_sessions shows every tracked session and its state.",
            max_wait = self.manager.config().max_wait.as_secs()
        )
    }
}

#[tool_router]
impl FridaMcpServer {
    #[tool(
        description = "Attach to a process. A numeric target attaches to that running pid; \
        anything else is treated as an application identifier and spawned suspended. \
        If script is given it is injected immediately as a resident script, and a spawned \
        target is resumed once the script evaluates successfully. Returns the session id."
    )]
    #[instrument(skip(self), fields(target = %req.target))]
    async fn attach(
        &self,
        Parameters(req): Parameters<AttachRequest>,
    ) -> Result<CallToolResult, McpError> {
        debug!("Tool call: attach");
        let args = req.args.unwrap_or_default();
        Ok(to_call_result(
            self.manager
                .attach(&req.target, req.script.as_deref(), &args, req.device_id)
                .await,
        ))
    }

    #[tool(
        description = "Evaluate JavaScript inside an attached session. Returns the evaluation \
        result (or error and stack) plus console output produced while evaluating. \
        With keep_alive=true the script stays loaded and later messages are queued for get_messages. \
        With resume_after=true a spawned-suspended process is resumed after a successful evaluation."
    )]
    #[instrument(skip(self, req), fields(session_id = %req.session_id))]
    async fn execute(
        &self,
        Parameters(req): Parameters<ExecuteRequest>,
    ) -> Result<CallToolResult, McpError> {
        debug!("Tool call: execute");
        Ok(to_call_result(
            self.manager
                .execute(
                    &req.session_id,
                    &req.javascript_code,
                    req.keep_alive.unwrap_or(false),
                    req.resume_after.unwrap_or(false),
                )
                .await,
        ))
    }

    #[tool(description = "Resume a spawned-suspended process. \
        Fails if no session tracks the pid or the process is not suspended.")]
    #[instrument(skip(self))]
    async fn resume(
        &self,
        Parameters(req): Parameters<PidRequest>,
    ) -> Result<CallToolResult, McpError> {
        debug!("Tool call: resume");
        Ok(to_call_result(
            self.manager.resume(req.pid, req.device_id.as_deref()).await,
        ))
    }

    #[tool(description = "Kill a process. Sessions tracking it become detached.")]
    #[instrument(skip(self))]
    async fn kill(
        &self,
        Parameters(req): Parameters<PidRequest>,
    ) -> Result<CallToolResult, McpError> {
        debug!("Tool call: kill");
        Ok(to_call_result(
            self.manager.kill(req.pid, req.device_id.as_deref()).await,
        ))
    }

    #[tool(
        description = "Drain messages queued by resident scripts, in arrival order. \
        Optionally wait `duration` seconds first to let more arrive. Each message is returned once. \
        Also reports script errors and the session's detach, and works on detached sessions \
        so final messages are not lost."
    )]
    #[instrument(skip(self))]
    async fn get_messages(
        &self,
        Parameters(req): Parameters<GetMessagesRequest>,
    ) -> Result<CallToolResult, McpError> {
        debug!("Tool call: get_messages");
        let wait = match req.wait() {
            Ok(wait) => wait,
            Err(e) => return Ok(e.to_tool_result()),
        };
        Ok(to_call_result(
            self.manager.get_messages(&req.session_id, wait).await,
        ))
    }

    #[tool(
        description = "End a session: unload its scripts and detach from the process. \
        With unload_only=true only the scripts are unloaded and the session stays attached. \
        Detaching an already detached session is a no-op."
    )]
    #[instrument(skip(self))]
    async fn detach(
        &self,
        Parameters(req): Parameters<DetachRequest>,
    ) -> Result<CallToolResult, McpError> {
        info!(session_id = %req.session_id, "Tool call: detach");
        Ok(to_call_result(
            self.manager
                .detach(&req.session_id, req.unload_only.unwrap_or(false))
                .await,
        ))
    }

    #[tool(description = "List tracked sessions with their pid, state, loaded script count \
        and number of undrained messages.")]
    #[instrument(skip(self))]
    async fn list_sessions(&self) -> Result<CallToolResult, McpError> {
        debug!("Tool call: list_sessions");
        Ok(json_result(&self.manager.list_sessions()))
    }
}

#[tool_handler]
impl ServerHandler for FridaMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            instructions: Some(self.instructions()),
            ..Default::default()
        }
    }
}
