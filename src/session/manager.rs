//! Lifecycle orchestrator: the operations tool calls invoke.
//!
//! Every backend call runs on the blocking pool with no lock held. State
//! changes are applied afterwards and re-checked, so a detach that races a
//! slow injection or resume surfaces as `SessionDetached`.

use super::receipt::{self, MessageRouter};
use super::record::{LoadedScript, SessionRecord};
use super::registry::Registry;
use super::types::{
    AttachResult, AttachTarget, DetachResult, ExecuteResult, ExecutionStatus, KillResult,
    MessagesResult, ResumeResult, SessionInfo, SessionState,
};
use crate::backend::{BackendError, BackendSession, InstrumentationBackend};
use crate::config::ManagerConfig;
use crate::error::ToolError;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const CALLER_DETACH_REASON: &str = "detached by caller";
const ROLLBACK_DETACH_REASON: &str = "attach rolled back";

/// Run a blocking backend call off the async runtime.
async fn blocking<T, F>(f: F) -> Result<T, ToolError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(f).await?)
}

/// Unload scripts in load order. Returns how many unloaded cleanly.
fn unload_scripts(session_id: &str, scripts: Vec<LoadedScript>) -> usize {
    scripts
        .into_iter()
        .filter(|script| match script.handle.unload() {
            Ok(()) => true,
            Err(e) => {
                warn!(session_id = %session_id, script = script.id, error = %e, "Failed to unload script");
                false
            }
        })
        .count()
}

fn spawn_and_attach(
    backend: &dyn InstrumentationBackend,
    device: Option<&str>,
    program: &str,
    argv: &[String],
) -> Result<(u32, Arc<dyn BackendSession>), ToolError> {
    let pid = backend.spawn(device, program, argv).map_err(|e| match e {
        BackendError::NotFound(_) => ToolError::TargetNotFound(program.to_string()),
        BackendError::Unavailable(msg) => ToolError::BackendUnavailable(msg),
        other => ToolError::SpawnFailed {
            target: program.to_string(),
            cause: other.to_string(),
        },
    })?;

    match backend.attach(device, pid) {
        Ok(session) => Ok((pid, session)),
        Err(e) => {
            if let Err(kill_err) = backend.kill(device, pid) {
                warn!(pid, error = %kill_err, "Failed to kill spawned process after attach failure");
            }
            Err(match e {
                BackendError::Unavailable(msg) => ToolError::BackendUnavailable(msg),
                other => ToolError::SpawnFailed {
                    target: program.to_string(),
                    cause: format!("attach to spawned pid {pid} failed: {other}"),
                },
            })
        }
    }
}

/// Owns the registry and drives the backend on behalf of tool calls.
pub struct SessionManager {
    backend: Arc<dyn InstrumentationBackend>,
    registry: Registry,
    config: ManagerConfig,
}

impl SessionManager {
    pub fn new(backend: Arc<dyn InstrumentationBackend>, config: ManagerConfig) -> Self {
        Self {
            registry: Registry::new(config.retired_capacity),
            backend,
            config,
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    fn lookup(&self, session_id: &str) -> Result<Arc<SessionRecord>, ToolError> {
        self.registry
            .get(session_id)
            .ok_or_else(|| ToolError::SessionNotFound(session_id.to_string()))
    }

    /// Attach to a pid, or spawn a named target suspended, and optionally
    /// inject a resident script. Spawned targets resume once the script
    /// reports success.
    pub async fn attach(
        &self,
        target: &str,
        script: Option<&str>,
        args: &[String],
        device_id: Option<String>,
    ) -> Result<AttachResult, ToolError> {
        let target = AttachTarget::parse(target)
            .ok_or_else(|| ToolError::InvalidParams("target must not be empty".to_string()))?;
        let spawned = target.is_spawn();
        let backend = self.backend.clone();
        let device = device_id.clone();

        let (pid, backend_session) = match target {
            AttachTarget::Pid(pid) => {
                let session = blocking(move || backend.attach(device.as_deref(), pid))
                    .await?
                    .map_err(|e| ToolError::from_backend("attach", e))?;
                (pid, session)
            }
            AttachTarget::Named(program) => {
                let argv = args.to_vec();
                blocking(move || {
                    spawn_and_attach(backend.as_ref(), device.as_deref(), &program, &argv)
                })
                .await??
            }
        };

        let state = if spawned {
            SessionState::SpawnedSuspended
        } else {
            SessionState::Attached
        };
        let record = match self
            .registry
            .create(pid, device_id.clone(), backend_session.clone(), state)
        {
            Ok(record) => record,
            Err(e) => {
                self.release_backend(backend_session, Vec::new(), spawned, pid, device_id)
                    .await;
                return Err(e);
            }
        };
        info!(session_id = %record.id(), pid, spawned, "Session created");

        let script_result = match script {
            Some(code) => {
                let outcome = {
                    let _gate = record.lock_operations().await;
                    self.run_script(&record, code, true, spawned).await
                };
                match outcome {
                    Ok(result) => Some(result),
                    Err(e) => {
                        self.roll_back(&record, spawned).await;
                        return Err(match e {
                            ToolError::SessionDetached { session_id, reason } => {
                                ToolError::InjectionFailed {
                                    session_id,
                                    cause: format!(
                                        "session detached during injection ({})",
                                        reason.as_deref().unwrap_or("unknown")
                                    ),
                                }
                            }
                            other => other,
                        });
                    }
                }
            }
            None => None,
        };

        Ok(AttachResult {
            session_id: record.id().to_string(),
            pid,
            state: record.state(),
            spawned,
            script_result,
        })
    }

    /// Undo a partially successful attach. Leaves no registry entry behind.
    async fn roll_back(&self, record: &Arc<SessionRecord>, spawned: bool) {
        self.registry.remove(record.id());
        let scripts = record
            .mark_detached(ROLLBACK_DETACH_REASON)
            .unwrap_or_default();
        warn!(session_id = %record.id(), pid = record.pid(), "Rolling back failed attach");
        self.release_backend(
            record.backend_session(),
            scripts,
            spawned,
            record.pid(),
            record.device_id().map(str::to_string),
        )
        .await;
    }

    /// Best-effort teardown of backend resources that no record owns anymore.
    async fn release_backend(
        &self,
        session: Arc<dyn BackendSession>,
        scripts: Vec<LoadedScript>,
        kill: bool,
        pid: u32,
        device: Option<String>,
    ) {
        let backend = self.backend.clone();
        let released = blocking(move || {
            let label = format!("pid {pid}");
            unload_scripts(&label, scripts);
            if let Err(e) = session.detach() {
                warn!(pid, error = %e, "Failed to detach backend session");
            }
            if kill {
                if let Err(e) = backend.kill(device.as_deref(), pid) {
                    warn!(pid, error = %e, "Failed to kill spawned process");
                }
            }
        })
        .await;
        if let Err(e) = released {
            warn!(pid, error = %e, "Backend teardown task failed");
        }
    }

    /// Evaluate `code` in a session.
    pub async fn execute(
        &self,
        session_id: &str,
        code: &str,
        keep_alive: bool,
        resume_after: bool,
    ) -> Result<ExecuteResult, ToolError> {
        let record = self.lookup(session_id)?;
        record.ensure_live()?;
        let _gate = record.lock_operations().await;
        self.run_script(&record, code, keep_alive, resume_after)
            .await
    }

    fn injection_error(&self, record: &SessionRecord, err: BackendError) -> ToolError {
        match record.ensure_live() {
            Err(detached) => detached,
            Ok(_) => match err {
                BackendError::Unavailable(msg) => ToolError::BackendUnavailable(msg),
                other => ToolError::InjectionFailed {
                    session_id: record.id().to_string(),
                    cause: other.to_string(),
                },
            },
        }
    }

    /// Create, load and await one wrapped script. Caller holds the gate.
    async fn run_script(
        &self,
        record: &Arc<SessionRecord>,
        code: &str,
        keep_alive: bool,
        resume_after: bool,
    ) -> Result<ExecuteResult, ToolError> {
        record.ensure_live()?;
        let source = receipt::wrap_source(code);
        let (router, receipt_rx) =
            MessageRouter::new(record.id(), record.messages().clone(), keep_alive);
        let callback = router.callback();
        let session = record.backend_session();

        let script = blocking(move || {
            let script = session.create_script(&source)?;
            script.on_message(callback);
            Ok::<_, BackendError>(script)
        })
        .await?
        .map_err(|e| self.injection_error(record, e))?;

        let script_id = record.add_script(script.clone(), keep_alive)?;
        debug!(session_id = %record.id(), script = script_id, keep_alive, "Loading script");

        let handle = script.clone();
        if let Err(e) = blocking(move || handle.load()).await? {
            record.remove_script(script_id);
            return Err(self.injection_error(record, e));
        }
        record.ensure_live()?;

        let waited = self.config.receipt_timeout;
        let receipt = tokio::time::timeout(waited, receipt_rx)
            .await
            .ok()
            .and_then(Result::ok);
        // A detach during the wait already owns the script's teardown.
        record.ensure_live()?;

        let mut result = receipt::evaluate(receipt, waited, record.state());
        if !keep_alive {
            result.script_unloaded = true;
            if let Some(loaded) = record.remove_script(script_id) {
                let id = record.id().to_string();
                blocking(move || unload_scripts(&id, vec![loaded])).await?;
            }
        }

        if resume_after {
            result.resumed = Some(false);
            if result.status == ExecutionStatus::Success {
                match self.resume_record(record).await {
                    Ok(()) => result.resumed = Some(true),
                    Err(e) => result.resume_error = Some(e.to_string()),
                }
            }
        }

        result.state = record.state();
        Ok(result)
    }

    /// Resume a suspended session's process. Caller holds the gate.
    async fn resume_record(&self, record: &SessionRecord) -> Result<(), ToolError> {
        let state = record.ensure_live()?;
        if state != SessionState::SpawnedSuspended {
            return Err(ToolError::InvalidState {
                session_id: record.id().to_string(),
                state,
            });
        }

        let backend = self.backend.clone();
        let device = record.device_id().map(str::to_string);
        let pid = record.pid();
        blocking(move || backend.resume(device.as_deref(), pid))
            .await?
            .map_err(|e| ToolError::from_backend("resume", e))?;

        record.set_state(SessionState::Attached)?;
        info!(session_id = %record.id(), pid, "Process resumed");
        Ok(())
    }

    /// Resume the suspended session tracking `pid`.
    pub async fn resume(
        &self,
        pid: u32,
        device_id: Option<&str>,
    ) -> Result<ResumeResult, ToolError> {
        let candidates: Vec<_> = self
            .registry
            .find_by_pid(pid)
            .into_iter()
            .filter(|r| device_id.is_none() || r.device_id() == device_id)
            .collect();
        let Some(first) = candidates.first() else {
            return Err(ToolError::SessionNotFound(format!("pid {pid}")));
        };
        let record = match candidates
            .iter()
            .find(|r| r.state() == SessionState::SpawnedSuspended)
        {
            Some(record) => record.clone(),
            None => {
                return Err(ToolError::InvalidState {
                    session_id: first.id().to_string(),
                    state: first.state(),
                })
            }
        };

        let _gate = record.lock_operations().await;
        self.resume_record(&record).await?;
        Ok(ResumeResult {
            session_id: record.id().to_string(),
            pid,
            state: record.state(),
        })
    }

    /// Drain a session's queue, optionally after waiting for more messages.
    pub async fn get_messages(
        &self,
        session_id: &str,
        wait: Option<Duration>,
    ) -> Result<MessagesResult, ToolError> {
        let record = self.lookup(session_id)?;
        let wait = wait.unwrap_or_default().min(self.config.max_wait);
        let drained = record.messages().wait_then_drain(wait).await;
        debug!(
            session_id = %session_id,
            messages = drained.messages.len(),
            notices = drained.notices.len(),
            "Drained message queue"
        );
        Ok(MessagesResult {
            session_id: session_id.to_string(),
            state: record.state(),
            messages_retrieved: drained.messages.len(),
            messages: drained.messages,
            notices: drained.notices,
        })
    }

    /// Unload scripts only, or tear the session down and retire it.
    pub async fn detach(
        &self,
        session_id: &str,
        unload_only: bool,
    ) -> Result<DetachResult, ToolError> {
        if unload_only {
            return self.unload_all(session_id).await;
        }

        let record = self.lookup(session_id)?;
        let Some(scripts) = record.mark_detached(CALLER_DETACH_REASON) else {
            self.registry.retire(session_id);
            debug!(session_id = %session_id, "Session already detached");
            return Ok(DetachResult {
                session_id: session_id.to_string(),
                pid: Some(record.pid()),
                scripts_unloaded: 0,
                state: Some(SessionState::Detached),
                noop: true,
            });
        };
        self.registry.retire(session_id);

        let session = record.backend_session();
        let id = session_id.to_string();
        let unloaded = blocking(move || {
            let unloaded = unload_scripts(&id, scripts);
            if let Err(e) = session.detach() {
                warn!(session_id = %id, error = %e, "Failed to detach backend session");
            }
            unloaded
        })
        .await?;

        info!(
            session_id = %session_id,
            pid = record.pid(),
            scripts_unloaded = unloaded,
            "Session detached"
        );
        Ok(DetachResult {
            session_id: session_id.to_string(),
            pid: Some(record.pid()),
            scripts_unloaded: unloaded,
            state: Some(SessionState::Detached),
            noop: false,
        })
    }

    async fn unload_all(&self, session_id: &str) -> Result<DetachResult, ToolError> {
        let noop = |pid, state| DetachResult {
            session_id: session_id.to_string(),
            pid,
            scripts_unloaded: 0,
            state,
            noop: true,
        };
        let Some(record) = self.registry.get(session_id) else {
            return Ok(noop(None, None));
        };
        // Wait out an in-flight execute so its script is not pulled mid-load.
        let _gate = record.lock_operations().await;
        if record.state() == SessionState::Detached {
            return Ok(noop(Some(record.pid()), Some(SessionState::Detached)));
        }

        let scripts = record.take_scripts();
        let id = session_id.to_string();
        let unloaded = blocking(move || unload_scripts(&id, scripts)).await?;
        info!(session_id = %session_id, scripts_unloaded = unloaded, "Scripts unloaded");
        Ok(DetachResult {
            session_id: session_id.to_string(),
            pid: Some(record.pid()),
            scripts_unloaded: unloaded,
            state: Some(record.state()),
            noop: false,
        })
    }

    /// Kill a process. Tracked sessions are reconciled by their detach watcher.
    pub async fn kill(&self, pid: u32, device_id: Option<&str>) -> Result<KillResult, ToolError> {
        let tracked_sessions: Vec<String> = self
            .registry
            .find_by_pid(pid)
            .iter()
            .filter(|r| r.state() != SessionState::Detached)
            .map(|r| r.id().to_string())
            .collect();

        let backend = self.backend.clone();
        let device = device_id.map(str::to_string);
        blocking(move || backend.kill(device.as_deref(), pid))
            .await?
            .map_err(|e| ToolError::from_backend("kill", e))?;

        info!(pid, sessions = tracked_sessions.len(), "Process killed");
        Ok(KillResult {
            pid,
            tracked_sessions,
        })
    }

    /// Live sessions, oldest first.
    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> =
            self.registry.records().iter().map(|r| r.info()).collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sessions
    }

    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Detach every live session.
    pub async fn shutdown_all(&self) {
        let ids = self.registry.list();
        let count = ids.len();
        for id in ids {
            if let Err(e) = self.detach(&id, false).await {
                warn!(session_id = %id, error = %e, "Failed to detach session during shutdown");
            }
        }
        info!(count, "All sessions detached");
    }
}
