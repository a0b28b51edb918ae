//! In-memory backend used by unit tests.
//!
//! Simulates processes, sessions and scripts. A responder decides which
//! messages a script emits when loaded; tests can also emit messages later,
//! crash processes, and inspect what the orchestrator asked for.

use super::{
    BackendError, BackendScript, BackendSession, DetachCallback, DetachReason,
    InstrumentationBackend, MessageCallback, ScriptMessage,
};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Produces the messages a script emits while loading.
pub type Responder = Arc<dyn Fn(&str, &FakeSession) -> Vec<ScriptMessage> + Send + Sync>;

/// Messages of a wrapper that evaluated successfully.
pub fn receipt_ok(result: &str, initial_logs: &[&str]) -> Vec<ScriptMessage> {
    vec![ScriptMessage::send(json!({
        "type": "execution_receipt",
        "result": result,
        "initial_logs": initial_logs,
    }))]
}

/// Messages of a wrapper whose evaluation threw.
pub fn receipt_err(message: &str, stack: &str) -> Vec<ScriptMessage> {
    vec![ScriptMessage::send(json!({
        "type": "execution_receipt",
        "error": { "message": message, "stack": stack },
        "initial_logs": [],
    }))]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeProcess {
    pub program: Option<String>,
    pub suspended: bool,
    pub killed: bool,
}

struct FakeState {
    next_pid: u32,
    devices: HashSet<String>,
    apps: HashSet<String>,
    processes: HashMap<u32, FakeProcess>,
    sessions: Vec<Arc<FakeSession>>,
    scripts: Vec<Arc<FakeScript>>,
    responder: Responder,
    load_error: Option<BackendError>,
    calls: Vec<String>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Clone)]
pub struct FakeBackend {
    state: Arc<Mutex<FakeState>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                next_pid: 1000,
                devices: HashSet::from(["local".to_string()]),
                apps: HashSet::new(),
                processes: HashMap::new(),
                sessions: Vec::new(),
                scripts: Vec::new(),
                responder: Arc::new(|_, _| receipt_ok("undefined", &[])),
                load_error: None,
                calls: Vec::new(),
            })),
        }
    }

    /// Make `identifier` spawnable.
    pub fn with_app(self, identifier: &str) -> Self {
        lock(&self.state).apps.insert(identifier.to_string());
        self
    }

    /// Add an already running process.
    pub fn with_process(self, pid: u32) -> Self {
        lock(&self.state).processes.insert(
            pid,
            FakeProcess {
                program: None,
                suspended: false,
                killed: false,
            },
        );
        self
    }

    pub fn with_device(self, device: &str) -> Self {
        lock(&self.state).devices.insert(device.to_string());
        self
    }

    pub fn set_responder(
        &self,
        responder: impl Fn(&str, &FakeSession) -> Vec<ScriptMessage> + Send + Sync + 'static,
    ) {
        lock(&self.state).responder = Arc::new(responder);
    }

    /// Make every subsequent `load` fail with `error`.
    pub fn fail_loads(&self, error: BackendError) {
        lock(&self.state).load_error = Some(error);
    }

    /// Terminate a process behind the orchestrator's back.
    pub fn crash(&self, pid: u32) {
        let sessions = {
            let mut state = lock(&self.state);
            if let Some(process) = state.processes.get_mut(&pid) {
                process.killed = true;
            }
            sessions_for(&state, pid)
        };
        for session in sessions {
            session.fire_detached(DetachReason::ProcessTerminated);
        }
    }

    /// Deliver `message` to every live script of `pid`.
    pub fn emit(&self, pid: u32, message: ScriptMessage) {
        let scripts: Vec<_> = lock(&self.state)
            .scripts
            .iter()
            .filter(|s| s.session.pid == pid)
            .cloned()
            .collect();
        for script in scripts {
            script.emit(message.clone());
        }
    }

    pub fn process(&self, pid: u32) -> Option<FakeProcess> {
        lock(&self.state).processes.get(&pid).cloned()
    }

    pub fn sessions_for(&self, pid: u32) -> Vec<Arc<FakeSession>> {
        sessions_for(&lock(&self.state), pid)
    }

    pub fn scripts(&self) -> Vec<Arc<FakeScript>> {
        lock(&self.state).scripts.clone()
    }

    /// Backend operations performed so far, e.g. `"spawn com.target.app"`.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    fn check_device(state: &FakeState, device: Option<&str>) -> Result<(), BackendError> {
        match device {
            Some(d) if !state.devices.contains(d) => {
                Err(BackendError::NotFound(format!("unable to find device '{d}'")))
            }
            _ => Ok(()),
        }
    }
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn sessions_for(state: &FakeState, pid: u32) -> Vec<Arc<FakeSession>> {
    state
        .sessions
        .iter()
        .filter(|s| s.pid == pid)
        .cloned()
        .collect()
}

fn record_call(state: &Weak<Mutex<FakeState>>, call: String) {
    if let Some(state) = state.upgrade() {
        lock(&state).calls.push(call);
    }
}

impl InstrumentationBackend for FakeBackend {
    fn spawn(
        &self,
        device: Option<&str>,
        program: &str,
        argv: &[String],
    ) -> Result<u32, BackendError> {
        let mut state = lock(&self.state);
        Self::check_device(&state, device)?;
        state.calls.push(format!("spawn {program} {}", argv.join(" ")).trim_end().to_string());
        if !state.apps.contains(program) {
            return Err(BackendError::NotFound(format!(
                "unable to find application with identifier '{program}'"
            )));
        }
        let pid = state.next_pid;
        state.next_pid += 1;
        state.processes.insert(
            pid,
            FakeProcess {
                program: Some(program.to_string()),
                suspended: true,
                killed: false,
            },
        );
        Ok(pid)
    }

    fn attach(
        &self,
        device: Option<&str>,
        pid: u32,
    ) -> Result<Arc<dyn BackendSession>, BackendError> {
        let mut state = lock(&self.state);
        Self::check_device(&state, device)?;
        state.calls.push(format!("attach {pid}"));
        match state.processes.get(&pid) {
            Some(p) if !p.killed => {}
            _ => {
                return Err(BackendError::NotFound(format!(
                    "unable to find process with pid {pid}"
                )))
            }
        }
        let weak_state = Arc::downgrade(&self.state);
        let session = Arc::new_cyclic(|me| FakeSession {
            pid,
            me: me.clone(),
            state: weak_state,
            inner: Mutex::new(FakeSessionInner::default()),
        });
        state.sessions.push(session.clone());
        Ok(session)
    }

    fn resume(&self, device: Option<&str>, pid: u32) -> Result<(), BackendError> {
        let mut state = lock(&self.state);
        Self::check_device(&state, device)?;
        state.calls.push(format!("resume {pid}"));
        let process = state
            .processes
            .get_mut(&pid)
            .filter(|p| !p.killed)
            .ok_or_else(|| BackendError::NotFound(format!("unable to find process with pid {pid}")))?;
        if !process.suspended {
            return Err(BackendError::InvalidOperation(
                "process is not suspended".to_string(),
            ));
        }
        process.suspended = false;
        Ok(())
    }

    fn kill(&self, device: Option<&str>, pid: u32) -> Result<(), BackendError> {
        {
            let mut state = lock(&self.state);
            Self::check_device(&state, device)?;
            state.calls.push(format!("kill {pid}"));
            match state.processes.get(&pid) {
                Some(p) if !p.killed => {}
                _ => {
                    return Err(BackendError::NotFound(format!(
                        "unable to find process with pid {pid}"
                    )))
                }
            }
        }
        self.crash(pid);
        Ok(())
    }
}

#[derive(Default)]
struct FakeSessionInner {
    detached: bool,
    on_detached: Option<DetachCallback>,
}

pub struct FakeSession {
    pub pid: u32,
    me: Weak<FakeSession>,
    state: Weak<Mutex<FakeState>>,
    inner: Mutex<FakeSessionInner>,
}

impl FakeSession {
    pub fn is_detached(&self) -> bool {
        lock(&self.inner).detached
    }

    /// Detach and fire the callback, at most once.
    pub fn fire_detached(&self, reason: DetachReason) {
        let callback = {
            let mut inner = lock(&self.inner);
            if inner.detached {
                return;
            }
            inner.detached = true;
            inner.on_detached.clone()
        };
        if let Some(callback) = callback {
            callback(reason);
        }
    }
}

impl BackendSession for FakeSession {
    fn on_detached(&self, callback: DetachCallback) {
        lock(&self.inner).on_detached = Some(callback);
    }

    fn create_script(&self, source: &str) -> Result<Arc<dyn BackendScript>, BackendError> {
        if self.is_detached() {
            return Err(BackendError::InvalidOperation("session is gone".to_string()));
        }
        let session = self
            .me
            .upgrade()
            .ok_or_else(|| BackendError::InvalidOperation("session is gone".to_string()))?;
        let script = Arc::new(FakeScript {
            session,
            source: source.to_string(),
            inner: Mutex::new(FakeScriptInner::default()),
        });
        if let Some(state) = self.state.upgrade() {
            lock(&state).scripts.push(script.clone());
        }
        Ok(script)
    }

    fn detach(&self) -> Result<(), BackendError> {
        record_call(&self.state, format!("detach {}", self.pid));
        self.fire_detached(DetachReason::ApplicationRequested);
        Ok(())
    }
}

#[derive(Default)]
struct FakeScriptInner {
    callback: Option<MessageCallback>,
    loaded: bool,
    unloads: usize,
}

pub struct FakeScript {
    session: Arc<FakeSession>,
    pub source: String,
    inner: Mutex<FakeScriptInner>,
}

impl FakeScript {
    pub fn is_loaded(&self) -> bool {
        let inner = lock(&self.inner);
        inner.loaded && inner.unloads == 0
    }

    /// Successful unloads; more than one would be a double free.
    pub fn unload_count(&self) -> usize {
        lock(&self.inner).unloads
    }

    pub fn emit(&self, message: ScriptMessage) {
        let callback = {
            let inner = lock(&self.inner);
            if !inner.loaded || inner.unloads > 0 {
                return;
            }
            inner.callback.clone()
        };
        if let Some(callback) = callback {
            callback(message);
        }
    }
}

impl BackendScript for FakeScript {
    fn on_message(&self, callback: MessageCallback) {
        lock(&self.inner).callback = Some(callback);
    }

    fn load(&self) -> Result<(), BackendError> {
        if self.session.is_detached() {
            return Err(BackendError::InvalidOperation("session is gone".to_string()));
        }
        let (responder, load_error) = match self.session.state.upgrade() {
            Some(state) => {
                let state = lock(&state);
                (state.responder.clone(), state.load_error.clone())
            }
            None => return Err(BackendError::Unavailable("backend dropped".to_string())),
        };
        if let Some(err) = load_error {
            return Err(err);
        }
        {
            let mut inner = lock(&self.inner);
            if inner.loaded {
                return Err(BackendError::InvalidOperation(
                    "script is already loaded".to_string(),
                ));
            }
            inner.loaded = true;
        }
        for message in responder(&self.source, &self.session) {
            self.emit(message);
        }
        Ok(())
    }

    fn unload(&self) -> Result<(), BackendError> {
        let mut inner = lock(&self.inner);
        if inner.unloads > 0 {
            return Err(BackendError::InvalidOperation(
                "script is destroyed".to_string(),
            ));
        }
        inner.unloads += 1;
        Ok(())
    }
}
