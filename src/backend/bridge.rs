//! Backend adapter that drives a helper process over newline-delimited JSON.
//!
//! Requests go to the helper's stdin as `{"id", "op", ...params}` and are
//! answered on its stdout with `{"id", "result"}` or
//! `{"id", "error": {"kind", "message"}}`. The helper may also emit events at
//! any time:
//!
//! ```text
//! {"event": "detached", "session": 1, "reason": "process-terminated"}
//! {"event": "message", "script": 7, "message": {"type": "send", "payload": ...}, "data": ...}
//! ```
//!
//! A dedicated reader thread parses stdout, completes pending requests and
//! invokes session/script callbacks. Callbacks run with no bridge lock held.

use super::{
    BackendError, BackendScript, BackendSession, DetachCallback, DetachReason,
    InstrumentationBackend, MessageCallback, ScriptMessage,
};
use crate::config::BridgeConfig;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

type Reply = Result<Value, BackendError>;

/// Detach events remembered for sessions that had no handler yet.
const EARLY_DETACH_CAPACITY: usize = 256;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Serialize)]
struct Request<'a> {
    id: u64,
    op: &'a str,
    #[serde(flatten)]
    params: Value,
}

#[derive(Debug, Deserialize)]
struct WireError {
    kind: String,
    message: String,
}

impl From<WireError> for BackendError {
    fn from(e: WireError) -> Self {
        match e.kind.as_str() {
            "not_found" => BackendError::NotFound(e.message),
            "invalid_operation" => BackendError::InvalidOperation(e.message),
            "unavailable" => BackendError::Unavailable(e.message),
            _ => BackendError::Failed(e.message),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum Event {
    Detached {
        session: u64,
        reason: DetachReason,
    },
    Message {
        script: u64,
        message: ScriptMessage,
        #[serde(default)]
        data: Option<Value>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Incoming {
    Reply {
        id: u64,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        error: Option<WireError>,
    },
    Event(Event),
}

struct ScriptEntry {
    session: u64,
    callback: Option<MessageCallback>,
}

#[derive(Default)]
struct Pending {
    closed: bool,
    replies: HashMap<u64, mpsc::Sender<Reply>>,
}

/// Detach handlers by session handle. A detach that arrives before its
/// handler is kept in `early` so the late handler still fires.
#[derive(Default)]
struct Detaches {
    handlers: HashMap<u64, DetachCallback>,
    early: HashMap<u64, DetachReason>,
    early_order: VecDeque<u64>,
}

impl Detaches {
    fn remember(&mut self, session: u64, reason: DetachReason) {
        if self.early.insert(session, reason).is_none() {
            self.early_order.push_back(session);
        }
        while self.early_order.len() > EARLY_DETACH_CAPACITY {
            if let Some(oldest) = self.early_order.pop_front() {
                self.early.remove(&oldest);
            }
        }
    }

    fn take_early(&mut self, session: u64) -> Option<DetachReason> {
        let reason = self.early.remove(&session)?;
        self.early_order.retain(|h| *h != session);
        Some(reason)
    }

    fn forget(&mut self, session: u64) {
        self.handlers.remove(&session);
        self.take_early(session);
    }
}

/// Connection state shared by the backend, its handles and the reader thread.
struct Connection {
    writer: Mutex<Box<dyn Write + Send>>,
    pending: Mutex<Pending>,
    detaches: Mutex<Detaches>,
    scripts: Mutex<HashMap<u64, ScriptEntry>>,
    next_id: AtomicU64,
    request_timeout: Duration,
}

fn closed_error() -> BackendError {
    BackendError::Unavailable("bridge connection closed".to_string())
}

impl Connection {
    fn request(&self, op: &str, params: Value) -> Reply {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = serde_json::to_string(&Request { id, op, params })
            .map_err(|e| BackendError::Failed(format!("failed to encode {op} request: {e}")))?;

        let (tx, rx) = mpsc::channel();
        {
            let mut pending = lock(&self.pending);
            if pending.closed {
                return Err(closed_error());
            }
            pending.replies.insert(id, tx);
        }

        let written = {
            let mut writer = lock(&self.writer);
            writeln!(writer, "{line}").and_then(|()| writer.flush())
        };
        if let Err(e) = written {
            lock(&self.pending).replies.remove(&id);
            return Err(BackendError::Unavailable(format!(
                "failed to write to bridge: {e}"
            )));
        }
        debug!(id, op, "Bridge request sent");

        match rx.recv_timeout(self.request_timeout) {
            Ok(reply) => reply,
            Err(RecvTimeoutError::Timeout) => {
                lock(&self.pending).replies.remove(&id);
                Err(BackendError::Unavailable(format!(
                    "bridge did not answer {op} within {}s",
                    self.request_timeout.as_secs_f64()
                )))
            }
            Err(RecvTimeoutError::Disconnected) => Err(closed_error()),
        }
    }

    fn complete(&self, id: u64, reply: Reply) {
        let sender = lock(&self.pending).replies.remove(&id);
        match sender {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => debug!(id, "Reply for unknown or timed out request"),
        }
    }

    fn dispatch(&self, event: Event) {
        match event {
            Event::Detached { session, reason } => {
                let callback = {
                    let mut detaches = lock(&self.detaches);
                    let callback = detaches.handlers.remove(&session);
                    if callback.is_none() {
                        debug!(session, %reason, "Detach event before handler, keeping it");
                        detaches.remember(session, reason.clone());
                    }
                    callback
                };
                lock(&self.scripts).retain(|_, entry| entry.session != session);
                if let Some(callback) = callback {
                    callback(reason);
                }
            }
            Event::Message {
                script,
                mut message,
                data,
            } => {
                if let (ScriptMessage::Send { data: slot, .. }, Some(data)) = (&mut message, data) {
                    *slot = Some(data);
                }
                let callback = lock(&self.scripts)
                    .get(&script)
                    .and_then(|entry| entry.callback.clone());
                match callback {
                    Some(callback) => callback(message),
                    None => debug!(script, "Message for unknown script"),
                }
            }
        }
    }

    /// Fail every pending request and detach every session.
    fn close(&self) {
        let replies = {
            let mut pending = lock(&self.pending);
            pending.closed = true;
            std::mem::take(&mut pending.replies)
        };
        for (_, tx) in replies {
            let _ = tx.send(Err(closed_error()));
        }
        lock(&self.scripts).clear();
        let handlers: Vec<_> = {
            let mut detaches = lock(&self.detaches);
            detaches.early.clear();
            detaches.early_order.clear();
            detaches.handlers.drain().collect()
        };
        info!(sessions = handlers.len(), "Bridge connection closed");
        for (_, callback) in handlers {
            callback(DetachReason::ConnectionTerminated);
        }
    }

    fn is_closed(&self) -> bool {
        lock(&self.pending).closed
    }

    fn read_loop(&self, reader: impl BufRead) {
        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "Failed to read from bridge");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Incoming>(&line) {
                Ok(Incoming::Reply { id, result, error }) => {
                    self.complete(id, error.map_or(Ok(result), |e| Err(e.into())));
                }
                Ok(Incoming::Event(event)) => self.dispatch(event),
                Err(e) => warn!(error = %e, "Ignoring malformed bridge output"),
            }
        }
        self.close();
    }
}

/// Instrumentation backend backed by a bridge helper process.
pub struct BridgeBackend {
    conn: Arc<Connection>,
    child: Mutex<Option<Child>>,
}

impl BridgeBackend {
    /// Start the helper process and connect to its stdio.
    pub fn launch(config: BridgeConfig) -> Result<Self, BackendError> {
        info!(program = %config.program.display(), "Starting bridge helper");
        let mut child = Command::new(&config.program)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                BackendError::Unavailable(format!(
                    "failed to start bridge {}: {e}",
                    config.program.display()
                ))
            })?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            return Err(BackendError::Unavailable(
                "bridge stdio is not piped".to_string(),
            ));
        };
        let backend = Self::connect(stdin, BufReader::new(stdout), config.request_timeout)?;
        *lock(&backend.child) = Some(child);
        Ok(backend)
    }

    /// Talk the bridge protocol over an arbitrary stream pair.
    pub fn connect(
        writer: impl Write + Send + 'static,
        reader: impl BufRead + Send + 'static,
        request_timeout: Duration,
    ) -> Result<Self, BackendError> {
        let conn = Arc::new(Connection {
            writer: Mutex::new(Box::new(writer)),
            pending: Mutex::new(Pending::default()),
            detaches: Mutex::new(Detaches::default()),
            scripts: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            request_timeout,
        });
        let reader_conn = conn.clone();
        thread::Builder::new()
            .name("bridge-reader".to_string())
            .spawn(move || reader_conn.read_loop(reader))
            .map_err(|e| BackendError::Failed(format!("failed to start bridge reader: {e}")))?;
        Ok(Self {
            conn,
            child: Mutex::new(None),
        })
    }
}

impl Drop for BridgeBackend {
    fn drop(&mut self) {
        if let Some(mut child) = lock(&self.child).take() {
            if let Err(e) = child.kill() {
                debug!(error = %e, "Bridge helper already exited");
            }
            let _ = child.wait();
        }
    }
}

fn handle_field(value: &Value, field: &str) -> Result<u64, BackendError> {
    value
        .get(field)
        .and_then(Value::as_u64)
        .ok_or_else(|| BackendError::Failed(format!("bridge reply is missing `{field}`")))
}

impl InstrumentationBackend for BridgeBackend {
    fn spawn(
        &self,
        device: Option<&str>,
        program: &str,
        argv: &[String],
    ) -> Result<u32, BackendError> {
        let reply = self.conn.request(
            "spawn",
            json!({"device": device, "program": program, "argv": argv}),
        )?;
        let pid = handle_field(&reply, "pid")?;
        u32::try_from(pid).map_err(|_| BackendError::Failed(format!("invalid pid {pid}")))
    }

    fn attach(
        &self,
        device: Option<&str>,
        pid: u32,
    ) -> Result<Arc<dyn BackendSession>, BackendError> {
        let reply = self
            .conn
            .request("attach", json!({"device": device, "pid": pid}))?;
        Ok(Arc::new(BridgeSession {
            handle: handle_field(&reply, "session")?,
            conn: self.conn.clone(),
        }))
    }

    fn resume(&self, device: Option<&str>, pid: u32) -> Result<(), BackendError> {
        self.conn
            .request("resume", json!({"device": device, "pid": pid}))
            .map(drop)
    }

    fn kill(&self, device: Option<&str>, pid: u32) -> Result<(), BackendError> {
        self.conn
            .request("kill", json!({"device": device, "pid": pid}))
            .map(drop)
    }
}

struct BridgeSession {
    handle: u64,
    conn: Arc<Connection>,
}

impl BackendSession for BridgeSession {
    fn on_detached(&self, callback: DetachCallback) {
        let early = {
            let mut detaches = lock(&self.conn.detaches);
            let early = detaches.take_early(self.handle);
            if early.is_none() {
                detaches.handlers.insert(self.handle, callback.clone());
            }
            early
        };
        if let Some(reason) = early {
            callback(reason);
            return;
        }
        // The connection may have closed before the handler went in.
        if self.conn.is_closed() {
            let orphan = lock(&self.conn.detaches).handlers.remove(&self.handle);
            if let Some(callback) = orphan {
                callback(DetachReason::ConnectionTerminated);
            }
        }
    }

    fn create_script(&self, source: &str) -> Result<Arc<dyn BackendScript>, BackendError> {
        let reply = self.conn.request(
            "create_script",
            json!({"session": self.handle, "source": source}),
        )?;
        let handle = handle_field(&reply, "script")?;
        lock(&self.conn.scripts).insert(
            handle,
            ScriptEntry {
                session: self.handle,
                callback: None,
            },
        );
        Ok(Arc::new(BridgeScript {
            handle,
            conn: self.conn.clone(),
        }))
    }

    fn detach(&self) -> Result<(), BackendError> {
        self.conn
            .request("detach", json!({"session": self.handle}))?;
        lock(&self.conn.detaches).forget(self.handle);
        Ok(())
    }
}

struct BridgeScript {
    handle: u64,
    conn: Arc<Connection>,
}

impl BackendScript for BridgeScript {
    fn on_message(&self, callback: MessageCallback) {
        if let Some(entry) = lock(&self.conn.scripts).get_mut(&self.handle) {
            entry.callback = Some(callback);
        }
    }

    fn load(&self) -> Result<(), BackendError> {
        self.conn
            .request("load_script", json!({"script": self.handle}))
            .map(drop)
    }

    fn unload(&self) -> Result<(), BackendError> {
        let result = self
            .conn
            .request("unload_script", json!({"script": self.handle}))
            .map(drop);
        lock(&self.conn.scripts).remove(&self.handle);
        result
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    /// A scripted helper on the far end of a socket pair.
    struct Helper {
        lines: std::io::Lines<BufReader<UnixStream>>,
        writer: UnixStream,
    }

    impl Helper {
        fn next(&mut self) -> Value {
            let line = self.lines.next().expect("request").expect("read");
            serde_json::from_str(&line).expect("json request")
        }

        fn send(&mut self, value: Value) {
            writeln!(self.writer, "{value}").expect("write");
        }

        fn reply(&mut self, request: &Value, result: Value) {
            self.send(json!({"id": request["id"], "result": result}));
        }
    }

    fn connect(timeout: Duration) -> (BridgeBackend, Helper) {
        let (ours, theirs) = UnixStream::pair().expect("socket pair");
        let reader = BufReader::new(ours.try_clone().expect("clone"));
        let backend = BridgeBackend::connect(ours, reader, timeout).expect("connect");
        let helper = Helper {
            lines: BufReader::new(theirs.try_clone().expect("clone")).lines(),
            writer: theirs,
        };
        (backend, helper)
    }

    #[test]
    fn session_and_script_round_trip() {
        let (backend, mut helper) = connect(Duration::from_secs(5));
        let serve = thread::spawn(move || {
            let attach = helper.next();
            assert_eq!(attach["op"], "attach");
            assert_eq!(attach["pid"], 42);
            helper.reply(&attach, json!({"session": 1}));

            let create = helper.next();
            assert_eq!(create["op"], "create_script");
            assert_eq!(create["source"], "send(1)");
            helper.reply(&create, json!({"script": 7}));

            let load = helper.next();
            assert_eq!(load["script"], 7);
            helper.send(json!({
                "event": "message",
                "script": 7,
                "message": {"type": "send", "payload": 1},
                "data": [1, 2],
            }));
            helper.reply(&load, Value::Null);
            helper
        });

        let session = backend.attach(None, 42).unwrap();
        let script = session.create_script("send(1)").unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        script.on_message(Arc::new(move |m| sink.lock().unwrap().push(m)));
        script.load().unwrap();
        serve.join().unwrap();

        // Events are read before the reply that follows them.
        assert_eq!(
            *received.lock().unwrap(),
            vec![ScriptMessage::Send {
                payload: json!(1),
                data: Some(json!([1, 2]))
            }]
        );
    }

    #[test]
    fn error_replies_map_to_backend_errors() {
        let (backend, mut helper) = connect(Duration::from_secs(5));
        let serve = thread::spawn(move || {
            let spawn = helper.next();
            helper.send(json!({
                "id": spawn["id"],
                "error": {"kind": "not_found", "message": "unable to find application"},
            }));
            let kill = helper.next();
            helper.send(json!({
                "id": kill["id"],
                "error": {"kind": "permission_denied", "message": "nope"},
            }));
            helper
        });

        assert_eq!(
            backend.spawn(None, "com.missing", &[]),
            Err(BackendError::NotFound("unable to find application".to_string()))
        );
        assert_eq!(
            backend.kill(Some("usb"), 1),
            Err(BackendError::Failed("nope".to_string()))
        );
        serve.join().unwrap();
    }

    #[test]
    fn detached_event_fires_callback_once() {
        let (backend, mut helper) = connect(Duration::from_secs(5));
        let serve = thread::spawn(move || {
            let attach = helper.next();
            helper.reply(&attach, json!({"session": 3}));
            helper
        });
        let session = backend.attach(None, 9).unwrap();
        let mut helper = serve.join().unwrap();

        let (tx, rx) = mpsc::channel();
        session.on_detached(Arc::new(move |reason| {
            let _ = tx.send(reason);
        }));
        helper.send(json!({"event": "detached", "session": 3, "reason": "process-terminated"}));
        helper.send(json!({"event": "detached", "session": 3, "reason": "process-terminated"}));

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            DetachReason::ProcessTerminated
        );
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn detach_before_handler_still_fires() {
        let (backend, mut helper) = connect(Duration::from_secs(5));
        let serve = thread::spawn(move || {
            let attach = helper.next();
            helper.reply(&attach, json!({"session": 4}));
            helper.send(json!({"event": "detached", "session": 4, "reason": "process-terminated"}));
            helper
        });
        let session = backend.attach(None, 11).unwrap();
        let _helper = serve.join().unwrap();
        thread::sleep(Duration::from_millis(100));

        let (tx, rx) = mpsc::channel();
        session.on_detached(Arc::new(move |reason| {
            let _ = tx.send(reason);
        }));

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            DetachReason::ProcessTerminated
        );
        assert!(lock(&backend.conn.detaches).early.is_empty());
    }

    #[test]
    fn caller_detach_drops_the_handler() {
        let (backend, mut helper) = connect(Duration::from_secs(5));
        let serve = thread::spawn(move || {
            let attach = helper.next();
            helper.reply(&attach, json!({"session": 2}));
            let detach = helper.next();
            assert_eq!(detach["op"], "detach");
            assert_eq!(detach["session"], 2);
            helper.reply(&detach, Value::Null);
            helper
        });
        let session = backend.attach(None, 8).unwrap();
        session.on_detached(Arc::new(|_| {}));
        assert_eq!(lock(&backend.conn.detaches).handlers.len(), 1);

        session.detach().unwrap();
        let _helper = serve.join().unwrap();
        assert!(lock(&backend.conn.detaches).handlers.is_empty());
    }

    #[test]
    fn helper_exit_detaches_sessions_and_fails_requests() {
        let (backend, mut helper) = connect(Duration::from_secs(5));
        let serve = thread::spawn(move || {
            let attach = helper.next();
            helper.reply(&attach, json!({"session": 1}));
            helper
        });
        let session = backend.attach(None, 5).unwrap();
        let (tx, rx) = mpsc::channel();
        session.on_detached(Arc::new(move |reason| {
            let _ = tx.send(reason);
        }));

        drop(serve.join().unwrap());

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            DetachReason::ConnectionTerminated
        );
        assert!(matches!(
            backend.resume(None, 5),
            Err(BackendError::Unavailable(_))
        ));
    }

    #[test]
    fn unanswered_requests_time_out() {
        let (backend, helper) = connect(Duration::from_millis(50));
        let err = backend.resume(None, 5).unwrap_err();
        assert!(matches!(err, BackendError::Unavailable(ref m) if m.contains("resume")));
        drop(helper);
    }
}
