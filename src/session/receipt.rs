//! Execution receipts: wrapping caller code and routing script messages.
//!
//! Caller code is evaluated inside a wrapper that captures console output
//! and reports the outcome with a single `execution_receipt` message. The
//! router hands that receipt to the waiting `execute` call and sends every
//! other message to the session queue (resident scripts) or drops it
//! (one-shot scripts).

use super::queue::MessageQueue;
use super::types::{ExecuteResult, ExecutionStatus, Notice, QueuedMessage, SessionState};
use crate::backend::{MessageCallback, ScriptMessage};
use serde::Deserialize;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

const RECEIPT_TYPE: &str = "execution_receipt";

/// Wrap `code` so that it reports an execution receipt.
pub(crate) fn wrap_source(code: &str) -> String {
    // A JSON string literal is a valid JS string literal.
    let literal = serde_json::to_string(code).unwrap_or_else(|_| "\"\"".to_string());
    format!(
        r#"(function () {{
    var logs = [];
    var log = console.log;
    function show(v) {{
        return (typeof v === 'object' && v !== null) ? JSON.stringify(v) : String(v);
    }}
    console.log = function () {{
        logs.push(Array.prototype.map.call(arguments, show).join(' '));
        log.apply(console, arguments);
    }};
    var receipt = {{ type: '{RECEIPT_TYPE}', initial_logs: logs }};
    try {{
        var value = eval({literal});
        receipt.result = value === undefined ? 'undefined' : show(value);
    }} catch (e) {{
        receipt.error = {{ message: String(e), stack: e && e.stack ? String(e.stack) : null }};
    }} finally {{
        console.log = log;
    }}
    send(receipt);
}})();
"#
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub(crate) struct ReceiptError {
    pub message: String,
    #[serde(default)]
    pub stack: Option<String>,
}

/// What the wrapper reported about one evaluation.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Receipt {
    Completed {
        result: Option<String>,
        error: Option<ReceiptError>,
        initial_logs: Vec<String>,
    },
    /// The script failed before the wrapper could report.
    ScriptError {
        description: String,
        stack: Option<String>,
    },
}

#[derive(Deserialize)]
struct ReceiptPayload {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ReceiptError>,
    #[serde(default)]
    initial_logs: Vec<Value>,
}

fn value_to_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

impl Receipt {
    /// Parse a `send` payload, if it is an execution receipt.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        let parsed = ReceiptPayload::deserialize(payload).ok()?;
        if parsed.kind != RECEIPT_TYPE {
            return None;
        }
        Some(Receipt::Completed {
            result: parsed.result.map(value_to_string),
            error: parsed.error,
            initial_logs: parsed.initial_logs.into_iter().map(value_to_string).collect(),
        })
    }
}

/// Message callback state for one script.
pub struct MessageRouter {
    session_id: String,
    receipt: Mutex<Option<oneshot::Sender<Receipt>>>,
    queue: Arc<MessageQueue>,
    keep_alive: bool,
}

impl MessageRouter {
    pub fn new(
        session_id: impl Into<String>,
        queue: Arc<MessageQueue>,
        keep_alive: bool,
    ) -> (Arc<Self>, oneshot::Receiver<Receipt>) {
        let (tx, rx) = oneshot::channel();
        let router = Arc::new(Self {
            session_id: session_id.into(),
            receipt: Mutex::new(Some(tx)),
            queue,
            keep_alive,
        });
        (router, rx)
    }

    pub fn callback(self: &Arc<Self>) -> MessageCallback {
        let router = self.clone();
        Arc::new(move |message| router.route(message))
    }

    /// Hand `receipt` to the waiter. Returns false if one was already delivered.
    fn deliver(&self, receipt: Receipt) -> bool {
        let sender = self
            .receipt
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match sender {
            Some(tx) => {
                // The waiter may have timed out already; nothing to do then.
                let _ = tx.send(receipt);
                true
            }
            None => false,
        }
    }

    fn receipt_pending(&self) -> bool {
        self.receipt
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    pub fn route(&self, message: ScriptMessage) {
        match message {
            ScriptMessage::Send { payload, data } => {
                if let Some(receipt) = Receipt::from_payload(&payload) {
                    if !self.deliver(receipt) {
                        debug!(session_id = %self.session_id, "Dropping duplicate execution receipt");
                    }
                    return;
                }
                self.enqueue(QueuedMessage::Send { payload, data });
            }
            ScriptMessage::Log { level, payload } => {
                self.enqueue(QueuedMessage::Log { level, payload });
            }
            ScriptMessage::Error { description, stack } => {
                if self.receipt_pending() {
                    let delivered = self.deliver(Receipt::ScriptError {
                        description: description.clone(),
                        stack: stack.clone(),
                    });
                    if delivered {
                        return;
                    }
                }
                if self.keep_alive {
                    self.queue
                        .push_notice(Notice::ScriptError { description, stack });
                } else {
                    debug!(session_id = %self.session_id, %description, "Dropping error from one-shot script");
                }
            }
        }
    }

    fn enqueue(&self, message: QueuedMessage) {
        if self.keep_alive {
            self.queue.push(message);
        } else {
            debug!(session_id = %self.session_id, "Dropping message from one-shot script");
        }
    }
}

/// Turn the receipt (or its absence) into an execute result.
pub(crate) fn evaluate(
    receipt: Option<Receipt>,
    waited: Duration,
    state: SessionState,
) -> ExecuteResult {
    let mut out = ExecuteResult {
        status: ExecutionStatus::Timeout,
        result: None,
        error: None,
        stack: None,
        details: None,
        initial_logs: Vec::new(),
        script_unloaded: false,
        resumed: None,
        resume_error: None,
        state,
    };
    match receipt {
        None => {
            out.details = Some(format!(
                "Script sent no execution receipt within {}s.",
                waited.as_secs_f64()
            ));
        }
        Some(Receipt::ScriptError { description, stack }) => {
            out.status = ExecutionStatus::Error;
            out.error = Some("Script execution error".to_string());
            out.details = Some(description);
            out.stack = stack;
        }
        Some(Receipt::Completed {
            error: Some(error),
            initial_logs,
            ..
        }) => {
            out.status = ExecutionStatus::Error;
            out.error = Some(error.message);
            out.stack = error.stack;
            out.initial_logs = initial_logs;
        }
        Some(Receipt::Completed {
            result,
            initial_logs,
            error: None,
        }) => {
            out.status = ExecutionStatus::Success;
            out.result = Some(result.unwrap_or_else(|| "undefined".to_string()));
            out.initial_logs = initial_logs;
        }
    }
    out
}
