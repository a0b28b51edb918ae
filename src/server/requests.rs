//! MCP tool request types.
//!
//! These structs define the parameters for each MCP tool exposed by the server.

use crate::error::ToolError;
use crate::session::MAX_DRAIN_WAIT_SECS;
use rmcp::schemars::JsonSchema;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct AttachRequest {
    #[schemars(
        description = "Process id (e.g. \"1234\") to attach to, or an application identifier / program \
        (e.g. \"com.target.app\") to spawn suspended."
    )]
    #[serde(alias = "pid", alias = "identifier")]
    pub target: String,
    #[schemars(
        description = "Optional JavaScript to inject right away as a resident script. \
        Spawned targets are resumed once it evaluates successfully."
    )]
    #[serde(alias = "javascript_code")]
    pub script: Option<String>,
    #[schemars(description = "Optional spawn arguments. Ignored when attaching to a pid.")]
    #[serde(alias = "argv")]
    pub args: Option<Vec<String>>,
    #[schemars(description = "Device id (default: the bridge's local device)")]
    pub device_id: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExecuteRequest {
    #[schemars(description = "Session id returned by attach")]
    pub session_id: String,
    #[schemars(description = "JavaScript to evaluate inside the target process")]
    #[serde(alias = "code", alias = "script")]
    pub javascript_code: String,
    #[schemars(
        description = "Keep the script loaded after evaluation so hooks keep firing and their \
        messages are queued for get_messages (default: false)"
    )]
    pub keep_alive: Option<bool>,
    #[schemars(
        description = "Resume a spawned-suspended process after successful evaluation (default: false)"
    )]
    pub resume_after: Option<bool>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct PidRequest {
    #[schemars(description = "Process id")]
    pub pid: u32,
    #[schemars(description = "Device id (default: the bridge's local device)")]
    pub device_id: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GetMessagesRequest {
    #[schemars(description = "Session id returned by attach")]
    pub session_id: String,
    #[schemars(
        description = "Seconds to wait for more messages before draining (default: 0, capped by the server)"
    )]
    #[serde(alias = "wait", alias = "timeout")]
    pub duration: Option<f64>,
}

impl GetMessagesRequest {
    /// Validated wait, capped so the conversion cannot overflow.
    pub fn wait(&self) -> Result<Option<Duration>, ToolError> {
        match self.duration {
            None => Ok(None),
            Some(secs) if !secs.is_finite() || secs < 0.0 => Err(ToolError::InvalidParams(
                format!("duration must be a non-negative number of seconds, got {secs}"),
            )),
            Some(secs) => Ok(Some(Duration::from_secs_f64(
                secs.min(MAX_DRAIN_WAIT_SECS as f64),
            ))),
        }
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct DetachRequest {
    #[schemars(description = "Session id returned by attach")]
    pub session_id: String,
    #[schemars(
        description = "Only unload the session's scripts and keep it attached (default: false)"
    )]
    pub unload_only: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn messages(duration: serde_json::Value) -> GetMessagesRequest {
        serde_json::from_value(json!({"session_id": "s", "duration": duration})).unwrap()
    }

    #[test]
    fn duration_is_validated_and_capped() {
        assert_eq!(messages(json!(null)).wait().unwrap(), None);
        assert_eq!(
            messages(json!(1.5)).wait().unwrap(),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(
            messages(json!(1e12)).wait().unwrap(),
            Some(Duration::from_secs(MAX_DRAIN_WAIT_SECS))
        );
        assert!(matches!(
            messages(json!(-1)).wait(),
            Err(ToolError::InvalidParams(_))
        ));
    }

    #[test]
    fn attach_accepts_aliases() {
        let req: AttachRequest =
            serde_json::from_value(json!({"pid": "1234", "javascript_code": "1"})).unwrap();
        assert_eq!(req.target, "1234");
        assert_eq!(req.script.as_deref(), Some("1"));
        assert!(req.args.is_none());
    }
}
