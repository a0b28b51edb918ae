//! Runtime configuration for the session manager and the bridge backend.

use std::path::PathBuf;
use std::time::Duration;

/// Seconds to wait for a script's execution receipt.
pub const DEFAULT_RECEIPT_TIMEOUT_SECS: u64 = 5;
/// Hard cap on a `get_messages` wait.
pub const DEFAULT_MAX_WAIT_SECS: u64 = 60;
/// Detached sessions kept around for a final drain.
pub const DEFAULT_RETIRED_CAPACITY: usize = 256;
/// Seconds before an unanswered bridge request counts as a lost backend.
pub const DEFAULT_BACKEND_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub receipt_timeout: Duration,
    pub max_wait: Duration,
    pub retired_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            receipt_timeout: Duration::from_secs(DEFAULT_RECEIPT_TIMEOUT_SECS),
            max_wait: Duration::from_secs(DEFAULT_MAX_WAIT_SECS),
            retired_capacity: DEFAULT_RETIRED_CAPACITY,
        }
    }
}

/// How to launch and talk to the bridge helper process.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub request_timeout: Duration,
}

impl BridgeConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            request_timeout: Duration::from_secs(DEFAULT_BACKEND_TIMEOUT_SECS),
        }
    }
}
