use std::path::Path;

use crate::config::SlotLimits;

/// One command run inside a leased slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invocation {
    pub command: String,
    /// Run as root inside the slot.
    pub privileged: bool,
    pub timeout_ms: u64,
    pub stdin: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
    pub elapsed_ms: u64,
    /// The caller-side deadline fired and the invocation was torn down.
    pub deadline_exceeded: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("failed to create slot {name}: {msg}")]
    CreateFailed { name: String, msg: String },
    #[error("failed to copy workspace into {name}: {msg}")]
    CopyFailed { name: String, msg: String },
    #[error("failed to invoke {name}: {msg}")]
    ExecFailed { name: String, msg: String },
}

#[mockall::automock]
#[async_trait::async_trait]
pub trait Backend: std::fmt::Debug + Send + Sync {
    async fn create_slot(
        &self,
        name: &str,
        image: &str,
        limits: &SlotLimits,
    ) -> Result<(), BackendError>;

    /// Best effort; errors are only logged.
    async fn destroy_slot(&self, name: &str);

    async fn is_alive(&self, name: &str) -> bool;

    /// Copies the contents of `host_dir` into the slot's work directory.
    async fn copy_in(&self, name: &str, host_dir: &Path) -> Result<(), BackendError>;

    async fn exec(&self, name: &str, invocation: &Invocation) -> Result<RawOutput, BackendError>;
}
