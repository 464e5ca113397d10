use std::path::PathBuf;
use std::time::Duration;

use crate::constants::{
    BATCH_GRACE_MS, DEFAULT_MEMORY_LIMIT_MB, DEFAULT_OOM_SLACK_MS, DEFAULT_POOL_SIZE,
    DEFAULT_SETTLE_DELAY_MS, DEFAULT_TIME_LIMIT_MS,
};

/// Resource caps applied to every slot when it is created.
#[derive(Clone, Debug, PartialEq)]
pub struct SlotLimits {
    pub memory_mb: u64,
    pub cpus: f32,
    pub pids: u32,
    pub open_files: u32,
    pub file_size_bytes: u64,
    pub tmpfs_size_mb: u64,
}

impl SlotLimits {
    pub fn with_memory(memory_mb: u64) -> Self {
        Self {
            memory_mb,
            cpus: 1.0,
            pids: 256,
            open_files: 256,
            file_size_bytes: 64 << 20,
            tmpfs_size_mb: 64,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PoolSettings {
    /// Slots per image.
    pub size: usize,
    /// Pause after bulk slot creation so the backend can settle.
    pub settle_delay: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            size: DEFAULT_POOL_SIZE,
            settle_delay: Duration::from_millis(DEFAULT_SETTLE_DELAY_MS),
        }
    }
}

#[derive(Clone, Debug)]
pub struct JudgeSettings {
    pub default_time_limit_ms: u64,
    pub default_memory_limit_mb: u64,
    pub oom_slack_ms: u64,
    pub batch_grace_ms: u64,
    /// Directory under which per-run workspaces are created.
    pub workspace_root: PathBuf,
}

impl Default for JudgeSettings {
    fn default() -> Self {
        Self {
            default_time_limit_ms: DEFAULT_TIME_LIMIT_MS,
            default_memory_limit_mb: DEFAULT_MEMORY_LIMIT_MB,
            oom_slack_ms: DEFAULT_OOM_SLACK_MS,
            batch_grace_ms: BATCH_GRACE_MS,
            workspace_root: std::env::temp_dir(),
        }
    }
}

#[derive(clap::Args, Clone, Debug)]
pub struct EngineArgs {
    /// Number of slots kept warm per sandbox image
    #[arg(long, env = "JUDGE_POOL_SIZE", default_value_t = DEFAULT_POOL_SIZE)]
    pub pool_size: usize,

    /// Docker CLI used to drive the slots
    #[arg(long, env = "JUDGE_DOCKER_BIN", default_value = "docker")]
    pub docker_bin: PathBuf,

    /// Pause after a pool creates its slots
    #[arg(long, env = "JUDGE_SETTLE_DELAY_MS", default_value_t = DEFAULT_SETTLE_DELAY_MS)]
    pub settle_delay_ms: u64,

    /// A kill this far below the time limit counts as a memory kill
    #[arg(long, env = "JUDGE_OOM_SLACK_MS", default_value_t = DEFAULT_OOM_SLACK_MS)]
    pub oom_slack_ms: u64,

    /// Where host-side workspaces are created
    #[arg(long, env = "JUDGE_WORKSPACE_ROOT")]
    pub workspace_root: Option<PathBuf>,
}

impl EngineArgs {
    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            size: self.pool_size.max(1),
            settle_delay: Duration::from_millis(self.settle_delay_ms),
        }
    }

    pub fn judge_settings(&self) -> JudgeSettings {
        let defaults = JudgeSettings::default();
        JudgeSettings {
            oom_slack_ms: self.oom_slack_ms,
            workspace_root: self
                .workspace_root
                .clone()
                .unwrap_or(defaults.workspace_root.clone()),
            ..defaults
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(clap::Parser, Debug)]
    struct TestCli {
        #[command(flatten)]
        engine: EngineArgs,
    }

    #[test]
    fn test_defaults_match_constants() {
        let cli = TestCli::parse_from(["judge-core"]);
        let pool = cli.engine.pool_settings();
        let judge = cli.engine.judge_settings();

        assert_eq!(pool.size, DEFAULT_POOL_SIZE);
        assert_eq!(pool.settle_delay, Duration::from_millis(500));
        assert_eq!(judge.oom_slack_ms, 500);
        assert_eq!(judge.default_time_limit_ms, 10_000);
        assert_eq!(judge.default_memory_limit_mb, 256);
    }

    #[test]
    fn test_pool_size_never_zero() {
        let cli = TestCli::parse_from(["judge-core", "--pool-size", "0"]);
        assert_eq!(cli.engine.pool_settings().size, 1);
    }

    #[test]
    fn test_slot_limits_for_memory() {
        let limits = SlotLimits::with_memory(768);
        assert_eq!(limits.memory_mb, 768);
        assert_eq!(limits.pids, 256);
        assert_eq!(limits.file_size_bytes, 64 * 1024 * 1024);
    }
}
