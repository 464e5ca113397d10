pub const DEFAULT_TIME_LIMIT_MS: u64 = 10_000;
pub const DEFAULT_MEMORY_LIMIT_MB: u64 = 256;

pub const DEFAULT_POOL_SIZE: usize = 8;
pub const DEFAULT_SETTLE_DELAY_MS: u64 = 500;
pub const SLOT_NAME_PREFIX: &str = "judge_pool";
pub const SLOT_START_POLL_ATTEMPTS: u32 = 10;
pub const SLOT_START_POLL_INTERVAL_MS: u64 = 500;
pub const SLOT_RESTART_PAUSE_MS: u64 = 100;

/// `timeout -s KILL` reports 128 + SIGKILL.
pub const KILL_EXIT_CODE: i32 = 137;
/// `timeout` with its default signal.
pub const TIMEOUT_EXIT_CODE: i32 = 124;
pub const DEFAULT_OOM_SLACK_MS: u64 = 500;

pub const BATCH_GRACE_MS: u64 = 30_000;
pub const EXEC_DEADLINE_GRACE_MS: u64 = 5_000;

pub const WORKDIR: &str = "/w";
pub const DRIVER_FILE: &str = "_runner.sh";
pub const INPUT_FILE_PREFIX: &str = "_in_";
pub const WORKSPACE_PREFIX: &str = "judge_";

pub const TIME_LIMIT_MESSAGE: &str = "Time limit exceeded";
