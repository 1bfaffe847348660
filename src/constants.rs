pub(crate) const POLL_INTERVAL_MS: u64 = 100;
pub const DEFAULT_SETTLE_MS: u64 = 500;

pub const DEFAULT_ATTEMPT_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_DEVICE_WAIT_SECS: u64 = 60;
pub const DEFAULT_DISCONNECT_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_ABORT_AFTER: u32 = 3;

/// Time between SIGTERM and SIGKILL when stopping the tool
pub(crate) const TERMINATE_GRACE_MS: u64 = 2000;
pub(crate) const PROCESS_POLL_MS: u64 = 20;

pub(crate) const MASKROM_HINT: &str = "If the board is connected, make sure it is in maskrom mode \
     (hold the maskrom button while applying power).";
