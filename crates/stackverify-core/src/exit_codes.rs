//! Process exit codes for verification runs.

/// Every check passed and no unit aborted.
pub const SUCCESS: i32 = 0;

/// At least one check failed; every unit ran to completion.
pub const CHECK_FAILURES: i32 = 1;

/// At least one unit aborted with a fatal error.
pub const FATAL: i32 = 2;

/// The run could not start (bad config, bad arguments).
pub const USAGE: i32 = 64;
