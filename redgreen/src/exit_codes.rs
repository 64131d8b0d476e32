//! Stable exit codes for redgreen CLI commands.

/// Command succeeded (for `call`, the action responded with `success: true`).
pub const OK: i32 = 0;
/// Startup failed: invalid config, unreadable input or bad arguments.
pub const INVALID: i32 = 1;
/// `redgreen call` ran but the action responded with `success: false`.
pub const ACTION_FAILED: i32 = 2;
/// `redgreen status` found no active cycle.
pub const NO_CYCLE: i32 = 3;
