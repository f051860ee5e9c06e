//! Stable exit codes for harness CLI commands.

/// Command succeeded; for `harness run`, every node succeeded or was skipped.
pub const OK: i32 = 0;
/// Invalid config or blueprint, provisioning failure, or any other error.
pub const INVALID: i32 = 1;
/// `harness run` completed but a node failed.
pub const RUN_FAILED: i32 = 2;
