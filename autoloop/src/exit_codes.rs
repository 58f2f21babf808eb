//! Stable exit codes for the autoloop CLI.

/// Command succeeded, or an attempt completed successfully.
pub const OK: i32 = 0;
/// Invalid config, no usable worker binary, or another setup/I/O error.
pub const INVALID: i32 = 1;
/// `autoloop run` used every attempt slot without a successful attempt.
pub const EXHAUSTED: i32 = 2;
