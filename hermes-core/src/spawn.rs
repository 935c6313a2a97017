//! The module spawn contract (§6.4): the environment variable names the
//! process manager sets for every spawned module, and that a module links
//! against `hermes-module` to read back. Kept as plain constants in the
//! core crate so both sides of the fork/exec boundary agree on the same
//! strings without one crate depending on the other.
pub const SEGMENT_ENV: &str = "HERMES_SEGMENT";
pub const BARRIER_BASE_ENV: &str = "HERMES_BARRIER_BASE";
pub const MODULE_NAME_ENV: &str = "HERMES_MODULE_NAME";
pub const MODULE_CONFIG_ENV: &str = "HERMES_MODULE_CONFIG";
pub const CMD_FD_ENV: &str = "HERMES_CMD_FD";
pub const REPLY_FD_ENV: &str = "HERMES_REPLY_FD";
