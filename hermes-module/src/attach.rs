//! Parses the attach parameters a module process receives from the manager
//! (§6.4): segment name, barrier base name, module name, optional config
//! path, and the control channel fd numbers.
use std::os::unix::io::RawFd;
use std::path::PathBuf;

use anyhow::anyhow;
use hermes_core::error::{HermesErrorKind, HermesResult, ResultExt};
use hermes_core::spawn::{
    BARRIER_BASE_ENV, CMD_FD_ENV, MODULE_CONFIG_ENV, MODULE_NAME_ENV, REPLY_FD_ENV, SEGMENT_ENV,
};

/// The parameters a module process is spawned with.
#[derive(Debug, Clone)]
pub struct AttachParams {
    pub segment_name: String,
    pub barrier_base: String,
    pub module_name: String,
    pub config_path: Option<PathBuf>,
    pub cmd_fd: RawFd,
    pub reply_fd: RawFd,
}

fn required_env(key: &str) -> HermesResult<String> {
    std::env::var(key)
        .map_err(|_| anyhow!("missing required environment variable {key}"))
        .typ(HermesErrorKind::Protocol)
}

impl AttachParams {
    /// Reads attach parameters from the process environment (§6.4).
    pub fn from_env() -> HermesResult<Self> {
        let cmd_fd: RawFd = required_env(CMD_FD_ENV)?
            .parse()
            .map_err(|e| anyhow!("invalid {CMD_FD_ENV}: {e}"))
            .typ(HermesErrorKind::Protocol)?;
        let reply_fd: RawFd = required_env(REPLY_FD_ENV)?
            .parse()
            .map_err(|e| anyhow!("invalid {REPLY_FD_ENV}: {e}"))
            .typ(HermesErrorKind::Protocol)?;

        Ok(Self {
            segment_name: required_env(SEGMENT_ENV)?,
            barrier_base: required_env(BARRIER_BASE_ENV)?,
            module_name: required_env(MODULE_NAME_ENV)?,
            config_path: std::env::var(MODULE_CONFIG_ENV).ok().map(PathBuf::from),
            cmd_fd,
            reply_fd,
        })
    }
}
