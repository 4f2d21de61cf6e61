//! Well-known agent paths and the build version.
//!
//! The agent daemon keeps its socket, pid file, and log under
//! `~/.burrow/agent`. The socket's filesystem permissions are the trust
//! boundary for the whole protocol; there is no other authentication.

use std::path::PathBuf;
use std::sync::OnceLock;

use semver::Version;

use crate::error::{BurrowError, Result};

/// Get the burrow config directory (~/.burrow)
pub fn config_dir() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(".burrow"))
        .ok_or_else(|| BurrowError::Config("could not determine home directory".into()))
}

/// Get the agent directory (~/.burrow/agent)
pub fn agent_dir() -> Result<PathBuf> {
    Ok(config_dir()?.join("agent"))
}

/// Get the agent socket path (~/.burrow/agent/burrowd.sock)
pub fn agent_socket_path() -> Result<PathBuf> {
    Ok(agent_dir()?.join("burrowd.sock"))
}

/// Get the agent PID file path (~/.burrow/agent/burrowd.pid)
pub fn agent_pid_path() -> Result<PathBuf> {
    Ok(agent_dir()?.join("burrowd.pid"))
}

/// Get the agent log path (~/.burrow/agent/agent.log)
pub fn agent_log_path() -> Result<PathBuf> {
    Ok(agent_dir()?.join("agent.log"))
}

/// The version this crate was built as, parsed once per process.
pub fn build_version() -> &'static Version {
    static VERSION: OnceLock<Version> = OnceLock::new();
    VERSION.get_or_init(|| {
        Version::parse(env!("CARGO_PKG_VERSION")).expect("CARGO_PKG_VERSION is valid semver")
    })
}
