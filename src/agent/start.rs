//! Spawning the agent daemon.

use std::process::{Command, Stdio};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::agent::client::{Client, pause};
use crate::error::{BurrowError, Result};

const START_ATTEMPTS: u64 = 10;

/// Start the agent daemon and wait for it to answer ping.
///
/// The daemon binary (`burrowd`) is expected next to the current
/// executable. It is spawned detached with null stdio and sets up its
/// own logging under the agent directory.
pub(crate) async fn start_daemon(cancel: &CancellationToken, client: Client) -> Result<Client> {
    spawn_daemon()?;

    // linear backoff: 50ms, 100ms, 150ms, ...
    for attempt in 1..=START_ATTEMPTS {
        pause(cancel, Duration::from_millis(50 * attempt)).await?;

        match client.ping(cancel).await {
            Ok(res) => {
                debug!(pid = res.pid, version = %res.version, "agent daemon is up");
                return Ok(client);
            }
            Err(err @ BurrowError::Cancelled) => return Err(err),
            Err(_) => {}
        }
    }

    Err(BurrowError::DaemonStart(
        "agent did not come up; check ~/.burrow/agent/agent.log for details".into(),
    ))
}

/// Spawn the daemon process in the background.
///
/// The daemon owns its socket, pid file, and log file; all this helper
/// guarantees is that the agent directory exists before the daemon
/// tries to bind in it.
fn spawn_daemon() -> Result<()> {
    let current_exe = std::env::current_exe()?;
    let daemon_path = current_exe.with_file_name("burrowd");

    if !daemon_path.exists() {
        return Err(BurrowError::DaemonStart(format!(
            "agent binary not found at {daemon_path:?}"
        )));
    }

    let agent_dir = crate::config::agent_dir()?;
    std::fs::create_dir_all(&agent_dir)?;

    Command::new(&daemon_path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;

    Ok(())
}
