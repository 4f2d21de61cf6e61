//! Finding, validating, or starting the agent daemon.
//!
//! A CLI invocation does not care whether the daemon was already running;
//! it cares that the daemon it talks to matches its own build. This
//! module owns that decision: ping the well-known socket, compare
//! versions, and replace an out-of-date background daemon with a fresh
//! one. A daemon the user started interactively is never killed.

use std::future::Future;
use std::time::Duration;

use semver::Version;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::agent::client::{Client, pause};
use crate::agent::conn::Endpoint;
use crate::agent::start;
use crate::config;
use crate::error::Result;

/// Grace period between killing an out-of-date agent and starting a new
/// one; there is no death notification on the socket, so we wait for
/// the old daemon to exit and release it.
const RESTART_GRACE: Duration = Duration::from_secs(1);

/// Ensure a compatible agent daemon is running and return a client to it.
///
/// `prune_peers` is invoked first so the platform drops invalid
/// WireGuard peers before the daemon (re)loads its peer list; its error
/// aborts the bootstrap.
///
/// The well-known socket path and the build version are read here, once,
/// and captured by the returned client.
pub async fn establish<P, Fut>(cancel: &CancellationToken, prune_peers: P) -> Result<Client>
where
    P: FnOnce() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let client = Client::new(Endpoint::unix(config::agent_socket_path()?));

    establish_with(cancel, client, config::build_version(), prune_peers, |c| {
        start::start_daemon(cancel, c)
    })
    .await
}

/// The bootstrap decision table, with the daemon starter injected so it
/// is testable without spawning processes.
pub(crate) async fn establish_with<P, PFut, S, SFut>(
    cancel: &CancellationToken,
    client: Client,
    build_version: &Version,
    prune_peers: P,
    start_daemon: S,
) -> Result<Client>
where
    P: FnOnce() -> PFut,
    PFut: Future<Output = Result<()>>,
    S: FnOnce(Client) -> SFut,
    SFut: Future<Output = Result<Client>>,
{
    prune_peers().await?;

    match client.ping(cancel).await {
        Ok(res) if res.version == *build_version => return Ok(client),
        Ok(res) => {
            warn!(
                agent = %res.version,
                build = %build_version,
                "the running agent does not match this build"
            );

            if !res.background {
                // started interactively by the user; not ours to restart
                return Ok(client);
            }

            warn!(
                "shutting down the out-of-date agent along with its wireguard connections; \
                 a new agent will start automatically"
            );

            if let Err(err) = client.kill(cancel).await {
                error!(%err, "failed stopping agent");
                return Err(err);
            }

            pause(cancel, RESTART_GRACE).await?;
        }
        Err(err) => {
            debug!(%err, "agent did not answer ping");
        }
    }

    start_daemon(client).await
}
