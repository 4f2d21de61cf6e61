//! Typed client for the agent protocol.
//!
//! Every operation dials its own connection, performs one
//! request/response exchange, and closes the connection on the way out.
//! `Client` is cheap to clone and safe to share across tasks; there is
//! no shared mutable state behind it.
//!
//! ## Cancellation
//!
//! Each operation takes a [`CancellationToken`]. An already-cancelled
//! token fails the operation before anything touches the network;
//! cancelling mid-flight drops the connection, which closes the socket
//! and aborts any blocked read or write.

use std::future::Future;
use std::time::Duration;

use semver::Version;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::agent::conn::{AgentStream, Endpoint};
use crate::agent::proto::{self, Reply};
use crate::error::{BurrowError, Result};

/// Pause between wait-loop polls.
const CYCLE: Duration = Duration::from_millis(50);

/// Outer bound on the wait loops.
const WAIT_LIMIT: Duration = Duration::from_secs(4 * 60);

/// Reply to [`Client::ping`].
#[derive(Debug, Clone, Deserialize)]
pub struct PingResponse {
    /// Process id of the daemon.
    #[serde(rename = "PID")]
    pub pid: i32,
    /// Version the daemon was built as. Only compared for equality.
    #[serde(rename = "Version")]
    pub version: Version,
    /// Whether the daemon runs in the background and may be killed and
    /// restarted by the client, or was started interactively by the
    /// user.
    #[serde(rename = "Background")]
    pub background: bool,
}

/// Reply to [`Client::establish`].
///
/// Both fields are opaque to the client; they are decoded only to be
/// handed back to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstablishResponse {
    #[serde(rename = "WireGuardState")]
    pub wireguard_state: serde_json::Value,
    #[serde(rename = "TunnelConfig")]
    pub tunnel_config: serde_json::Value,
}

/// Instances of an app, as reported by the agent. The client does not
/// inspect the shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Instances(pub serde_json::Value);

/// Client for the burrow agent daemon.
#[derive(Debug, Clone)]
pub struct Client {
    endpoint: Endpoint,
}

impl Client {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    /// Connect to the agent at `endpoint` and verify it answers ping.
    pub async fn dial(cancel: &CancellationToken, endpoint: Endpoint) -> Result<Self> {
        let client = Self::new(endpoint);
        client.ping(cancel).await?;
        Ok(client)
    }

    /// Ping-verified client for the well-known agent socket.
    pub async fn default_client(cancel: &CancellationToken) -> Result<Self> {
        Self::dial(cancel, Endpoint::unix(crate::config::agent_socket_path()?)).await
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Dial a raw connection, racing the dial against cancellation.
    ///
    /// Fails without touching the network if the token is already
    /// cancelled.
    pub(crate) async fn dial_raw(&self, cancel: &CancellationToken) -> Result<AgentStream> {
        if cancel.is_cancelled() {
            return Err(BurrowError::Cancelled);
        }

        tokio::select! {
            _ = cancel.cancelled() => Err(BurrowError::Cancelled),
            conn = self.endpoint.connect() => Ok(conn?),
        }
    }

    /// Run one request/response exchange on a fresh connection.
    ///
    /// The exchange owns the connection; whichever of the exchange and
    /// the cancellation completes first determines the outcome, and the
    /// connection is dropped (closed exactly once) on every exit path.
    async fn exchange<T, F, Fut>(&self, cancel: &CancellationToken, op: F) -> Result<T>
    where
        F: FnOnce(AgentStream) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let conn = self.dial_raw(cancel).await?;

        tokio::select! {
            _ = cancel.cancelled() => Err(BurrowError::Cancelled),
            res = op(conn) => res,
        }
    }

    /// Check the daemon is alive; returns its pid, version, and
    /// background flag.
    pub async fn ping(&self, cancel: &CancellationToken) -> Result<PingResponse> {
        self.exchange(cancel, |mut conn| async move {
            proto::write_command(&mut conn, "ping", &[]).await?;
            let data = proto::read_frame(&mut conn).await?;
            match Reply::classify(&data) {
                Reply::OkPayload(body) => Ok(serde_json::from_slice(body)?),
                _ => Err(BurrowError::invalid_response(&data)),
            }
        })
        .await
    }

    /// Ask the daemon to exit.
    ///
    /// No reply is read: the daemon may be gone before it can write one.
    /// A successful write is success.
    pub async fn kill(&self, cancel: &CancellationToken) -> Result<()> {
        self.exchange(cancel, |mut conn| async move {
            proto::write_command(&mut conn, "kill", &[]).await?;
            Ok(())
        })
        .await
    }

    /// Ensure a WireGuard tunnel for the `slug` organization exists,
    /// allocating one if needed, and return the daemon's tunnel state.
    pub async fn establish(
        &self,
        cancel: &CancellationToken,
        slug: &str,
    ) -> Result<EstablishResponse> {
        validate_argument("slug", slug)?;

        self.exchange(cancel, |mut conn| async move {
            proto::write_command(&mut conn, "establish", &[slug]).await?;

            // this goes out to the platform API; no aggressive timeout
            let data = proto::read_frame(&mut conn).await?;
            match Reply::classify(&data) {
                Reply::OkPayload(body) => Ok(serde_json::from_slice(body)?),
                Reply::Err(msg) => Err(BurrowError::from_remote(msg)),
                _ => Err(BurrowError::invalid_response(&data)),
            }
        })
        .await
    }

    /// Probe the tunnel for the `slug` organization.
    pub async fn probe(&self, cancel: &CancellationToken, slug: &str) -> Result<()> {
        validate_argument("slug", slug)?;

        self.exchange(cancel, |mut conn| async move {
            proto::write_command(&mut conn, "probe", &[slug]).await?;
            let data = proto::read_frame(&mut conn).await?;
            match Reply::classify(&data) {
                Reply::Ok => Ok(()),
                Reply::Err(msg) => Err(BurrowError::from_remote(msg)),
                _ => Err(BurrowError::invalid_response(&data)),
            }
        })
        .await
    }

    /// Resolve `host` on the `slug` organization network.
    ///
    /// # Errors
    ///
    /// Returns [`BurrowError::NoSuchHost`] when the agent's DNS has no
    /// record for the host.
    pub async fn resolve(
        &self,
        cancel: &CancellationToken,
        slug: &str,
        host: &str,
    ) -> Result<String> {
        validate_argument("slug", slug)?;
        validate_argument("host", host)?;

        self.exchange(cancel, |mut conn| async move {
            proto::write_command(&mut conn, "resolve", &[slug, host]).await?;
            let data = proto::read_frame(&mut conn).await?;
            match Reply::classify(&data) {
                Reply::Ok => Err(BurrowError::NoSuchHost),
                Reply::OkPayload(addr) => Ok(String::from_utf8_lossy(addr).into_owned()),
                Reply::Err(msg) => Err(BurrowError::from_remote(msg)),
                Reply::Invalid => Err(BurrowError::invalid_response(&data)),
            }
        })
        .await
    }

    /// List the instances of `app` in the `slug` organization.
    pub async fn instances(
        &self,
        cancel: &CancellationToken,
        slug: &str,
        app: &str,
    ) -> Result<Instances> {
        validate_argument("slug", slug)?;
        validate_argument("app", app)?;

        self.exchange(cancel, |mut conn| async move {
            proto::write_command(&mut conn, "instances", &[slug, app]).await?;

            // this goes out to the network; no aggressive timeout
            let data = proto::read_frame(&mut conn).await?;
            match Reply::classify(&data) {
                Reply::OkPayload(body) => Ok(serde_json::from_slice(body)?),
                Reply::Err(msg) => Err(BurrowError::from_remote(msg)),
                _ => Err(BurrowError::invalid_response(&data)),
            }
        })
        .await
    }

    /// Wait for the tunnel for `slug` to become available within the
    /// next four minutes, probing every 50 ms.
    ///
    /// Any probe outcome other than [`BurrowError::TunnelUnavailable`]
    /// ends the wait immediately. If the inner deadline fires while the
    /// caller's token is still live, the error is normalized to
    /// [`BurrowError::TunnelUnavailable`].
    pub async fn wait_for_tunnel(&self, cancel: &CancellationToken, slug: &str) -> Result<()> {
        let wait = async {
            loop {
                match self.probe(cancel, slug).await {
                    Err(BurrowError::TunnelUnavailable) => pause(cancel, CYCLE).await?,
                    other => return other,
                }
            }
        };

        match timeout(WAIT_LIMIT, wait).await {
            Ok(res) => res,
            Err(_) if cancel.is_cancelled() => Err(BurrowError::Cancelled),
            Err(_) => Err(BurrowError::TunnelUnavailable),
        }
    }

    /// Wait for `host` on the `slug` organization network to become
    /// resolvable within the next four minutes.
    ///
    /// Waits for the tunnel first, then retries only on
    /// [`BurrowError::NoSuchHost`]; an inner-deadline expiry with the
    /// caller's token still live is normalized to that same error.
    pub async fn wait_for_host(
        &self,
        cancel: &CancellationToken,
        slug: &str,
        host: &str,
    ) -> Result<()> {
        let wait = async {
            self.wait_for_tunnel(cancel, slug).await?;

            loop {
                match self.resolve(cancel, slug, host).await {
                    Ok(_) => return Ok(()),
                    Err(BurrowError::NoSuchHost) => pause(cancel, CYCLE).await?,
                    Err(err) => return Err(err),
                }
            }
        };

        match timeout(WAIT_LIMIT, wait).await {
            Ok(res) => res,
            Err(_) if cancel.is_cancelled() => Err(BurrowError::Cancelled),
            Err(_) => Err(BurrowError::NoSuchHost),
        }
    }
}

/// Sleep that wakes early on cancellation.
pub(crate) async fn pause(cancel: &CancellationToken, period: Duration) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(BurrowError::Cancelled),
        _ = sleep(period) => Ok(()),
    }
}

/// Protocol arguments are space-delimited with no quoting; reject
/// anything that would corrupt the frame rather than truncating it.
pub(crate) fn validate_argument(name: &str, value: &str) -> Result<()> {
    if value.is_empty() || value.contains(' ') {
        return Err(BurrowError::InvalidArgument(format!(
            "{name} must be non-empty and contain no spaces: {value:?}"
        )));
    }

    Ok(())
}
