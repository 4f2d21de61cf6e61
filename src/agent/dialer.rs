//! Proxied connections into an organization's private network.
//!
//! The agent proxies each connection through the organization's
//! WireGuard tunnel: the client sends `connect <slug> <addr>
//! <timeout-ns>` on a fresh connection and, on an `ok` reply, the same
//! connection becomes a bidirectional byte stream to the requested
//! endpoint.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::agent::client::{Client, EstablishResponse, validate_argument};
use crate::agent::conn::AgentStream;
use crate::agent::proto::{self, Reply};
use crate::error::{BurrowError, Result};

/// A factory for streams into one organization's private network.
///
/// Built with [`Client::dialer`] (which establishes the tunnel and
/// caches its state for informational access) or
/// [`Client::decaf_dialer`] (which skips the establish for callers that
/// already hold a live tunnel). Both expose the same capability set;
/// the decaf variant simply has no cached state.
#[derive(Debug)]
pub struct TunnelDialer {
    slug: String,
    timeout: Option<Duration>,
    state: Option<serde_json::Value>,
    config: Option<serde_json::Value>,
    client: Client,
}

impl Client {
    /// Build a dialer for the `slug` organization, establishing its
    /// tunnel first.
    pub async fn dialer(&self, cancel: &CancellationToken, slug: &str) -> Result<TunnelDialer> {
        let EstablishResponse {
            wireguard_state,
            tunnel_config,
        } = self.establish(cancel, slug).await?;

        Ok(TunnelDialer {
            slug: slug.to_owned(),
            timeout: None,
            state: Some(wireguard_state),
            config: Some(tunnel_config),
            client: self.clone(),
        })
    }

    /// Build a dialer for the `slug` organization without establishing
    /// its tunnel first.
    pub fn decaf_dialer(&self, slug: &str) -> Result<TunnelDialer> {
        validate_argument("slug", slug)?;

        Ok(TunnelDialer {
            slug: slug.to_owned(),
            timeout: None,
            state: None,
            config: None,
            client: self.clone(),
        })
    }
}

impl TunnelDialer {
    /// WireGuard state captured at establish time, if this dialer
    /// established.
    pub fn state(&self) -> Option<&serde_json::Value> {
        self.state.as_ref()
    }

    /// Tunnel configuration captured at establish time, if this dialer
    /// established.
    pub fn config(&self) -> Option<&serde_json::Value> {
        self.config.as_ref()
    }

    /// Set the connect timeout relayed to the agent with each dial.
    /// The dialer is otherwise immutable after construction.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Open a proxied stream to `addr` (`host:port`) inside the
    /// organization's network.
    ///
    /// `network` has no meaning to the agent, which always proxies to a
    /// TCP peer inside the tunnel; it is logged for diagnostics only.
    /// On success the returned stream is owned by the caller; on any
    /// failure after the dial the connection is closed before returning.
    pub async fn dial_context(
        &self,
        cancel: &CancellationToken,
        network: &str,
        addr: &str,
    ) -> Result<AgentStream> {
        validate_argument("addr", addr)?;

        debug!(network, addr, slug = %self.slug, "dialing through the agent");

        let mut conn = self.client.dial_raw(cancel).await?;

        let timeout_ns = self
            .timeout
            .map(|t| t.as_nanos() as u64)
            .unwrap_or_default()
            .to_string();

        let connect = async {
            proto::write_command(&mut conn, "connect", &[&self.slug, addr, &timeout_ns]).await?;
            let data = proto::read_frame(&mut conn).await?;
            match Reply::classify(&data) {
                Reply::Ok => Ok(()),
                Reply::Err(msg) => Err(BurrowError::from_remote(msg)),
                _ => Err(BurrowError::invalid_response(&data)),
            }
        };

        // failure or cancellation drops (closes) the connection
        tokio::select! {
            _ = cancel.cancelled() => return Err(BurrowError::Cancelled),
            res = connect => res?,
        }

        Ok(conn)
    }
}
