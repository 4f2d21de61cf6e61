//! Long-lived DNS resolver sessions over a hijacked agent connection.
//!
//! A fresh agent connection is upgraded with the `resolver <slug>` verb;
//! the agent answers `ok <nameserver>` and the connection then speaks a
//! length-prefixed query/reply sub-protocol: requests are `host <name>`
//! or `txt <name>`, replies are `ok <answer>` or `err <message>`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::agent::client::{Client, validate_argument};
use crate::agent::conn::AgentStream;
use crate::agent::proto::{self, Reply};
use crate::error::{BurrowError, Result};

/// A DNS resolver session against one organization's network.
///
/// Lookups are serialized: the session owns a single connection and the
/// reply to each query is consumed before the next query is written, so
/// two concurrent lookups each see their matching reply.
///
/// Once any lookup hits an I/O or protocol failure the session is
/// unusable: the failure is latched and every further lookup returns it
/// without touching the socket. Discard the session and build a new one.
#[derive(Debug)]
pub struct Resolver {
    conn: tokio::sync::Mutex<AgentStream>,
    sticky: Mutex<Option<Arc<BurrowError>>>,
    timeout: Option<Duration>,
    ns_addr: String,
}

impl Client {
    /// Open a resolver session for the `slug` organization, ensuring its
    /// tunnel exists first.
    pub async fn resolver(&self, cancel: &CancellationToken, slug: &str) -> Result<Resolver> {
        self.establish(cancel, slug).await?;

        let mut conn = self.dial_raw(cancel).await?;

        let hijack = async {
            proto::write_command(&mut conn, "resolver", &[slug]).await?;
            let data = proto::read_frame(&mut conn).await?;
            match Reply::classify(&data) {
                Reply::OkPayload(ns) => Ok(String::from_utf8_lossy(ns).into_owned()),
                Reply::Err(msg) => Err(BurrowError::from_remote(msg)),
                _ => Err(BurrowError::invalid_response(&data)),
            }
        };

        // failure or cancellation drops (closes) the connection
        let ns_addr = tokio::select! {
            _ = cancel.cancelled() => return Err(BurrowError::Cancelled),
            res = hijack => res?,
        };

        Ok(Resolver {
            conn: tokio::sync::Mutex::new(conn),
            sticky: Mutex::new(None),
            timeout: None,
            ns_addr,
        })
    }
}

impl Resolver {
    /// Nameserver address the agent reported at session start.
    pub fn ns_addr(&self) -> &str {
        &self.ns_addr
    }

    /// Bound the wait for each reply.
    ///
    /// The bound covers the DNS round-trip on the agent, not the payload
    /// stream: it applies to the reply's length prefix only, so a large
    /// or slow payload is never truncated.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = Some(timeout);
    }

    /// Look up the addresses of `name`.
    pub async fn lookup_host(&self, name: &str) -> Result<Vec<String>> {
        let reply = self.lookup("host", name).await?;
        Ok(reply.split(',').map(str::to_owned).collect())
    }

    /// Look up the TXT record of `name`.
    ///
    /// The agent never sends more than one record; the single-element
    /// list mirrors standard resolver interfaces.
    pub async fn lookup_txt(&self, name: &str) -> Result<Vec<String>> {
        let reply = self.lookup("txt", name).await?;
        Ok(vec![reply])
    }

    async fn lookup(&self, kind: &str, name: &str) -> Result<String> {
        validate_argument("name", name)?;

        if let Some(err) = self.sticky() {
            return Err(BurrowError::Session(err));
        }

        let mut conn = self.conn.lock().await;

        match self.query(&mut conn, kind, name).await {
            Ok(reply) => Ok(reply),
            // a clean remote error leaves the stream in sync
            Err(err @ (BurrowError::Agent(_) | BurrowError::TunnelUnavailable)) => Err(err),
            Err(err) => Err(self.latch(err)),
        }
    }

    async fn query(&self, conn: &mut AgentStream, kind: &str, name: &str) -> Result<String> {
        let request = format!("{kind} {name}");
        proto::write_frame(conn, request.as_bytes()).await?;

        // the length prefix carries the wait for the DNS round-trip on
        // the agent; the payload that follows arrives promptly
        let len = match self.timeout {
            Some(bound) => match timeout(bound, proto::read_frame_len(conn)).await {
                Ok(res) => res?,
                Err(_) => return Err(BurrowError::DeadlineExceeded),
            },
            None => proto::read_frame_len(conn).await?,
        };

        let body = proto::read_frame_body(conn, len).await?;

        match Reply::classify(&body) {
            Reply::OkPayload(payload) => Ok(String::from_utf8_lossy(payload).into_owned()),
            Reply::Err(msg) => Err(BurrowError::from_remote(msg)),
            _ => Err(BurrowError::invalid_response(&body)),
        }
    }

    /// The failure latched on this session, if any. A session with a
    /// latched failure cannot perform lookups.
    pub fn err(&self) -> Option<Arc<BurrowError>> {
        self.sticky()
    }

    /// Close the session's connection.
    pub async fn close(self) -> Result<()> {
        let mut conn = self.conn.into_inner();
        conn.shutdown().await?;
        Ok(())
    }

    fn sticky(&self) -> Option<Arc<BurrowError>> {
        self.sticky.lock().unwrap().clone()
    }

    fn latch(&self, err: BurrowError) -> BurrowError {
        let mut sticky = self.sticky.lock().unwrap();
        let arc = sticky.get_or_insert_with(|| Arc::new(err)).clone();
        BurrowError::Session(arc)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::agent::conn::Endpoint;
    use tempfile::TempDir;
    use tokio::net::{UnixListener, UnixStream};

    const ESTABLISH_REPLY: &[u8] = br#"ok {"WireGuardState":{},"TunnelConfig":{}}"#;

    /// Serve the establish + hijack handshake, returning the hijacked
    /// connection for the test to drive.
    async fn accept_session(listener: &UnixListener, slug: &str) -> UnixStream {
        let (mut conn, _) = listener.accept().await.unwrap();
        let request = proto::read_frame(&mut conn).await.unwrap();
        assert_eq!(request, format!("establish {slug}").as_bytes());
        proto::write_frame(&mut conn, ESTABLISH_REPLY).await.unwrap();
        drop(conn);

        let (mut conn, _) = listener.accept().await.unwrap();
        let request = proto::read_frame(&mut conn).await.unwrap();
        assert_eq!(request, format!("resolver {slug}").as_bytes());
        proto::write_frame(&mut conn, b"ok fdaa::3").await.unwrap();
        conn
    }

    fn agent_socket() -> (TempDir, Client, UnixListener) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("burrowd.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let client = Client::new(Endpoint::unix(&path));
        (dir, client, listener)
    }

    #[tokio::test]
    async fn test_lookup_host_splits_on_commas() {
        let (_dir, client, listener) = agent_socket();
        let cancel = CancellationToken::new();

        let server = tokio::spawn(async move {
            let mut conn = accept_session(&listener, "o").await;

            let request = proto::read_frame(&mut conn).await.unwrap();
            assert_eq!(request, b"host app.internal");
            proto::write_frame(&mut conn, b"ok fdaa::1,fdaa::2").await.unwrap();
        });

        let resolver = client.resolver(&cancel, "o").await.unwrap();
        assert_eq!(resolver.ns_addr(), "fdaa::3");

        let addrs = resolver.lookup_host("app.internal").await.unwrap();
        assert_eq!(addrs, vec!["fdaa::1", "fdaa::2"]);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_lookup_txt_is_a_single_record() {
        let (_dir, client, listener) = agent_socket();
        let cancel = CancellationToken::new();

        let server = tokio::spawn(async move {
            let mut conn = accept_session(&listener, "o").await;

            let request = proto::read_frame(&mut conn).await.unwrap();
            assert_eq!(request, b"txt _dmarc.app.internal");
            proto::write_frame(&mut conn, b"ok v=spf1 a,b include").await.unwrap();
        });

        let resolver = client.resolver(&cancel, "o").await.unwrap();
        let records = resolver.lookup_txt("_dmarc.app.internal").await.unwrap();
        // the payload is returned verbatim, commas included
        assert_eq!(records, vec!["v=spf1 a,b include"]);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_error_is_not_sticky() {
        let (_dir, client, listener) = agent_socket();
        let cancel = CancellationToken::new();

        let server = tokio::spawn(async move {
            let mut conn = accept_session(&listener, "o").await;

            let _ = proto::read_frame(&mut conn).await.unwrap();
            proto::write_frame(&mut conn, b"err NXDOMAIN").await.unwrap();

            let _ = proto::read_frame(&mut conn).await.unwrap();
            proto::write_frame(&mut conn, b"ok fdaa::1").await.unwrap();
        });

        let resolver = client.resolver(&cancel, "o").await.unwrap();

        let err = resolver.lookup_host("ghost.internal").await.unwrap_err();
        assert_eq!(err.to_string(), "NXDOMAIN");
        assert!(resolver.err().is_none());

        // the session still works
        let addrs = resolver.lookup_host("app.internal").await.unwrap();
        assert_eq!(addrs, vec!["fdaa::1"]);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_io_failure_is_sticky() {
        let (_dir, client, listener) = agent_socket();
        let cancel = CancellationToken::new();

        let server = tokio::spawn(async move {
            let mut conn = accept_session(&listener, "o").await;
            let _ = proto::read_frame(&mut conn).await.unwrap();
            // hang up mid-lookup
            drop(conn);
        });

        let resolver = client.resolver(&cancel, "o").await.unwrap();

        let first = resolver.lookup_host("app.internal").await.unwrap_err();
        let second = resolver.lookup_host("app.internal").await.unwrap_err();
        let third = resolver.lookup_txt("app.internal").await.unwrap_err();

        // all three surface the same latched failure
        assert_eq!(first.to_string(), second.to_string());
        assert_eq!(first.to_string(), third.to_string());
        assert!(resolver.err().is_some());

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_reply_is_sticky() {
        let (_dir, client, listener) = agent_socket();
        let cancel = CancellationToken::new();

        let server = tokio::spawn(async move {
            let mut conn = accept_session(&listener, "o").await;
            let _ = proto::read_frame(&mut conn).await.unwrap();
            proto::write_frame(&mut conn, b"what").await.unwrap();
        });

        let resolver = client.resolver(&cancel, "o").await.unwrap();

        let err = resolver.lookup_host("app.internal").await.unwrap_err();
        assert!(err.to_string().contains("invalid agent response"));
        assert!(resolver.err().is_some());

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_lookups_each_see_their_reply() {
        let (_dir, client, listener) = agent_socket();
        let cancel = CancellationToken::new();

        let server = tokio::spawn(async move {
            let mut conn = accept_session(&listener, "o").await;

            // replies strictly in request order
            for _ in 0..2 {
                let request = proto::read_frame(&mut conn).await.unwrap();
                let name = String::from_utf8(request).unwrap();
                let name = name.strip_prefix("host ").unwrap().to_owned();
                let reply = match name.as_str() {
                    "one.internal" => "ok fdaa::1",
                    "two.internal" => "ok fdaa::2",
                    other => panic!("unexpected lookup {other}"),
                };
                proto::write_frame(&mut conn, reply.as_bytes()).await.unwrap();
            }
        });

        let resolver = std::sync::Arc::new(client.resolver(&cancel, "o").await.unwrap());

        let a = {
            let resolver = resolver.clone();
            tokio::spawn(async move { resolver.lookup_host("one.internal").await.unwrap() })
        };
        let b = {
            let resolver = resolver.clone();
            tokio::spawn(async move { resolver.lookup_host("two.internal").await.unwrap() })
        };

        assert_eq!(a.await.unwrap(), vec!["fdaa::1"]);
        assert_eq!(b.await.unwrap(), vec!["fdaa::2"]);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_reply_timeout_applies_to_the_prefix_only() {
        let (_dir, client, listener) = agent_socket();
        let cancel = CancellationToken::new();

        let server = tokio::spawn(async move {
            let mut conn = accept_session(&listener, "o").await;

            let _ = proto::read_frame(&mut conn).await.unwrap();
            // dribble the reply out: prefix fast, payload slow
            let payload = b"ok fdaa::42";
            conn.write_all(&(payload.len() as u32).to_be_bytes()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(150)).await;
            conn.write_all(payload).await.unwrap();
        });

        let mut resolver = client.resolver(&cancel, "o").await.unwrap();
        resolver.set_timeout(Duration::from_millis(100));

        // the payload takes longer than the timeout, but the timeout
        // only bounds the prefix
        let addrs = resolver.lookup_host("app.internal").await.unwrap();
        assert_eq!(addrs, vec!["fdaa::42"]);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_reply_timeout_expiry_latches() {
        let (_dir, client, listener) = agent_socket();
        let cancel = CancellationToken::new();

        let server = tokio::spawn(async move {
            let mut conn = accept_session(&listener, "o").await;
            let _ = proto::read_frame(&mut conn).await.unwrap();
            // never reply
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(conn);
        });

        let mut resolver = client.resolver(&cancel, "o").await.unwrap();
        resolver.set_timeout(Duration::from_millis(50));

        let err = resolver.lookup_host("app.internal").await.unwrap_err();
        assert_eq!(err.to_string(), "read deadline exceeded");
        assert!(resolver.err().is_some());

        server.abort();
    }

    #[tokio::test]
    async fn test_bad_hijack_reply_fails_construction() {
        let (_dir, client, listener) = agent_socket();
        let cancel = CancellationToken::new();

        let server = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let _ = proto::read_frame(&mut conn).await.unwrap();
            proto::write_frame(&mut conn, ESTABLISH_REPLY).await.unwrap();
            drop(conn);

            let (mut conn, _) = listener.accept().await.unwrap();
            let _ = proto::read_frame(&mut conn).await.unwrap();
            // bare ok carries no nameserver
            proto::write_frame(&mut conn, b"ok").await.unwrap();
        });

        let err = client.resolver(&cancel, "o").await.unwrap_err();
        assert!(matches!(err, BurrowError::InvalidResponse(_)));

        server.await.unwrap();
    }
}
