//! ICMPv6 echo sessions over a hijacked agent connection.
//!
//! A fresh agent connection is upgraded with the `ping6 <slug>` verb; no
//! reply is sent and the connection is immediately in streaming mode.
//! Frames flow in both directions as a 16-byte IPv6 address, a
//! big-endian u16 length, and a complete ICMPv6 message including its
//! header. The agent enforces ICMP type/code policy and computes
//! checksums; only `fdaa`-network addresses are reachable.

use std::net::{IpAddr, Ipv6Addr};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;

use crate::agent::client::Client;
use crate::agent::conn::AgentStream;
use crate::agent::proto;
use crate::error::{BurrowError, Result};

/// Payloads must be strictly smaller than this; the agent refuses
/// anything larger.
const MAX_PAYLOAD: usize = 1500;

/// An ICMPv6 echo session against one organization's network.
///
/// The read and write halves are independent: one task may sit in
/// [`Pinger::read_from`] while another calls [`Pinger::write_to`]. Both
/// halves share one sticky failure; once it is set, every read and write
/// returns it until the session is discarded.
pub struct Pinger {
    read: tokio::sync::Mutex<ReadHalf<AgentStream>>,
    write: tokio::sync::Mutex<WriteHalf<AgentStream>>,
    sticky: Mutex<Option<Arc<BurrowError>>>,
    read_deadline: Mutex<Option<Instant>>,
}

impl Client {
    /// Open an ICMPv6 echo session for the `slug` organization,
    /// ensuring its tunnel exists first.
    pub async fn pinger(&self, cancel: &CancellationToken, slug: &str) -> Result<Pinger> {
        self.establish(cancel, slug).await?;

        let mut conn = self.dial_raw(cancel).await?;

        let args = [slug];
        tokio::select! {
            _ = cancel.cancelled() => return Err(BurrowError::Cancelled),
            res = proto::write_command(&mut conn, "ping6", &args) => res?,
        }

        Ok(Pinger::new(conn))
    }
}

impl Pinger {
    fn new(conn: AgentStream) -> Self {
        let (read, write) = tokio::io::split(conn);
        Self {
            read: tokio::sync::Mutex::new(read),
            write: tokio::sync::Mutex::new(write),
            sticky: Mutex::new(None),
            read_deadline: Mutex::new(None),
        }
    }

    /// Set the deadline for subsequent [`Pinger::read_from`] calls, or
    /// clear it with `None`.
    ///
    /// A read that fails because the deadline passed does not poison the
    /// session, so callers may poll with short deadlines while watching
    /// other work.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        *self.read_deadline.lock().unwrap() = deadline;
    }

    /// The failure latched on this session, if any. Reads and writes on
    /// a session with a latched failure return it unchanged.
    pub fn err(&self) -> Option<Arc<BurrowError>> {
        self.sticky.lock().unwrap().clone()
    }

    /// Write a complete ICMPv6 message, header included, to `addr`.
    ///
    /// # Errors
    ///
    /// Payloads of 1500 bytes or more and non-IPv6 addresses are
    /// rejected without touching the socket, and without poisoning the
    /// session. I/O failures are latched.
    pub async fn write_to(&self, payload: &[u8], addr: IpAddr) -> Result<usize> {
        if let Some(err) = self.sticky() {
            return Err(BurrowError::Session(err));
        }

        if payload.len() >= MAX_PAYLOAD {
            return Err(BurrowError::InvalidArgument(format!(
                "icmp payload too large: {} bytes (limit {MAX_PAYLOAD})",
                payload.len(),
            )));
        }

        let IpAddr::V6(addr) = addr else {
            return Err(BurrowError::InvalidArgument(format!(
                "icmp destination must be an IPv6 address: {addr}"
            )));
        };

        let mut conn = self.write.lock().await;

        match send_frame(&mut conn, &addr, payload).await {
            Ok(()) => Ok(payload.len()),
            Err(err) => Err(self.latch(err)),
        }
    }

    /// Read one ICMPv6 message into `buf`, returning the message length
    /// and the source address.
    ///
    /// The message is copied into `buf`; if it is larger than `buf` the
    /// excess is dropped, but the returned length is always the full
    /// message length.
    pub async fn read_from(&self, buf: &mut [u8]) -> Result<(usize, Ipv6Addr)> {
        if let Some(err) = self.sticky() {
            return Err(BurrowError::Session(err));
        }

        let deadline = *self.read_deadline.lock().unwrap();
        let mut conn = self.read.lock().await;

        // common case for a deadline miss: the caller is polling and
        // nothing has arrived; the session stays usable
        let mut addr = [0u8; 16];
        match read_with_deadline(&mut conn, &mut addr, deadline).await {
            Ok(()) => {}
            Err(err @ BurrowError::DeadlineExceeded) => return Err(err),
            Err(err) => return Err(self.latch(err)),
        }

        match read_message(&mut conn).await {
            Ok(payload) => {
                let n = payload.len().min(buf.len());
                buf[..n].copy_from_slice(&payload[..n]);
                Ok((payload.len(), Ipv6Addr::from(addr)))
            }
            Err(err) => Err(self.latch(err)),
        }
    }

    /// Close the session's connection.
    pub async fn close(self) -> Result<()> {
        let read = self.read.into_inner();
        let write = self.write.into_inner();
        let mut conn = read.unsplit(write);
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

async fn send_frame(
    conn: &mut WriteHalf<AgentStream>,
    addr: &Ipv6Addr,
    payload: &[u8],
) -> Result<()> {
    conn.write_all(&addr.octets()).await?;
    conn.write_all(&(payload.len() as u16).to_be_bytes()).await?;
    conn.write_all(payload).await?;
    conn.flush().await?;
    Ok(())
}

async fn read_with_deadline(
    conn: &mut ReadHalf<AgentStream>,
    buf: &mut [u8],
    deadline: Option<Instant>,
) -> Result<()> {
    match deadline {
        Some(at) => match timeout_at(at, conn.read_exact(buf)).await {
            Ok(res) => {
                res?;
                Ok(())
            }
            Err(_) => Err(BurrowError::DeadlineExceeded),
        },
        None => {
            conn.read_exact(buf).await?;
            Ok(())
        }
    }
}

async fn read_message(conn: &mut ReadHalf<AgentStream>) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 2];
    conn.read_exact(&mut len_buf).await?;

    let mut payload = vec![0u8; usize::from(u16::from_be_bytes(len_buf))];
    conn.read_exact(&mut payload).await?;
    Ok(payload)
}
