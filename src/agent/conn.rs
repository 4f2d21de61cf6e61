//! Endpoint addresses and the raw agent stream.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

/// Address of an agent endpoint.
///
/// In practice this is the well-known Unix socket, but the client never
/// interprets the address beyond dialing it.
#[derive(Debug, Clone)]
pub enum Endpoint {
    #[cfg(unix)]
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl Endpoint {
    #[cfg(unix)]
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Endpoint::Unix(path.into())
    }

    /// Open a fresh stream to this endpoint.
    pub async fn connect(&self) -> io::Result<AgentStream> {
        match self {
            #[cfg(unix)]
            Endpoint::Unix(path) => Ok(AgentStream::Unix(UnixStream::connect(path).await?)),
            Endpoint::Tcp(addr) => Ok(AgentStream::Tcp(TcpStream::connect(addr).await?)),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            #[cfg(unix)]
            Endpoint::Unix(path) => write!(f, "{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "{addr}"),
        }
    }
}

/// A stream connection to the agent.
///
/// Dropping the stream closes it; that is also how in-flight operations
/// are aborted on cancellation.
#[derive(Debug)]
pub enum AgentStream {
    #[cfg(unix)]
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl AsyncRead for AgentStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            AgentStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
            AgentStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for AgentStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            #[cfg(unix)]
            AgentStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
            AgentStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            AgentStream::Unix(s) => Pin::new(s).poll_flush(cx),
            AgentStream::Tcp(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            AgentStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
            AgentStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
