//! Wire framing and reply classification for the agent protocol.
//!
//! ## Frame format
//!
//! Every message on the handshake sub-protocol is framed the same way:
//! - 4 bytes: payload length (big-endian u32)
//! - N bytes: payload
//!
//! A request payload is an ASCII verb and zero or more space-separated
//! arguments, with no quoting. A reply payload is `ok`, `ok ` followed by
//! arbitrary bytes, or `err ` followed by a UTF-8 message.
//!
//! The codec enforces no maximum length; each caller bounds use by
//! message type. Zero-length payloads are legal.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Write a length-delimited frame to an async writer.
///
/// The length prefix and payload go out in a single buffered write so a
/// peer never observes a bare prefix.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> io::Result<()> {
    let mut buf = Vec::with_capacity(4 + data.len());
    buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
    buf.extend_from_slice(data);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a length-delimited frame from an async reader.
///
/// # Errors
///
/// Returns an error if the stream ends before the declared length is
/// satisfied, or if reading fails.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Vec<u8>> {
    let len = read_frame_len(reader).await?;
    read_frame_body(reader, len).await
}

/// Read just the 4-byte length prefix of a frame.
///
/// Split out from [`read_frame`] so sessions can bound the wait for the
/// prefix without truncating a slow payload.
pub async fn read_frame_len<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<usize> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    Ok(u32::from_be_bytes(len_buf) as usize)
}

/// Read the payload of a frame whose length prefix was already consumed.
pub async fn read_frame_body<R: AsyncRead + Unpin>(
    reader: &mut R,
    len: usize,
) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Join a verb and its arguments with single spaces and write them as
/// one frame.
///
/// Arguments must already be space-free; the client validates them
/// before they reach the codec.
pub async fn write_command<W: AsyncWrite + Unpin>(
    writer: &mut W,
    verb: &str,
    args: &[&str],
) -> io::Result<()> {
    let mut payload = String::from(verb);
    for arg in args {
        payload.push(' ');
        payload.push_str(arg);
    }
    write_frame(writer, payload.as_bytes()).await
}

const OK: &[u8] = b"ok";
const OK_PREFIX: &[u8] = b"ok ";
const ERR_PREFIX: &[u8] = b"err ";

/// Classification of a reply payload.
///
/// Every byte string falls into exactly one variant. The prefix match is
/// exact and case-sensitive; a bare `ok` is [`Reply::Ok`], never an
/// OK-with-empty-payload.
#[derive(Debug, PartialEq, Eq)]
pub enum Reply<'a> {
    /// Exactly `ok`.
    Ok,
    /// `ok ` followed by a payload.
    OkPayload(&'a [u8]),
    /// `err ` followed by a message.
    Err(&'a [u8]),
    /// Anything else.
    Invalid,
}

impl<'a> Reply<'a> {
    pub fn classify(data: &'a [u8]) -> Self {
        if data == OK {
            Reply::Ok
        } else if let Some(rest) = data.strip_prefix(OK_PREFIX) {
            Reply::OkPayload(rest)
        } else if let Some(rest) = data.strip_prefix(ERR_PREFIX) {
            Reply::Err(rest)
        } else {
            Reply::Invalid
        }
    }
}
