use std::sync::Arc;

use thiserror::Error;

/// Remote error message the agent sends while a tunnel is still coming up.
const TUNNEL_UNAVAILABLE: &str = "tunnel unavailable";

#[derive(Error, Debug)]
pub enum BurrowError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Reply bytes matched none of `ok`, `ok <payload>`, `err <message>`.
    #[error("invalid agent response: {0:?}")]
    InvalidResponse(String),

    /// An `err <message>` reply; the agent's message, verbatim.
    #[error("{0}")]
    Agent(String),

    #[error("tunnel unavailable")]
    TunnelUnavailable,

    #[error("no such host")]
    NoSuchHost,

    #[error("operation cancelled")]
    Cancelled,

    #[error("read deadline exceeded")]
    DeadlineExceeded,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed to start agent: {0}")]
    DaemonStart(String),

    #[error("config error: {0}")]
    Config(String),

    /// A failure previously recorded on a resolver or pinger session.
    /// The session is unusable; every operation on it returns this same
    /// error until the session is discarded.
    #[error(transparent)]
    Session(Arc<BurrowError>),
}

impl BurrowError {
    /// Classify the message of an `err <message>` reply.
    pub(crate) fn from_remote(message: &[u8]) -> Self {
        let message = String::from_utf8_lossy(message);
        if message == TUNNEL_UNAVAILABLE {
            BurrowError::TunnelUnavailable
        } else {
            BurrowError::Agent(message.into_owned())
        }
    }

    pub(crate) fn invalid_response(data: &[u8]) -> Self {
        BurrowError::InvalidResponse(String::from_utf8_lossy(data).into_owned())
    }
}

pub type Result<T> = std::result::Result<T, BurrowError>;
