//! Client error types.

use std::io;

use thiserror::Error;
use zipline_core::{ConnClosed, ConnectionError, RouteError};

/// Errors surfaced by [`crate::Client`].
#[derive(Debug, Error)]
pub enum ClientError {
    /// The client is not connected; writes fail fast instead of waiting.
    #[error("not connected")]
    NotConnected,

    /// [`crate::Client::close`] was called.
    #[error("client closed")]
    Closed,

    /// The server did not answer the handshake in time.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// The server refused the handshake.
    #[error("handshake rejected: {0}")]
    Rejected(String),

    /// The server refused the credential.
    #[error("{0}")]
    AuthenticationFailed(String),

    /// The server asked the client to go away.
    #[error("goaway: {0}")]
    Goaway(String),

    /// A newer connection registered the same function name and took over.
    #[error("SFN[{0}] is already linked to another connection")]
    DuplicateName(String),

    /// The frame connection failed or closed.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Dialing the transport failed.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

impl ClientError {
    /// Whether reconnecting may succeed.
    ///
    /// Refusals by the server are final; timeouts and transport failures are
    /// not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::HandshakeTimeout | Self::Connection(_) | Self::Io(_) => true,
            Self::NotConnected
            | Self::Closed
            | Self::Rejected(_)
            | Self::AuthenticationFailed(_)
            | Self::Goaway(_)
            | Self::DuplicateName(_) => false,
        }
    }

    /// Classify a Goaway message; duplicate-name evictions get their own
    /// variant.
    pub fn from_goaway(message: String) -> Self {
        match RouteError::duplicate_name_in(&message) {
            Some(name) => Self::DuplicateName(name.to_string()),
            None => Self::Goaway(message),
        }
    }
}

impl From<ConnClosed> for ClientError {
    fn from(closed: ConnClosed) -> Self {
        Self::Connection(ConnectionError::Closed(closed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification() {
        assert!(ClientError::HandshakeTimeout.is_retryable());
        assert!(ClientError::from(ConnClosed::remote("reset")).is_retryable());
        assert!(ClientError::Io(io::ErrorKind::ConnectionRefused.into()).is_retryable());

        assert!(!ClientError::Rejected("no".into()).is_retryable());
        assert!(!ClientError::AuthenticationFailed("bad token".into()).is_retryable());
        assert!(!ClientError::Goaway("bye".into()).is_retryable());
        assert!(!ClientError::Closed.is_retryable());
        assert!(!ClientError::DuplicateName("sfn-1".into()).is_retryable());
    }

    #[test]
    fn goaway_classification() {
        let evicted = ClientError::from_goaway("SFN[sfn-1] is already linked to another connection".into());
        assert!(matches!(&evicted, ClientError::DuplicateName(name) if name == "sfn-1"));
        assert_eq!(evicted.to_string(), "SFN[sfn-1] is already linked to another connection");

        let shutdown = ClientError::from_goaway("server shutdown".into());
        assert!(matches!(shutdown, ClientError::Goaway(msg) if msg == "server shutdown"));
    }

    #[test]
    fn closed_connection_display() {
        let err = ClientError::from(ConnClosed::remote("idle timeout"));
        assert_eq!(err.to_string(), "remote conn closed: idle timeout");
    }
}
