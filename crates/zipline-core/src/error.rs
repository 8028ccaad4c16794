//! Error types shared by the connection, registry, and routing layers.

use thiserror::Error;
use zipline_proto::ProtocolError;

/// A frame connection has been torn down.
///
/// Carries the human-readable reason and whether the peer (or the transport
/// on its behalf) initiated the close. Callers treat this as expected
/// termination, not a crash.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{} conn closed: {reason}", initiator(.remote))]
pub struct ConnClosed {
    /// `true` when the close was initiated by the peer or the transport
    pub remote: bool,
    /// Reason given by whoever closed the connection
    pub reason: String,
}

fn initiator(remote: &bool) -> &'static str {
    if *remote { "remote" } else { "local" }
}

impl ConnClosed {
    /// Close initiated on this side.
    pub fn local(reason: impl Into<String>) -> Self {
        Self { remote: false, reason: reason.into() }
    }

    /// Close initiated by the peer or transport.
    pub fn remote(reason: impl Into<String>) -> Self {
        Self { remote: true, reason: reason.into() }
    }
}

/// Errors from reading or writing frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// The connection is closed; every later read or write fails the same way.
    #[error(transparent)]
    Closed(#[from] ConnClosed),

    /// Peer sent bytes that do not decode to a frame.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl ConnectionError {
    /// The close cause, if this is a closed-error.
    pub fn as_closed(&self) -> Option<&ConnClosed> {
        match self {
            Self::Closed(c) => Some(c),
            Self::Protocol(_) => None,
        }
    }
}

/// Application error codes passed to the transport on close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum CloseCode {
    /// Normal close
    Closed = 0xC1,
    /// Handshake protocol violation or timeout
    Handshake = 0xC5,
    /// Evicted by a newer connection with the same name
    DuplicateName = 0xC6,
    /// Client closed on purpose
    ClientAbort = 0xC7,
    /// Handler failed to start
    StartHandler = 0xC8,
    /// Authentication or registration refused
    Rejected = 0xCC,
    /// Peer is not a known client type
    UnknownClient = 0xCD,
    /// Malformed data frame
    Data = 0xCE,
    /// Server is going away
    Goaway = 0xCF,
}

impl CloseCode {
    /// Numeric code.
    pub fn to_u64(self) -> u64 {
        self as u64
    }

    /// Parse a numeric code.
    pub fn from_u64(code: u64) -> Option<Self> {
        match code {
            0xC1 => Some(Self::Closed),
            0xC5 => Some(Self::Handshake),
            0xC6 => Some(Self::DuplicateName),
            0xC7 => Some(Self::ClientAbort),
            0xC8 => Some(Self::StartHandler),
            0xCC => Some(Self::Rejected),
            0xCD => Some(Self::UnknownClient),
            0xCE => Some(Self::Data),
            0xCF => Some(Self::Goaway),
            _ => None,
        }
    }
}

/// Errors from the connector registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The registry was closed; it accepts no further mutation.
    #[error("connector closed")]
    Closed,
}

/// Errors from router registration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    /// Workflow mode: the name is not a configured function.
    #[error("SFN[{name}] does not exist in config functions")]
    UnknownFunction {
        /// Name from the handshake
        name: String,
    },

    /// Workflow mode: another connection took over this name.
    #[error("SFN[{name}] {suffix}", suffix = DUPLICATE_NAME_SUFFIX)]
    DuplicateName {
        /// Contested function name
        name: String,
        /// Connection that lost the name
        conn_id: String,
    },
}

const DUPLICATE_NAME_SUFFIX: &str = "is already linked to another connection";

impl RouteError {
    /// Function name carried by a [`RouteError::DuplicateName`] message, as
    /// sent in the Goaway to the evicted connection.
    pub fn duplicate_name_in(message: &str) -> Option<&str> {
        message
            .strip_suffix(DUPLICATE_NAME_SUFFIX)?
            .strip_suffix("] ")?
            .strip_prefix("SFN[")
    }
}

/// Errors from credential verification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No authenticator is registered under the credential's name.
    #[error("authentication failed: authentication not found: {name}")]
    NotFound {
        /// Credential name
        name: String,
    },

    /// The authenticator refused the credential payload.
    #[error("authentication failed: client credential name is {name}")]
    Refused {
        /// Credential name
        name: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_display_names_initiator() {
        assert_eq!(ConnClosed::remote("bye").to_string(), "remote conn closed: bye");
        assert_eq!(ConnClosed::local("idle timeout").to_string(), "local conn closed: idle timeout");
    }

    #[test]
    fn close_codes_round_trip() {
        for code in [
            CloseCode::Closed,
            CloseCode::Handshake,
            CloseCode::DuplicateName,
            CloseCode::ClientAbort,
            CloseCode::StartHandler,
            CloseCode::Rejected,
            CloseCode::UnknownClient,
            CloseCode::Data,
            CloseCode::Goaway,
        ] {
            assert_eq!(CloseCode::from_u64(code.to_u64()), Some(code));
        }
        assert_eq!(CloseCode::from_u64(0x13), None);
    }

    #[test]
    fn duplicate_name_message_parses_back() {
        let err = RouteError::DuplicateName { name: "sfn-1".into(), conn_id: "old".into() };
        assert_eq!(RouteError::duplicate_name_in(&err.to_string()), Some("sfn-1"));
        assert_eq!(RouteError::duplicate_name_in("server shutdown"), None);
        let unknown = RouteError::UnknownFunction { name: "sfn-1".into() };
        assert_eq!(RouteError::duplicate_name_in(&unknown.to_string()), None);
    }
}
