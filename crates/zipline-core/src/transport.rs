//! Transport abstraction for connection-oriented protocols.
//!
//! Abstracts over transports that support multiplexed streams (like QUIC).
//! Production uses Quinn (real QUIC), tests use an in-process pipe pair or
//! Turmoil (simulated TCP).

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

pub mod mem;
#[cfg(feature = "quic")]
pub mod quic;

pub use mem::{MemConnection, MemTransport};
#[cfg(feature = "quic")]
pub use quic::{QuicConnection, QuicTransport};

/// Abstract transport for connection-oriented protocols with multiplexed
/// streams.
///
/// This trait models QUIC's architecture:
/// - One Connection can have many Streams
/// - Connections are long-lived and have connection-level operations
/// - Streams are cheap, multiplexed, and have stream-level operations
///
/// A zipline peer uses exactly one bidirectional stream per connection as its
/// frame channel.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Type representing a connection to a peer.
    type Connection: TransportConnection;

    /// Accept an incoming connection.
    ///
    /// Blocks until a connection is established and returns a Connection
    /// handle. Fails with [`io::ErrorKind::NotConnected`] once the listener
    /// is closed; any other error concerns a single incoming connection and
    /// the listener stays usable.
    async fn accept(&self) -> io::Result<Self::Connection>;

    /// Connect to a remote endpoint.
    ///
    /// Initiates a connection to `remote` (an address string such as
    /// `"127.0.0.1:9000"`), waits for the transport handshake to complete, and
    /// returns a Connection handle.
    async fn connect(&self, remote: &str) -> io::Result<Self::Connection>;

    /// Stop accepting connections.
    ///
    /// Connections already accepted are not affected.
    fn close(&self, reason: &str);
}

/// A connection to a remote peer, supporting multiplexed streams.
///
/// Represents a QUIC connection or its simulation equivalent. Multiple streams
/// can be opened/accepted concurrently over a single connection.
#[async_trait]
pub trait TransportConnection: Send + Sync + 'static {
    /// Type of stream for sending data.
    type SendStream: AsyncWrite + Unpin + Send + 'static;

    /// Type of stream for receiving data.
    type RecvStream: AsyncRead + Unpin + Send + 'static;

    /// Open a new bidirectional stream.
    ///
    /// Creates a new stream over this connection and returns send and receive
    /// halves. Stream creation is lightweight (multiplexing).
    async fn open_bi(&self) -> io::Result<(Self::SendStream, Self::RecvStream)>;

    /// Accept an incoming bidirectional stream.
    ///
    /// Blocks until peer opens a stream and returns send and receive halves.
    /// Returns `Ok(None)` if connection is gracefully closed.
    async fn accept_bi(&self) -> io::Result<Option<(Self::SendStream, Self::RecvStream)>>;

    /// Close the connection immediately with an error code.
    ///
    /// Terminates all streams on this connection, sends close frame to peer
    /// with error code, and returns immediately (non-blocking).
    fn close(&self, error_code: u64, reason: &str);

    /// Reason the connection was closed, by either side, if it has been.
    ///
    /// Transports that cannot carry a reason return `None`.
    fn close_reason(&self) -> Option<String>;
}
