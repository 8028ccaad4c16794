//! Frame channel over one transport stream.
//!
//! [`FrameConn`] turns the byte stream of a single bidirectional transport
//! stream into a frame channel with one close semantics for every failure:
//! once the connection is done, every read and write returns the same
//! [`ConnClosed`] cause, without blocking.
//!
//! # Lifecycle
//!
//! ```text
//! ┌──────┐  read/write ok   ┌──────┐
//! │ Open │─────────────────>│ Open │
//! └──────┘                  └──────┘
//!    │ close_with_error (local)  │ EOF / reset / idle timeout
//!    ↓                           ↓
//! ┌──────────────────────────────────┐
//! │ Done(cause), recorded exactly once│
//! └──────────────────────────────────┘
//! ```
//!
//! The cause lives in a [`ConnContext`]. Suspended reads and writes race the
//! context, so tearing the connection down wakes them immediately.

use std::{io, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::{Mutex, watch},
};
use zipline_proto::{
    Frame, MAX_FRAME_SIZE, ProtocolError,
    packet::{MAX_LENGTH_GROUPS, decode_length},
};

use crate::{
    error::{CloseCode, ConnClosed, ConnectionError},
    transport::TransportConnection,
};

/// Reason recorded when the peer closes without telling us why.
pub const PEER_CLOSED: &str = "connection closed by peer";

/// Reason recorded when no frame arrives within the idle timeout.
pub const IDLE_TIMEOUT: &str = "idle timeout";

/// Frame connection configuration.
#[derive(Debug, Clone, Default)]
pub struct FrameConnConfig {
    /// Close the connection if no frame arrives for this long
    pub idle_timeout: Option<Duration>,
}

/// Cancellation handle for one connection.
///
/// Cloning is cheap; every clone observes the same cause. The cause is set at
/// most once.
#[derive(Debug, Clone)]
pub struct ConnContext {
    cause: Arc<watch::Sender<Option<ConnClosed>>>,
}

impl ConnContext {
    /// A context that is not done yet.
    pub fn new() -> Self {
        let (cause, _) = watch::channel(None);
        Self { cause: Arc::new(cause) }
    }

    /// Close cause, if the connection is done.
    pub fn cause(&self) -> Option<ConnClosed> {
        self.cause.borrow().clone()
    }

    /// Whether the connection is done.
    pub fn is_done(&self) -> bool {
        self.cause.borrow().is_some()
    }

    /// Wait until the connection is done and return the cause.
    pub async fn done(&self) -> ConnClosed {
        let mut rx = self.cause.subscribe();
        loop {
            if let Some(cause) = rx.borrow_and_update().clone() {
                return cause;
            }
            if rx.changed().await.is_err() {
                return ConnClosed::local("context dropped");
            }
        }
    }

    /// Record `cause` if none is recorded yet. Returns `true` if it was.
    pub(crate) fn cancel(&self, cause: ConnClosed) -> bool {
        self.cause.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(cause);
                true
            } else {
                false
            }
        })
    }
}

impl Default for ConnContext {
    fn default() -> Self {
        Self::new()
    }
}

type Slot<T> = Arc<Mutex<Option<T>>>;

/// Why a raw read stopped.
enum ReadFailure {
    Io(io::Error),
    /// Length prefix unreadable; the stream is out of sync
    Protocol(ProtocolError),
    Gone,
}

impl From<io::Error> for ReadFailure {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<ProtocolError> for ReadFailure {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

/// A frame channel over one bidirectional stream of `C`.
///
/// Reads are serialized among readers and writes among writers, so
/// concurrent writers never interleave partial frames.
pub struct FrameConn<C: TransportConnection> {
    conn: C,
    send: Slot<C::SendStream>,
    recv: Slot<C::RecvStream>,
    ctx: ConnContext,
    config: FrameConnConfig,
}

impl<C: TransportConnection> FrameConn<C> {
    /// Wrap an already opened or accepted stream of `conn`.
    pub fn new(
        conn: C,
        send: C::SendStream,
        recv: C::RecvStream,
        config: FrameConnConfig,
    ) -> Self {
        Self {
            conn,
            send: Arc::new(Mutex::new(Some(send))),
            recv: Arc::new(Mutex::new(Some(recv))),
            ctx: ConnContext::new(),
            config,
        }
    }

    /// Open the frame stream on a dialed connection.
    pub async fn open(conn: C, config: FrameConnConfig) -> Result<Self, ConnectionError> {
        match conn.open_bi().await {
            Ok((send, recv)) => Ok(Self::new(conn, send, recv, config)),
            Err(e) => Err(stream_failure(&conn, e.to_string()).into()),
        }
    }

    /// Accept the frame stream on an accepted connection.
    pub async fn accept(conn: C, config: FrameConnConfig) -> Result<Self, ConnectionError> {
        match conn.accept_bi().await {
            Ok(Some((send, recv))) => Ok(Self::new(conn, send, recv, config)),
            Ok(None) => Err(stream_failure(&conn, PEER_CLOSED.to_string()).into()),
            Err(e) => Err(stream_failure(&conn, e.to_string()).into()),
        }
    }

    /// Lifecycle context of this connection.
    pub fn context(&self) -> &ConnContext {
        &self.ctx
    }

    /// Underlying transport connection.
    pub fn transport(&self) -> &C {
        &self.conn
    }

    /// Block until a whole frame arrives.
    ///
    /// Transport failures, EOF, and idle timeouts all surface as
    /// [`ConnectionError::Closed`]. A frame body that fails to decode is
    /// [`ConnectionError::Protocol`] and leaves the connection open. A bad
    /// length prefix loses frame boundaries, so it closes the connection
    /// with [`CloseCode::Data`].
    pub async fn read_frame(&self) -> Result<Frame, ConnectionError> {
        if let Some(cause) = self.ctx.cause() {
            return Err(cause.into());
        }

        let read = async {
            let mut guard = self.recv.lock().await;
            let Some(recv) = guard.as_mut() else {
                return Err(ReadFailure::Gone);
            };
            read_raw(recv).await
        };

        let outcome = tokio::select! {
            biased;
            cause = self.ctx.done() => return Err(cause.into()),
            outcome = with_timeout(self.config.idle_timeout, read) => outcome,
        };

        match outcome {
            Some(Ok((lead, body))) => Ok(Frame::decode_node(lead, &body)?),
            Some(Err(ReadFailure::Protocol(e))) => {
                tracing::warn!(error = %e, "unreadable length prefix");
                self.shutdown(ConnClosed::local(e.to_string()), CloseCode::Data);
                Err(self.current_cause().into())
            },
            Some(Err(ReadFailure::Io(e))) => Err(self.closed_by_transport(&e).into()),
            Some(Err(ReadFailure::Gone)) => Err(self.current_cause().into()),
            None => {
                self.shutdown(ConnClosed::local(IDLE_TIMEOUT), CloseCode::Closed);
                Err(self.current_cause().into())
            },
        }
    }

    /// Encode and write one frame.
    ///
    /// Writers are serialized; a frame is either written whole or the
    /// connection is torn down.
    pub async fn write_frame(&self, frame: &Frame) -> Result<(), ConnectionError> {
        if let Some(cause) = self.ctx.cause() {
            return Err(cause.into());
        }

        let mut buf = Vec::new();
        frame.encode(&mut buf)?;

        let write = async {
            let mut guard = self.send.lock().await;
            let Some(send) = guard.as_mut() else {
                return Err(None);
            };
            send.write_all(&buf).await.map_err(Some)?;
            send.flush().await.map_err(Some)
        };

        tokio::select! {
            biased;
            cause = self.ctx.done() => Err(cause.into()),
            result = write => match result {
                Ok(()) => Ok(()),
                Err(Some(e)) => Err(self.closed_by_transport(&e).into()),
                Err(None) => Err(self.current_cause().into()),
            },
        }
    }

    /// Close with [`CloseCode::Closed`] and `reason`.
    ///
    /// Idempotent: only the first call records its reason and returns `true`.
    pub fn close_with_error(&self, reason: &str) -> bool {
        self.close_with_code(CloseCode::Closed, reason)
    }

    /// Close with an explicit application error code.
    pub fn close_with_code(&self, code: CloseCode, reason: &str) -> bool {
        self.shutdown(ConnClosed::local(reason), code)
    }

    fn shutdown(&self, cause: ConnClosed, code: CloseCode) -> bool {
        let reason = cause.reason.clone();
        let remote = cause.remote;
        if !self.ctx.cancel(cause) {
            return false;
        }

        tracing::debug!(remote, reason = %reason, code = code.to_u64(), "frame connection closed");
        self.conn.close(code.to_u64(), &reason);

        // Release both halves so byte-stream transports deliver EOF to the peer
        let send = Arc::clone(&self.send);
        let recv = Arc::clone(&self.recv);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Some(mut stream) = send.lock().await.take() {
                    let _ = stream.shutdown().await;
                }
                drop(recv.lock().await.take());
            });
        }
        true
    }

    fn closed_by_transport(&self, err: &io::Error) -> ConnClosed {
        if let Some(cause) = self.ctx.cause() {
            return cause;
        }
        let reason = self.conn.close_reason().unwrap_or_else(|| match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted => PEER_CLOSED.to_string(),
            _ => err.to_string(),
        });
        self.shutdown(ConnClosed::remote(reason), CloseCode::Closed);
        self.current_cause()
    }

    fn current_cause(&self) -> ConnClosed {
        self.ctx.cause().unwrap_or_else(|| ConnClosed::local(PEER_CLOSED))
    }
}

fn stream_failure<C: TransportConnection>(conn: &C, fallback: String) -> ConnClosed {
    ConnClosed::remote(conn.close_reason().unwrap_or(fallback))
}

async fn with_timeout<F: std::future::Future>(limit: Option<Duration>, fut: F) -> Option<F::Output> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}

/// Read one node packet: lead byte, length prefix, body.
async fn read_raw<R>(recv: &mut R) -> Result<(u8, Vec<u8>), ReadFailure>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let lead = recv.read_u8().await?;

    let mut prefix = [0u8; MAX_LENGTH_GROUPS];
    let mut used = 0;
    loop {
        if used == MAX_LENGTH_GROUPS {
            return Err(ProtocolError::MalformedLength.into());
        }
        let byte = recv.read_u8().await?;
        prefix[used] = byte;
        used += 1;
        if byte & 0x80 == 0 {
            break;
        }
    }

    let (len, _) = decode_length(&prefix[..used])?;
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge { size: len, max: MAX_FRAME_SIZE }.into());
    }

    let mut body = vec![0u8; len];
    recv.read_exact(&mut body).await?;
    Ok((lead, body))
}

#[cfg(test)]
mod tests {
    use zipline_proto::{DataFrame, GoawayFrame};

    use super::*;
    use crate::transport::{MemConnection, MemTransport, Transport};

    async fn pair(config: FrameConnConfig) -> (FrameConn<MemConnection>, FrameConn<MemConnection>) {
        let transport = MemTransport::new();
        let client = transport.connect("mem").await.unwrap();
        let server = transport.accept().await.unwrap();
        let client = FrameConn::open(client, config.clone()).await.unwrap();
        let server = FrameConn::accept(server, config).await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn frames_arrive_in_order() {
        let (client, server) = pair(FrameConnConfig::default()).await;
        for tag in 1..=3 {
            client.write_frame(&Frame::Data(DataFrame::new(tag, vec![tag as u8]))).await.unwrap();
        }
        for tag in 1..=3 {
            let Frame::Data(data) = server.read_frame().await.unwrap() else {
                unreachable!("only data frames were written")
            };
            assert_eq!(data.tag(), tag);
        }
    }

    #[tokio::test]
    async fn close_is_idempotent_and_keeps_first_cause() {
        let (client, _server) = pair(FrameConnConfig::default()).await;
        assert!(client.close_with_error("first"));
        assert!(!client.close_with_error("second"));
        assert_eq!(client.context().cause(), Some(ConnClosed::local("first")));
    }

    #[tokio::test]
    async fn io_after_close_fails_immediately() {
        let (client, _server) = pair(FrameConnConfig::default()).await;
        client.close_with_error("done");

        let expected = ConnectionError::Closed(ConnClosed::local("done"));
        assert_eq!(client.read_frame().await, Err(expected.clone()));
        assert_eq!(client.write_frame(&Frame::HandshakeAck).await, Err(expected));
    }

    #[tokio::test]
    async fn suspended_read_wakes_on_local_close() {
        let (client, _server) = pair(FrameConnConfig::default()).await;
        let client = Arc::new(client);
        let reader = Arc::clone(&client);
        let pending = tokio::spawn(async move { reader.read_frame().await });
        tokio::task::yield_now().await;

        client.close_with_error("shutting down");
        let result = pending.await.unwrap();
        assert_eq!(result, Err(ConnectionError::Closed(ConnClosed::local("shutting down"))));
    }

    #[tokio::test]
    async fn peer_sees_remote_close_with_reason() {
        let (client, server) = pair(FrameConnConfig::default()).await;
        server.close_with_code(CloseCode::DuplicateName, "duplicate name");

        let err = client.read_frame().await.unwrap_err();
        assert_eq!(err, ConnectionError::Closed(ConnClosed::remote("duplicate name")));
        assert!(client.context().is_done());
    }

    #[tokio::test]
    async fn frames_written_before_close_are_still_read() {
        let (client, server) = pair(FrameConnConfig::default()).await;
        let goaway = Frame::Goaway(GoawayFrame { message: "bye".into() });
        server.write_frame(&goaway).await.unwrap();
        server.close_with_error("bye");

        assert_eq!(client.read_frame().await.unwrap(), goaway);
        assert!(client.read_frame().await.unwrap_err().as_closed().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_is_a_local_close() {
        let config = FrameConnConfig { idle_timeout: Some(Duration::from_secs(5)) };
        let (_client, server) = pair(config).await;

        let err = server.read_frame().await.unwrap_err();
        assert_eq!(err, ConnectionError::Closed(ConnClosed::local(IDLE_TIMEOUT)));
    }

    #[tokio::test]
    async fn garbage_body_is_a_protocol_error() {
        let transport = MemTransport::new();
        let client = transport.connect("mem").await.unwrap();
        let server = transport.accept().await.unwrap();
        let (mut raw_send, _raw_recv) = client.open_bi().await.unwrap();
        let server = FrameConn::accept(server, FrameConnConfig::default()).await.unwrap();

        // Unknown frame type 0x20, then a valid HandshakeAck
        raw_send.write_all(&[0xA0, 0x00, 0xA9, 0x00]).await.unwrap();

        assert_eq!(
            server.read_frame().await,
            Err(ConnectionError::Protocol(ProtocolError::UnknownFrameType(0x20)))
        );
        assert_eq!(server.read_frame().await.unwrap(), Frame::HandshakeAck);
    }

    #[tokio::test]
    async fn oversized_length_prefix_closes_the_stream() {
        let transport = MemTransport::new();
        let client = transport.connect("mem").await.unwrap();
        let server = transport.accept().await.unwrap();
        let (mut raw_send, _raw_recv) = client.open_bi().await.unwrap();
        let server = FrameConn::accept(server, FrameConnConfig::default()).await.unwrap();

        // A data lead byte claiming one byte too many, then what would parse
        // as a whole Rejected frame if the reader skipped the bad prefix
        let mut bytes = vec![0xBF];
        zipline_proto::packet::encode_varint(i64::try_from(MAX_FRAME_SIZE + 1).unwrap(), &mut bytes);
        Frame::Rejected(zipline_proto::RejectedFrame { message: "x".into() }).encode(&mut bytes).unwrap();
        raw_send.write_all(&bytes).await.unwrap();

        let reason = ProtocolError::FrameTooLarge { size: MAX_FRAME_SIZE + 1, max: MAX_FRAME_SIZE }.to_string();
        let expected = ConnectionError::Closed(ConnClosed::local(reason));
        assert_eq!(server.read_frame().await, Err(expected.clone()));
        assert!(server.context().is_done());
        assert_eq!(server.read_frame().await, Err(expected));
    }
}
