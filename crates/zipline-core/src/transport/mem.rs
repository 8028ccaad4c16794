//! In-process transport built on tokio duplex pipes.
//!
//! A [`MemTransport`] is both listener and dialer: clones share one accept
//! queue, `connect` creates a pipe pair and hands the far end to whoever is
//! accepting. Both ends share a close record so a peer reading EOF can learn
//! why the connection went away.

use std::{
    io,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use tokio::{
    io::{DuplexStream, ReadHalf, WriteHalf},
    sync::{mpsc, watch},
};

use super::{Transport, TransportConnection};

const PIPE_CAPACITY: usize = 64 * 1024;

/// In-process listener and dialer.
#[derive(Clone)]
pub struct MemTransport {
    hub: Arc<Hub>,
}

struct Hub {
    tx: mpsc::UnboundedSender<MemConnection>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MemConnection>>,
    closed: watch::Sender<Option<String>>,
}

impl MemTransport {
    /// Create a new, open listener.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(None);
        Self { hub: Arc::new(Hub { tx, rx: tokio::sync::Mutex::new(rx), closed }) }
    }

    /// Reason the listener was closed, if it has been.
    pub fn close_reason(&self) -> Option<String> {
        self.hub.closed.borrow().clone()
    }

    fn closed_error(&self) -> Option<io::Error> {
        self.close_reason().map(|reason| io::Error::new(io::ErrorKind::NotConnected, reason))
    }
}

impl Default for MemTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemTransport {
    type Connection = MemConnection;

    async fn accept(&self) -> io::Result<MemConnection> {
        if let Some(err) = self.closed_error() {
            return Err(err);
        }

        let mut closed = self.hub.closed.subscribe();
        let mut rx = self.hub.rx.lock().await;
        tokio::select! {
            () = async { let _ = closed.wait_for(Option::is_some).await; } => {
                Err(self.closed_error().unwrap_or_else(|| io::ErrorKind::NotConnected.into()))
            },
            conn = rx.recv() => conn.ok_or_else(|| io::ErrorKind::NotConnected.into()),
        }
    }

    async fn connect(&self, _remote: &str) -> io::Result<MemConnection> {
        if self.close_reason().is_some() {
            return Err(io::ErrorKind::ConnectionRefused.into());
        }

        let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
        let link = Arc::new(Mutex::new(None));
        let server_side = MemConnection::new(far, Arc::clone(&link));
        self.hub.tx.send(server_side).map_err(|_| io::Error::from(io::ErrorKind::ConnectionRefused))?;

        Ok(MemConnection::new(near, link))
    }

    fn close(&self, reason: &str) {
        self.hub.closed.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(reason.to_string());
                true
            } else {
                false
            }
        });
    }
}

/// One end of an in-process connection carrying a single stream.
pub struct MemConnection {
    stream: Mutex<Option<DuplexStream>>,
    link: Arc<Mutex<Option<String>>>,
}

impl MemConnection {
    fn new(stream: DuplexStream, link: Arc<Mutex<Option<String>>>) -> Self {
        Self { stream: Mutex::new(Some(stream)), link }
    }

    fn take_stream(&self) -> Option<DuplexStream> {
        self.stream.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

#[async_trait]
impl TransportConnection for MemConnection {
    type SendStream = WriteHalf<DuplexStream>;
    type RecvStream = ReadHalf<DuplexStream>;

    async fn open_bi(&self) -> io::Result<(Self::SendStream, Self::RecvStream)> {
        let stream = self.take_stream().ok_or_else(|| io::Error::other("stream already taken"))?;
        let (recv, send) = tokio::io::split(stream);
        Ok((send, recv))
    }

    async fn accept_bi(&self) -> io::Result<Option<(Self::SendStream, Self::RecvStream)>> {
        Ok(self.take_stream().map(|stream| {
            let (recv, send) = tokio::io::split(stream);
            (send, recv)
        }))
    }

    fn close(&self, _error_code: u64, reason: &str) {
        let mut slot = self.link.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(reason.to_string());
        }
        drop(slot);
        // A stream nobody took yet is dropped here so the peer sees EOF
        drop(self.take_stream());
    }

    fn close_reason(&self) -> Option<String> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn connect_and_accept_share_a_pipe() {
        let transport = MemTransport::new();
        let client = transport.connect("mem").await.unwrap();
        let server = transport.accept().await.unwrap();

        let (mut send, _recv) = client.open_bi().await.unwrap();
        let (_send, mut recv) = server.accept_bi().await.unwrap().unwrap();

        send.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        recv.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn close_reason_is_visible_to_both_ends() {
        let transport = MemTransport::new();
        let client = transport.connect("mem").await.unwrap();
        let server = transport.accept().await.unwrap();

        server.close(0xC1, "bye");
        server.close(0xC1, "ignored");
        assert_eq!(client.close_reason().as_deref(), Some("bye"));
        assert_eq!(server.close_reason().as_deref(), Some("bye"));
    }

    #[tokio::test]
    async fn closing_listener_keeps_accepted_connections() {
        let transport = MemTransport::new();
        let client = transport.connect("mem").await.unwrap();
        let server = transport.accept().await.unwrap();

        transport.close("shutdown");
        assert!(transport.accept().await.is_err());
        assert!(transport.connect("mem").await.is_err());

        let (mut send, _recv) = client.open_bi().await.unwrap();
        let (_send, mut recv) = server.accept_bi().await.unwrap().unwrap();
        send.write_all(b"ok").await.unwrap();
        let mut buf = [0u8; 2];
        recv.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");
        assert_eq!(client.close_reason(), None);
    }

    #[tokio::test]
    async fn pending_accept_wakes_on_close() {
        let transport = MemTransport::new();
        let acceptor = transport.clone();
        let pending = tokio::spawn(async move { acceptor.accept().await.map(|_| ()) });
        tokio::task::yield_now().await;

        transport.close("shutdown");
        let result = pending.await.unwrap();
        assert_eq!(result.unwrap_err().to_string(), "shutdown");
    }
}
