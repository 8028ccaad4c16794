//! Turmoil TCP transport.
//!
//! Each simulated TCP connection carries exactly one stream, which is all a
//! zipline peer needs. TCP cannot carry a close reason, so peers observe
//! closes as end of stream.

use std::{
    io,
    sync::{Mutex, PoisonError},
};

use async_trait::async_trait;
use tokio::{
    io::{ReadHalf, WriteHalf},
    sync::watch,
};
use turmoil::net::{TcpListener, TcpStream};
use zipline_core::transport::{Transport, TransportConnection};

/// Simulated listener and dialer.
pub struct SimTransport {
    listener: Option<TcpListener>,
    closed: watch::Sender<Option<String>>,
}

impl SimTransport {
    /// Listen on `addr` (for example `"0.0.0.0:9000"`) inside the current
    /// turmoil host.
    pub async fn bind(addr: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener: Some(listener), closed: watch::channel(None).0 })
    }

    /// Transport that can only dial out.
    pub fn dialer() -> Self {
        Self { listener: None, closed: watch::channel(None).0 }
    }
}

#[async_trait]
impl Transport for SimTransport {
    type Connection = SimConnection;

    async fn accept(&self) -> io::Result<SimConnection> {
        let Some(listener) = &self.listener else {
            return Err(io::Error::new(io::ErrorKind::Unsupported, "dial-only transport"));
        };

        let mut closed = self.closed.subscribe();
        if let Some(reason) = closed.borrow().clone() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, reason));
        }
        tokio::select! {
            () = async { let _ = closed.wait_for(Option::is_some).await; } => {
                Err(io::Error::new(io::ErrorKind::NotConnected, "listener closed"))
            },
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                tracing::trace!(%peer, "accepted simulated connection");
                Ok(SimConnection::new(stream))
            },
        }
    }

    async fn connect(&self, remote: &str) -> io::Result<SimConnection> {
        let stream = TcpStream::connect(remote).await?;
        Ok(SimConnection::new(stream))
    }

    fn close(&self, reason: &str) {
        self.closed.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(reason.to_string());
                true
            } else {
                false
            }
        });
    }
}

/// One simulated TCP connection.
pub struct SimConnection {
    stream: Mutex<Option<TcpStream>>,
}

impl SimConnection {
    fn new(stream: TcpStream) -> Self {
        Self { stream: Mutex::new(Some(stream)) }
    }

    fn split(&self) -> Option<(WriteHalf<TcpStream>, ReadHalf<TcpStream>)> {
        let stream = self.stream.lock().unwrap_or_else(PoisonError::into_inner).take()?;
        let (recv, send) = tokio::io::split(stream);
        Some((send, recv))
    }
}

#[async_trait]
impl TransportConnection for SimConnection {
    type SendStream = WriteHalf<TcpStream>;
    type RecvStream = ReadHalf<TcpStream>;

    async fn open_bi(&self) -> io::Result<(Self::SendStream, Self::RecvStream)> {
        self.split().ok_or_else(|| io::Error::other("stream already taken"))
    }

    async fn accept_bi(&self) -> io::Result<Option<(Self::SendStream, Self::RecvStream)>> {
        Ok(self.split())
    }

    fn close(&self, _error_code: u64, _reason: &str) {
        // Dropping an unclaimed stream closes the socket; claimed halves are
        // shut down by the frame connection.
        drop(self.stream.lock().unwrap_or_else(PoisonError::into_inner).take());
    }

    fn close_reason(&self) -> Option<String> {
        None
    }
}
