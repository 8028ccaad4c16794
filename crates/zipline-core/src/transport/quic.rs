//! QUIC transport backed by Quinn.
//!
//! The server endpoint presents a certificate chain; the client endpoint
//! trusts an explicit set of roots (usually the server's self-signed
//! certificate in development).
//!
//! Closing the listener only refuses new connections. Accepted connections
//! keep running until closed individually; [`QuicTransport::drain`] then
//! waits for them to finish before releasing the endpoint.

use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use quinn::{ConnectionError, Endpoint, VarInt};
use tokio::sync::watch;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use super::{Transport, TransportConnection};

/// QUIC endpoint acting as listener, dialer, or both.
pub struct QuicTransport {
    endpoint: Endpoint,
    server_name: String,
    closed: watch::Sender<Option<String>>,
}

impl QuicTransport {
    /// Bind a server endpoint on `addr` presenting `certs`.
    ///
    /// `idle_timeout` bounds how long a silent connection stays open at the
    /// transport layer.
    pub fn server(
        addr: SocketAddr,
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        idle_timeout: Option<Duration>,
    ) -> io::Result<Self> {
        let mut config = quinn::ServerConfig::with_single_cert(certs, key)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let mut transport = quinn::TransportConfig::default();
        if let Some(timeout) = idle_timeout {
            let timeout = quinn::IdleTimeout::try_from(timeout)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            transport.max_idle_timeout(Some(timeout));
        }
        config.transport_config(Arc::new(transport));

        let endpoint = Endpoint::server(config, addr)?;
        Ok(Self::with_endpoint(endpoint, String::new()))
    }

    /// Create a client endpoint trusting `roots`, verifying the server
    /// certificate against `server_name`.
    pub fn client(roots: Vec<CertificateDer<'static>>, server_name: &str) -> io::Result<Self> {
        let mut store = rustls::RootCertStore::empty();
        for cert in roots {
            store.add(cert).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        }
        let config = quinn::ClientConfig::with_root_certificates(Arc::new(store))
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let mut endpoint = Endpoint::client(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))?;
        endpoint.set_default_client_config(config);
        Ok(Self::with_endpoint(endpoint, server_name.to_string()))
    }

    fn with_endpoint(endpoint: Endpoint, server_name: String) -> Self {
        let (closed, _) = watch::channel(None);
        Self { endpoint, server_name, closed }
    }

    /// Address the endpoint is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.endpoint.local_addr()
    }

    /// Wait up to `limit` for every connection to finish, then close the
    /// endpoint.
    pub async fn drain(&self, limit: Duration) {
        if tokio::time::timeout(limit, self.endpoint.wait_idle()).await.is_err() {
            tracing::warn!(connections = self.endpoint.open_connections(), "endpoint drain timed out");
        }
        let reason = self.closed.borrow().clone().unwrap_or_default();
        self.endpoint.close(VarInt::from_u32(0), reason.as_bytes());
    }

    fn closed_error(&self) -> Option<io::Error> {
        self.closed.borrow().clone().map(|reason| io::Error::new(io::ErrorKind::NotConnected, reason))
    }
}

#[async_trait]
impl Transport for QuicTransport {
    type Connection = QuicConnection;

    async fn accept(&self) -> io::Result<QuicConnection> {
        if let Some(err) = self.closed_error() {
            return Err(err);
        }

        let mut closed = self.closed.subscribe();
        let incoming = tokio::select! {
            () = async { let _ = closed.wait_for(Option::is_some).await; } => {
                return Err(self.closed_error().unwrap_or_else(|| io::ErrorKind::NotConnected.into()));
            },
            incoming = self.endpoint.accept() => incoming
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "endpoint closed"))?,
        };
        let conn = incoming.await.map_err(io::Error::other)?;
        Ok(QuicConnection { conn })
    }

    async fn connect(&self, remote: &str) -> io::Result<QuicConnection> {
        let addr: SocketAddr =
            remote.parse().map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let connecting = self.endpoint.connect(addr, &self.server_name).map_err(io::Error::other)?;
        let conn = connecting.await.map_err(io::Error::other)?;
        Ok(QuicConnection { conn })
    }

    fn close(&self, reason: &str) {
        self.endpoint.set_server_config(None);
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

/// An established QUIC connection.
pub struct QuicConnection {
    conn: quinn::Connection,
}

#[async_trait]
impl TransportConnection for QuicConnection {
    type SendStream = quinn::SendStream;
    type RecvStream = quinn::RecvStream;

    async fn open_bi(&self) -> io::Result<(Self::SendStream, Self::RecvStream)> {
        self.conn.open_bi().await.map_err(io::Error::other)
    }

    async fn accept_bi(&self) -> io::Result<Option<(Self::SendStream, Self::RecvStream)>> {
        match self.conn.accept_bi().await {
            Ok(streams) => Ok(Some(streams)),
            Err(ConnectionError::ApplicationClosed(_) | ConnectionError::LocallyClosed) => Ok(None),
            Err(e) => Err(io::Error::other(e)),
        }
    }

    fn close(&self, error_code: u64, reason: &str) {
        let code = VarInt::from_u64(error_code).unwrap_or(VarInt::MAX);
        self.conn.close(code, reason.as_bytes());
    }

    fn close_reason(&self) -> Option<String> {
        self.conn.close_reason().map(|err| match err {
            ConnectionError::ApplicationClosed(close) => {
                String::from_utf8_lossy(&close.reason).into_owned()
            },
            ConnectionError::TimedOut => "idle timeout".to_string(),
            other => other.to_string(),
        })
    }
}
