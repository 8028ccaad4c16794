//! Zipper control plane.
//!
//! # Connection lifecycle
//!
//! ```text
//! ┌──────────┐ stream  ┌────────────────┐ credential ok  ┌────────────┐
//! │ Accepted │───────> │ Authenticating │──────────────> │ Registered │
//! └──────────┘         └────────────────┘                └────────────┘
//!                              │ refused / timeout /            │ ack
//!                              │ wrong first frame              ↓
//!                              ↓                           ┌─────────┐
//!                        ┌──────────┐                      │ Serving │
//!                        │ Rejected │                      └─────────┘
//!                        └──────────┘                           │ read error
//!                              │                                ↓
//!                              └──────────────────────────> ┌────────┐
//!                                                           │ Closed │
//!                                                           └────────┘
//! ```
//!
//! Every accepted connection runs on its own task. The only state shared
//! between tasks is the [`Connector`] and the [`Router`]; a failure on one
//! connection never stalls another.

use std::{
    io,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use tokio::sync::watch;
use zipline_core::{
    AuthError, CloseCode, Connection, ConnectionError, ConnectionInfo, Connector, Environment,
    FrameConn, FrameConnConfig, Peer, Registration, RouteError, Router,
    auth::{DefaultMetadataBuilder, MetadataBuilder},
    router::select_targets,
    transport::Transport,
};
use zipline_proto::{
    AuthenticationAckFrame, BackflowFrame, ConnectToFrame, DataFrame, Frame, FrameType,
    GoawayFrame, HandshakeFrame, HandshakeRejectedFrame, Metadata, ProtocolError, RejectedFrame,
    StreamType,
};

use crate::{config::ServerConfig, downstream::Downstream, error::ServerError};

/// How long shutdown waits for clients to hang up after a Goaway.
const GOAWAY_GRACE: Duration = Duration::from_secs(1);

type Conn<T> = Connection<<T as Transport>::Connection>;
type Frames<T> = FrameConn<<T as Transport>::Connection>;

/// Why an accepted connection was never registered.
#[derive(Debug)]
enum Refusal {
    /// No handshake within the timeout
    Timeout,
    /// The connection ended mid-handshake
    Gone(ConnectionError),
    /// First frame was not the one the handshake requires
    Unexpected(FrameType),
    /// Credential refused
    Auth { error: AuthError, separate: bool },
    /// Handshake metadata did not decode
    Metadata { id: String, error: ProtocolError },
    /// Answered with a redirect
    Redirected,
}

/// Accepted handshake plus what authentication produced.
struct Admitted {
    handshake: HandshakeFrame,
    auth: Metadata,
}

/// A zipper: accepts connections on `T`, registers them, and dispatches data.
pub struct Server<T: Transport, E: Environment> {
    transport: T,
    env: E,
    config: ServerConfig,
    connector: Connector<Conn<T>>,
    router: Router,
    metadata: Box<dyn MetadataBuilder>,
    downstreams: RwLock<Vec<Arc<dyn Downstream>>>,
    shutdown: watch::Sender<bool>,
}

impl<T: Transport, E: Environment> Server<T, E> {
    /// Zipper listening on `transport`.
    pub fn new(transport: T, env: E, config: ServerConfig) -> Self {
        let router = Router::new(config.router_mode());
        let (shutdown, _) = watch::channel(false);
        Self {
            transport,
            env,
            config,
            connector: Connector::new(),
            router,
            metadata: Box::new(DefaultMetadataBuilder),
            downstreams: RwLock::new(Vec::new()),
            shutdown,
        }
    }

    /// Replace the connection metadata builder.
    #[must_use]
    pub fn with_metadata_builder(mut self, builder: impl MetadataBuilder) -> Self {
        self.metadata = Box::new(builder);
        self
    }

    /// Mirror every data frame to `downstream`.
    pub fn add_downstream(&self, downstream: Arc<dyn Downstream>) {
        tracing::info!(zipper = %self.config.name, downstream = downstream.name(), "downstream added");
        self.downstreams.write().unwrap_or_else(PoisonError::into_inner).push(downstream);
    }

    /// Configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Listening transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Registry of live connections.
    pub fn connector(&self) -> &Connector<Conn<T>> {
        &self.connector
    }

    /// Tag router.
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Accept connections until [`Server::shutdown`].
    pub async fn serve(self: Arc<Self>) -> Result<(), ServerError> {
        let mut stop = self.shutdown.subscribe();
        tracing::info!(zipper = %self.config.name, "serving");

        loop {
            let accepted = tokio::select! {
                biased;
                () = async { let _ = stop.wait_for(|stopped| *stopped).await; } => break,
                accepted = self.transport.accept() => accepted,
            };

            match accepted {
                Ok(conn) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move { server.handle(conn).await });
                },
                Err(_) if *self.shutdown.borrow() => break,
                Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                    tracing::info!(zipper = %self.config.name, reason = %e, "listener closed");
                    break;
                },
                Err(e) if e.kind() == io::ErrorKind::Unsupported => {
                    tracing::error!(zipper = %self.config.name, error = %e, "transport cannot accept");
                    return Err(e.into());
                },
                Err(e) => {
                    tracing::warn!(zipper = %self.config.name, error = %e, "incoming connection failed");
                },
            }
        }

        tracing::info!(zipper = %self.config.name, "stopped serving");
        Ok(())
    }

    /// Stop accepting, tell every client to go away, and drop all state.
    ///
    /// Goaways go out before the listener closes. Connections still open
    /// after a short grace period are closed.
    pub async fn shutdown(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }

        let conns = self.connector.close();
        tracing::info!(zipper = %self.config.name, connections = conns.len(), "shutting down");
        let goaway = Frame::Goaway(GoawayFrame { message: "server shutdown".to_string() });
        for conn in &conns {
            let _ = conn.write_frame(&goaway).await;
        }

        // Clients hang up on Goaway; closing first could discard it unsent
        let grace = self.env.sleep(GOAWAY_GRACE);
        tokio::pin!(grace);
        for conn in &conns {
            tokio::select! {
                _ = conn.context().done() => {},
                () = &mut grace => break,
            }
        }
        for conn in conns {
            conn.close_with_code(CloseCode::Goaway, "server shutdown");
        }
        self.transport.close("server shutdown");
        self.router.clean();

        let downstreams = std::mem::take(&mut *self.downstreams.write().unwrap_or_else(PoisonError::into_inner));
        for downstream in downstreams {
            downstream.close();
        }
    }

    /// Drive one accepted connection from stream accept to cleanup.
    async fn handle(&self, conn: T::Connection) {
        let config = FrameConnConfig { idle_timeout: self.config.idle_timeout };
        let frames = match FrameConn::accept(conn, config).await {
            Ok(frames) => frames,
            Err(e) => {
                tracing::debug!(error = %e, "connection ended before opening a stream");
                return;
            },
        };

        let Some(conn) = self.register(frames).await else {
            return;
        };
        self.serve_connection(&conn).await;
        self.unregister(&conn);
    }

    /// Authenticate and register, or refuse and close.
    async fn register(&self, frames: Frames<T>) -> Option<Arc<Conn<T>>> {
        let admitted = tokio::select! {
            admitted = self.admit(&frames) => admitted,
            () = self.env.sleep(self.config.handshake_timeout) => Err(Refusal::Timeout),
        };
        let Admitted { handshake, auth } = match admitted {
            Ok(admitted) => admitted,
            Err(refusal) => {
                self.refuse(&frames, refusal).await;
                return None;
            },
        };

        let metadata = match self.metadata.build(&handshake, auth) {
            Ok(metadata) => metadata,
            Err(error) => {
                self.refuse(&frames, Refusal::Metadata { id: handshake.id.clone(), error }).await;
                return None;
            },
        };

        let id = if handshake.id.is_empty() { self.env.random_id() } else { handshake.id.clone() };
        let info = ConnectionInfo::from_handshake(id, &handshake, metadata);
        let conn = Arc::new(Connection::new(info, frames));

        match self.connector.add(Arc::clone(&conn)) {
            Ok(Some(previous)) => {
                tracing::info!(conn_id = %conn.id(), "superseded by a new connection with the same id");
                previous.close_with_error("superseded by a new connection");
            },
            Ok(None) => {},
            Err(_) => {
                let _ = conn.write_frame(&GoawayFrame { message: "server shutdown".into() }.into()).await;
                conn.close_with_code(CloseCode::Goaway, "server shutdown");
                return None;
            },
        }

        let function = conn.stream_type() == StreamType::StreamFunction;
        if function {
            if let Err(e) = self.router.check(conn.name()) {
                tracing::info!(conn_id = %conn.id(), name = %conn.name(), error = %e, "registration rejected");
                let rejected = HandshakeRejectedFrame { id: conn.id().to_string(), message: e.to_string() };
                let _ = conn.write_frame(&rejected.into()).await;
                conn.close_with_code(CloseCode::Rejected, &e.to_string());
                let _ = self.connector.remove_entry(&conn);
                return None;
            }
        }

        // Ack before subscribing so no routed data precedes it
        if let Err(e) = conn.write_frame(&Frame::HandshakeAck).await {
            tracing::debug!(conn_id = %conn.id(), error = %e, "handshake ack failed");
            self.unregister(&conn);
            return None;
        }

        if function {
            if let Err(e) = self.subscribe(&conn).await {
                tracing::warn!(conn_id = %conn.id(), name = %conn.name(), error = %e, "subscribe failed");
                conn.close_with_code(CloseCode::Rejected, &e.to_string());
                self.unregister(&conn);
                return None;
            }
        }

        tracing::info!(
            conn_id = %conn.id(),
            name = %conn.name(),
            stream_type = %conn.stream_type(),
            tags = ?conn.observe_data_tags(),
            "registered"
        );
        Some(conn)
    }

    /// Read the optional authentication exchange and the handshake.
    async fn admit(&self, frames: &Frames<T>) -> Result<Admitted, Refusal> {
        let first = frames.read_frame().await.map_err(Refusal::Gone)?;

        let (handshake, auth) = match first {
            Frame::Authentication(credential) => {
                let auth = self
                    .config
                    .auths
                    .authenticate(&credential.auth_name, &credential.auth_payload)
                    .map_err(|error| Refusal::Auth { error, separate: true })?;
                let ack = AuthenticationAckFrame { ok: true, reason: String::new() };
                frames.write_frame(&ack.into()).await.map_err(Refusal::Gone)?;

                match frames.read_frame().await.map_err(Refusal::Gone)? {
                    Frame::Handshake(handshake) => (handshake, auth),
                    other => return Err(Refusal::Unexpected(other.frame_type())),
                }
            },
            Frame::Handshake(handshake) => {
                let auth = self
                    .config
                    .auths
                    .authenticate(&handshake.auth_name, &handshake.auth_payload)
                    .map_err(|error| Refusal::Auth { error, separate: false })?;
                (handshake, auth)
            },
            other => return Err(Refusal::Unexpected(other.frame_type())),
        };

        if let Some(endpoint) = &self.config.redirect_to {
            tracing::info!(name = %handshake.name, endpoint = %endpoint, "redirecting");
            let redirect = ConnectToFrame { endpoint: endpoint.clone() };
            frames.write_frame(&redirect.into()).await.map_err(Refusal::Gone)?;
            return Err(Refusal::Redirected);
        }

        Ok(Admitted { handshake, auth })
    }

    /// Answer a refused connection and close it.
    async fn refuse(&self, frames: &Frames<T>, refusal: Refusal) {
        let (answer, code, reason) = match refusal {
            Refusal::Timeout => (None, CloseCode::Handshake, "handshake timeout".to_string()),
            Refusal::Gone(e) => {
                tracing::debug!(error = %e, "connection ended during handshake");
                return;
            },
            Refusal::Unexpected(frame_type) => {
                let message = format!("handshake expected, got {frame_type:?}");
                (Some(RejectedFrame { message: message.clone() }.into()), CloseCode::Handshake, message)
            },
            Refusal::Auth { error, separate: true } => {
                let reason = error.to_string();
                let ack = AuthenticationAckFrame { ok: false, reason: reason.clone() };
                (Some(ack.into()), CloseCode::Rejected, reason)
            },
            Refusal::Auth { error, separate: false } => {
                let reason = error.to_string();
                (Some(RejectedFrame { message: reason.clone() }.into()), CloseCode::Rejected, reason)
            },
            Refusal::Metadata { id, error } => {
                let message = error.to_string();
                let rejected = HandshakeRejectedFrame { id, message: message.clone() };
                (Some(rejected.into()), CloseCode::Handshake, message)
            },
            Refusal::Redirected => (None, CloseCode::Closed, "redirected".to_string()),
        };

        tracing::info!(reason = %reason, "connection refused");
        if let Some(answer) = answer {
            let _ = frames.write_frame(&answer).await;
        }
        frames.close_with_code(code, &reason);
    }

    /// Subscribe a stream function, evicting any same-name holder.
    async fn subscribe(&self, conn: &Arc<Conn<T>>) -> Result<(), RouteError> {
        let registration = Registration {
            conn_id: conn.id().to_string(),
            name: conn.name().to_string(),
            observe_data_tags: conn.observe_data_tags().to_vec(),
            wanted_target: conn.info().wanted_target.clone(),
        };

        let Some(eviction) = self.router.add(registration)? else {
            return Ok(());
        };
        let error = eviction.error();
        tracing::info!(evicted = %eviction.conn_id, by = %conn.id(), name = %eviction.name, "duplicate name");
        if let Some(stale) = self.connector.get(&eviction.conn_id) {
            let _ = stale.write_frame(&GoawayFrame { message: error.to_string() }.into()).await;
            stale.close_with_code(CloseCode::DuplicateName, &error.to_string());
            let _ = self.connector.remove_entry(&stale);
        }
        Ok(())
    }

    /// Serving loop of one registered connection.
    async fn serve_connection(&self, conn: &Arc<Conn<T>>) {
        loop {
            match conn.read_frame().await {
                Ok(Frame::Data(data)) => self.dispatch(conn, data).await,
                Ok(Frame::Backflow(backflow)) => self.backflow(conn, backflow).await,
                Ok(Frame::CloseStream(close)) => {
                    tracing::info!(conn_id = %conn.id(), stream_id = %close.stream_id, reason = %close.reason, "close stream");
                    if close.stream_id == conn.id() {
                        conn.close_with_error(&close.reason);
                        return;
                    }
                    if let Some(target) = self.connector.get(&close.stream_id) {
                        target.close_with_error(&close.reason);
                        self.unregister(&target);
                    }
                },
                Ok(other) => {
                    tracing::warn!(conn_id = %conn.id(), frame_type = ?other.frame_type(), "unexpected frame");
                },
                Err(ConnectionError::Protocol(e)) => {
                    tracing::warn!(conn_id = %conn.id(), error = %e, "malformed frame");
                    let message = e.to_string();
                    let _ = conn.write_frame(&RejectedFrame { message: message.clone() }.into()).await;
                    conn.close_with_code(CloseCode::Data, &message);
                    return;
                },
                Err(ConnectionError::Closed(cause)) => {
                    tracing::info!(conn_id = %conn.id(), name = %conn.name(), cause = %cause, "connection closed");
                    return;
                },
            }
        }
    }

    /// Route a data frame to subscribers, downstreams, and back to its
    /// source.
    async fn dispatch(&self, from: &Arc<Conn<T>>, mut data: DataFrame) {
        if data.meta.transaction_id.is_empty() {
            data.meta.transaction_id = self.env.random_id();
        }
        if data.meta.source_id.is_empty() {
            data.meta.source_id = from.id().to_string();
        }

        let tag = data.tag();
        let target = match Metadata::decode(&data.meta.metadata) {
            Ok(metadata) => metadata.target().map(str::to_string),
            Err(e) => {
                tracing::debug!(conn_id = %from.id(), error = %e, "undecodable data metadata");
                None
            },
        };

        let candidates = self.router.route(tag, target.as_deref());
        let selected = select_targets(candidates, data.meta.lb_policy(), &data.meta.to_instance_id, &self.env);
        if selected.is_empty() {
            tracing::debug!(tag, tid = %data.meta.transaction_id, "no subscriber");
        }

        let frame = Frame::Data(data.clone());
        for id in &selected {
            let Some(subscriber) = self.connector.get(id) else {
                tracing::debug!(tag, conn_id = %id, "subscriber gone");
                continue;
            };
            if let Err(e) = subscriber.write_frame(&frame).await {
                tracing::warn!(tag, conn_id = %id, error = %e, "dispatch failed");
                subscriber.close_with_error(&e.to_string());
            }
        }

        if from.stream_type() != StreamType::UpstreamZipper {
            let downstreams = self.downstreams.read().unwrap_or_else(PoisonError::into_inner).clone();
            for downstream in downstreams {
                if let Err(e) = downstream.forward(&data).await {
                    tracing::warn!(downstream = downstream.name(), error = %e, "mirror failed");
                }
            }
        }

        self.implicit_backflow(from, &data).await;
    }

    /// Hand a data frame to its originating source if that source observes
    /// the tag.
    async fn implicit_backflow(&self, from: &Arc<Conn<T>>, data: &DataFrame) {
        let source_id = &data.meta.source_id;
        if source_id == from.id() {
            return;
        }
        let Some(source) = self.connector.get(source_id) else {
            return;
        };
        if source.stream_type() != StreamType::Source || !source.observes(data.tag()) {
            return;
        }

        let backflow = BackflowFrame {
            tag: data.tag(),
            carriage: data.payload.carriage.clone(),
            source_id: source_id.clone(),
        };
        if let Err(e) = source.write_frame(&backflow.into()).await {
            tracing::warn!(conn_id = %source_id, error = %e, "backflow failed");
        }
    }

    /// Deliver an explicit backflow frame to sources observing its tag.
    async fn backflow(&self, from: &Arc<Conn<T>>, backflow: BackflowFrame) {
        let receivers = self.connector.find(|c| {
            c.stream_type() == StreamType::Source
                && c.observes(backflow.tag)
                && (backflow.source_id.is_empty() || c.id() == backflow.source_id)
        });
        if receivers.is_empty() {
            tracing::debug!(conn_id = %from.id(), tag = backflow.tag, "no backflow receiver");
        }

        let frame = Frame::Backflow(backflow);
        for receiver in receivers {
            if let Err(e) = receiver.write_frame(&frame).await {
                tracing::warn!(conn_id = %receiver.id(), error = %e, "backflow failed");
            }
        }
    }

    /// Remove `conn` from the connector and, if it was still registered
    /// there, from the router.
    fn unregister(&self, conn: &Arc<Conn<T>>) {
        if self.connector.remove_entry(conn).unwrap_or(false) {
            self.router.remove(conn.id());
            tracing::debug!(conn_id = %conn.id(), "unregistered");
        }
    }
}
