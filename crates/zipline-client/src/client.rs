//! Client connection state machine.
//!
//! # States
//!
//! ```text
//! ┌───────┐ connect ┌────────────┐ ack  ┌───────────┐
//! │ Ready │────────>│ Connecting │─────>│ Connected │
//! └───────┘         └────────────┘      └───────────┘
//!                     │    ↑                  │ closed / idle timeout
//!     timeout/refused │    │ retry            ↓
//!                     │  ┌──────────────────────┐
//!                     └─>│     Disconnected     │
//!                        └──────────────────────┘
//!
//!        close() from any state ──> Closed (terminal)
//! ```
//!
//! One task runs the receive loop of the current connection and one
//! supervisor task retries dialing after a disconnect, on the interval of the
//! [`ReconnectPolicy`](crate::ReconnectPolicy). Handlers run inline on the
//! receive loop: a slow handler delays the frames behind it on the same
//! connection, never frames of other clients.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        Arc, Mutex, PoisonError, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::Bytes;
use tokio::sync::watch;
use zipline_core::{
    CloseCode, ConnectionError, Environment, FrameConn, FrameConnConfig, transport::Transport,
};
use zipline_proto::{
    AuthenticationFrame, DataFrame, Frame, HandshakeFrame, LbType, MetaFrame, PayloadFrame, Tag,
};

use crate::{config::ClientConfig, context::Context, error::ClientError};

/// Redirects followed by a single dial before giving up.
const MAX_REDIRECTS: usize = 3;

/// Boxed future returned by data handlers.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

type DataHandler<T, E> = Arc<dyn Fn(Context<T, E>) -> BoxFuture<()> + Send + Sync>;
type BackflowHandler = Arc<dyn Fn(Tag, Bytes) + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(&ClientError) + Send + Sync>;
type Conn<T> = Arc<FrameConn<<T as Transport>::Connection>>;

/// Connection state of a [`Client`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Created, never dialed
    Ready,
    /// Dialing or handshaking
    Connecting,
    /// Handshake acknowledged, frames flow
    Connected,
    /// Lost or failed to establish the connection
    Disconnected,
    /// Closed on request; terminal
    Closed,
}

struct Handlers<T: Transport, E: Environment> {
    data: Option<DataHandler<T, E>>,
    backflow: Option<BackflowHandler>,
    error: Option<ErrorHandler>,
}

/// Result of a successful handshake exchange.
enum Outcome {
    Accepted,
    Redirect(String),
}

struct Inner<T: Transport, E: Environment> {
    config: ClientConfig,
    id: String,
    transport: T,
    env: E,
    state: watch::Sender<ClientState>,
    addr: Mutex<String>,
    conn: Mutex<Option<Conn<T>>>,
    handlers: RwLock<Handlers<T, E>>,
    supervising: AtomicBool,
}

/// A source, stream function, or upstream zipper connected to a zipper.
///
/// Cloning is cheap; clones share one connection.
pub struct Client<T: Transport, E: Environment> {
    inner: Arc<Inner<T, E>>,
}

impl<T: Transport, E: Environment> Clone for Client<T, E> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T: Transport, E: Environment> Client<T, E> {
    /// Client dialing through `transport`. Nothing happens until
    /// [`Client::connect`].
    pub fn new(transport: T, env: E, config: ClientConfig) -> Self {
        let id = if config.id.is_empty() { env.random_id() } else { config.id.clone() };
        let (state, _) = watch::channel(ClientState::Ready);
        Self {
            inner: Arc::new(Inner {
                config,
                id,
                transport,
                env,
                state,
                addr: Mutex::new(String::new()),
                conn: Mutex::new(None),
                handlers: RwLock::new(Handlers { data: None, backflow: None, error: None }),
                supervising: AtomicBool::new(false),
            }),
        }
    }

    /// Client id, also the source id of frames it writes.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Name announced in the handshake.
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Current state.
    pub fn state(&self) -> ClientState {
        *self.inner.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ClientState> {
        self.inner.state.subscribe()
    }

    /// Address dialed by the next (re)connect; updated by redirects.
    pub fn address(&self) -> String {
        lock(&self.inner.addr).clone()
    }

    /// Handle inbound data frames.
    pub fn set_data_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(Context<T, E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: DataHandler<T, E> = Arc::new(move |ctx| Box::pin(handler(ctx)));
        self.inner.handlers.write().unwrap_or_else(PoisonError::into_inner).data = Some(handler);
    }

    /// Handle inbound backflow frames.
    pub fn set_backflow_handler<F>(&self, handler: F)
    where
        F: Fn(Tag, Bytes) + Send + Sync + 'static,
    {
        self.inner.handlers.write().unwrap_or_else(PoisonError::into_inner).backflow =
            Some(Arc::new(handler));
    }

    /// Observe connection failures, refusals, and disconnects.
    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(&ClientError) + Send + Sync + 'static,
    {
        self.inner.handlers.write().unwrap_or_else(PoisonError::into_inner).error = Some(Arc::new(handler));
    }

    /// Dial `addr` and complete the handshake.
    ///
    /// On a retryable failure the error is returned and the reconnect
    /// supervisor keeps trying in the background until [`Client::close`].
    pub async fn connect(&self, addr: &str) -> Result<(), ClientError> {
        if self.state() == ClientState::Closed {
            return Err(ClientError::Closed);
        }
        *lock(&self.inner.addr) = addr.to_string();

        match self.inner.dial().await {
            Ok(()) => {
                self.spawn_supervisor();
                Ok(())
            },
            Err(e) => {
                self.inner.set_state(ClientState::Disconnected);
                self.inner.report(&e);
                if e.is_retryable() {
                    self.spawn_supervisor();
                }
                Err(e)
            },
        }
    }

    /// Write one frame. Fails fast unless connected.
    pub async fn write_frame(&self, frame: &Frame) -> Result<(), ClientError> {
        match self.state() {
            ClientState::Connected => {},
            ClientState::Closed => return Err(ClientError::Closed),
            _ => return Err(ClientError::NotConnected),
        }
        let conn = self.inner.current().ok_or(ClientError::NotConnected)?;
        conn.write_frame(frame).await.map_err(ClientError::from)
    }

    /// Write `data` under `tag` to every subscriber.
    pub async fn write(&self, tag: Tag, data: impl Into<Bytes>) -> Result<(), ClientError> {
        let frame = self.data_frame(tag, data.into(), None)?;
        self.write_frame(&Frame::Data(frame)).await
    }

    /// Write `data` under `tag`, forcing broadcast delivery.
    pub async fn broadcast(&self, tag: Tag, data: impl Into<Bytes>) -> Result<(), ClientError> {
        let mut frame = self.data_frame(tag, data.into(), None)?;
        frame.meta.broadcast = true;
        self.write_frame(&Frame::Data(frame)).await
    }

    /// Write `data` under `tag` to the subscriber whose id is `instance`
    /// only.
    pub async fn write_to_instance(
        &self,
        tag: Tag,
        data: impl Into<Bytes>,
        instance: &str,
    ) -> Result<(), ClientError> {
        let mut frame = self.data_frame(tag, data.into(), None)?;
        frame.meta.lb_type = LbType::BindInstance;
        frame.meta.to_instance_id = instance.to_string();
        self.write_frame(&Frame::Data(frame)).await
    }

    /// Write `data` under `tag` to subscribers wanting `target`.
    pub async fn write_with_target(
        &self,
        tag: Tag,
        data: impl Into<Bytes>,
        target: &str,
    ) -> Result<(), ClientError> {
        let frame = self.data_frame(tag, data.into(), Some(target))?;
        self.write_frame(&Frame::Data(frame)).await
    }

    /// Close the connection and stop reconnecting. Idempotent.
    pub fn close(&self) {
        self.inner.close(CloseCode::ClientAbort, "client closed");
    }

    fn data_frame(&self, tag: Tag, carriage: Bytes, target: Option<&str>) -> Result<DataFrame, ClientError> {
        let metadata = match target {
            Some(target) => {
                let mut metadata = self.inner.config.metadata.clone();
                metadata.set_target(target);
                metadata.encode()
            },
            None => self.inner.config.metadata.encode(),
        }
        .map_err(ConnectionError::from)?;

        Ok(DataFrame {
            meta: MetaFrame {
                transaction_id: self.inner.env.random_id(),
                source_id: self.inner.id.clone(),
                metadata,
                ..MetaFrame::default()
            },
            payload: PayloadFrame { tag, carriage },
        })
    }

    fn spawn_supervisor(&self) {
        if self.inner.supervising.swap(true, Ordering::SeqCst) {
            return;
        }
        tokio::spawn(Arc::clone(&self.inner).supervise());
    }
}

impl<T: Transport, E: Environment> Inner<T, E> {
    /// Move to `next` unless already there or closed. Returns whether the
    /// state changed.
    fn set_state(&self, next: ClientState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ClientState::Closed || *state == next {
                false
            } else {
                *state = next;
                true
            }
        })
    }

    fn current(&self) -> Option<Conn<T>> {
        lock(&self.conn).clone()
    }

    /// Forget `conn` if it is still the current connection.
    fn detach(&self, conn: &Conn<T>) -> bool {
        let mut slot = lock(&self.conn);
        if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, conn)) {
            *slot = None;
            true
        } else {
            false
        }
    }

    fn report(&self, err: &ClientError) {
        tracing::warn!(client_id = %self.id, name = %self.config.name, error = %err, "client error");
        let handler = self.handlers.read().unwrap_or_else(PoisonError::into_inner).error.clone();
        if let Some(handler) = handler {
            handler(err);
        }
    }

    fn close(&self, code: CloseCode, reason: &str) {
        let changed = self.state.send_if_modified(|state| {
            if *state == ClientState::Closed {
                false
            } else {
                *state = ClientState::Closed;
                true
            }
        });
        if let Some(conn) = lock(&self.conn).take() {
            conn.close_with_code(code, reason);
        }
        if changed {
            tracing::info!(client_id = %self.id, name = %self.config.name, reason, "client closed");
        }
    }

    /// Establish a connection and start its receive loop.
    async fn dial(self: &Arc<Self>) -> Result<(), ClientError> {
        if !self.set_state(ClientState::Connecting) && *self.state.borrow() == ClientState::Closed {
            return Err(ClientError::Closed);
        }

        let conn = Arc::new(self.establish().await?);
        let previous = {
            let mut slot = lock(&self.conn);
            if *self.state.borrow() == ClientState::Closed {
                conn.close_with_code(CloseCode::ClientAbort, "client closed");
                return Err(ClientError::Closed);
            }
            slot.replace(Arc::clone(&conn))
        };
        // Wakes the old receive loop, which then exits without touching state
        if let Some(previous) = previous {
            previous.close_with_code(CloseCode::ClientAbort, "replaced by a new connection");
        }
        self.set_state(ClientState::Connected);
        tracing::info!(
            client_id = %self.id,
            name = %self.config.name,
            stream_type = %self.config.stream_type,
            "connected"
        );

        tokio::spawn(Arc::clone(self).receive_loop(conn));
        Ok(())
    }

    /// Dial and handshake, following redirects.
    async fn establish(&self) -> Result<FrameConn<T::Connection>, ClientError> {
        let mut addr = lock(&self.addr).clone();
        let config = FrameConnConfig { idle_timeout: self.config.idle_timeout };

        for _ in 0..=MAX_REDIRECTS {
            let conn = self.transport.connect(&addr).await?;
            let frames = FrameConn::open(conn, config.clone()).await?;

            let outcome = tokio::select! {
                outcome = self.handshake(&frames) => outcome,
                () = self.env.sleep(self.config.handshake_timeout) => Err(ClientError::HandshakeTimeout),
            };

            match outcome {
                Ok(Outcome::Accepted) => return Ok(frames),
                Ok(Outcome::Redirect(endpoint)) => {
                    tracing::info!(client_id = %self.id, from = %addr, to = %endpoint, "redirected");
                    frames.close_with_error("redirected");
                    addr = endpoint;
                    *lock(&self.addr) = addr.clone();
                },
                Err(e) => {
                    let code = match e {
                        ClientError::HandshakeTimeout => CloseCode::Handshake,
                        _ => CloseCode::ClientAbort,
                    };
                    frames.close_with_code(code, &e.to_string());
                    return Err(e);
                },
            }
        }
        Err(ClientError::Rejected(format!("more than {MAX_REDIRECTS} redirects")))
    }

    async fn handshake(&self, frames: &FrameConn<T::Connection>) -> Result<Outcome, ClientError> {
        let credential = &self.config.credential;

        if self.config.separate_auth {
            let auth = AuthenticationFrame {
                auth_name: credential.name().to_string(),
                auth_payload: credential.payload().to_string(),
            };
            frames.write_frame(&auth.into()).await?;
            match frames.read_frame().await? {
                Frame::AuthenticationAck(ack) if ack.ok => {},
                Frame::AuthenticationAck(ack) => return Err(ClientError::AuthenticationFailed(ack.reason)),
                other => return refusal(other),
            }
        }

        let handshake = HandshakeFrame {
            name: self.config.name.clone(),
            id: self.id.clone(),
            stream_type: self.config.stream_type,
            observe_data_tags: self.config.observe_data_tags.clone(),
            auth_name: if self.config.separate_auth { String::new() } else { credential.name().to_string() },
            auth_payload: if self.config.separate_auth {
                String::new()
            } else {
                credential.payload().to_string()
            },
            version: self.config.version.clone(),
            wanted_target: self.config.wanted_target.clone().unwrap_or_default(),
            metadata: self.config.metadata.encode().map_err(ConnectionError::from)?,
        };
        frames.write_frame(&handshake.into()).await?;

        loop {
            match frames.read_frame().await? {
                Frame::HandshakeAck => return Ok(Outcome::Accepted),
                Frame::ConnectTo(redirect) => return Ok(Outcome::Redirect(redirect.endpoint)),
                Frame::Data(_) | Frame::Backflow(_) => {
                    tracing::debug!(client_id = %self.id, "frame before handshake ack dropped");
                },
                other => return refusal(other),
            }
        }
    }

    async fn receive_loop(self: Arc<Self>, conn: Conn<T>) {
        let client = Client { inner: Arc::clone(&self) };
        loop {
            let frame = match conn.read_frame().await {
                Ok(frame) => frame,
                // Framing is intact here; length-prefix errors arrive as Closed
                Err(ConnectionError::Protocol(e)) => {
                    tracing::warn!(client_id = %self.id, error = %e, "undecodable frame skipped");
                    continue;
                },
                Err(ConnectionError::Closed(cause)) => {
                    if self.detach(&conn) && self.set_state(ClientState::Disconnected) {
                        tracing::info!(client_id = %self.id, cause = %cause, "disconnected");
                        self.report(&ClientError::from(cause));
                    }
                    return;
                },
            };

            match frame {
                Frame::Data(data) => {
                    let handler = self.handlers.read().unwrap_or_else(PoisonError::into_inner).data.clone();
                    match handler {
                        Some(handler) => handler(Context::new(client.clone(), data)).await,
                        None => tracing::debug!(client_id = %self.id, tag = data.tag(), "no data handler"),
                    }
                },
                Frame::Backflow(backflow) => {
                    let handler = self.handlers.read().unwrap_or_else(PoisonError::into_inner).backflow.clone();
                    match handler {
                        Some(handler) => handler(backflow.tag, backflow.carriage),
                        None => tracing::debug!(client_id = %self.id, tag = backflow.tag, "no backflow handler"),
                    }
                },
                Frame::Goaway(goaway) => {
                    let err = ClientError::from_goaway(goaway.message);
                    let code = match err {
                        ClientError::DuplicateName(_) => CloseCode::DuplicateName,
                        _ => CloseCode::Goaway,
                    };
                    self.report(&err);
                    self.close(code, &err.to_string());
                    return;
                },
                Frame::Rejected(rejected) => {
                    let err = ClientError::Rejected(rejected.message);
                    self.report(&err);
                    self.close(CloseCode::Rejected, &err.to_string());
                    return;
                },
                other => {
                    tracing::warn!(client_id = %self.id, frame_type = ?other.frame_type(), "unsupported frame");
                },
            }
        }
    }

    async fn supervise(self: Arc<Self>) {
        let policy = self.config.reconnect.clone();
        let mut state = self.state.subscribe();
        let mut failures = 0u32;

        loop {
            let current = state
                .wait_for(|s| matches!(s, ClientState::Disconnected | ClientState::Closed))
                .await
                .map(|s| *s);
            if !matches!(current, Ok(ClientState::Disconnected)) {
                break;
            }
            if policy.max_attempts.is_some_and(|max| failures >= max) {
                tracing::warn!(client_id = %self.id, failures, "giving up reconnecting");
                break;
            }

            tokio::select! {
                () = self.env.sleep(policy.interval) => {},
                () = async { let _ = state.wait_for(|s| *s == ClientState::Closed).await; } => break,
            }

            match self.dial().await {
                Ok(()) => failures = 0,
                Err(ClientError::Closed) => break,
                Err(e) => {
                    failures += 1;
                    self.set_state(ClientState::Disconnected);
                    self.report(&e);
                    if !e.is_retryable() {
                        break;
                    }
                },
            }
        }
        self.supervising.store(false, Ordering::SeqCst);
    }
}

/// Classify a frame the server sent instead of the expected answer.
fn refusal(frame: Frame) -> Result<Outcome, ClientError> {
    Err(match frame {
        Frame::HandshakeRejected(rejected) => ClientError::Rejected(rejected.message),
        Frame::Rejected(rejected) if rejected.message.starts_with("authentication failed") => {
            ClientError::AuthenticationFailed(rejected.message)
        },
        Frame::Rejected(rejected) => ClientError::Rejected(rejected.message),
        Frame::Goaway(goaway) => ClientError::from_goaway(goaway.message),
        other => ClientError::Rejected(format!("unexpected {:?} frame", other.frame_type())),
    })
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
