//! Registered connections.
//!
//! A [`Connection`] is a [`FrameConn`] plus the identity the peer announced
//! in its handshake. It is created when the handshake succeeds and owned by
//! the connector until removal; the transport stream is closed exactly once,
//! through the frame connection.

use zipline_proto::{Frame, HandshakeFrame, Metadata, StreamType, Tag};

use crate::{
    error::{CloseCode, ConnectionError},
    frame_conn::{ConnContext, FrameConn},
    transport::TransportConnection,
};

/// Identity of a registered peer, as the connector indexes it.
pub trait Peer: Send + Sync + 'static {
    /// Unique connection id.
    fn id(&self) -> &str;

    /// Client-chosen name.
    fn name(&self) -> &str;

    /// Tags the peer receives.
    fn observe_data_tags(&self) -> &[Tag];

    /// Whether the peer receives `tag`.
    fn observes(&self, tag: Tag) -> bool {
        self.observe_data_tags().contains(&tag)
    }
}

/// Handshake-derived description of a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Unique connection id
    pub id: String,
    /// Client-chosen name
    pub name: String,
    /// Role of the client
    pub stream_type: StreamType,
    /// Tags the client receives
    pub observe_data_tags: Vec<Tag>,
    /// Merged handshake and authentication metadata
    pub metadata: Metadata,
    /// Only receive data targeted at this value
    pub wanted_target: Option<String>,
}

impl ConnectionInfo {
    /// Describe the sender of `handshake`, registered under `id`.
    pub fn from_handshake(id: impl Into<String>, handshake: &HandshakeFrame, metadata: Metadata) -> Self {
        Self {
            id: id.into(),
            name: handshake.name.clone(),
            stream_type: handshake.stream_type,
            observe_data_tags: handshake.observe_data_tags.clone(),
            metadata,
            wanted_target: Some(handshake.wanted_target.clone()).filter(|t| !t.is_empty()),
        }
    }
}

impl Peer for ConnectionInfo {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn observe_data_tags(&self) -> &[Tag] {
        &self.observe_data_tags
    }
}

/// A live, registered connection.
pub struct Connection<C: TransportConnection> {
    info: ConnectionInfo,
    frames: FrameConn<C>,
}

impl<C: TransportConnection> Connection<C> {
    /// Bind `info` to an established frame connection.
    pub fn new(info: ConnectionInfo, frames: FrameConn<C>) -> Self {
        Self { info, frames }
    }

    /// Handshake-derived description.
    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Role of the client.
    pub fn stream_type(&self) -> StreamType {
        self.info.stream_type
    }

    /// Connection metadata.
    pub fn metadata(&self) -> &Metadata {
        &self.info.metadata
    }

    /// Lifecycle context.
    pub fn context(&self) -> &ConnContext {
        self.frames.context()
    }

    /// Underlying frame connection.
    pub fn frames(&self) -> &FrameConn<C> {
        &self.frames
    }

    /// Read the next frame.
    pub async fn read_frame(&self) -> Result<Frame, ConnectionError> {
        self.frames.read_frame().await
    }

    /// Write one frame.
    pub async fn write_frame(&self, frame: &Frame) -> Result<(), ConnectionError> {
        self.frames.write_frame(frame).await
    }

    /// Close with `reason`; see [`FrameConn::close_with_error`].
    pub fn close_with_error(&self, reason: &str) -> bool {
        self.frames.close_with_error(reason)
    }

    /// Close with an explicit code; see [`FrameConn::close_with_code`].
    pub fn close_with_code(&self, code: CloseCode, reason: &str) -> bool {
        self.frames.close_with_code(code, reason)
    }
}

impl<C: TransportConnection> Peer for Connection<C> {
    fn id(&self) -> &str {
        &self.info.id
    }

    fn name(&self) -> &str {
        &self.info.name
    }

    fn observe_data_tags(&self) -> &[Tag] {
        &self.info.observe_data_tags
    }
}
