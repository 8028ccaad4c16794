//! Mesh downstreams.
//!
//! A zipper can mirror every data frame it receives to other zippers. Each
//! downstream is a client connected with the upstream-zipper role, so the
//! receiving zipper routes the frame locally but never mirrors it again.

use async_trait::async_trait;
use zipline_client::{Client, ClientConfig};
use zipline_core::{Environment, transport::Transport};
use zipline_proto::{DataFrame, Frame, StreamType};

use crate::error::ServerError;

/// A zipper that receives a copy of every data frame.
#[async_trait]
pub trait Downstream: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Forward one frame as is.
    async fn forward(&self, frame: &DataFrame) -> Result<(), ServerError>;

    /// Disconnect.
    fn close(&self);
}

/// Downstream reached through a [`Client`].
pub struct ClientDownstream<T: Transport, E: Environment> {
    name: String,
    client: Client<T, E>,
}

impl<T: Transport, E: Environment> ClientDownstream<T, E> {
    /// Client configuration for a downstream link announced as `zipper`.
    pub fn config(zipper: &str) -> ClientConfig {
        ClientConfig {
            name: zipper.to_string(),
            stream_type: StreamType::UpstreamZipper,
            ..ClientConfig::default()
        }
    }

    /// Wrap a client created from [`ClientDownstream::config`].
    pub fn new(name: impl Into<String>, client: Client<T, E>) -> Self {
        Self { name: name.into(), client }
    }

    /// Underlying client.
    pub fn client(&self) -> &Client<T, E> {
        &self.client
    }
}

#[async_trait]
impl<T: Transport, E: Environment> Downstream for ClientDownstream<T, E> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn forward(&self, frame: &DataFrame) -> Result<(), ServerError> {
        self.client
            .write_frame(&Frame::Data(frame.clone()))
            .await
            .map_err(|e| ServerError::Downstream { name: self.name.clone(), reason: e.to_string() })
    }

    fn close(&self) {
        self.client.close();
    }
}
