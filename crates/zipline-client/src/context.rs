//! Serverless handler context.
//!
//! A stream function's data handler receives one [`Context`] per inbound
//! data frame. Writes made through the context stay correlated with the frame
//! that caused them: they carry its transaction id, source id, and metadata.

use bytes::Bytes;
use zipline_core::{Environment, transport::Transport};
use zipline_proto::{BackflowFrame, DataFrame, Frame, MetaFrame, Metadata, PayloadFrame, Tag};

use crate::{client::Client, error::ClientError};

/// One inbound data frame plus a way to answer it.
pub struct Context<T: Transport, E: Environment> {
    client: Client<T, E>,
    frame: DataFrame,
    metadata: Metadata,
}

impl<T: Transport, E: Environment> Context<T, E> {
    pub(crate) fn new(client: Client<T, E>, frame: DataFrame) -> Self {
        let metadata = Metadata::decode(&frame.meta.metadata).unwrap_or_else(|e| {
            tracing::debug!(error = %e, "undecodable data metadata");
            Metadata::new()
        });
        Self { client, frame, metadata }
    }

    /// Tag of the inbound frame.
    pub fn tag(&self) -> Tag {
        self.frame.tag()
    }

    /// Payload of the inbound frame.
    pub fn data(&self) -> &Bytes {
        &self.frame.payload.carriage
    }

    /// Transaction id shared by every frame derived from the same origin.
    pub fn transaction_id(&self) -> &str {
        &self.frame.meta.transaction_id
    }

    /// Id of the source that produced the original frame.
    pub fn source_id(&self) -> &str {
        &self.frame.meta.source_id
    }

    /// Metadata of the inbound frame.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// The inbound frame.
    pub fn frame(&self) -> &DataFrame {
        &self.frame
    }

    /// Emit `data` under `tag`, correlated with the inbound frame.
    pub async fn write(&self, tag: Tag, data: impl Into<Bytes>) -> Result<(), ClientError> {
        let frame = DataFrame {
            meta: MetaFrame {
                transaction_id: self.frame.meta.transaction_id.clone(),
                source_id: self.frame.meta.source_id.clone(),
                metadata: self.frame.meta.metadata.clone(),
                ..MetaFrame::default()
            },
            payload: PayloadFrame { tag, carriage: data.into() },
        };
        self.client.write_frame(&Frame::Data(frame)).await
    }

    /// Send `data` back to the originating source under `tag`.
    pub async fn write_backflow(&self, tag: Tag, data: impl Into<Bytes>) -> Result<(), ClientError> {
        let frame = BackflowFrame {
            tag,
            carriage: data.into(),
            source_id: self.frame.meta.source_id.clone(),
        };
        self.client.write_frame(&Frame::Backflow(frame)).await
    }
}
