//! Frame types and their wire encoding.
//!
//! A frame is a single top-level node packet whose tag is the
//! [`FrameType`]. Fields are child packets keyed by a per-frame field tag and
//! may appear in any order. Unknown field tags are skipped so newer peers can
//! add fields without breaking older ones.
//!
//! Absent fields decode to their zero value, which means an encoded empty
//! string and a missing string are indistinguishable after decoding.

use bytes::Bytes;
use serde_repr::{Deserialize_repr, Serialize_repr};
use zerocopy::{FromBytes, IntoBytes, byteorder::little_endian::U32};

use crate::{
    errors::{ProtocolError, Result},
    packet::{Children, NodeBuilder, read_packet},
};

/// Numeric routing key carried by every data payload.
pub type Tag = u32;

/// Maximum encoded size of a single frame (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Discriminant of a top-level frame node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Separate credential exchange, sent before the handshake
    Authentication = 0x03,
    /// Answer to [`FrameType::Authentication`]
    AuthenticationAck = 0x11,
    /// Handshake refused for a specific stream
    HandshakeRejected = 0x14,
    /// Handshake accepted
    HandshakeAck = 0x29,
    /// Processing result routed back to a source
    Backflow = 0x2D,
    /// Peer is going away
    Goaway = 0x2E,
    /// Identity and subscription announcement
    Handshake = 0x31,
    /// Connection-level rejection
    Rejected = 0x39,
    /// Request to close a named stream
    CloseStream = 0x3B,
    /// Redirect to another zipper
    ConnectTo = 0x3E,
    /// User data in flight
    Data = 0x3F,
}

impl FrameType {
    /// Parse a frame type from its tag.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x03 => Some(Self::Authentication),
            0x11 => Some(Self::AuthenticationAck),
            0x14 => Some(Self::HandshakeRejected),
            0x29 => Some(Self::HandshakeAck),
            0x2D => Some(Self::Backflow),
            0x2E => Some(Self::Goaway),
            0x31 => Some(Self::Handshake),
            0x39 => Some(Self::Rejected),
            0x3B => Some(Self::CloseStream),
            0x3E => Some(Self::ConnectTo),
            0x3F => Some(Self::Data),
            _ => None,
        }
    }

    /// Tag byte for this frame type.
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Role a client plays on the fabric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum StreamType {
    /// Originates data frames
    #[default]
    Source = 0x5F,
    /// Another zipper relaying frames into this one
    UpstreamZipper = 0x5E,
    /// Subscribes to tags and processes frames
    StreamFunction = 0x5D,
}

impl StreamType {
    /// Parse a stream type from its wire value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x5F => Some(Self::Source),
            0x5E => Some(Self::UpstreamZipper),
            0x5D => Some(Self::StreamFunction),
            _ => None,
        }
    }

    /// Wire value.
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for StreamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Source => "Source",
            Self::UpstreamZipper => "UpstreamZipper",
            Self::StreamFunction => "StreamFunction",
        };
        f.write_str(name)
    }
}

/// Delivery policy among the subscribers resolved for a tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum LbType {
    /// Every resolved subscriber
    #[default]
    Broadcast = 0x00,
    /// Exactly one resolved subscriber, chosen at random
    RandomPick = 0x01,
    /// Only the subscriber whose id equals `to_instance_id`
    BindInstance = 0x02,
}

impl LbType {
    /// Parse a load-balance type from its wire value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Broadcast),
            0x01 => Some(Self::RandomPick),
            0x02 => Some(Self::BindInstance),
            _ => None,
        }
    }

    /// Wire value.
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

mod field {
    pub mod handshake {
        pub const NAME: u8 = 0x01;
        pub const STREAM_TYPE: u8 = 0x02;
        pub const ID: u8 = 0x03;
        pub const AUTH_NAME: u8 = 0x04;
        pub const AUTH_PAYLOAD: u8 = 0x05;
        pub const OBSERVE_DATA_TAGS: u8 = 0x06;
        pub const VERSION: u8 = 0x07;
        pub const WANTED_TARGET: u8 = 0x08;
        pub const METADATA: u8 = 0x09;
    }

    pub mod data {
        pub const META: u8 = 0x2F;
        pub const PAYLOAD: u8 = 0x2E;
    }

    pub mod meta {
        pub const TRANSACTION_ID: u8 = 0x01;
        pub const SOURCE_ID: u8 = 0x02;
        pub const METADATA: u8 = 0x03;
        pub const BROADCAST: u8 = 0x04;
        pub const LB_TYPE: u8 = 0x05;
        pub const TO_INSTANCE_ID: u8 = 0x06;
    }

    pub mod payload {
        pub const TAG: u8 = 0x01;
        pub const CARRIAGE: u8 = 0x02;
    }

    pub mod backflow {
        pub const TAG: u8 = 0x01;
        pub const CARRIAGE: u8 = 0x02;
        pub const SOURCE_ID: u8 = 0x03;
    }

    pub mod auth {
        pub const NAME: u8 = 0x04;
        pub const PAYLOAD: u8 = 0x05;
    }

    pub mod auth_ack {
        pub const OK: u8 = 0x01;
        pub const REASON: u8 = 0x02;
    }

    pub mod rejected_handshake {
        pub const ID: u8 = 0x01;
        pub const MESSAGE: u8 = 0x02;
    }

    pub mod close_stream {
        pub const STREAM_ID: u8 = 0x01;
        pub const REASON: u8 = 0x02;
    }

    pub const MESSAGE: u8 = 0x01;
    pub const ENDPOINT: u8 = 0x01;
}

/// Identity and capability announcement, sent once as the first frame on a
/// new stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeFrame {
    /// Client-chosen name (the function name for stream functions)
    pub name: String,
    /// Client-supplied instance id
    pub id: String,
    /// Role of the connecting client
    pub stream_type: StreamType,
    /// Tags this client wants to receive
    pub observe_data_tags: Vec<Tag>,
    /// Name of the authentication scheme
    pub auth_name: String,
    /// Credential for the authentication scheme
    pub auth_payload: String,
    /// Protocol version string
    pub version: String,
    /// Only receive data frames targeted at this value
    pub wanted_target: String,
    /// Encoded [`crate::Metadata`]
    pub metadata: Bytes,
}

/// Handshake refused for the stream `id`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeRejectedFrame {
    /// Stream id from the refused handshake
    pub id: String,
    /// Human-readable reason
    pub message: String,
}

/// Credential exchange sent before the handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthenticationFrame {
    /// Name of the authentication scheme
    pub auth_name: String,
    /// Credential payload
    pub auth_payload: String,
}

/// Outcome of an [`AuthenticationFrame`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthenticationAckFrame {
    /// Whether the credential was accepted
    pub ok: bool,
    /// Reason for refusal, empty on success
    pub reason: String,
}

/// Routing envelope of a [`DataFrame`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaFrame {
    /// Correlation id, assigned once and preserved across relays
    pub transaction_id: String,
    /// Connection id of the originating source
    pub source_id: String,
    /// Force broadcast delivery regardless of `lb_type`
    pub broadcast: bool,
    /// Delivery policy among resolved subscribers
    pub lb_type: LbType,
    /// Target instance for [`LbType::BindInstance`]
    pub to_instance_id: String,
    /// Encoded [`crate::Metadata`]
    pub metadata: Bytes,
}

impl MetaFrame {
    /// Policy actually applied: `broadcast` overrides `lb_type`.
    pub fn lb_policy(&self) -> LbType {
        if self.broadcast { LbType::Broadcast } else { self.lb_type }
    }
}

/// User payload and its routing tag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PayloadFrame {
    /// Routing key
    pub tag: Tag,
    /// Opaque user bytes
    pub carriage: Bytes,
}

/// Unit of user data in flight.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataFrame {
    /// Routing envelope
    pub meta: MetaFrame,
    /// Tagged payload
    pub payload: PayloadFrame,
}

impl DataFrame {
    /// Data frame with the given tag and carriage and an empty envelope.
    pub fn new(tag: Tag, carriage: impl Into<Bytes>) -> Self {
        Self {
            meta: MetaFrame::default(),
            payload: PayloadFrame { tag, carriage: carriage.into() },
        }
    }

    /// Routing tag of the payload.
    pub fn tag(&self) -> Tag {
        self.payload.tag
    }
}

/// Processing result routed back toward the originating source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackflowFrame {
    /// Tag the result was produced under
    pub tag: Tag,
    /// Result bytes
    pub carriage: Bytes,
    /// Source connection the result belongs to; empty delivers to every
    /// source observing `tag`
    pub source_id: String,
}

/// Request to close a single stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloseStreamFrame {
    /// Stream to close
    pub stream_id: String,
    /// Human-readable reason
    pub reason: String,
}

/// Peer is going away; the receiver should close.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GoawayFrame {
    /// Human-readable reason
    pub message: String,
}

/// Connection-level rejection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RejectedFrame {
    /// Human-readable reason
    pub message: String,
}

/// Redirect: reconnect to `endpoint` instead.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectToFrame {
    /// Address of the zipper to dial
    pub endpoint: String,
}

/// Any frame that can travel on a frame connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// See [`HandshakeFrame`]
    Handshake(HandshakeFrame),
    /// Handshake accepted; carries no fields
    HandshakeAck,
    /// See [`HandshakeRejectedFrame`]
    HandshakeRejected(HandshakeRejectedFrame),
    /// See [`AuthenticationFrame`]
    Authentication(AuthenticationFrame),
    /// See [`AuthenticationAckFrame`]
    AuthenticationAck(AuthenticationAckFrame),
    /// See [`DataFrame`]
    Data(DataFrame),
    /// See [`BackflowFrame`]
    Backflow(BackflowFrame),
    /// See [`CloseStreamFrame`]
    CloseStream(CloseStreamFrame),
    /// See [`GoawayFrame`]
    Goaway(GoawayFrame),
    /// See [`RejectedFrame`]
    Rejected(RejectedFrame),
    /// See [`ConnectToFrame`]
    ConnectTo(ConnectToFrame),
}

macro_rules! impl_from_frame {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Frame {
                fn from(frame: $ty) -> Self {
                    Self::$variant(frame)
                }
            }
        )*
    };
}

impl_from_frame! {
    HandshakeFrame => Handshake,
    HandshakeRejectedFrame => HandshakeRejected,
    AuthenticationFrame => Authentication,
    AuthenticationAckFrame => AuthenticationAck,
    DataFrame => Data,
    BackflowFrame => Backflow,
    CloseStreamFrame => CloseStream,
    GoawayFrame => Goaway,
    RejectedFrame => Rejected,
    ConnectToFrame => ConnectTo,
}

impl Frame {
    /// Type discriminant of this frame.
    pub fn frame_type(&self) -> FrameType {
        match self {
            Self::Handshake(_) => FrameType::Handshake,
            Self::HandshakeAck => FrameType::HandshakeAck,
            Self::HandshakeRejected(_) => FrameType::HandshakeRejected,
            Self::Authentication(_) => FrameType::Authentication,
            Self::AuthenticationAck(_) => FrameType::AuthenticationAck,
            Self::Data(_) => FrameType::Data,
            Self::Backflow(_) => FrameType::Backflow,
            Self::CloseStream(_) => FrameType::CloseStream,
            Self::Goaway(_) => FrameType::Goaway,
            Self::Rejected(_) => FrameType::Rejected,
            Self::ConnectTo(_) => FrameType::ConnectTo,
        }
    }

    /// Append the wire encoding of this frame to `dst`.
    ///
    /// On [`ProtocolError::FrameTooLarge`] `dst` is left as it was.
    pub fn encode(&self, dst: &mut Vec<u8>) -> Result<()> {
        let start = dst.len();
        self.build().finish(dst);

        let size = dst.len() - start;
        if size > MAX_FRAME_SIZE {
            dst.truncate(start);
            return Err(ProtocolError::FrameTooLarge { size, max: MAX_FRAME_SIZE });
        }
        Ok(())
    }

    /// Encode this frame into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = Vec::new();
        self.encode(&mut buf)?;
        Ok(Bytes::from(buf))
    }

    /// Decode exactly one frame from `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge { size: buf.len(), max: MAX_FRAME_SIZE });
        }
        let (packet, used) = read_packet(buf)?;
        if used != buf.len() {
            return Err(ProtocolError::TrailingBytes(buf.len() - used));
        }
        if !packet.node {
            return Err(ProtocolError::UnexpectedPacket { expected: "frame", tag: packet.tag });
        }
        Self::decode_body(packet.tag, packet.value)
    }

    /// Decode a frame whose lead byte and length prefix were already read.
    ///
    /// Stream readers use this after pulling `lead`, the length, and exactly
    /// that many body bytes off the wire.
    pub fn decode_node(lead: u8, body: &[u8]) -> Result<Self> {
        if lead & 0x80 == 0 {
            return Err(ProtocolError::UnexpectedPacket { expected: "frame", tag: lead });
        }
        Self::decode_body(lead & 0x7F, body)
    }

    fn decode_body(tag: u8, body: &[u8]) -> Result<Self> {
        let frame_type = FrameType::from_u8(tag).ok_or(ProtocolError::UnknownFrameType(tag))?;
        let children = Children::new(body);

        let frame = match frame_type {
            FrameType::Handshake => Self::Handshake(HandshakeFrame::decode_fields(children)?),
            FrameType::HandshakeAck => {
                // Fields are ignored but must still be well-formed
                for child in children {
                    child?;
                }
                Self::HandshakeAck
            },
            FrameType::HandshakeRejected => {
                Self::HandshakeRejected(HandshakeRejectedFrame::decode_fields(children)?)
            },
            FrameType::Authentication => {
                Self::Authentication(AuthenticationFrame::decode_fields(children)?)
            },
            FrameType::AuthenticationAck => {
                Self::AuthenticationAck(AuthenticationAckFrame::decode_fields(children)?)
            },
            FrameType::Data => Self::Data(DataFrame::decode_fields(children)?),
            FrameType::Backflow => Self::Backflow(BackflowFrame::decode_fields(children)?),
            FrameType::CloseStream => {
                Self::CloseStream(CloseStreamFrame::decode_fields(children)?)
            },
            FrameType::Goaway => Self::Goaway(GoawayFrame { message: decode_message(children)? }),
            FrameType::Rejected => {
                Self::Rejected(RejectedFrame { message: decode_message(children)? })
            },
            FrameType::ConnectTo => Self::ConnectTo(ConnectToFrame::decode_fields(children)?),
        };
        Ok(frame)
    }

    fn build(&self) -> NodeBuilder {
        let mut node = NodeBuilder::new(self.frame_type().to_u8());
        match self {
            Self::Handshake(f) => f.write_fields(&mut node),
            Self::HandshakeAck => {},
            Self::HandshakeRejected(f) => {
                node.string(field::rejected_handshake::ID, &f.id)
                    .string(field::rejected_handshake::MESSAGE, &f.message);
            },
            Self::Authentication(f) => {
                node.string(field::auth::NAME, &f.auth_name)
                    .string(field::auth::PAYLOAD, &f.auth_payload);
            },
            Self::AuthenticationAck(f) => {
                node.boolean(field::auth_ack::OK, f.ok).string(field::auth_ack::REASON, &f.reason);
            },
            Self::Data(f) => f.write_fields(&mut node),
            Self::Backflow(f) => {
                node.uint32(field::backflow::TAG, f.tag)
                    .bytes(field::backflow::CARRIAGE, &f.carriage)
                    .string(field::backflow::SOURCE_ID, &f.source_id);
            },
            Self::CloseStream(f) => {
                node.string(field::close_stream::STREAM_ID, &f.stream_id)
                    .string(field::close_stream::REASON, &f.reason);
            },
            Self::Goaway(f) => {
                node.string(field::MESSAGE, &f.message);
            },
            Self::Rejected(f) => {
                node.string(field::MESSAGE, &f.message);
            },
            Self::ConnectTo(f) => {
                node.string(field::ENDPOINT, &f.endpoint);
            },
        }
        node
    }
}

fn encode_tags(tags: &[Tag]) -> Vec<u8> {
    let mut out = Vec::with_capacity(tags.len() * 4);
    for tag in tags {
        out.extend_from_slice(U32::new(*tag).as_bytes());
    }
    out
}

fn decode_tags(raw: &[u8]) -> Result<Vec<Tag>> {
    let groups = <[U32]>::ref_from_bytes(raw)
        .map_err(|_| ProtocolError::InvalidFieldValue { field: "observe_data_tags" })?;
    Ok(groups.iter().map(|t| t.get()).collect())
}

fn decode_message(children: Children<'_>) -> Result<String> {
    let mut message = String::new();
    for child in children {
        let child = child?;
        if child.tag == field::MESSAGE {
            message = child.string("message")?;
        }
    }
    Ok(message)
}

impl HandshakeFrame {
    fn write_fields(&self, node: &mut NodeBuilder) {
        use field::handshake as f;
        node.string(f::NAME, &self.name)
            .byte(f::STREAM_TYPE, self.stream_type.to_u8())
            .string(f::ID, &self.id)
            .string(f::AUTH_NAME, &self.auth_name)
            .string(f::AUTH_PAYLOAD, &self.auth_payload)
            .bytes(f::OBSERVE_DATA_TAGS, &encode_tags(&self.observe_data_tags))
            .string(f::VERSION, &self.version)
            .string(f::WANTED_TARGET, &self.wanted_target)
            .bytes(f::METADATA, &self.metadata);
    }

    fn decode_fields(children: Children<'_>) -> Result<Self> {
        use field::handshake as f;
        let mut frame = Self::default();
        for child in children {
            let child = child?;
            match child.tag {
                f::NAME => frame.name = child.string("name")?,
                f::STREAM_TYPE => {
                    let raw = child.byte("stream_type")?;
                    frame.stream_type = StreamType::from_u8(raw)
                        .ok_or(ProtocolError::InvalidFieldValue { field: "stream_type" })?;
                },
                f::ID => frame.id = child.string("id")?,
                f::AUTH_NAME => frame.auth_name = child.string("auth_name")?,
                f::AUTH_PAYLOAD => frame.auth_payload = child.string("auth_payload")?,
                f::OBSERVE_DATA_TAGS => {
                    frame.observe_data_tags = decode_tags(child.raw("observe_data_tags")?)?;
                },
                f::VERSION => frame.version = child.string("version")?,
                f::WANTED_TARGET => frame.wanted_target = child.string("wanted_target")?,
                f::METADATA => frame.metadata = child.bytes("metadata")?,
                _ => {},
            }
        }
        Ok(frame)
    }
}

impl HandshakeRejectedFrame {
    fn decode_fields(children: Children<'_>) -> Result<Self> {
        use field::rejected_handshake as f;
        let mut frame = Self::default();
        for child in children {
            let child = child?;
            match child.tag {
                f::ID => frame.id = child.string("id")?,
                f::MESSAGE => frame.message = child.string("message")?,
                _ => {},
            }
        }
        Ok(frame)
    }
}

impl AuthenticationFrame {
    fn decode_fields(children: Children<'_>) -> Result<Self> {
        use field::auth as f;
        let mut frame = Self::default();
        for child in children {
            let child = child?;
            match child.tag {
                f::NAME => frame.auth_name = child.string("auth_name")?,
                f::PAYLOAD => frame.auth_payload = child.string("auth_payload")?,
                _ => {},
            }
        }
        Ok(frame)
    }
}

impl AuthenticationAckFrame {
    fn decode_fields(children: Children<'_>) -> Result<Self> {
        use field::auth_ack as f;
        let mut frame = Self::default();
        for child in children {
            let child = child?;
            match child.tag {
                f::OK => frame.ok = child.boolean("ok")?,
                f::REASON => frame.reason = child.string("reason")?,
                _ => {},
            }
        }
        Ok(frame)
    }
}

impl DataFrame {
    fn write_fields(&self, node: &mut NodeBuilder) {
        let mut meta = NodeBuilder::new(field::data::META);
        meta.string(field::meta::TRANSACTION_ID, &self.meta.transaction_id)
            .string(field::meta::SOURCE_ID, &self.meta.source_id)
            .bytes(field::meta::METADATA, &self.meta.metadata)
            .boolean(field::meta::BROADCAST, self.meta.broadcast)
            .byte(field::meta::LB_TYPE, self.meta.lb_type.to_u8())
            .string(field::meta::TO_INSTANCE_ID, &self.meta.to_instance_id);

        let mut payload = NodeBuilder::new(field::data::PAYLOAD);
        payload
            .uint32(field::payload::TAG, self.payload.tag)
            .bytes(field::payload::CARRIAGE, &self.payload.carriage);

        node.node(meta).node(payload);
    }

    fn decode_fields(children: Children<'_>) -> Result<Self> {
        let mut frame = Self::default();
        for child in children {
            let child = child?;
            match child.tag {
                field::data::META => frame.meta = MetaFrame::decode_fields(child.children("meta")?)?,
                field::data::PAYLOAD => {
                    frame.payload = PayloadFrame::decode_fields(child.children("payload")?)?;
                },
                _ => {},
            }
        }
        Ok(frame)
    }
}

impl MetaFrame {
    fn decode_fields(children: Children<'_>) -> Result<Self> {
        use field::meta as f;
        let mut meta = Self::default();
        for child in children {
            let child = child?;
            match child.tag {
                f::TRANSACTION_ID => meta.transaction_id = child.string("transaction_id")?,
                f::SOURCE_ID => meta.source_id = child.string("source_id")?,
                f::METADATA => meta.metadata = child.bytes("metadata")?,
                f::BROADCAST => meta.broadcast = child.boolean("broadcast")?,
                f::LB_TYPE => {
                    meta.lb_type = LbType::from_u8(child.byte("lb_type")?)
                        .ok_or(ProtocolError::InvalidFieldValue { field: "lb_type" })?;
                },
                f::TO_INSTANCE_ID => meta.to_instance_id = child.string("to_instance_id")?,
                _ => {},
            }
        }
        Ok(meta)
    }
}

impl PayloadFrame {
    fn decode_fields(children: Children<'_>) -> Result<Self> {
        use field::payload as f;
        let mut payload = Self::default();
        for child in children {
            let child = child?;
            match child.tag {
                f::TAG => payload.tag = child.uint32("tag")?,
                f::CARRIAGE => payload.carriage = child.bytes("carriage")?,
                _ => {},
            }
        }
        Ok(payload)
    }
}

impl BackflowFrame {
    fn decode_fields(children: Children<'_>) -> Result<Self> {
        use field::backflow as f;
        let mut frame = Self::default();
        for child in children {
            let child = child?;
            match child.tag {
                f::TAG => frame.tag = child.uint32("tag")?,
                f::CARRIAGE => frame.carriage = child.bytes("carriage")?,
                f::SOURCE_ID => frame.source_id = child.string("source_id")?,
                _ => {},
            }
        }
        Ok(frame)
    }
}

impl CloseStreamFrame {
    fn decode_fields(children: Children<'_>) -> Result<Self> {
        use field::close_stream as f;
        let mut frame = Self::default();
        for child in children {
            let child = child?;
            match child.tag {
                f::STREAM_ID => frame.stream_id = child.string("stream_id")?,
                f::REASON => frame.reason = child.string("reason")?,
                _ => {},
            }
        }
        Ok(frame)
    }
}

impl ConnectToFrame {
    fn decode_fields(children: Children<'_>) -> Result<Self> {
        let mut frame = Self::default();
        for child in children {
            let child = child?;
            if child.tag == field::ENDPOINT {
                frame.endpoint = child.string("endpoint")?;
            }
        }
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_type_round_trips_through_tag() {
        for ty in [
            FrameType::Authentication,
            FrameType::AuthenticationAck,
            FrameType::HandshakeRejected,
            FrameType::HandshakeAck,
            FrameType::Backflow,
            FrameType::Goaway,
            FrameType::Handshake,
            FrameType::Rejected,
            FrameType::CloseStream,
            FrameType::ConnectTo,
            FrameType::Data,
        ] {
            assert_eq!(FrameType::from_u8(ty.to_u8()), Some(ty));
        }
        assert_eq!(FrameType::from_u8(0x00), None);
    }

    #[test]
    fn broadcast_flag_overrides_lb_type() {
        let meta = MetaFrame { broadcast: true, lb_type: LbType::RandomPick, ..Default::default() };
        assert_eq!(meta.lb_policy(), LbType::Broadcast);

        let meta = MetaFrame { lb_type: LbType::BindInstance, ..Default::default() };
        assert_eq!(meta.lb_policy(), LbType::BindInstance);
    }

    #[test]
    fn tag_list_must_be_whole_groups() {
        assert_eq!(decode_tags(&[]), Ok(vec![]));
        assert_eq!(decode_tags(&[0x10, 0, 0, 0, 0x01, 0x02, 0, 0]), Ok(vec![0x10, 0x0201]));
        assert_eq!(
            decode_tags(&[1, 2, 3]),
            Err(ProtocolError::InvalidFieldValue { field: "observe_data_tags" })
        );
    }

    #[test]
    fn encode_leaves_buffer_untouched_when_too_large() {
        let frame = Frame::Data(DataFrame::new(1, vec![0u8; MAX_FRAME_SIZE]));
        let mut buf = vec![0xAA];
        let err = frame.encode(&mut buf);
        assert!(matches!(err, Err(ProtocolError::FrameTooLarge { .. })));
        assert_eq!(buf, [0xAA]);
    }
}
