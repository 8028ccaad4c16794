//! Wire format for the zipline dispatch fabric.
//!
//! Frames are encoded as a tree of tagged-length-value packets. Each frame is
//! one node packet whose tag identifies the frame type; its children are the
//! frame's fields, keyed by per-frame field tags. Data frames nest two more
//! nodes: the routing envelope ([`MetaFrame`]) and the tagged payload
//! ([`PayloadFrame`]).
//!
//! The codec is pure: no I/O, no state. Decoding walks the outer node,
//! dispatches on the frame type, and reads fields in any order, skipping tags
//! it does not recognize.
//!
//! # Security
//!
//! Every length prefix is bounds-checked before slicing. Frames larger than
//! [`MAX_FRAME_SIZE`] are refused on both encode and decode. Malformed input
//! is always an error, never a panic.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod errors;
pub mod frame;
pub mod metadata;
pub mod packet;

pub use errors::{ProtocolError, Result};
pub use frame::{
    AuthenticationAckFrame, AuthenticationFrame, BackflowFrame, CloseStreamFrame, ConnectToFrame,
    DataFrame, Frame, FrameType, GoawayFrame, HandshakeFrame, HandshakeRejectedFrame, LbType,
    MAX_FRAME_SIZE, MetaFrame, PayloadFrame, RejectedFrame, StreamType, Tag,
};
pub use metadata::{Metadata, TARGET_KEY};
