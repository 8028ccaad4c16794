//! Property tests: every frame decodes back to itself.

use bytes::Bytes;
use proptest::prelude::*;
use zipline_proto::{
    AuthenticationAckFrame, AuthenticationFrame, BackflowFrame, CloseStreamFrame, ConnectToFrame,
    DataFrame, Frame, GoawayFrame, HandshakeFrame, HandshakeRejectedFrame, LbType, MetaFrame,
    Metadata, PayloadFrame, RejectedFrame, StreamType,
};

fn bytes_strategy() -> impl Strategy<Value = Bytes> {
    prop::collection::vec(any::<u8>(), 0..256).prop_map(Bytes::from)
}

fn stream_type_strategy() -> impl Strategy<Value = StreamType> {
    prop_oneof![
        Just(StreamType::Source),
        Just(StreamType::UpstreamZipper),
        Just(StreamType::StreamFunction),
    ]
}

fn lb_type_strategy() -> impl Strategy<Value = LbType> {
    prop_oneof![Just(LbType::Broadcast), Just(LbType::RandomPick), Just(LbType::BindInstance)]
}

fn handshake_strategy() -> impl Strategy<Value = HandshakeFrame> {
    (
        (".*", ".*", stream_type_strategy(), prop::collection::vec(any::<u32>(), 0..16)),
        (".*", ".*", ".*", ".*", bytes_strategy()),
    )
        .prop_map(
            |(
                (name, id, stream_type, observe_data_tags),
                (auth_name, auth_payload, version, wanted_target, metadata),
            )| HandshakeFrame {
                name,
                id,
                stream_type,
                observe_data_tags,
                auth_name,
                auth_payload,
                version,
                wanted_target,
                metadata,
            },
        )
}

fn data_strategy() -> impl Strategy<Value = DataFrame> {
    (
        (".*", ".*", any::<bool>(), lb_type_strategy(), ".*", bytes_strategy()),
        (any::<u32>(), bytes_strategy()),
    )
        .prop_map(
            |(
                (transaction_id, source_id, broadcast, lb_type, to_instance_id, metadata),
                (tag, carriage),
            )| DataFrame {
                meta: MetaFrame {
                    transaction_id,
                    source_id,
                    broadcast,
                    lb_type,
                    to_instance_id,
                    metadata,
                },
                payload: PayloadFrame { tag, carriage },
            },
        )
}

fn frame_strategy() -> impl Strategy<Value = Frame> {
    prop_oneof![
        handshake_strategy().prop_map(Frame::Handshake),
        Just(Frame::HandshakeAck),
        (".*", ".*").prop_map(|(id, message)| {
            Frame::HandshakeRejected(HandshakeRejectedFrame { id, message })
        }),
        (".*", ".*").prop_map(|(auth_name, auth_payload)| {
            Frame::Authentication(AuthenticationFrame { auth_name, auth_payload })
        }),
        (any::<bool>(), ".*")
            .prop_map(|(ok, reason)| Frame::AuthenticationAck(AuthenticationAckFrame { ok, reason })),
        data_strategy().prop_map(Frame::Data),
        (any::<u32>(), bytes_strategy(), ".*").prop_map(|(tag, carriage, source_id)| {
            Frame::Backflow(BackflowFrame { tag, carriage, source_id })
        }),
        (".*", ".*").prop_map(|(stream_id, reason)| {
            Frame::CloseStream(CloseStreamFrame { stream_id, reason })
        }),
        ".*".prop_map(|message| Frame::Goaway(GoawayFrame { message })),
        ".*".prop_map(|message| Frame::Rejected(RejectedFrame { message })),
        ".*".prop_map(|endpoint| Frame::ConnectTo(ConnectToFrame { endpoint })),
    ]
}

proptest! {
    #[test]
    fn prop_frame_round_trip(frame in frame_strategy()) {
        let bytes = frame.to_bytes().unwrap();
        prop_assert_eq!(Frame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn prop_decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = Frame::decode(&bytes);
    }

    #[test]
    fn prop_metadata_round_trip(
        entries in prop::collection::btree_map(".*", ".*", 0..8)
    ) {
        let meta: Metadata = entries.into_iter().collect();
        let bytes = meta.encode().unwrap();
        prop_assert_eq!(Metadata::decode(&bytes).unwrap(), meta);
    }
}

#[test]
fn large_carriage_round_trips() {
    let frame = Frame::Data(DataFrame::new(7, vec![0x5A; 1 << 20]));
    let bytes = frame.to_bytes().unwrap();
    assert_eq!(Frame::decode(&bytes).unwrap(), frame);
}
