//! Golden encodings and decode error classification.
//!
//! The byte strings here are what existing peers put on the wire; any change
//! to them is a compatibility break.

use bytes::Bytes;
use hex_literal::hex;
use zipline_proto::{
    BackflowFrame, ConnectToFrame, DataFrame, Frame, GoawayFrame, HandshakeFrame, LbType,
    MetaFrame, PayloadFrame, ProtocolError, RejectedFrame, StreamType,
};

fn encode(frame: &Frame) -> Vec<u8> {
    let mut buf = Vec::new();
    frame.encode(&mut buf).unwrap();
    buf
}

#[test]
fn handshake_ack_golden() {
    let bytes = encode(&Frame::HandshakeAck);
    assert_eq!(bytes, hex!("a9 00"));
    assert_eq!(Frame::decode(&bytes).unwrap(), Frame::HandshakeAck);
}

#[test]
fn rejected_golden() {
    let frame = Frame::Rejected(RejectedFrame { message: "rejected error".into() });
    let bytes = encode(&frame);
    assert_eq!(bytes[..4], hex!("b9 10 01 0e"));
    assert_eq!(&bytes[4..], b"rejected error");
    assert_eq!(Frame::decode(&bytes).unwrap(), frame);
}

#[test]
fn goaway_golden() {
    let frame = Frame::Goaway(GoawayFrame { message: "goaway error".into() });
    let bytes = encode(&frame);
    insta::assert_snapshot!(hex::encode(&bytes), @"ae0e010c676f61776179206572726f72");
    assert_eq!(Frame::decode(&bytes).unwrap(), frame);
}

#[test]
fn connect_to_golden() {
    let frame = Frame::ConnectTo(ConnectToFrame { endpoint: "11.11.11.11:8080".into() });
    let bytes = encode(&frame);
    assert_eq!(bytes[..4], hex!("be 12 01 10"));
    assert_eq!(&bytes[4..], b"11.11.11.11:8080");
}

#[test]
fn data_frame_layout() {
    let frame = Frame::Data(DataFrame {
        meta: MetaFrame {
            transaction_id: "t-1".into(),
            source_id: "src-1".into(),
            ..Default::default()
        },
        payload: PayloadFrame { tag: 0x10, carriage: Bytes::from_static(b"hi") },
    });
    let bytes = encode(&frame);
    insta::assert_snapshot!(
        hex::encode(&bytes),
        @"bf21af160103742d3102057372632d3103000401000501000600ae0701011002026869"
    );
    assert_eq!(Frame::decode(&bytes).unwrap(), frame);
}

#[test]
fn handshake_layout() {
    let frame = Frame::Handshake(HandshakeFrame {
        name: "sfn-1".into(),
        id: "id-1".into(),
        stream_type: StreamType::StreamFunction,
        observe_data_tags: vec![0x10, 0x61],
        ..Default::default()
    });
    let bytes = encode(&frame);
    insta::assert_snapshot!(
        hex::encode(&bytes),
        @"b124010573666e2d3102015d030469642d310400050006081000000061000000070008000900"
    );
    assert_eq!(Frame::decode(&bytes).unwrap(), frame);
}

#[test]
fn backflow_tag_uses_two_byte_varint() {
    let frame = Frame::Backflow(BackflowFrame {
        tag: 0x61,
        carriage: Bytes::from_static(b"ok"),
        source_id: String::new(),
    });
    assert_eq!(encode(&frame), hex!("ad 0a 01 02 80 61 02 02 6f 6b 03 00"));
}

#[test]
fn fields_decode_in_any_order_and_unknown_tags_are_skipped() {
    // Goaway with an unknown field 0x7A before the message
    let bytes = hex!("ae 07 7a 02 ff ff 01 01 78");
    assert_eq!(
        Frame::decode(&bytes).unwrap(),
        Frame::Goaway(GoawayFrame { message: "x".into() })
    );
}

#[test]
fn absent_fields_decode_to_defaults() {
    let frame = Frame::decode(&hex!("bf 00")).unwrap();
    assert_eq!(frame, Frame::Data(DataFrame::default()));
    assert_eq!(DataFrame::default().meta.lb_policy(), LbType::Broadcast);
}

#[test]
fn truncated_buffers_are_rejected() {
    let bytes = encode(&Frame::Goaway(GoawayFrame { message: "goaway error".into() }));
    for cut in 0..bytes.len() {
        let err = Frame::decode(&bytes[..cut]).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { .. }), "cut {cut}: {err:?}");
    }
}

#[test]
fn malformed_lengths_are_rejected() {
    // Negative length
    assert_eq!(Frame::decode(&hex!("ae 7f")), Err(ProtocolError::MalformedLength));
    // Six continuation groups
    assert_eq!(
        Frame::decode(&hex!("ae 81 81 81 81 81 01")),
        Err(ProtocolError::MalformedLength)
    );
}

#[test]
fn unknown_frame_type_is_rejected() {
    assert_eq!(Frame::decode(&hex!("a0 00")), Err(ProtocolError::UnknownFrameType(0x20)));
}

#[test]
fn primitive_at_top_level_is_rejected() {
    assert_eq!(
        Frame::decode(&hex!("2e 00")),
        Err(ProtocolError::UnexpectedPacket { expected: "frame", tag: 0x2e })
    );
}

#[test]
fn trailing_bytes_are_rejected() {
    assert_eq!(Frame::decode(&hex!("a9 00 00")), Err(ProtocolError::TrailingBytes(1)));
}

#[test]
fn invalid_enum_values_are_rejected() {
    // Handshake with stream_type 0x01
    assert_eq!(
        Frame::decode(&hex!("b1 03 02 01 01")),
        Err(ProtocolError::InvalidFieldValue { field: "stream_type" })
    );
}

#[test]
fn invalid_utf8_is_rejected() {
    assert_eq!(
        Frame::decode(&hex!("b9 03 01 01 ff")),
        Err(ProtocolError::InvalidUtf8 { field: "message" })
    );
}
