//! Arbitrary bytes must never panic the frame decoder, and anything it
//! accepts must survive re-encoding.

#![no_main]

use libfuzzer_sys::fuzz_target;
use zipline_proto::Frame;

fuzz_target!(|data: &[u8]| {
    let Ok(frame) = Frame::decode(data) else {
        return;
    };
    let bytes = frame.to_bytes().expect("decoded frame re-encodes");
    let again = Frame::decode(&bytes).expect("re-encoded frame decodes");
    assert_eq!(frame, again);

    // The stream path splits off the lead byte and length prefix first
    if let Some((&lead, _)) = data.split_first() {
        let _ = Frame::decode_node(lead, &data[1..]);
    }
});
