//! Connection and frame metadata arrives from untrusted peers as CBOR.

#![no_main]

use libfuzzer_sys::fuzz_target;
use zipline_proto::Metadata;

fuzz_target!(|data: &[u8]| {
    if let Ok(metadata) = Metadata::decode(data) {
        let bytes = metadata.encode().expect("decoded metadata re-encodes");
        assert_eq!(Metadata::decode(&bytes).expect("round trip"), metadata);
        let _ = metadata.target();
    }
});
