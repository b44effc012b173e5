//! Fuzz target for SFTP request framing and parsing.
//!
//! Run with:
//! ```bash
//! cd crates/proto
//! cargo +nightly fuzz run sftp_request -- -max_total_time=300
//! ```

#![no_main]
use kestrel_proto::ssh::sftp::{Framer, Request};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Parse the input directly as a packet body.
    if let Ok(request) = Request::parse(data) {
        let encoded = request.to_bytes();
        let reparsed = Request::parse(&encoded[4..]).expect("encoded request must parse");
        assert_eq!(request.id(), reparsed.id());
    }

    // And as a stream of length-prefixed packets.
    let mut framer = Framer::default();
    framer.push(data);
    while let Ok(Some(body)) = framer.next_packet() {
        let _ = Request::parse(&body);
    }
});
