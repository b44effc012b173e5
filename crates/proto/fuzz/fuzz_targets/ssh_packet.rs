//! Fuzz target for the SSH binary packet opener.
//!
//! Feeds arbitrary bytes to a plaintext [`PacketOpener`] and looks for
//! panics or runaway buffering. Any payload that opens must survive a
//! seal/open round trip.
//!
//! Run with:
//! ```bash
//! cd crates/proto
//! cargo +nightly fuzz run ssh_packet -- -max_total_time=300
//! ```

#![no_main]
use bytes::BytesMut;
use kestrel_proto::ssh::packet::{PacketOpener, PacketSealer};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut opener = PacketOpener::new();
    let mut input = BytesMut::from(data);

    while let Ok(Some((_, payload))) = opener.open(&mut input) {
        let mut sealer = PacketSealer::new();
        let mut reopener = PacketOpener::new();
        let mut wire = BytesMut::new();
        sealer.seal(&payload, &mut wire).expect("opened payload must seal");
        let (_, reopened) = reopener
            .open(&mut wire)
            .expect("sealed packet must open")
            .expect("sealed packet is complete");
        assert_eq!(payload, reopened);
    }
});
