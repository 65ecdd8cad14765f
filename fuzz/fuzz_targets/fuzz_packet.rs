#![no_main]

use libfuzzer_sys::fuzz_target;
use respoke_client::transports::Packet;

fuzz_target!(|data: &[u8]| {
    let Ok(frame) = std::str::from_utf8(data) else {
        return;
    };
    // Anything that decodes must encode again without error.
    if let Ok(packet) = Packet::decode(frame) {
        let _ = packet.encode();
    }
});
