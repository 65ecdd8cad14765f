#![no_main]

use libfuzzer_sys::fuzz_target;
use respoke_client::transports::Handshake;

fuzz_target!(|data: &[u8]| {
    if let Ok(body) = std::str::from_utf8(data) {
        let _ = Handshake::parse(body);
    }
});
