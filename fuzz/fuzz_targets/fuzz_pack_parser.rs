//! Fuzz target for the pack container push parser.
//!
//! Tests that the parser handles arbitrary input without panicking.

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut parser = keel_pack::PushParser::new();
    if parser.accept_bytes(data).is_ok() {
        let _ = parser.read_pending_records();
    }
});
