//! Fuzz target for search recipe parsing.

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = keel_server::parse_recipe(data);
});
