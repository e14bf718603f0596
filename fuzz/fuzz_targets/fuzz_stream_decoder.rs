//! Fuzz target for the record stream decoder.
//!
//! Feeds arbitrary bytes at arbitrary chunk boundaries and drives the
//! grouping layer to exhaustion.

#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // The first byte picks the chunking granularity.
    let chunk_size = (*data.first().unwrap_or(&1) as usize).max(1);
    let chunks: Vec<Bytes> = data.chunks(chunk_size).map(Bytes::copy_from_slice).collect();

    let mut decoder = keel_pack::StreamDecoder::new(chunks.into_iter());
    if decoder.read_format_name().is_err() {
        return;
    }
    while let Ok(Some(_)) = decoder.next_keyed_record() {}
});
