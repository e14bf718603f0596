//! Streaming compressed-size estimation.
//!
//! Bulk graph verbs cap their response near a compressed-size budget
//! without compressing the final payload twice: content is fed through a
//! zlib compressor that discards its output but counts it.

use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{self, Write};

/// Flush the compressor once this much content is pending, so the
/// output count tracks reality instead of the compressor's buffer.
const FLUSH_THRESHOLD: u64 = 32 * 1024;

/// Estimates the compressed size of content added so far.
pub struct ZlibEstimator {
    encoder: ZlibEncoder<io::Sink>,
    max_size: u64,
    unflushed: u64,
}

impl ZlibEstimator {
    /// Creates an estimator that is [`full`](Self::full) once the
    /// compressed size reaches `max_size` bytes.
    pub fn new(max_size: u64) -> Self {
        Self {
            encoder: ZlibEncoder::new(io::sink(), Compression::default()),
            max_size,
            unflushed: 0,
        }
    }

    /// Feeds content into the estimate.
    pub fn add_content(&mut self, content: &[u8]) -> io::Result<()> {
        self.encoder.write_all(content)?;
        self.unflushed += content.len() as u64;
        if self.unflushed >= FLUSH_THRESHOLD {
            self.encoder.flush()?;
            self.unflushed = 0;
        }
        Ok(())
    }

    /// True once the estimated compressed size has reached the budget.
    pub fn full(&mut self) -> io::Result<bool> {
        if self.encoder.total_out() >= self.max_size {
            return Ok(true);
        }
        if self.unflushed > 0 {
            self.encoder.flush()?;
            self.unflushed = 0;
        }
        Ok(self.encoder.total_out() >= self.max_size)
    }

    /// Total content bytes fed in so far.
    pub fn total_in(&self) -> u64 {
        self.encoder.total_in()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compressible_content_stays_below_budget() {
        let mut estimator = ZlibEstimator::new(4096);
        for _ in 0..64 {
            estimator.add_content(&[0u8; 1024]).unwrap();
        }
        // 64 KiB of zeros compresses far below 4 KiB.
        assert!(!estimator.full().unwrap());
    }

    #[test]
    fn incompressible_content_fills_the_budget() {
        let mut estimator = ZlibEstimator::new(4096);
        // A cheap pseudo-random sequence that zlib cannot shrink much.
        let mut state: u32 = 0x12345678;
        let mut chunk = [0u8; 1024];
        for _ in 0..16 {
            for byte in chunk.iter_mut() {
                state = state.wrapping_mul(1664525).wrapping_add(1013904223);
                *byte = (state >> 24) as u8;
            }
            estimator.add_content(&chunk).unwrap();
        }
        assert!(estimator.full().unwrap());
    }

    #[test]
    fn total_in_counts_content() {
        let mut estimator = ZlibEstimator::new(1024);
        estimator.add_content(b"hello").unwrap();
        assert_eq!(estimator.total_in(), 5);
    }
}
