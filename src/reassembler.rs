//! Reassembly of out-of-order acceleration chunks.

use std::collections::BTreeMap;

use crate::protocol::{Chunk, Sample};

/// Chunks of one capture attempt, keyed by sequence number.
///
/// Arrival order is irrelevant: [`flatten`](Self::flatten) always walks the
/// sequence numbers in ascending order. A repeated sequence number replaces the
/// earlier chunk.
#[derive(Debug, Default, Clone)]
pub struct ChunkReassembler {
    chunks: BTreeMap<u8, Vec<Sample>>,
}

impl ChunkReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a chunk, replacing any chunk already recorded under its sequence number.
    pub fn record(&mut self, chunk: Chunk) {
        self.chunks.insert(chunk.seq, chunk.samples);
    }

    /// All recorded samples in sequence order.
    pub fn flatten(&self) -> Vec<Sample> {
        let mut out = Vec::with_capacity(self.sample_count());
        for samples in self.chunks.values() {
            out.extend_from_slice(samples);
        }
        out
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn sample_count(&self) -> usize {
        self.chunks.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Sequence numbers in `0..expected` that were never recorded.
    pub fn missing(&self, expected: usize) -> Vec<u8> {
        (0..expected.min(256))
            .map(|seq| seq as u8)
            .filter(|seq| !self.chunks.contains_key(seq))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(seq: u8, base: f64, n: usize) -> Chunk {
        Chunk {
            seq,
            samples: (1..=n)
                .map(|i| {
                    let k = base + i as f64;
                    Sample::new(0.1 * k, 0.2 * k, 0.3 * k)
                })
                .collect(),
        }
    }

    #[test]
    fn flatten_orders_by_sequence_number() {
        // Chunks arrive as 2, 0, 1.
        let mut r = ChunkReassembler::new();
        for seq in [2u8, 0, 1] {
            r.record(chunk(seq, seq as f64 * 10.0, 3));
        }

        let samples = r.flatten();
        assert_eq!(samples.len(), 9);
        assert_eq!(&samples[0..3], chunk(0, 0.0, 3).samples.as_slice());
        assert_eq!(&samples[3..6], chunk(1, 10.0, 3).samples.as_slice());
        assert_eq!(&samples[6..9], chunk(2, 20.0, 3).samples.as_slice());
    }

    #[test]
    fn flatten_is_independent_of_record_order() {
        let seqs = [0u8, 1, 2, 3];
        let orders: [[usize; 4]; 6] = [
            [0, 1, 2, 3],
            [3, 2, 1, 0],
            [1, 3, 0, 2],
            [2, 0, 3, 1],
            [3, 0, 2, 1],
            [1, 0, 3, 2],
        ];

        let mut reference = ChunkReassembler::new();
        for &seq in &seqs {
            reference.record(chunk(seq, seq as f64, 2));
        }
        let expected = reference.flatten();

        for order in orders {
            let mut r = ChunkReassembler::new();
            for idx in order {
                let seq = seqs[idx];
                r.record(chunk(seq, seq as f64, 2));
            }
            assert_eq!(r.flatten(), expected, "order {:?}", order);
        }
    }

    #[test]
    fn duplicate_sequence_last_write_wins() {
        let mut r = ChunkReassembler::new();
        r.record(chunk(4, 0.0, 3));
        r.record(chunk(4, 100.0, 1));
        assert_eq!(r.chunk_count(), 1);
        assert_eq!(r.flatten(), chunk(4, 100.0, 1).samples);
    }

    #[test]
    fn clear_and_counts() {
        let mut r = ChunkReassembler::new();
        assert!(r.is_empty());
        r.record(chunk(0, 0.0, 3));
        r.record(chunk(1, 0.0, 0));
        assert_eq!(r.chunk_count(), 2);
        assert_eq!(r.sample_count(), 3);
        r.clear();
        assert!(r.is_empty());
        assert!(r.flatten().is_empty());
    }

    #[test]
    fn missing_reports_gaps() {
        let mut r = ChunkReassembler::new();
        for seq in [0u8, 2, 3] {
            r.record(chunk(seq, 0.0, 1));
        }
        assert_eq!(r.missing(5), vec![1, 4]);
    }
}
