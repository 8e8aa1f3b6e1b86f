//! Deterministic RNG utilities for reproducible tests.

use std::ops::Range;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Create a deterministic `ChaCha8Rng` from a seed.
///
/// All test randomization should go through this to ensure reproducibility.
pub fn seeded_rng(seed: u64) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed)
}

/// `dim` floats drawn uniformly from `range`.
pub fn uniform_vec(rng: &mut impl Rng, dim: usize, range: Range<f32>) -> Vec<f32> {
    (0..dim).map(|_| rng.gen_range(range.clone())).collect()
}

/// Cut `bytes` into consecutive chunks of 1..=`max_chunk` bytes.
///
/// Simulates a stream delivered over several short reads.
pub fn random_chunks<'a>(rng: &mut impl Rng, bytes: &'a [u8], max_chunk: usize) -> Vec<&'a [u8]> {
    let max_chunk = max_chunk.max(1);
    let mut chunks = Vec::new();
    let mut rest = bytes;
    while !rest.is_empty() {
        let len = rng.gen_range(1..=max_chunk).min(rest.len());
        let (head, tail) = rest.split_at(len);
        chunks.push(head);
        rest = tail;
    }
    chunks
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
