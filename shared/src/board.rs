//! Deterministic board generation
//!
//! A board is a seeded Fisher–Yates shuffle of the valid challenge pool,
//! truncated to the board size. The seed is the run id, so anyone holding the
//! run id and the same pool ordering can recompute the board offline.
//!
//! The random source is a 32-bit rolling string hash feeding a Park–Miller
//! style linear congruential generator. Both must stay bit-exact: boards
//! created before any change here are re-derived from their ids.

use crate::{Challenge, ChallengeId, BOARD_SIZE};
use std::collections::HashSet;

const LCG_MULTIPLIER: i64 = 16_807;
const LCG_MODULUS: i64 = 2_147_483_647;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BoardError {
    #[error(
        "Need at least {required} challenges to create a bingo board. Currently have {available} valid challenges."
    )]
    InsufficientPool { available: usize, required: usize },
}

/// Rolling `hash * 31 + unit` over UTF-16 code units, wrapping at 32 bits.
pub fn seed_hash(seed: &str) -> i32 {
    seed.encode_utf16().fold(0i32, |hash, unit| {
        (hash << 5).wrapping_sub(hash).wrapping_add(i32::from(unit))
    })
}

#[derive(Debug, Clone)]
pub struct SeededRng {
    state: i64,
}

impl SeededRng {
    pub fn from_seed(seed: &str) -> Self {
        Self::from_hash(seed_hash(seed))
    }

    /// Hashes outside `1..LCG_MODULUS` would pin the generator at zero or
    /// drive it negative, so they are folded into the valid state range.
    pub fn from_hash(hash: i32) -> Self {
        let state = i64::from(hash).rem_euclid(LCG_MODULUS);
        Self {
            state: if state == 0 { 1 } else { state },
        }
    }

    /// Next value in `[0, 1)`.
    pub fn next_f64(&mut self) -> f64 {
        self.state = self.state * LCG_MULTIPLIER % LCG_MODULUS;
        (self.state - 1) as f64 / (LCG_MODULUS - 1) as f64
    }

    /// Next index in `0..bound`.
    pub fn next_index(&mut self, bound: usize) -> usize {
        (self.next_f64() * bound as f64).floor() as usize
    }
}

pub fn shuffle<T>(items: &mut [T], rng: &mut SeededRng) {
    for i in (1..items.len()).rev() {
        let j = rng.next_index(i + 1);
        items.swap(i, j);
    }
}

/// Picks `size` distinct challenges from `pool` for the given seed.
///
/// Invalid entries are skipped, and a repeated id keeps only its first
/// occurrence. Fails when fewer than `size` usable challenges remain,
/// reporting how many there are.
pub fn generate(seed: &str, pool: &[Challenge], size: usize) -> Result<Vec<Challenge>, BoardError> {
    let mut seen: HashSet<ChallengeId> = HashSet::new();
    let mut candidates: Vec<Challenge> = pool
        .iter()
        .filter(|challenge| challenge.is_valid() && seen.insert(challenge.id))
        .cloned()
        .collect();

    if candidates.len() < size {
        return Err(BoardError::InsufficientPool {
            available: candidates.len(),
            required: size,
        });
    }

    let mut rng = SeededRng::from_seed(seed);
    shuffle(&mut candidates, &mut rng);
    candidates.truncate(size);
    Ok(candidates)
}

pub fn generate_board(seed: &str, pool: &[Challenge]) -> Result<Vec<Challenge>, BoardError> {
    generate(seed, pool, BOARD_SIZE)
}
