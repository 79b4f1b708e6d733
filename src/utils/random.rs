//! Deterministic random number generator for tie-breaks and sampling.
//!
//! This module provides a seeded pseudo-random number generator whose entire
//! state can be captured as `(seed, steps)` and replayed on load. Every public
//! draw consumes exactly one step of the underlying generator, so a replayed
//! instance continues the exact sequence of the original.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// A seeded, replayable pseudo-random number generator.
///
/// All random decisions of the temporal memory (winner-cell tie-breaks,
/// without-replacement sampling for synapse growth) draw from a single
/// instance of this generator, which keeps runs reproducible for a given seed.
///
/// # Example
///
/// ```rust
/// use veles::utils::Random;
///
/// let mut rng = Random::new(42);
///
/// // Generate random integers
/// let n = rng.get_uint32();
///
/// // Sample from a range
/// let idx = rng.get_uint32_range(0, 100);
///
/// // Shuffle a vector
/// let mut items: Vec<u32> = (0..10).collect();
/// rng.shuffle(&mut items);
/// ```
pub struct Random {
    rng: ChaCha20Rng,
    seed: u64,
    /// Number of draws taken so far (for state reconstruction).
    steps: u64,
}

// Custom serialization for Random - we serialize seed and steps,
// then reconstruct the RNG state on deserialization.
#[cfg(feature = "serde")]
mod serde_impl {
    use super::*;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    struct RandomState {
        seed: u64,
        steps: u64,
    }

    impl Serialize for Random {
        fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            let state = RandomState {
                seed: self.seed,
                steps: self.steps,
            };
            state.serialize(serializer)
        }
    }

    impl<'de> Deserialize<'de> for Random {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            let state = RandomState::deserialize(deserializer)?;
            Ok(Random::from_state(state.seed, state.steps))
        }
    }
}

impl Random {
    /// Creates a new random number generator with the given seed.
    ///
    /// A negative seed selects a seed from system randomness; any
    /// non-negative seed produces a deterministic sequence.
    #[must_use]
    pub fn new(seed: i64) -> Self {
        let actual_seed = if seed < 0 {
            rand::thread_rng().gen()
        } else {
            seed as u64
        };

        Self {
            rng: ChaCha20Rng::seed_from_u64(actual_seed),
            seed: actual_seed,
            steps: 0,
        }
    }

    /// Creates a random number generator with a random seed.
    #[must_use]
    pub fn with_random_seed() -> Self {
        Self::new(-1)
    }

    /// Reconstructs a generator from a `(seed, steps)` snapshot by replaying
    /// the recorded number of draws.
    #[must_use]
    pub fn from_state(seed: u64, steps: u64) -> Self {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        for _ in 0..steps {
            let _: u64 = rng.gen();
        }
        Self { rng, seed, steps }
    }

    /// Returns the seed used for this generator.
    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Returns the number of draws taken so far.
    #[must_use]
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// One draw of the underlying generator. Every public operation funnels
    /// through here so `steps` counts the stream position exactly.
    fn next_u64(&mut self) -> u64 {
        self.steps += 1;
        self.rng.gen()
    }

    /// Generates a random u32.
    pub fn get_uint32(&mut self) -> u32 {
        self.next_u64() as u32
    }

    /// Generates a random u64.
    pub fn get_uint64(&mut self) -> u64 {
        self.next_u64()
    }

    /// Generates a random u32 in the range [min, max).
    pub fn get_uint32_range(&mut self, min: u32, max: u32) -> u32 {
        if min >= max {
            return min;
        }
        min + (self.next_u64() % u64::from(max - min)) as u32
    }

    /// Generates a random usize in the range [0, n).
    pub fn get_usize(&mut self, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        (self.next_u64() % n as u64) as usize
    }

    /// Generates a random f64 in [0, 1).
    pub fn get_real64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Shuffles a slice in place using Fisher-Yates algorithm.
    pub fn shuffle<T>(&mut self, slice: &mut [T]) {
        let n = slice.len();
        if n <= 1 {
            return;
        }

        for i in (1..n).rev() {
            let j = self.get_usize(i + 1);
            slice.swap(i, j);
        }
    }

    /// Samples `k` unique items from a collection without replacement.
    ///
    /// Returns a vector of `k` randomly selected items from the input.
    /// If `k >= items.len()`, returns all items in their original order.
    pub fn sample<T: Clone>(&mut self, mut items: Vec<T>, k: usize) -> Vec<T> {
        let n = items.len();
        if k >= n {
            return items;
        }

        // Partial Fisher-Yates: only the first k positions need to be drawn.
        for i in 0..k {
            let j = self.get_usize(n - i) + i;
            items.swap(i, j);
        }

        items.truncate(k);
        items
    }
}

impl Default for Random {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Clone for Random {
    fn clone(&self) -> Self {
        Self {
            rng: self.rng.clone(),
            seed: self.seed,
            steps: self.steps,
        }
    }
}

impl std::fmt::Debug for Random {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Random")
            .field("seed", &self.seed)
            .field("steps", &self.steps)
            .finish_non_exhaustive()
    }
}
