//! Host input generation.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// `count` pseudo-random values in `[0, 1)`. The same seed always yields the
/// same samples; without one the generator is seeded from OS entropy.
pub fn random_samples(count: usize, seed: Option<u64>) -> Vec<f32> {
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    (0..count).map(|_| rng.gen::<f32>()).collect()
}
