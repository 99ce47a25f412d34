// src/rand_source.rs
//! Pluggable float generators used for retry jitter.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt::Debug;
use std::sync::Mutex;

/// Largest value a [`FixedRandSource`] will return
pub const MAX_FIXED_VALUE: f64 = 0.9999999999;

/// Source of uniformly distributed floats in `[0.0, 1.0)`
pub trait RandSource: Send + Sync + Debug {
    fn float64(&self) -> f64;
}

/// OS-seeded cryptographically secure generator, for production use
#[derive(Debug, Default, Clone, Copy)]
pub struct CryptoRandSource;

impl CryptoRandSource {
    pub fn new() -> Self {
        Self
    }
}

impl RandSource for CryptoRandSource {
    fn float64(&self) -> f64 {
        // The thread-local generator is a CSPRNG reseeded from the OS
        rand::rng().random::<f64>()
    }
}

/// Seeded generator; the same seed always yields the same sequence
#[derive(Debug)]
pub struct DeterministicRandSource {
    rng: Mutex<StdRng>,
}

impl DeterministicRandSource {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl RandSource for DeterministicRandSource {
    fn float64(&self) -> f64 {
        match self.rng.lock() {
            Ok(mut rng) => rng.random::<f64>(),
            // A panic while holding the lock cannot corrupt an RNG
            Err(poisoned) => poisoned.into_inner().random::<f64>(),
        }
    }
}

/// Always returns the same value, clamped to `[0, MAX_FIXED_VALUE]`
#[derive(Debug, Clone, Copy)]
pub struct FixedRandSource {
    value: f64,
}

impl FixedRandSource {
    pub fn new(value: f64) -> Self {
        let value = if value.is_nan() {
            0.0
        } else {
            value.clamp(0.0, MAX_FIXED_VALUE)
        };
        Self { value }
    }
}

impl RandSource for FixedRandSource {
    fn float64(&self) -> f64 {
        self.value
    }
}
