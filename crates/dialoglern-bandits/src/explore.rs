//! Exploration helpers shared by the bandit policies.

use dialoglern_core::{Action, ActionSpace};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Mutex, PoisonError};

/// `max(min_rate, base_rate * decay^steps)`.
pub fn decayed_rate(base_rate: f64, min_rate: f64, decay: f64, steps: u64) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let factor = decay.powf(steps as f64);
    (base_rate * factor).max(min_rate)
}

/// Clamps a probability into `[0, 1]`, replacing non-finite values.
pub(crate) fn sanitize_probability(value: f64, fallback: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        fallback
    }
}

/// Source of every random draw a policy makes.
///
/// Seeded configurations are reproducible; otherwise the generator is seeded
/// from OS entropy.
#[derive(Debug)]
pub(crate) struct ExplorationRng {
    inner: Mutex<StdRng>,
}

impl ExplorationRng {
    pub(crate) fn new(seed: Option<u64>) -> Self {
        Self {
            inner: Mutex::new(Self::make(seed)),
        }
    }

    fn make(seed: Option<u64>) -> StdRng {
        match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        }
    }

    pub(crate) fn reseed(&self, seed: Option<u64>) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = Self::make(seed);
    }

    /// Uniform draw in `[0, 1)`.
    pub(crate) fn unit(&self) -> f64 {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen::<f64>()
    }

    pub(crate) fn pick(&self, space: &ActionSpace) -> Option<Action> {
        let mut rng = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        space.random_action(&mut *rng).cloned()
    }
}
