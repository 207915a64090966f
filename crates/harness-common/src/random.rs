//! Injectable randomness for member selection and resource naming
//!
//! Real runs seed from OS entropy. Tests seed explicitly so that member
//! choices and generated names are reproducible.

use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Characters allowed in generated ids. GCP only accepts lowercase names for
/// several resource types, so the alphabet has no uppercase letters.
const UNIQUE_ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Length of ids returned by [`HarnessRng::unique_id`]
pub const UNIQUE_ID_LEN: usize = 6;

/// Clonable handle to a shared random number generator
#[derive(Clone, Debug)]
pub struct HarnessRng {
    inner: Arc<Mutex<StdRng>>,
}

impl HarnessRng {
    /// Generator seeded from OS entropy
    pub fn from_entropy() -> Self {
        Self::wrap(StdRng::from_entropy())
    }

    /// Deterministic generator for reproducible runs and tests
    pub fn seeded(seed: u64) -> Self {
        Self::wrap(StdRng::seed_from_u64(seed))
    }

    fn wrap(rng: StdRng) -> Self {
        Self {
            inner: Arc::new(Mutex::new(rng)),
        }
    }

    /// Short lowercase alphanumeric id used to namespace cloud resources.
    pub fn unique_id(&self) -> String {
        let mut rng = self.inner.lock();
        (0..UNIQUE_ID_LEN)
            .map(|_| {
                let idx = rng.gen_range(0..UNIQUE_ID_ALPHABET.len());
                UNIQUE_ID_ALPHABET[idx] as char
            })
            .collect()
    }

    /// Uniformly random index into a collection of `len` items, or `None` if empty.
    pub fn pick_index(&self, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        Some(self.inner.lock().gen_range(0..len))
    }

    /// Uniformly random element of `items`
    pub fn pick<'a, T>(&self, items: &'a [T]) -> Option<&'a T> {
        self.pick_index(items.len()).map(|i| &items[i])
    }
}

impl Default for HarnessRng {
    fn default() -> Self {
        Self::from_entropy()
    }
}
