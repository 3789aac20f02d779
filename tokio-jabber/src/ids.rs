//! Identifier generation.

use rand::{thread_rng, Rng};

/// Build a random element id such as `iq-9c3d0e6a51f2b7a4`.
pub fn make_id(prefix: &str) -> String {
    let id: u64 = thread_rng().gen();
    format!("{}-{:016x}", prefix, id)
}

/// Monotonic BOSH request id.
///
/// The counter starts at a random value below 2^32 so that the server has
/// plenty of room before reaching the 2^53 limit of XEP-0124, and every
/// call to [`Rid::advance`] increments it by exactly one.
#[derive(Debug, Clone)]
pub struct Rid {
    value: u64,
}

impl Rid {
    /// Seed a new counter from the thread-local RNG.
    pub fn new() -> Self {
        Self::starting_at(thread_rng().gen_range(1_000_000..u32::MAX as u64))
    }

    /// Counter whose first [`Rid::advance`] returns `value + 1`.
    pub fn starting_at(value: u64) -> Self {
        Self { value }
    }

    /// Current value, i.e. the rid of the last request.
    pub fn value(&self) -> u64 {
        self.value
    }

    /// Advance and return the rid for the next request.
    pub fn advance(&mut self) -> u64 {
        self.value += 1;
        self.value
    }
}

impl Default for Rid {
    fn default() -> Self {
        Self::new()
    }
}
