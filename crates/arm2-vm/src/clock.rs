//! Time and randomness sources.
//!
//! Both are injected into the VM at construction rather than read from
//! process globals, which keeps GET_TIME and GET_RANDOM deterministic
//! under test.

use std::time::Instant;

/// Monotonic milliseconds since the VM started.
pub trait Clock: Send {
    fn now_ms(&self) -> u64;
}

/// Production clock: `Instant`-based, anchored at construction.
pub struct MonotonicClock {
    start: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// Test clock: advances only when told to.
pub struct ManualClock {
    ms: std::sync::atomic::AtomicU64,
}

impl ManualClock {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ms: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn advance(&self, ms: u64) {
        self.ms.fetch_add(ms, std::sync::atomic::Ordering::Relaxed);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.ms.load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// 32-bit random source.
pub trait Rng: Send {
    fn next_u32(&mut self) -> u32;
}

/// xorshift64* generator. Small, fast, and good enough for guest
/// programs; seedable for reproducible runs.
pub struct XorShiftRng {
    state: u64,
}

impl XorShiftRng {
    #[must_use]
    pub const fn seeded(seed: u64) -> Self {
        // A zero state would be a fixed point
        let state = if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed };
        Self { state }
    }

    /// Seed from wall-clock entropy.
    #[must_use]
    pub fn from_entropy() -> Self {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0x5EED, |d| d.as_nanos() as u64);
        Self::seeded(nanos)
    }
}

impl Rng for XorShiftRng {
    fn next_u32(&mut self) -> u32 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        (x.wrapping_mul(0x2545_F491_4F6C_DD1D) >> 32) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_rng_is_reproducible() {
        let mut a = XorShiftRng::seeded(42);
        let mut b = XorShiftRng::seeded(42);
        for _ in 0..8 {
            assert_eq!(a.next_u32(), b.next_u32());
        }
    }

    #[test]
    fn zero_seed_is_remapped() {
        let mut rng = XorShiftRng::seeded(0);
        assert_ne!(rng.next_u32(), 0);
    }

    #[test]
    fn manual_clock_advances_on_demand() {
        let clock = ManualClock::new();
        assert_eq!(clock.now_ms(), 0);
        clock.advance(250);
        assert_eq!(clock.now_ms(), 250);
    }
}
