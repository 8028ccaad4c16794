//! Environment abstraction for time and randomness.
//!
//! Everything in the fabric that needs the clock, a timer, or random bytes
//! gets them through [`Environment`]. Production uses [`SystemEnv`]; the
//! simulation harness supplies a seeded implementation so runs are
//! reproducible.

use std::{
    future::Future,
    time::{Duration, Instant},
};

/// Source of time, sleeping, and randomness.
pub trait Environment: Clone + Send + Sync + 'static {
    /// Current instant.
    fn now(&self) -> Instant;

    /// Suspend the calling task for `duration`.
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;

    /// Fill `buffer` with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Random `u64`.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_le_bytes(bytes)
    }

    /// Random index in `0..len`. `len` must be non-zero.
    fn random_index(&self, len: usize) -> usize {
        (self.random_u64() % len as u64) as usize
    }

    /// Random 128-bit identifier rendered as 32 lowercase hex digits.
    ///
    /// Used for connection ids and transaction ids.
    fn random_id(&self) -> String {
        let mut bytes = [0u8; 16];
        self.random_bytes(&mut bytes);
        format!("{:032x}", u128::from_be_bytes(bytes))
    }
}

/// Production environment: wall clock, tokio timers, thread-local RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl Environment for SystemEnv {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        use rand::RngCore;
        rand::thread_rng().fill_bytes(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_id_is_32_hex_digits() {
        let id = SystemEnv.random_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, SystemEnv.random_id());
    }

    #[test]
    fn random_index_stays_in_bounds() {
        for len in 1..20 {
            assert!(SystemEnv.random_index(len) < len);
        }
    }
}
