//! Abort Injector: a cancellation exerciser, not a correctness mechanism.
//!
//! Every Nth request gets a short-lived helper thread spawned alongside its
//! submission; the helper sleeps a randomized delay then issues an abort
//! against that request's tag. Grounded on the teacher's thread-per-unit
//! idiom (`src/nbd/server.rs::handle_client` spawned per connection) applied
//! here to a per-request helper instead of a per-connection handler.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::Rng;

const MIN_DELAY_US: u64 = 5;
const MAX_DELAY_US: u64 = 500;

/// Cadence-gated injector: every request whose tag is `0 mod cadence` gets a
/// helper thread racing the real submission. Cloning shares the same counters
/// (each clone is a handle onto the same `Arc<AtomicU64>` pair), which is what
/// lets the spawned helper thread record its own outcome without borrowing
/// back into `SharedContext`.
#[derive(Debug, Clone)]
pub struct AbortInjector {
    cadence: Option<u32>,
    issued: Arc<AtomicU64>,
    succeeded: Arc<AtomicU64>,
}

impl AbortInjector {
    pub fn new(cadence: Option<u32>) -> Self {
        AbortInjector { cadence, issued: Arc::new(AtomicU64::new(0)), succeeded: Arc::new(AtomicU64::new(0)) }
    }

    pub fn should_inject(&self, tag: i32) -> bool {
        match self.cadence {
            Some(a) if a > 0 => (tag as i64).rem_euclid(a as i64) == 0,
            _ => false,
        }
    }

    /// Spawn the helper for `tag` against `fd`. `abort_fn` performs the actual
    /// abort ioctl/syscall — injected so this module stays free of a direct
    /// pass-through dependency and is unit-testable without a real device.
    pub fn inject(&self, fd: RawFd, tag: i32, abort_fn: impl Fn(RawFd, i32) -> bool + Send + 'static) {
        self.issued.fetch_add(1, Ordering::Relaxed);
        let succeeded = self.succeeded.clone();
        let delay = rand::thread_rng().gen_range(MIN_DELAY_US..=MAX_DELAY_US);
        thread::spawn(move || {
            thread::sleep(Duration::from_micros(delay));
            if abort_fn(fd, tag) {
                succeeded.fetch_add(1, Ordering::Relaxed);
            }
        });
    }

    pub fn counts(&self) -> (u64, u64) {
        (self.issued.load(Ordering::Relaxed), self.succeeded.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_cadence_never_injects() {
        let inj = AbortInjector::new(None);
        assert!(!inj.should_inject(0));
        assert!(!inj.should_inject(100));
    }

    #[test]
    fn cadence_matches_multiples_only() {
        let inj = AbortInjector::new(Some(4));
        assert!(inj.should_inject(0));
        assert!(!inj.should_inject(2));
        assert!(inj.should_inject(8));
    }
}
