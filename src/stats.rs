//! Running counters and the end-of-run / SIGUSR1 report.
//!
//! The `N+P` records-in/records-out format and the throughput line under
//! `time=` follow `original_source/testing/sgh_dd.cpp`'s summary output;
//! the counter set itself is atomics owned by the Coordinator
//! (`src/coordinator.rs`), this module only knows how to format a snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// One immutable snapshot of the running counters, cheap to build from the
/// Coordinator's atomics and safe to print without holding any lock.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsSnapshot {
    pub in_full: u64,
    pub in_partial: u64,
    pub out_full: u64,
    pub out_partial: u64,
    pub in_remaining: u64,
    pub out_remaining: u64,
    pub transient_busy: u64,
    pub retry_eagain: u64,
    pub aborts_issued: u64,
    pub aborts_succeeded: u64,
    pub miscompares: u64,
    pub sum_of_resids: u64,
    pub dio_incomplete: u64,
}

/// The process-lifetime counter set. Plain atomics, no locking — matches the
/// invariant that counter updates only need to coincide with condition
/// signaling when they gate the ordering barrier (`src/barrier.rs`); these
/// are purely informational.
#[derive(Debug, Default)]
pub struct Counters {
    pub in_full: AtomicU64,
    pub in_partial: AtomicU64,
    pub out_full: AtomicU64,
    pub out_partial: AtomicU64,
    pub in_remaining: AtomicU64,
    pub out_remaining: AtomicU64,
    pub transient_busy: AtomicU64,
    pub retry_eagain: AtomicU64,
    pub aborts_issued: AtomicU64,
    pub aborts_succeeded: AtomicU64,
    pub miscompares: AtomicU64,
    pub sum_of_resids: AtomicU64,
    pub dio_incomplete: AtomicU64,
}

impl Counters {
    pub fn new(total_blocks: u64) -> Self {
        let c = Counters::default();
        c.in_remaining.store(total_blocks, Ordering::Relaxed);
        c.out_remaining.store(total_blocks, Ordering::Relaxed);
        c
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            in_full: self.in_full.load(Ordering::Relaxed),
            in_partial: self.in_partial.load(Ordering::Relaxed),
            out_full: self.out_full.load(Ordering::Relaxed),
            out_partial: self.out_partial.load(Ordering::Relaxed),
            in_remaining: self.in_remaining.load(Ordering::Relaxed),
            out_remaining: self.out_remaining.load(Ordering::Relaxed),
            transient_busy: self.transient_busy.load(Ordering::Relaxed),
            retry_eagain: self.retry_eagain.load(Ordering::Relaxed),
            aborts_issued: self.aborts_issued.load(Ordering::Relaxed),
            aborts_succeeded: self.aborts_succeeded.load(Ordering::Relaxed),
            miscompares: self.miscompares.load(Ordering::Relaxed),
            sum_of_resids: self.sum_of_resids.load(Ordering::Relaxed),
            dio_incomplete: self.dio_incomplete.load(Ordering::Relaxed),
        }
    }
}

/// Render a `records in/out` report line, in the `full+partial` form.
pub fn format_report(snap: &StatsSnapshot, elapsed: Option<Duration>, bs: u32) -> String {
    let mut out = format!(
        "records in: {}+{}\nrecords out: {}+{}\nremaining: in={} out={}\n\
         transient_busy={} retry_eagain={} aborts={}/{} miscompares={} resid_sum={} dio_incomplete={}",
        snap.in_full,
        snap.in_partial,
        snap.out_full,
        snap.out_partial,
        snap.in_remaining,
        snap.out_remaining,
        snap.transient_busy,
        snap.retry_eagain,
        snap.aborts_succeeded,
        snap.aborts_issued,
        snap.miscompares,
        snap.sum_of_resids,
        snap.dio_incomplete,
    );
    if let Some(elapsed) = elapsed {
        let bytes = (snap.out_full * bs as u64) as f64;
        let secs = elapsed.as_secs_f64().max(1e-9);
        let mib_per_s = bytes / (1024.0 * 1024.0) / secs;
        out.push_str(&format!("\ntime: {:.3}s, {:.2} MiB/s", secs, mib_per_s));
    }
    out
}

/// Wraps a start `Instant` so `time=` reporting can compute elapsed duration
/// without the caller threading `Instant::now()` calls through every layer.
pub struct Clock {
    start: Instant,
}

impl Clock {
    pub fn start() -> Self {
        Clock { start: Instant::now() }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_counters_seed_remaining_from_total() {
        let c = Counters::new(100);
        let snap = c.snapshot();
        assert_eq!(snap.in_remaining, 100);
        assert_eq!(snap.out_remaining, 100);
        assert_eq!(snap.in_full, 0);
    }

    #[test]
    fn report_contains_both_record_lines() {
        let c = Counters::new(10);
        c.in_full.store(4, Ordering::Relaxed);
        c.out_full.store(4, Ordering::Relaxed);
        let report = format_report(&c.snapshot(), None, 512);
        assert!(report.contains("records in: 4+0"));
        assert!(report.contains("records out: 4+0"));
    }
}
