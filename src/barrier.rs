//! Ordering barrier: workers complete segments out of order but must write
//! them out in LBA order. Idiomatic `Condvar` guarding a shared cursor; no
//! direct teacher analogue, the closest being the connection-state
//! `Mutex`/`Condvar` pair in `src/server/listener.rs` used to hand off
//! accepted sockets between threads.

use std::sync::{Condvar, Mutex};

/// Tracks the next output block index allowed to write, plus whether the
/// whole copy has been stopped (error or completion) so waiters don't block
/// forever on a cursor that will never reach them.
pub struct OrderingBarrier {
    cursor: Mutex<u64>,
    cv: Condvar,
}

impl OrderingBarrier {
    pub fn new(start: u64) -> Self {
        OrderingBarrier { cursor: Mutex::new(start), cv: Condvar::new() }
    }

    pub fn position(&self) -> u64 {
        *self.cursor.lock().unwrap()
    }

    /// Block until `cursor == oblk` or `should_abort()` returns true.
    /// Returns `false` if it woke up due to abort rather than reaching `oblk`.
    pub fn wait_for(&self, oblk: u64, should_abort: impl Fn() -> bool) -> bool {
        let mut cursor = self.cursor.lock().unwrap();
        loop {
            if *cursor == oblk {
                return true;
            }
            if should_abort() {
                return false;
            }
            let (guard, timeout) = self
                .cv
                .wait_timeout(cursor, std::time::Duration::from_millis(50))
                .unwrap();
            cursor = guard;
            let _ = timeout;
        }
    }

    /// Advance the cursor past `blocks` blocks and wake every waiter so they
    /// can re-check their own target.
    pub fn advance(&self, blocks: u64) {
        let mut cursor = self.cursor.lock().unwrap();
        *cursor += blocks;
        self.cv.notify_all();
    }

    /// Wake every waiter without moving the cursor, used when a worker aborts
    /// and other workers may be waiting on a cursor position that will now
    /// never arrive through the normal path.
    pub fn notify_stalled(&self) {
        self.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn wait_returns_once_cursor_reaches_target() {
        let barrier = Arc::new(OrderingBarrier::new(0));
        let b2 = barrier.clone();
        let handle = std::thread::spawn(move || b2.wait_for(3, || false));
        std::thread::sleep(std::time::Duration::from_millis(10));
        barrier.advance(3);
        assert!(handle.join().unwrap());
    }

    #[test]
    fn wait_bails_out_on_abort() {
        let barrier = OrderingBarrier::new(0);
        let stop = AtomicBool::new(true);
        assert!(!barrier.wait_for(5, || stop.load(Ordering::Relaxed)));
    }
}
