//! Multi-request (MRQ) batching.
//!
//! Groups several pass-through requests into one submission unit instead of
//! issuing them one at a time, the way the teacher's protocol layer frames
//! several records into one on-wire unit (`src/cas/protocol.rs`) rather than
//! one round trip per record. The batching policy itself (depth, restricted
//! side, packed vs. separate CDBs) follows the MRQ behavior observed in
//! `original_source/testing/sgh_dd.cpp`.

use std::time::Duration;

use thiserror::Error;

use crate::config::{MrqConfig, Side};
use crate::ptr::{self, Direction, PtrCompletion, PtrError, PtrFlags};

#[derive(Debug, Error)]
pub enum MrqError {
    #[error(transparent)]
    Ptr(#[from] PtrError),

    #[error("mrq batch is empty")]
    EmptyBatch,
}

/// One deferred pass-through request awaiting batched submission. Carries its
/// own data buffer (empty for the no-payload directions) so a round-trip
/// through the batcher hands the caller real transferred bytes back, not just
/// a completion status.
pub struct DeferredPtr {
    pub fd: std::os::unix::io::RawFd,
    pub direction: Direction,
    pub cdb_size: u8,
    pub lba: u64,
    pub blocks: u32,
    pub flags: PtrFlags,
    pub pack_id: i32,
    pub buf: Vec<u8>,
    pub coe: bool,
}

/// Outcome of one batch member, in the same order it was pushed.
pub struct BatchResult {
    pub lba: u64,
    pub buf: Vec<u8>,
    pub completion: Result<PtrCompletion, PtrError>,
}

/// A batch of requests restricted to one side (`spec.md` §4.9 "an MRQ batch
/// is scoped to one side's in-flight requests"). `depth` must be even overall
/// and, when not side-restricted, divisible by three (two reads to one write,
/// matching the teacher's read-heavy default ratio); both invariants are
/// enforced at configuration time (`config::Config::parse_mrq`), not here.
pub struct Batcher {
    cfg: MrqConfig,
    pending: Vec<DeferredPtr>,
}

impl Batcher {
    pub fn new(cfg: MrqConfig) -> Self {
        Batcher { cfg, pending: Vec::new() }
    }

    pub fn side(&self) -> Option<Side> {
        self.cfg.side
    }

    pub fn depth(&self) -> usize {
        self.cfg.depth as usize
    }

    pub fn is_full(&self) -> bool {
        self.pending.len() >= self.depth()
    }

    pub fn push(&mut self, req: DeferredPtr) {
        self.pending.push(req);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drain and submit the current batch, in push order. Submission here is
    /// sequential — the kernel-level MRQ ioctl variant collapsing a whole
    /// batch into one syscall is an external collaborator (`spec.md` §1);
    /// this reproduces the observable batching semantics (reissue-in-place on
    /// a retryable completion, never re-queue at the tail) without it.
    pub fn flush(&mut self, timeout: Duration) -> Result<Vec<BatchResult>, MrqError> {
        if self.pending.is_empty() {
            return Err(MrqError::EmptyBatch);
        }
        let batch = std::mem::take(&mut self.pending);
        let mut results = Vec::with_capacity(batch.len());
        for mut req in batch {
            let completion = ptr::issue(
                req.fd,
                req.direction,
                req.cdb_size,
                req.lba,
                req.blocks,
                &mut req.buf,
                timeout,
                req.flags,
                req.pack_id,
                req.coe,
            );
            results.push(BatchResult { lba: req.lba, buf: req.buf, completion });
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(depth: u32, side: Option<Side>) -> MrqConfig {
        MrqConfig { depth, side, pack_cdb: false }
    }

    fn deferred(lba: u64, pack_id: i32) -> DeferredPtr {
        DeferredPtr {
            fd: -1,
            direction: Direction::Read,
            cdb_size: 10,
            lba,
            blocks: 1,
            flags: PtrFlags::default(),
            pack_id,
            buf: vec![0u8; 1],
            coe: false,
        }
    }

    #[test]
    fn batcher_reports_full_at_depth() {
        let mut b = Batcher::new(cfg(2, None));
        assert!(!b.is_full());
        b.push(deferred(0, 0));
        assert!(!b.is_full());
        b.push(deferred(1, 1));
        assert!(b.is_full());
    }

    #[test]
    fn flush_on_empty_batch_is_an_error() {
        let mut b = Batcher::new(cfg(2, None));
        assert!(matches!(b.flush(Duration::from_secs(1)), Err(MrqError::EmptyBatch)));
    }
}
