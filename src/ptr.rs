//! Pass-Through Request.
//!
//! One in-flight SCSI command: CDB + data buffer + sense buffer + flags + tag.
//! `submit`/`reap` are folded into one blocking call here (`sgio::submit` already
//! blocks until the ioctl completes) — MRQ's deferred/batched submission
//! (`src/mrq.rs`) is what actually defers issuance; a bare PTR always runs
//! synchronously, the same single-syscall-and-return shape as
//! `FileBackend::read`/`write` (`src/storage/file.rs`).

use std::os::unix::io::RawFd;
use std::time::Duration;

use thiserror::Error;

use crate::cdb::{build_cdb, CdbError, CdbKind, CdbParams};
use crate::classifier::{classify, Outcome};
use crate::sgio::{self, SgIoError, SG_DXFER_FROM_DEV, SG_DXFER_NONE, SG_DXFER_TO_DEV, SG_FLAG_DIRECT_IO, SG_FLAG_Q_AT_HEAD, SG_FLAG_Q_AT_TAIL};

#[derive(Debug, Error)]
pub enum PtrError {
    #[error(transparent)]
    Cdb(#[from] CdbError),

    #[error(transparent)]
    Sgio(#[from] SgIoError),

    #[error("retry_ua exceeded local retry budget at LBA {lba}")]
    RetryExhausted { lba: u64 },

    #[error("medium/hardware error at LBA {lba} (not masked by coe)")]
    MediaHard { lba: u64 },

    #[error("miscompare at LBA {lba}")]
    Miscompare { lba: u64 },

    #[error("fatal completion status at LBA {lba}: {outcome:?}")]
    Fatal { lba: u64, outcome: Outcome },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PtrFlags {
    pub direct_io: bool,
    pub queue_head: bool,
    pub queue_tail: bool,
    pub fua: bool,
    pub dpo: bool,
}

/// Direction of one pass-through request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
    Verify,
    PreFetch,
    SyncCache,
}

/// Outcome of one PTR issuance, after any local retry has been applied.
#[derive(Debug, Clone, Copy)]
pub struct PtrCompletion {
    pub outcome: Outcome,
    pub resid: i32,
    pub good_blocks: u32,
}

/// Monotonic tag generator. READ tags are even; a paired WRITE tag (shared-buffer
/// mode) is the next odd integer.
#[derive(Debug, Default)]
pub struct TagGenerator {
    next_even: i32,
}

impl TagGenerator {
    pub fn next_read_tag(&mut self) -> i32 {
        let tag = self.next_even;
        self.next_even += 2;
        tag
    }

    pub fn paired_write_tag(read_tag: i32) -> i32 {
        read_tag + 1
    }
}

/// Issue one SCSI command through the pass-through interface, applying the
/// `retry_ua` / `media_hard` / `coe` failure rules.
#[allow(clippy::too_many_arguments)]
pub fn issue(
    fd: RawFd,
    direction: Direction,
    cdb_size: u8,
    lba: u64,
    blocks: u32,
    buf: &mut [u8],
    timeout: Duration,
    flags: PtrFlags,
    pack_id: i32,
    coe: bool,
) -> Result<PtrCompletion, PtrError> {
    let (kind, dxfer_dir, write_buf) = match direction {
        Direction::Read => (CdbKind::Read, SG_DXFER_FROM_DEV, true),
        Direction::Write => (CdbKind::Write, SG_DXFER_TO_DEV, false),
        Direction::Verify => (CdbKind::Verify, SG_DXFER_TO_DEV, false),
        Direction::PreFetch => (CdbKind::PreFetch, SG_DXFER_NONE, false),
        Direction::SyncCache => (CdbKind::SyncCache, SG_DXFER_NONE, false),
    };

    let params = CdbParams {
        kind,
        cdb_size,
        lba,
        blocks,
        fua: flags.fua,
        dpo: flags.dpo,
        immed: matches!(direction, Direction::PreFetch),
    };
    let mut cdb = build_cdb(&params)?;

    let mut ioflags = 0u32;
    if flags.direct_io {
        ioflags |= SG_FLAG_DIRECT_IO;
    }
    if flags.queue_head {
        ioflags |= SG_FLAG_Q_AT_HEAD;
    }
    if flags.queue_tail {
        ioflags |= SG_FLAG_Q_AT_TAIL;
    }

    let mut attempted_retry = false;
    loop {
        let xfer_buf: &mut [u8] = if write_buf || matches!(direction, Direction::Write | Direction::Verify) {
            buf
        } else {
            &mut []
        };
        let result = sgio::submit(fd, &mut cdb, xfer_buf, dxfer_dir, timeout, ioflags, pack_id)?;
        let outcome = classify(result.status, result.host_status, result.driver_status, &result.sense);

        if outcome.is_retryable_once() && !attempted_retry {
            attempted_retry = true;
            continue;
        }
        if outcome.is_retryable_once() {
            return Err(PtrError::RetryExhausted { lba });
        }

        return match outcome {
            Outcome::Miscompare => Err(PtrError::Miscompare { lba }),
            Outcome::MediaHard => {
                if coe && matches!(direction, Direction::Read) {
                    buf.fill(0);
                    Ok(PtrCompletion { outcome: Outcome::Clean, resid: 0, good_blocks: blocks })
                } else if coe {
                    // write-side coe: ignore the error, pretend the blocks landed.
                    Ok(PtrCompletion { outcome: Outcome::Clean, resid: 0, good_blocks: blocks })
                } else {
                    Err(PtrError::MediaHard { lba })
                }
            }
            Outcome::Clean | Outcome::ConditionMet | Outcome::Recovered => {
                let resid = result.resid.max(0) as u32;
                let good_bytes = (blocks * cdb_len_to_block_size(buf, blocks)).saturating_sub(resid);
                let good_blocks = if blocks == 0 { 0 } else { good_bytes / (buf.len() as u32 / blocks) };
                Ok(PtrCompletion { outcome, resid: result.resid, good_blocks })
            }
            other => Err(PtrError::Fatal { lba, outcome: other }),
        };
    }
}

fn cdb_len_to_block_size(buf: &[u8], blocks: u32) -> u32 {
    if blocks == 0 {
        0
    } else {
        buf.len() as u32 / blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_generator_produces_even_read_tags_with_odd_pair() {
        let mut gen = TagGenerator::default();
        let a = gen.next_read_tag();
        let b = gen.next_read_tag();
        assert_eq!(a % 2, 0);
        assert_eq!(b, a + 2);
        assert_eq!(TagGenerator::paired_write_tag(a), a + 1);
    }
}
