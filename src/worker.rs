//! Per-worker segment loop.
//!
//! Each worker is its own OS thread with its own endpoints (the `same_fds`
//! flag, when set, is handled by the coordinator sharing one `Endpoint`
//! instead — not yet wired up, see `DESIGN.md`), following the teacher's
//! thread-per-connection shape in `NbdServer::run` (`src/nbd/server.rs`)
//! generalized from "one client socket" to "one claimed block segment,
//! repeated until the input is exhausted".
//!
//! When `mrq=` is configured and the relevant side is pass-through, PTRs for
//! that side are deferred into a `Batcher` (`src/mrq.rs`) and flushed once
//! per claimed round instead of being issued one at a time.

use std::os::unix::io::RawFd;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::config::{ChkAddr, Config, Side};
use crate::coordinator::SharedContext;
use crate::endpoint::{Endpoint, EndpointKind};
use crate::error::CopyError;
use crate::mrq::{Batcher, DeferredPtr};
use crate::ptr::{Direction, PtrFlags};

/// How a worker's segment loop ended.
pub enum WorkerOutcome {
    Stopped,
    ShortRead,
    EndOfRange,
    Fatal(CopyError),
}

struct WorkerEndpoints {
    input: Endpoint,
    output: Endpoint,
    secondary: Option<Endpoint>,
}

fn open_endpoints(ctx: &SharedContext) -> Result<WorkerEndpoints, CopyError> {
    let cfg = &ctx.cfg;

    let input = if let Some(pattern) = cfg.iflag.synthetic_pattern() {
        Endpoint::synthetic(pattern, cfg.bs)
    } else {
        Endpoint::open_for_read(&cfg.if_path, cfg.bs, cfg.iflag.direct || cfg.iflag.dio)?
    };

    let of_path = cfg.of_path.as_deref().unwrap_or(".");
    let output = Endpoint::open_for_write(of_path, cfg.bs, cfg.oflag.direct || cfg.oflag.dio, cfg.oflag.append)?;

    let secondary = cfg
        .of2_path
        .as_deref()
        .map(|p| Endpoint::open_for_write(p, cfg.bs, false, false))
        .transpose()?;

    Ok(WorkerEndpoints { input, output, secondary })
}

/// Releases the sharing relationship this worker established, if any, when
/// the worker returns by any path (error, short read, or clean end-of-range).
struct SharingGuard<'a> {
    ctx: &'a SharedContext,
    read_fd: Option<RawFd>,
}

impl Drop for SharingGuard<'_> {
    fn drop(&mut self) {
        if let Some(fd) = self.read_fd {
            let _ = self.ctx.sharing.lock().unwrap().release(fd);
        }
    }
}

/// Try to establish kernel buffer sharing between this worker's own pass-through
/// input and output fds (`spec.md` §4.8). Only meaningful when both sides are
/// pass-through, there is no secondary sink to keep independently in sync, and
/// `same_fds` wasn't requested (that mode shares one fd pair across workers
/// instead, which this worker-local establish call does not model). Returns
/// `true` only once `establish` has actually succeeded — callers must not
/// assume sharing is in effect otherwise.
fn try_establish_sharing(ctx: &SharedContext, endpoints: &WorkerEndpoints) -> Option<RawFd> {
    let cfg = &ctx.cfg;
    let eligible = endpoints.secondary.is_none()
        && endpoints.input.kind.is_pass_through()
        && endpoints.output.kind.is_pass_through()
        && !cfg.iflag.same_fds;
    if !eligible {
        return None;
    }
    let (Some(read_fd), Some(write_fd)) = (endpoints.input.raw_fd(), endpoints.output.raw_fd()) else {
        return None;
    };
    match ctx.sharing.lock().unwrap().establish(read_fd, write_fd) {
        Ok(()) => Some(read_fd),
        Err(_) => None,
    }
}

fn maybe_inject_abort(ctx: &SharedContext, fd: RawFd, tag: i32) {
    if ctx.abort_injector.should_inject(tag) {
        ctx.abort_injector.inject(fd, tag, crate::sgio::abort);
    }
}

/// Run one worker's segment loop to completion or termination.
pub fn run(ctx: Arc<SharedContext>, _id: usize) -> WorkerOutcome {
    let mut endpoints = match open_endpoints(&ctx) {
        Ok(e) => e,
        Err(e) => return WorkerOutcome::Fatal(e),
    };
    let cfg = &ctx.cfg;

    let sharing_fd = try_establish_sharing(&ctx, &endpoints);
    let _sharing_guard = SharingGuard { ctx: &*ctx, read_fd: sharing_fd };
    let sharing_established = sharing_fd.is_some();

    let skip_order = skip_order_wait(cfg, &endpoints.input, &endpoints.output, endpoints.secondary.is_some(), sharing_established);

    let mut read_batcher = cfg
        .mrq
        .filter(|_| endpoints.input.kind.is_pass_through() && mrq_side_for(cfg, true))
        .map(Batcher::new);
    let mut write_batcher = cfg
        .mrq
        .filter(|_| skip_order && endpoints.output.kind.is_pass_through() && mrq_side_for(cfg, false))
        .map(Batcher::new);

    let round_size = cfg
        .mrq
        .filter(|_| read_batcher.is_some() || write_batcher.is_some())
        .map(|m| m.depth.max(1) as usize)
        .unwrap_or(1);

    let bpt = cfg.bpt as u64;
    let bs = cfg.bs as usize;

    loop {
        if ctx.stop.is_raised() {
            return WorkerOutcome::Stopped;
        }

        let mut round = Vec::with_capacity(round_size);
        for _ in 0..round_size {
            let start = ctx.position_cursor.fetch_add(bpt, Ordering::SeqCst);
            if start >= ctx.total_blocks {
                break;
            }
            let n = std::cmp::min(bpt, ctx.total_blocks - start) as u32;
            round.push((start, n));
        }
        if round.is_empty() {
            return WorkerOutcome::EndOfRange;
        }

        match run_round(
            &ctx,
            &mut endpoints,
            &round,
            bs,
            read_batcher.as_mut(),
            write_batcher.as_mut(),
            skip_order,
        ) {
            Ok(RoundOutcome::Full) => continue,
            Ok(RoundOutcome::ShortRead) => {
                ctx.stop.raise();
                ctx.barrier.notify_stalled();
                return WorkerOutcome::ShortRead;
            }
            Err(e) => {
                ctx.stop.raise();
                ctx.barrier.notify_stalled();
                return WorkerOutcome::Fatal(e);
            }
        }
    }
}

enum RoundOutcome {
    Full,
    ShortRead,
}

/// One finished segment's READ: the data actually transferred, ready to be
/// checked, ordered, and written.
struct ReadResult {
    start: u64,
    actual_n: u32,
    buf: Vec<u8>,
    partial: bool,
}

fn run_round(
    ctx: &SharedContext,
    endpoints: &mut WorkerEndpoints,
    round: &[(u64, u32)],
    bs: usize,
    mut read_batcher: Option<&mut Batcher>,
    mut write_batcher: Option<&mut Batcher>,
    skip_order: bool,
) -> Result<RoundOutcome, CopyError> {
    let cfg = &ctx.cfg;
    let reads = read_round(ctx, endpoints, round, bs, read_batcher.as_deref_mut())?;

    let mut short = false;
    let mut queued_writes: Vec<(u64, u32, bool)> = Vec::new();

    for read in reads {
        let ReadResult { start, actual_n, buf, partial } = read;
        if (actual_n as u64) < round_blocks_for(round, start) {
            short = true;
        }

        if cfg.chkaddr != ChkAddr::Off && actual_n > 0 {
            check_address(cfg.chkaddr, start, &buf[..actual_n as usize * bs], bs)?;
        }

        if actual_n > 0 {
            ctx.counters.in_full.fetch_add(actual_n as u64, Ordering::Relaxed);
        }
        if partial {
            ctx.counters.in_partial.fetch_add(1, Ordering::Relaxed);
        }
        ctx.activity.bump();

        if !skip_order {
            let woke = ctx.barrier.wait_for(start, || ctx.stop.is_raised());
            if !woke {
                return Err(CopyError::Io(std::io::Error::new(
                    std::io::ErrorKind::Interrupted,
                    "ordering wait aborted by stop flag",
                )));
            }
        }

        let write_n = actual_n;
        let data = &buf[..write_n as usize * bs];

        match write_batcher.as_deref_mut() {
            Some(batcher) if write_n > 0 => {
                let fd = endpoints.output.raw_fd().expect("pass-through endpoint carries a fd");
                queue_write(ctx, fd, batcher, start, write_n, data);
                queued_writes.push((start, write_n, partial));
            }
            _ => {
                if write_n > 0 {
                    write_segment(ctx, &mut endpoints.output, start, write_n, data)?;
                    if let Some(secondary) = endpoints.secondary.as_mut() {
                        secondary.write_blocks(cfg.seek + start, data)?;
                    }
                    ctx.counters.out_full.fetch_add(write_n as u64, Ordering::Relaxed);
                }
                if partial {
                    ctx.counters.out_partial.fetch_add(1, Ordering::Relaxed);
                }
                ctx.activity.bump();
                ctx.barrier.advance(actual_n as u64);
                ctx.counters.in_remaining.fetch_sub(round_blocks_for(round, start), Ordering::Relaxed);
                ctx.counters.out_remaining.fetch_sub(actual_n as u64, Ordering::Relaxed);
            }
        }

        if short {
            break;
        }
    }

    if let Some(batcher) = write_batcher.as_deref_mut() {
        if !batcher.is_empty() {
            let results = batcher.flush(cfg.cmd_timeout)?;
            let per_segment = if cfg.prefetch && cfg.verify { 2 } else { 1 };
            let mut results = results.into_iter();
            for (start, write_n, partial) in queued_writes.iter() {
                if per_segment == 2 {
                    results.next().expect("prefetch result present for every queued write").completion?;
                }
                results.next().expect("write result present for every queued write").completion?;
                ctx.counters.out_full.fetch_add(*write_n as u64, Ordering::Relaxed);
                if *partial {
                    ctx.counters.out_partial.fetch_add(1, Ordering::Relaxed);
                }
                ctx.activity.bump();
                ctx.barrier.advance(*write_n as u64);
                ctx.counters.in_remaining.fetch_sub(round_blocks_for(round, *start), Ordering::Relaxed);
                ctx.counters.out_remaining.fetch_sub(*write_n as u64, Ordering::Relaxed);
            }
        }
    }

    if short {
        Ok(RoundOutcome::ShortRead)
    } else {
        Ok(RoundOutcome::Full)
    }
}

fn round_blocks_for(round: &[(u64, u32)], start: u64) -> u64 {
    round.iter().find(|&&(s, _)| s == start).map(|&(_, n)| n as u64).unwrap_or(0)
}

fn read_round(
    ctx: &SharedContext,
    endpoints: &mut WorkerEndpoints,
    round: &[(u64, u32)],
    bs: usize,
    batcher: Option<&mut Batcher>,
) -> Result<Vec<ReadResult>, CopyError> {
    let cfg = &ctx.cfg;
    match batcher {
        Some(batcher) => {
            let fd = endpoints.input.raw_fd().expect("pass-through endpoint carries a fd");
            for &(start, n) in round {
                let lba = cfg.skip + start;
                let tag = ctx.tag_gen.lock().unwrap().next_read_tag();
                maybe_inject_abort(ctx, fd, tag);
                let flags = PtrFlags { direct_io: cfg.iflag.dio, fua: cfg.fua_in, dpo: cfg.iflag.dpo, ..Default::default() };
                batcher.push(DeferredPtr {
                    fd,
                    direction: Direction::Read,
                    cdb_size: cfg.cdbsz,
                    lba,
                    blocks: n,
                    flags,
                    pack_id: tag,
                    buf: vec![0u8; n as usize * bs],
                    coe: cfg.iflag.coe,
                });
            }
            let results = batcher.flush(cfg.cmd_timeout)?;
            let mut out = Vec::with_capacity(results.len());
            for ((start, _n), result) in round.iter().zip(results) {
                let completion = result.completion?;
                let got = completion.good_blocks as usize * bs;
                let mut buf = result.buf;
                let short = got < buf.len();
                if short {
                    buf.truncate(got);
                }
                out.push(ReadResult { start: *start, actual_n: (got / bs) as u32, buf, partial: got % bs != 0 });
            }
            Ok(out)
        }
        None => {
            let mut out = Vec::with_capacity(round.len());
            for &(start, n) in round {
                let mut buf = vec![0u8; n as usize * bs];
                let got = read_segment(ctx, endpoints, start, n, &mut buf)?;
                let short = got < buf.len();
                if short {
                    buf.truncate(got);
                }
                out.push(ReadResult { start, actual_n: (got / bs) as u32, buf, partial: got % bs != 0 });
            }
            Ok(out)
        }
    }
}

fn queue_write(ctx: &SharedContext, fd: RawFd, batcher: &mut Batcher, start: u64, n: u32, data: &[u8]) {
    let cfg = &ctx.cfg;
    let lba = cfg.seek + start;

    if cfg.prefetch && cfg.verify {
        let tag = ctx.tag_gen.lock().unwrap().next_read_tag();
        maybe_inject_abort(ctx, fd, tag);
        batcher.push(DeferredPtr {
            fd,
            direction: Direction::PreFetch,
            cdb_size: cfg.cdbsz,
            lba,
            blocks: n,
            flags: PtrFlags::default(),
            pack_id: tag,
            buf: Vec::new(),
            coe: false,
        });
    }

    let direction = if cfg.verify { Direction::Verify } else { Direction::Write };
    let tag = ctx.tag_gen.lock().unwrap().next_read_tag();
    maybe_inject_abort(ctx, fd, tag);
    let flags = PtrFlags { direct_io: cfg.oflag.dio, fua: cfg.fua_out, dpo: cfg.oflag.dpo, ..Default::default() };
    batcher.push(DeferredPtr {
        fd,
        direction,
        cdb_size: cfg.cdbsz,
        lba,
        blocks: n,
        flags,
        pack_id: tag,
        buf: data.to_vec(),
        coe: cfg.oflag.coe,
    });
}

fn read_segment(
    ctx: &SharedContext,
    endpoints: &mut WorkerEndpoints,
    start: u64,
    n: u32,
    buf: &mut Vec<u8>,
) -> Result<usize, CopyError> {
    let cfg = &ctx.cfg;
    let lba = cfg.skip + start;

    if endpoints.input.kind.is_pass_through() {
        let fd = endpoints.input.raw_fd().expect("pass-through endpoint carries a fd");
        let bs = buf.len() / n as usize;
        let tag = ctx.tag_gen.lock().unwrap().next_read_tag();
        maybe_inject_abort(ctx, fd, tag);
        let flags = PtrFlags { direct_io: cfg.iflag.dio, fua: cfg.fua_in, dpo: cfg.iflag.dpo, ..Default::default() };
        let completion = crate::ptr::issue(
            fd,
            Direction::Read,
            cfg.cdbsz,
            lba,
            n,
            buf,
            cfg.cmd_timeout,
            flags,
            tag,
            cfg.iflag.coe,
        )?;
        Ok(completion.good_blocks as usize * bs)
    } else {
        let _guard = (!matches!(endpoints.input.kind, EndpointKind::Fifo)).then(|| ctx.input_mutex.lock().unwrap());
        Ok(endpoints.input.read_blocks(lba, buf)?)
    }
}

fn write_segment(ctx: &SharedContext, output: &mut Endpoint, start: u64, n: u32, data: &[u8]) -> Result<(), CopyError> {
    let cfg = &ctx.cfg;
    let lba = cfg.seek + start;

    if output.kind.is_pass_through() {
        let fd = output.raw_fd().expect("pass-through endpoint carries a fd");
        let mut scratch = data.to_vec();

        if cfg.prefetch && cfg.verify {
            let tag = ctx.tag_gen.lock().unwrap().next_read_tag();
            maybe_inject_abort(ctx, fd, tag);
            let mut empty = [];
            crate::ptr::issue(
                fd,
                Direction::PreFetch,
                cfg.cdbsz,
                lba,
                n,
                &mut empty,
                cfg.cmd_timeout,
                PtrFlags::default(),
                tag,
                false,
            )?;
        }

        let direction = if cfg.verify { Direction::Verify } else { Direction::Write };
        let tag = ctx.tag_gen.lock().unwrap().next_read_tag();
        maybe_inject_abort(ctx, fd, tag);
        let flags = PtrFlags { direct_io: cfg.oflag.dio, fua: cfg.fua_out, dpo: cfg.oflag.dpo, ..Default::default() };
        crate::ptr::issue(fd, direction, cfg.cdbsz, lba, n, &mut scratch, cfg.cmd_timeout, flags, tag, cfg.oflag.coe)?;
        Ok(())
    } else {
        let _guard = (!matches!(output.kind, EndpointKind::Fifo)).then(|| ctx.output_mutex.lock().unwrap());
        output.write_blocks(lba, data)?;
        Ok(())
    }
}

/// Ordering is meaningless for the random synthetic source, and unnecessary
/// when both sides are pass-through with no secondary sink to keep in step
/// *and* `SharingManager::establish` actually succeeded for this worker's fd
/// pair — absent that, nothing serializes cross-worker WRITE completion order
/// and the barrier must run (`spec.md` §5, invariant 2).
fn skip_order_wait(cfg: &Config, input: &Endpoint, output: &Endpoint, has_secondary: bool, sharing_established: bool) -> bool {
    if matches!(input.kind, EndpointKind::Synthetic(crate::config::SyntheticPattern::Random)) {
        return true;
    }
    if sharing_established && !has_secondary && input.kind.is_pass_through() && output.kind.is_pass_through() && !cfg.iflag.same_fds {
        return true;
    }
    false
}

fn check_address(mode: ChkAddr, start: u64, buf: &[u8], bs: usize) -> Result<(), CopyError> {
    if bs < 4 {
        return Ok(());
    }
    let blocks = buf.len() / bs;
    for k in 0..blocks {
        let expect = (start + k as u64) as u32;
        let off = k * bs;
        let word = u32::from_be_bytes(buf[off..off + 4].try_into().unwrap());
        if word != expect {
            return Err(CopyError::Miscompare { lba: start + k as u64 });
        }
        if mode == ChkAddr::Strict {
            let mut j = 4;
            while j + 4 <= bs {
                let word = u32::from_be_bytes(buf[off + j..off + j + 4].try_into().unwrap());
                if word != expect {
                    return Err(CopyError::Miscompare { lba: start + k as u64 });
                }
                j += 4;
            }
        }
    }
    Ok(())
}

fn mrq_side_for(cfg: &Config, reading: bool) -> bool {
    match cfg.mrq.and_then(|m| m.side) {
        None => true,
        Some(Side::In) => reading,
        Some(Side::Out) => !reading,
    }
}
