//! The global work coordinator.
//!
//! Owns every piece of process-wide state — counters, cursors, the stop
//! flag, the ordering barrier, the sharing manager — and hands out only
//! borrow-style `Arc` references to workers and the watchdog, never transfers
//! ownership. Thread spawning and joining follows the teacher's
//! `NbdServer::run`/`handle_client` shape (`src/nbd/server.rs`): one
//! `Arc`-shared context, one `thread::spawn` per unit of concurrent work,
//! join and report at the end.

use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::abort::AbortInjector;
use crate::barrier::OrderingBarrier;
use crate::config::Config;
use crate::endpoint::Endpoint;
use crate::error::CopyError;
use crate::ptr::{self, Direction, PtrFlags, TagGenerator};
use crate::sharing::SharingManager;
use crate::stats::{format_report, Clock, Counters};
use crate::watchdog::{ActivityCounter, StopFlag, Watchdog};
use crate::worker::{self, WorkerOutcome};

/// Everything a worker or the watchdog needs, shared read-only except for the
/// interior-mutable atomics/mutexes it explicitly exposes.
pub struct SharedContext {
    pub cfg: Config,
    pub total_blocks: u64,
    pub position_cursor: AtomicU64,
    pub counters: Counters,
    pub stop: StopFlag,
    pub barrier: OrderingBarrier,
    pub activity: ActivityCounter,
    pub abort_injector: AbortInjector,
    pub sharing: Mutex<SharingManager>,
    pub input_mutex: Mutex<()>,
    pub output_mutex: Mutex<()>,
    pub tag_gen: Mutex<TagGenerator>,
}

/// Final outcome of the whole copy, enough to compute the process exit code
/// and print the closing report.
pub struct RunReport {
    pub exit_code: i32,
    pub report_line: String,
}

pub struct Coordinator {
    ctx: Arc<SharedContext>,
    clock: Clock,
}

impl Coordinator {
    pub fn new(cfg: Config) -> Result<Self, CopyError> {
        let total_blocks = resolve_total_blocks(&cfg)?;
        let ctx = SharedContext {
            abort_injector: AbortInjector::new(cfg.abort_cadence),
            position_cursor: AtomicU64::new(0),
            counters: Counters::new(total_blocks),
            stop: StopFlag::new(),
            barrier: OrderingBarrier::new(0),
            activity: ActivityCounter::new(),
            sharing: Mutex::new(SharingManager::new()),
            input_mutex: Mutex::new(()),
            output_mutex: Mutex::new(()),
            tag_gen: Mutex::new(TagGenerator::default()),
            total_blocks,
            cfg,
        };
        Ok(Coordinator { ctx: Arc::new(ctx), clock: Clock::start() })
    }

    /// Run the copy to completion: start the watchdog, spawn `thr` workers,
    /// join them, perform the optional final cache sync, and compute the exit
    /// code from the highest-severity outcome observed.
    pub fn run(self) -> Result<RunReport, CopyError> {
        if self.ctx.cfg.dry_run {
            return Ok(RunReport {
                exit_code: 0,
                report_line: format_report(&self.ctx.counters.snapshot(), None, self.ctx.cfg.bs),
            });
        }

        let watchdog = Watchdog::spawn(
            self.ctx.cfg.watchdog_ict,
            self.ctx.cfg.watchdog_crt,
            self.ctx.activity.clone(),
            self.ctx.stop.clone(),
            self.ctx.clone(),
        )
        .ok();

        let handles: Vec<JoinHandle<WorkerOutcome>> = (0..self.ctx.cfg.thr)
            .map(|id| {
                let ctx = self.ctx.clone();
                thread::spawn(move || worker::run(ctx, id as usize))
            })
            .collect();

        let mut worst: Option<CopyError> = None;
        for handle in handles {
            match handle.join() {
                Ok(WorkerOutcome::Stopped | WorkerOutcome::EndOfRange | WorkerOutcome::ShortRead) => {}
                Ok(WorkerOutcome::Fatal(err)) => {
                    if worst.as_ref().map(|w| err.exit_code() > w.exit_code()).unwrap_or(true) {
                        worst = Some(err);
                    }
                }
                Err(_) => {
                    if worst.is_none() {
                        worst = Some(CopyError::WorkerPanic);
                    }
                }
            }
        }

        self.ctx.stop.raise();
        self.ctx.barrier.notify_stalled();
        if let Some(wd) = watchdog {
            let _ = wd.join();
        }

        if self.ctx.cfg.sync_on_exit {
            if let Err(e) = sync_output(&self.ctx.cfg) {
                log::warn!("SYNCHRONIZE CACHE on exit failed: {e}");
            }
        }

        let (aborts_issued, aborts_succeeded) = self.ctx.abort_injector.counts();
        self.ctx.counters.aborts_issued.store(aborts_issued, std::sync::atomic::Ordering::Relaxed);
        self.ctx.counters.aborts_succeeded.store(aborts_succeeded, std::sync::atomic::Ordering::Relaxed);

        let elapsed = if self.ctx.cfg.time_mode == crate::config::TimeMode::Off {
            None
        } else {
            Some(self.clock.elapsed())
        };
        let report_line = format_report(&self.ctx.counters.snapshot(), elapsed, self.ctx.cfg.bs);
        eprintln!("{report_line}");

        match worst {
            Some(err) => Err(err),
            None => Ok(RunReport { exit_code: 0, report_line }),
        }
    }
}

fn resolve_total_blocks(cfg: &Config) -> Result<u64, CopyError> {
    if let Some(n) = cfg.count {
        return Ok(n);
    }
    // count=-1/absent: derive from the input endpoint's own size. Reading a
    // device's SCSI capacity (READ CAPACITY(10)/(16)) belongs with file-type
    // probing, an external collaborator this engine does not reimplement; a
    // regular file or block device can still report its own length.
    let meta = std::fs::metadata(&cfg.if_path).map_err(CopyError::Io)?;
    let len = meta.len();
    Ok(len / cfg.bs as u64)
}

fn sync_output(cfg: &Config) -> Result<(), CopyError> {
    let Some(of_path) = &cfg.of_path else { return Ok(()) };
    let mut ep = Endpoint::open_for_write(of_path, cfg.bs, false, false)?;
    if ep.kind.is_pass_through() {
        if let Some(fd) = ep.raw_fd() {
            let mut buf = [];
            ptr::issue(
                fd,
                Direction::SyncCache,
                cfg.cdbsz,
                0,
                0,
                &mut buf,
                cfg.cmd_timeout,
                PtrFlags::default(),
                -1,
                false,
            )
            .map_err(CopyError::from)?;
        }
    } else {
        ep.sync()?;
    }
    Ok(())
}
