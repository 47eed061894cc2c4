//! Linux `SG_IO` ioctl plumbing.
//!
//! The pass-through envelope (`spec.md` §6 "Wire level") is the kernel `sg_io_hdr`
//! struct submitted via `ioctl(fd, SG_IO, &hdr)`. The struct layout and ioctl number
//! are grounded on `examples/other_examples/..._pakr-rawata__src-linux.rs.rs`, which
//! builds the equivalent struct (there for `SG_ATA_16`) with `libc::ioctl` and
//! `#[repr(C)]`.

use std::os::unix::io::RawFd;

use thiserror::Error;

pub const SG_IO: libc::c_ulong = 0x2285;

pub const SG_DXFER_NONE: i32 = -1;
pub const SG_DXFER_TO_DEV: i32 = -2;
pub const SG_DXFER_FROM_DEV: i32 = -3;

pub const SG_FLAG_DIRECT_IO: u32 = 0x01;
pub const SG_FLAG_MMAP_IO: u32 = 0x04;
pub const SG_FLAG_NO_DXFER: u32 = 0x10000;
pub const SG_FLAG_Q_AT_TAIL: u32 = 0x10;
pub const SG_FLAG_Q_AT_HEAD: u32 = 0x20;

/// Mirrors the kernel's `sg_io_hdr_t` (v3 interface), `#[repr(C)]` so its layout
/// matches exactly what the ioctl expects.
#[repr(C)]
pub struct SgIoHdr {
    pub interface_id: i32,
    pub dxfer_direction: i32,
    pub cmd_len: u8,
    pub mx_sb_len: u8,
    pub iovec_count: u16,
    pub dxfer_len: u32,
    pub dxferp: *mut libc::c_void,
    pub cmdp: *mut u8,
    pub sbp: *mut u8,
    pub timeout: u32,
    pub flags: u32,
    pub pack_id: i32,
    pub usr_ptr: *mut libc::c_void,
    pub status: u8,
    pub masked_status: u8,
    pub msg_status: u8,
    pub sb_len_wr: u8,
    pub host_status: u16,
    pub driver_status: u16,
    pub resid: i32,
    pub duration: u32,
    pub info: u32,
}

impl Default for SgIoHdr {
    fn default() -> Self {
        // SAFETY: every field is a plain integer or a nullable pointer; the
        // all-zeros bit pattern is a valid value for each of them.
        unsafe { std::mem::zeroed() }
    }
}

#[derive(Debug, Error)]
pub enum SgIoError {
    #[error("ioctl(SG_IO) failed: {0}")]
    Ioctl(#[source] std::io::Error),

    #[error("ioctl(SG_IO) failed: out of memory")]
    NoMem,
}

/// How many times `submit` retries a transient failure (`EINTR`, `EAGAIN`,
/// `ENOMEM`) before giving up and returning it to the caller (`spec.md` §4.2,
/// §7 kinds 3 and 4: neither is fatal unless repeated indefinitely).
const TRANSIENT_RETRY_LIMIT: u32 = 64;

/// Raw result of one `SG_IO` ioctl call: the three status fields plus whatever
/// sense data the device returned.
#[derive(Debug, Clone)]
pub struct SgIoResult {
    pub status: u8,
    pub host_status: u16,
    pub driver_status: u16,
    pub resid: i32,
    pub sense: Vec<u8>,
}

/// Best-effort task-management ioctl for the Abort Injector (`spec.md` §4.9).
/// The v3 `SG_IO` interface has no generic per-tag abort; this targets the
/// `SG_IOABORT` ioctl some kernels expose for cancelling an outstanding
/// `sg_io_v4` request by its tag, and is expected to fail harmlessly (`ENOTTY`
/// or `EINVAL`) on a v3-only host. The caller treats failure the same as a
/// race lost to the real completion — neither is reported as an error.
pub const SG_IOABORT: libc::c_ulong = 0x2223;

pub fn abort(fd: RawFd, tag: i32) -> bool {
    let mut tag_buf = tag;
    // SAFETY: `tag_buf` is a valid, live `i32` for the duration of the call.
    let rc = unsafe { libc::ioctl(fd, SG_IOABORT as _, &mut tag_buf as *mut i32) };
    rc >= 0
}

/// Submit one SCSI command through the pass-through interface and block until it
/// completes. Higher layers (PTR, MRQ) are responsible for retry/interrupt handling;
/// this function only performs the syscall.
pub fn submit(
    fd: RawFd,
    cdb: &mut [u8],
    data: &mut [u8],
    direction: i32,
    timeout: std::time::Duration,
    flags: u32,
    pack_id: i32,
) -> Result<SgIoResult, SgIoError> {
    let mut sense = vec![0u8; 64];
    let mut hdr = SgIoHdr {
        interface_id: 'S' as i32,
        dxfer_direction: direction,
        cmd_len: cdb.len() as u8,
        mx_sb_len: sense.len() as u8,
        iovec_count: 0,
        dxfer_len: data.len() as u32,
        dxferp: if data.is_empty() {
            std::ptr::null_mut()
        } else {
            data.as_mut_ptr() as *mut libc::c_void
        },
        cmdp: cdb.as_mut_ptr(),
        sbp: sense.as_mut_ptr(),
        timeout: timeout.as_millis() as u32,
        flags,
        pack_id,
        ..Default::default()
    };

    // SAFETY: `hdr` stays alive for the duration of the call, `cdb`/`data`/`sense`
    // outlive the pointers stored in it, and the ioctl number matches the struct.
    let mut attempt = 0;
    loop {
        let rc = unsafe { libc::ioctl(fd, SG_IO as _, &mut hdr as *mut SgIoHdr) };
        if rc >= 0 {
            break;
        }
        let err = std::io::Error::last_os_error();
        let transient = matches!(
            err.raw_os_error(),
            Some(libc::EINTR) | Some(libc::EAGAIN) | Some(libc::ENOMEM)
        );
        if transient && attempt < TRANSIENT_RETRY_LIMIT {
            attempt += 1;
            std::thread::yield_now();
            continue;
        }
        return match err.raw_os_error() {
            Some(libc::ENOMEM) => Err(SgIoError::NoMem),
            _ => Err(SgIoError::Ioctl(err)),
        };
    }

    sense.truncate(hdr.sb_len_wr as usize);
    Ok(SgIoResult {
        status: hdr.status,
        host_status: hdr.host_status,
        driver_status: hdr.driver_status,
        resid: hdr.resid,
        sense,
    })
}
