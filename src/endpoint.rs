//! Endpoints — one side of the copy (`spec.md` §3 "Endpoint", §9 "Tagged variants").
//!
//! A closed sum type replaces the file-type integer bitfield the original tool
//! uses, so the worker's dispatch is exhaustive and the compiler enforces that
//! every endpoint kind is handled. Grounded on the teacher's `BlockStorage` trait
//! (`src/storage/mod.rs`) and `FileBackend` (`src/storage/file.rs`): same
//! open/read/write/flush shape, generalized from "one file" to the five kinds
//! `spec.md` §3 names.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

use rand::{RngCore, SeedableRng};
use thiserror::Error;

use crate::config::SyntheticPattern;

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("I/O error opening {path}: {source}")]
    Open { path: String, #[source] source: std::io::Error },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("mmap setup failed: {0}")]
    Mmap(std::io::Error),

    #[error("synthetic data source is only valid on the input side")]
    SyntheticOnOutput,

    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },
}

/// Closed sum type for the five endpoint kinds `spec.md` §3 names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    PassThrough,
    Block,
    Regular,
    Fifo,
    DevNull,
    Synthetic(SyntheticPattern),
}

impl EndpointKind {
    pub fn is_pass_through(self) -> bool {
        matches!(self, EndpointKind::PassThrough)
    }

    pub fn is_synthetic(self) -> bool {
        matches!(self, EndpointKind::Synthetic(_))
    }
}

/// Probe a path's kind from its file-type bits. Deliberately shallow: major/minor
/// kernel-version fingerprinting is an external collaborator per `spec.md` §1; this
/// only distinguishes fifo/block/char/regular, the minimum a worker needs to pick a
/// dispatch arm.
fn probe_kind(path: &str) -> std::io::Result<EndpointKind> {
    if path == "." {
        return Ok(EndpointKind::DevNull);
    }
    if path == "-" {
        return Ok(EndpointKind::Regular);
    }
    let meta = std::fs::metadata(path)?;
    let ft = meta.file_type();
    if ft.is_fifo() {
        Ok(EndpointKind::Fifo)
    } else if ft.is_block_device() {
        Ok(EndpointKind::Block)
    } else if ft.is_char_device() && path.contains("sg") {
        Ok(EndpointKind::PassThrough)
    } else {
        Ok(EndpointKind::Regular)
    }
}

/// One side of the copy: a tagged handle plus its negotiated geometry
/// (`spec.md` §3 "Endpoint").
pub struct Endpoint {
    pub kind: EndpointKind,
    pub block_size: u32,
    file: Option<File>,
    /// Deterministic generator state for the `Random` synthetic pattern; kept
    /// per-endpoint rather than per-worker so repeated opens are independent.
    rng: Option<rand::rngs::StdRng>,
}

impl Endpoint {
    /// Open a real (non-synthetic) endpoint for reading.
    pub fn open_for_read(path: &str, block_size: u32, direct: bool) -> Result<Self, EndpointError> {
        Self::open(path, block_size, false, direct, false)
    }

    /// Open a real (non-synthetic) endpoint for writing.
    pub fn open_for_write(
        path: &str,
        block_size: u32,
        direct: bool,
        append: bool,
    ) -> Result<Self, EndpointError> {
        Self::open(path, block_size, true, direct, append)
    }

    fn open(path: &str, block_size: u32, write: bool, direct: bool, append: bool) -> Result<Self, EndpointError> {
        if path == "." {
            return Ok(Endpoint { kind: EndpointKind::DevNull, block_size, file: None, rng: None });
        }
        let kind = probe_kind(path).map_err(|source| EndpointError::Open { path: path.to_string(), source })?;

        let mut opts = OpenOptions::new();
        opts.read(!write || kind == EndpointKind::Block).write(write);
        if write && kind == EndpointKind::Regular {
            opts.create(true);
            if append {
                opts.append(true);
            }
        }
        #[cfg(target_os = "linux")]
        if direct {
            opts.custom_flags(libc::O_DIRECT);
        }
        let file = if path == "-" {
            // stdio: dup onto a real File handle so callers have one uniform type.
            let fd = if write { 1 } else { 0 };
            // SAFETY: fd 0/1 are valid for the process lifetime; File::from_raw_fd
            // takes ownership, so avoid a double-close by forgetting a dup'd copy.
            unsafe {
                use std::os::unix::io::FromRawFd;
                let dup = libc::dup(fd);
                if dup < 0 {
                    return Err(EndpointError::Open { path: path.to_string(), source: std::io::Error::last_os_error() });
                }
                File::from_raw_fd(dup)
            }
        } else {
            opts.open(path).map_err(|source| EndpointError::Open { path: path.to_string(), source })?
        };

        Ok(Endpoint { kind, block_size, file: Some(file), rng: None })
    }

    /// Build a synthetic input-only endpoint (`spec.md` §3 "the SYNTHETIC kind is
    /// only valid on the input side").
    pub fn synthetic(pattern: SyntheticPattern, block_size: u32) -> Self {
        Endpoint {
            kind: EndpointKind::Synthetic(pattern),
            block_size,
            file: None,
            rng: Some(rand::rngs::StdRng::from_entropy()),
        }
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.file.as_ref().map(|f| f.as_raw_fd())
    }

    /// Read `blocks` logical blocks starting at `lba` into `buf`
    /// (`buf.len() == blocks as usize * block_size as usize`).
    ///
    /// Only valid for `Regular`/`Block`/`Fifo` (non-pass-through, non-synthetic)
    /// endpoints; `PassThrough` reads go through `ptr::submit_read` instead.
    pub fn read_blocks(&mut self, lba: u64, buf: &mut [u8]) -> Result<usize, EndpointError> {
        match self.kind {
            EndpointKind::DevNull => {
                buf.fill(0);
                Ok(buf.len())
            }
            EndpointKind::Synthetic(pattern) => {
                self.fill_synthetic(pattern, lba, buf);
                Ok(buf.len())
            }
            EndpointKind::Fifo | EndpointKind::Regular | EndpointKind::Block => {
                let file = self.file.as_mut().expect("opened non-synthetic endpoint has a file");
                if self.kind != EndpointKind::Fifo {
                    file.seek(SeekFrom::Start(lba * self.block_size as u64))?;
                }
                let mut total = 0;
                while total < buf.len() {
                    let n = file.read(&mut buf[total..])?;
                    if n == 0 {
                        break;
                    }
                    total += n;
                }
                Ok(total)
            }
            EndpointKind::PassThrough => {
                unreachable!("pass-through reads are dispatched through ptr::submit_read")
            }
        }
    }

    /// Write `data` (a whole number of blocks) starting at `lba`.
    pub fn write_blocks(&mut self, lba: u64, data: &[u8]) -> Result<(), EndpointError> {
        match self.kind {
            EndpointKind::DevNull => Ok(()),
            EndpointKind::Synthetic(_) => Err(EndpointError::SyntheticOnOutput),
            EndpointKind::Fifo | EndpointKind::Regular | EndpointKind::Block => {
                let file = self.file.as_mut().expect("opened non-synthetic endpoint has a file");
                if self.kind != EndpointKind::Fifo {
                    file.seek(SeekFrom::Start(lba * self.block_size as u64))?;
                }
                file.write_all(data)?;
                Ok(())
            }
            EndpointKind::PassThrough => {
                unreachable!("pass-through writes are dispatched through ptr::submit_write")
            }
        }
    }

    pub fn sync(&mut self) -> Result<(), EndpointError> {
        if let Some(file) = &self.file {
            file.sync_all()?;
        }
        Ok(())
    }

    fn fill_synthetic(&mut self, pattern: SyntheticPattern, lba: u64, buf: &mut [u8]) {
        let bs = self.block_size as usize;
        match pattern {
            SyntheticPattern::Zero => buf.fill(0),
            SyntheticPattern::Ff => buf.fill(0xff),
            SyntheticPattern::SelfAddress => {
                buf.fill(0);
                if bs < 4 {
                    return;
                }
                let blocks = buf.len() / bs;
                for k in 0..blocks {
                    let addr = (lba + k as u64) as u32;
                    let off = k * bs;
                    let mut j = 0;
                    while j + 4 <= bs {
                        buf[off + j..off + j + 4].copy_from_slice(&addr.to_be_bytes());
                        j += 4;
                    }
                }
            }
            SyntheticPattern::Random => {
                let rng = self.rng.as_mut().expect("synthetic endpoint carries an rng");
                rng.fill_bytes(buf);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_zero_pattern() {
        let mut ep = Endpoint::synthetic(SyntheticPattern::Zero, 16);
        let mut buf = vec![0xAAu8; 32];
        ep.read_blocks(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn synthetic_ff_pattern() {
        let mut ep = Endpoint::synthetic(SyntheticPattern::Ff, 16);
        let mut buf = vec![0u8; 16];
        ep.read_blocks(5, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xff));
    }

    #[test]
    fn synthetic_self_address_pattern_matches_scenario_2() {
        // spec.md §8 scenario 2: bs=512 count=3, block k encodes iblk+k as a
        // big-endian 32-bit word repeated through the block.
        let mut ep = Endpoint::synthetic(SyntheticPattern::SelfAddress, 512);
        let mut buf = vec![0u8; 512 * 3];
        ep.read_blocks(0, &mut buf).unwrap();
        assert_eq!(&buf[0..4], &[0, 0, 0, 0]);
        assert_eq!(&buf[512..516], &[0, 0, 0, 1]);
        assert_eq!(&buf[1024..1028], &[0, 0, 0, 2]);
    }

    #[test]
    fn devnull_read_is_zero_filled_write_is_noop() {
        let mut ep = Endpoint::open_for_write(".", 512, false, false).unwrap();
        ep.write_blocks(0, &vec![1u8; 512]).unwrap();
        let mut read_ep = Endpoint::open_for_read(".", 512, false).unwrap();
        let mut buf = vec![9u8; 512];
        read_ep.read_blocks(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn regular_file_round_trip() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let path = tmp.path().to_str().unwrap();
        let mut writer = Endpoint::open_for_write(path, 512, false, false).unwrap();
        let data = vec![0x42u8; 512 * 4];
        writer.write_blocks(0, &data).unwrap();
        writer.sync().unwrap();

        let mut reader = Endpoint::open_for_read(path, 512, false).unwrap();
        let mut buf = vec![0u8; 512 * 4];
        let n = reader.read_blocks(0, &mut buf).unwrap();
        assert_eq!(n, buf.len());
        assert_eq!(buf, data);
    }
}
