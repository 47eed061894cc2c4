//! Crate-wide error aggregation.
//!
//! Each module owns a small, focused error enum (`ConfigError`, `CdbError`,
//! `EndpointError`, `PtrError`, ...). `CopyError` composes them with `#[from]` so a
//! worker can propagate any of them with `?` while the top-level binary still gets
//! one type to match on for exit-code selection.

use thiserror::Error;

use crate::cdb::CdbError;
use crate::config::ConfigError;
use crate::endpoint::EndpointError;
use crate::mrq::MrqError;
use crate::ptr::PtrError;

/// The top-level error taxonomy, folded into one enum so a single match picks the
/// process exit code regardless of which layer failed.
#[derive(Debug, Error)]
pub enum CopyError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("endpoint open/setup error: {0}")]
    Endpoint(#[from] EndpointError),

    #[error("CDB build error: {0}")]
    Cdb(#[from] CdbError),

    #[error("pass-through request error: {0}")]
    Ptr(#[from] PtrError),

    #[error("MRQ batch error: {0}")]
    Mrq(#[from] MrqError),

    #[error("miscompare detected at LBA {lba}")]
    Miscompare { lba: u64 },

    #[error("fatal I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("worker thread panicked")]
    WorkerPanic,
}

impl CopyError {
    /// Map an error to the process exit code family it belongs to. Larger values
    /// are more severe; when several workers fail concurrently the coordinator
    /// keeps the largest one seen.
    pub fn exit_code(&self) -> i32 {
        match self {
            CopyError::Config(_) => 1,
            CopyError::Endpoint(_) => 2,
            CopyError::Cdb(_) => 1,
            CopyError::Miscompare { .. } => 3,
            CopyError::Ptr(_) => 4,
            CopyError::Mrq(_) => 4,
            CopyError::Io(_) => 4,
            CopyError::WorkerPanic => 5,
        }
    }
}
