//! Concurrent SCSI pass-through block copy engine.
//!
//! Module layout mirrors the component breakdown: each file owns one piece
//! of the pipeline (CDB construction, one in-flight request, batching,
//! classification, the segment loop, and the coordinator tying them
//! together), the same one-concern-per-module shape the teacher uses for its
//! protocol/server/storage split.

pub mod abort;
pub mod barrier;
pub mod cdb;
pub mod classifier;
pub mod config;
pub mod coordinator;
pub mod endpoint;
pub mod error;
pub mod mrq;
pub mod ptr;
pub mod sgio;
pub mod sharing;
pub mod stats;
pub mod watchdog;
pub mod worker;

pub use config::{CliArgs, Config};
pub use coordinator::Coordinator;
pub use error::CopyError;
