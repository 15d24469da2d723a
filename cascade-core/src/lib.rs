//! Stream computation engine over partitioned append-only logs.
//!
//! A [Topology](topology::Topology) wires [Computation](computation::Computation)s to named
//! streams. The [StreamProcessor](processor::StreamProcessor) runs one
//! [Runner](runner::Runner) per computation and partition: it reads records, hands them to the
//! computation, appends what it produced and only then commits the consumed offsets, so a
//! restart redelivers anything that was not fully handled (at-least-once).
//!
//! Streams live behind the [LogManager](log::LogManager) trait, with an in-memory and a
//! file-backed implementation.

pub mod computation;
pub mod config;
pub mod context;
pub mod error;
pub mod lag;
pub mod log;
pub mod metrics;
pub mod policy;
pub mod processor;
pub mod record;
pub mod registry;
pub mod runner;
pub mod topology;

pub use crate::error::{Error, ErrorKind, Result};
