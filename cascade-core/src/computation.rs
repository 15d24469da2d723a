//! A [Computation] is user code with named logical inputs (`i1`, `i2`, ...) and outputs (`o1`,
//! `o2`, ...). The [Topology](crate::topology::Topology) binds those names to concrete streams.
//! A computation instance is driven by a single runner, so its handlers are never called
//! concurrently.

use std::fmt;
use std::sync::Arc;

use tracing::{error, warn};

use crate::context::ComputationContext;
use crate::error::{Error, Result};
use crate::record::Record;

/// Name and logical streams of a computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputationMetadata {
    name: String,
    inputs: Vec<String>,
    outputs: Vec<String>,
}

impl ComputationMetadata {
    /// Metadata with inputs `i1..=i{nb_inputs}` and outputs `o1..=o{nb_outputs}`.
    pub fn new(name: &str, nb_inputs: usize, nb_outputs: usize) -> Self {
        Self {
            name: name.to_string(),
            inputs: (1..=nb_inputs).map(|i| format!("i{i}")).collect(),
            outputs: (1..=nb_outputs).map(|i| format!("o{i}")).collect(),
        }
    }

    pub fn with_streams(
        name: &str,
        inputs: impl IntoIterator<Item = impl Into<String>>,
        outputs: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.to_string(),
            inputs: inputs.into_iter().map(Into::into).collect(),
            outputs: outputs.into_iter().map(Into::into).collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }
}

/// What was being processed when a handler failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureSource {
    Record {
        input: String,
        partition: u32,
        offset: u64,
        key: String,
    },
    Timer {
        key: String,
    },
    Flush,
}

/// A failed attempt, handed to [Computation::process_retry] and [Computation::process_failure].
#[derive(Debug, Clone)]
pub struct Failure {
    pub error: Error,
    /// failed attempts so far, `1` after the first failure
    pub attempt: u32,
    pub source: FailureSource,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            FailureSource::Record {
                input,
                partition,
                offset,
                key,
            } => write!(
                f,
                "record {key} at {input}-{partition}:{offset} (attempt {}): {}",
                self.attempt, self.error
            ),
            FailureSource::Timer { key } => {
                write!(f, "timer {key} (attempt {}): {}", self.attempt, self.error)
            }
            FailureSource::Flush => write!(f, "flush (attempt {}): {}", self.attempt, self.error),
        }
    }
}

pub trait Computation: Send {
    fn metadata(&self) -> &ComputationMetadata;

    /// Called once, before anything else.
    fn init(&mut self, _context: &mut ComputationContext) -> Result<()> {
        Ok(())
    }

    /// Business logic for one record read from the logical input `input`.
    fn process_record(
        &mut self,
        context: &mut ComputationContext,
        input: &str,
        record: &Record,
    ) -> Result<()>;

    /// A timer set through the context has elapsed. `timestamp` is the wall clock millis it was
    /// due at.
    fn process_timer(
        &mut self,
        _context: &mut ComputationContext,
        _key: &str,
        _timestamp: u64,
    ) -> Result<()> {
        Ok(())
    }

    /// Called before every retry of a failed attempt.
    fn process_retry(&mut self, context: &mut ComputationContext, failure: &Failure) {
        warn!(
            computation = %context.computation_name(),
            partition = context.partition(),
            last_offset = ?context.last_offset(),
            attempt = failure.attempt,
            error = %failure.error,
            "Retrying {failure}"
        );
    }

    /// Called once the retries are exhausted, before the policy decides to skip or halt.
    fn process_failure(&mut self, context: &mut ComputationContext, failure: &Failure) {
        error!(
            computation = %context.computation_name(),
            partition = context.partition(),
            last_offset = ?context.last_offset(),
            attempt = failure.attempt,
            error = %failure.error,
            "Retries exhausted for {failure}"
        );
    }

    /// Called when the runner stops.
    fn destroy(&mut self) {}
}

/// Creates a fresh instance for every runner.
pub type ComputationFactory = Arc<dyn Fn() -> Box<dyn Computation> + Send + Sync>;
