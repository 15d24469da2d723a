//! [ComputationContext] is the only way a computation affects the world: it produces records,
//! sets timers and asks its runner for checkpoints. Nothing produced is visible downstream until
//! the runner flushes the [Accumulator] at a checkpoint.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::log::{LogOffset, deadline_after};
use crate::record::Record;

/// A record waiting to be appended to the stream bound to `output`.
#[derive(Debug, Clone, PartialEq)]
pub struct Produced {
    pub output: String,
    /// `None` lets the stream's partitioner decide.
    pub partition: Option<u32>,
    pub record: Record,
}

/// Records produced since the last checkpoint, in production order.
#[derive(Debug, Default)]
pub struct Accumulator {
    produced: Vec<Produced>,
}

impl Accumulator {
    pub fn len(&self) -> usize {
        self.produced.len()
    }

    pub fn is_empty(&self) -> bool {
        self.produced.is_empty()
    }

    pub fn records(&self) -> &[Produced] {
        &self.produced
    }

    /// Drops everything produced after the first `len` records.
    pub fn truncate(&mut self, len: usize) {
        self.produced.truncate(len);
    }

    pub fn drain(&mut self) -> Vec<Produced> {
        std::mem::take(&mut self.produced)
    }

    fn push(&mut self, produced: Produced) {
        self.produced.push(produced);
    }
}

#[derive(Debug, Clone, Copy)]
struct Timer {
    due: Instant,
    /// wall clock millis handed to the computation when the timer fires
    timestamp: u64,
}

#[derive(Debug)]
pub struct ComputationContext {
    computation: String,
    partition: u32,
    /// declared outputs and the partition count of the stream each is bound to
    outputs: BTreeMap<String, u32>,
    accumulator: Accumulator,
    timers: BTreeMap<String, Timer>,
    checkpoint: bool,
    termination: bool,
    last_offset: Option<LogOffset>,
}

impl ComputationContext {
    pub fn new(computation: &str, partition: u32, outputs: BTreeMap<String, u32>) -> Self {
        Self {
            computation: computation.to_string(),
            partition,
            outputs,
            accumulator: Accumulator::default(),
            timers: BTreeMap::new(),
            checkpoint: false,
            termination: false,
            last_offset: None,
        }
    }

    pub fn computation_name(&self) -> &str {
        &self.computation
    }

    /// Partition of the inputs this context is serving.
    pub fn partition(&self) -> u32 {
        self.partition
    }

    /// Offset of the input record being processed, `None` in `init` and timers.
    pub fn last_offset(&self) -> Option<LogOffset> {
        self.last_offset
    }

    pub fn produce(&mut self, output: &str, record: Record) -> Result<()> {
        self.check_output(output)?;
        self.accumulator.push(Produced {
            output: output.to_string(),
            partition: None,
            record,
        });
        Ok(())
    }

    pub fn produce_to_partition(
        &mut self,
        output: &str,
        partition: u32,
        record: Record,
    ) -> Result<()> {
        let partitions = self.check_output(output)?;
        if partition >= partitions {
            return Err(Error::InvalidPartition {
                stream: output.to_string(),
                partition,
                partitions,
            });
        }
        self.accumulator.push(Produced {
            output: output.to_string(),
            partition: Some(partition),
            record,
        });
        Ok(())
    }

    pub fn produce_key_value(
        &mut self,
        output: &str,
        key: impl Into<Bytes>,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        self.produce(output, Record::new(key, payload))
    }

    /// Fires `process_timer` for `key` once `delay` elapsed. Setting an existing key moves it.
    pub fn set_timer(&mut self, key: &str, delay: Duration) {
        let timestamp = (Utc::now().timestamp_millis().max(0) as u64)
            .saturating_add(delay.as_millis() as u64);
        self.timers.insert(
            key.to_string(),
            Timer {
                due: deadline_after(delay),
                timestamp,
            },
        );
    }

    pub fn cancel_timer(&mut self, key: &str) -> bool {
        self.timers.remove(key).is_some()
    }

    /// Asks the runner to commit right after the current record.
    pub fn ask_for_checkpoint(&mut self) {
        self.checkpoint = true;
    }

    pub fn cancel_ask_for_checkpoint(&mut self) {
        self.checkpoint = false;
    }

    /// Asks the runner to stop after the next checkpoint.
    pub fn ask_for_termination(&mut self) {
        self.termination = true;
    }

    fn check_output(&self, output: &str) -> Result<u32> {
        self.outputs.get(output).copied().ok_or_else(|| {
            Error::Processing(format!(
                "{} produced to undeclared output {output}",
                self.computation
            ))
        })
    }

    pub(crate) fn accumulator(&self) -> &Accumulator {
        &self.accumulator
    }

    pub(crate) fn accumulator_mut(&mut self) -> &mut Accumulator {
        &mut self.accumulator
    }

    pub(crate) fn set_last_offset(&mut self, offset: Option<LogOffset>) {
        self.last_offset = offset;
    }

    pub(crate) fn checkpoint_requested(&self) -> bool {
        self.checkpoint
    }

    pub(crate) fn termination_requested(&self) -> bool {
        self.termination
    }

    pub(crate) fn checkpoint_done(&mut self) {
        self.checkpoint = false;
    }

    /// Earliest pending timer.
    pub(crate) fn next_timer(&self) -> Option<Instant> {
        self.timers.values().map(|t| t.due).min()
    }

    /// Removes and returns the timers due at `now`, earliest first.
    pub(crate) fn take_expired(&mut self, now: Instant) -> Vec<(String, u64)> {
        let mut expired: Vec<(String, Timer)> = self
            .timers
            .iter()
            .filter(|(_, t)| t.due <= now)
            .map(|(k, t)| (k.clone(), *t))
            .collect();
        expired.sort_by_key(|(_, t)| t.due);
        for (key, _) in &expired {
            self.timers.remove(key);
        }
        expired.into_iter().map(|(k, t)| (k, t.timestamp)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> ComputationContext {
        ComputationContext::new("upper", 1, BTreeMap::from([("o1".to_string(), 2)]))
    }

    #[test]
    fn produce_accumulates_in_order() {
        let mut ctx = context();
        ctx.produce("o1", Record::of_key("a")).unwrap();
        ctx.produce_key_value("o1", "b", "payload").unwrap();
        ctx.produce_to_partition("o1", 1, Record::of_key("c")).unwrap();

        let produced = ctx.accumulator().records();
        assert_eq!(produced.len(), 3);
        assert_eq!(produced[1].record.payload, Bytes::from("payload"));
        assert_eq!(produced[2].partition, Some(1));
        assert_eq!(produced[0].partition, None);
    }

    #[test]
    fn undeclared_output_is_rejected() {
        let mut ctx = context();
        assert!(matches!(
            ctx.produce("o2", Record::of_key("a")),
            Err(Error::Processing(_))
        ));
        assert!(matches!(
            ctx.produce_to_partition("o1", 2, Record::of_key("a")),
            Err(Error::InvalidPartition { partitions: 2, .. })
        ));
        assert!(ctx.accumulator().is_empty());
    }

    #[test]
    fn checkpoint_and_termination_flags() {
        let mut ctx = context();
        assert!(!ctx.checkpoint_requested());
        ctx.ask_for_checkpoint();
        assert!(ctx.checkpoint_requested());
        ctx.cancel_ask_for_checkpoint();
        assert!(!ctx.checkpoint_requested());
        ctx.ask_for_checkpoint();
        ctx.checkpoint_done();
        assert!(!ctx.checkpoint_requested());

        ctx.ask_for_termination();
        assert!(ctx.termination_requested());
        assert_eq!(ctx.partition(), 1);
        assert_eq!(ctx.computation_name(), "upper");
    }

    #[tokio::test(start_paused = true)]
    async fn timers_fire_in_due_order() {
        let mut ctx = context();
        ctx.set_timer("late", Duration::from_secs(2));
        ctx.set_timer("early", Duration::from_secs(1));
        ctx.set_timer("cancelled", Duration::from_millis(10));
        assert!(ctx.cancel_timer("cancelled"));
        assert!(!ctx.cancel_timer("cancelled"));

        assert!(ctx.take_expired(Instant::now()).is_empty());
        tokio::time::advance(Duration::from_secs(3)).await;

        let fired: Vec<String> = ctx
            .take_expired(Instant::now())
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(fired, vec!["early", "late"]);
        assert!(ctx.next_timer().is_none());
    }

    #[tokio::test]
    async fn far_timers_do_not_overflow() {
        let mut ctx = context();
        ctx.set_timer("never", Duration::MAX);
        assert!(ctx.next_timer().is_some());
        assert!(ctx.take_expired(Instant::now()).is_empty());
    }

    #[test]
    fn truncate_discards_tail() {
        let mut acc = Accumulator::default();
        acc.push(Produced {
            output: "o1".into(),
            partition: None,
            record: Record::of_key("a"),
        });
        acc.push(Produced {
            output: "o1".into(),
            partition: None,
            record: Record::of_key("b"),
        });
        acc.truncate(1);
        assert_eq!(acc.len(), 1);
        assert_eq!(acc.drain().len(), 1);
        assert!(acc.is_empty());
    }
}
