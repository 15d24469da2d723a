//! Streams are named, partitioned, append-only logs. Every partition is an ordered sequence of
//! [Record]s addressed by dense offsets starting at `0`, and every consumer group keeps its own
//! committed offset per partition. A committed offset is the offset of the next record the group
//! will read, so a group that has consumed everything has committed the end offset.
//!
//! The engine only talks to a backend through [LogManager]; [memory::MemLogManager] and
//! [file::FileLogManager] are the two backends shipped here.

use std::iter::Sum;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::Result;
use crate::record::Record;

pub mod appender;
pub(crate) mod codec;
pub mod file;
pub mod memory;
pub mod partitioner;
pub mod tailer;

pub use appender::LogAppender;
pub use tailer::Tailer;

/// A record read back from a partition, with the position it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub partition: u32,
    pub offset: u64,
    pub record: Record,
}

/// Position of an appended record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogOffset {
    pub partition: u32,
    pub offset: u64,
}

impl std::fmt::Display for LogOffset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.partition, self.offset)
    }
}

/// Backlog of a consumer group on one partition, or on a set of partitions once summed.
///
/// `lower_offset` is the committed offset and `upper_offset` the end offset. `upper` counts the
/// records ever appended and `lag` the ones not yet committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogLag {
    pub lower_offset: u64,
    pub upper_offset: u64,
    pub lag: u64,
    pub upper: u64,
}

impl LogLag {
    pub fn of(committed: u64, end: u64) -> Self {
        Self {
            lower_offset: committed,
            upper_offset: end,
            lag: end.saturating_sub(committed),
            upper: end,
        }
    }

    /// Number of records the group has gone through.
    pub fn lower(&self) -> u64 {
        self.upper.saturating_sub(self.lag)
    }
}

/// Aggregation across partitions: lags and sizes add up, the lower bound is the smallest non
/// zero committed offset and the upper bound is the largest end offset.
impl Sum for LogLag {
    fn sum<I: Iterator<Item = LogLag>>(iter: I) -> Self {
        let mut total = LogLag::default();
        let mut lower: Option<u64> = None;
        for lag in iter {
            total.lag += lag.lag;
            total.upper += lag.upper;
            total.upper_offset = total.upper_offset.max(lag.upper_offset);
            if lag.lower_offset > 0 {
                lower = Some(lower.map_or(lag.lower_offset, |l| l.min(lag.lower_offset)));
            }
        }
        total.lower_offset = lower.unwrap_or(0);
        total
    }
}

/// Backend SPI for partitioned logs.
///
/// Implementations must be cheap to clone (share their state behind an `Arc`) since every runner
/// holds its own handle.
#[trait_variant::make(LogManager: Send)]
#[allow(async_fn_in_trait)]
pub trait LocalLogManager {
    /// Creates the stream with `partitions` partitions. Returns `false` when it already existed,
    /// in which case its partition count is left untouched.
    async fn create_if_not_exists(&self, stream: &str, partitions: u32) -> Result<bool>;

    async fn exists(&self, stream: &str) -> bool;

    async fn partitions(&self, stream: &str) -> Result<u32>;

    /// Durably appends `record` to the partition and returns its offset.
    async fn append(&self, stream: &str, partition: u32, record: Record) -> Result<LogOffset>;

    /// Returns up to `max` records starting at offset `from`. Waits up to `timeout` for the first
    /// record when none is available yet and returns an empty batch when the wait runs out.
    async fn read(
        &self,
        stream: &str,
        partition: u32,
        from: u64,
        max: usize,
        timeout: Duration,
    ) -> Result<Vec<LogRecord>>;

    /// Offset the next appended record will get.
    async fn end_offset(&self, stream: &str, partition: u32) -> Result<u64>;

    /// Committed offset of the group, `0` for a group that never committed.
    async fn committed(&self, stream: &str, partition: u32, group: &str) -> Result<u64>;

    /// Moves the committed offset of the group forward. Committing an offset lower or equal to
    /// the current one is a no-op, so concurrent committers can never move it backward.
    async fn commit(&self, stream: &str, partition: u32, group: &str, offset: u64) -> Result<()>;

    /// One entry per partition, in partition order. Does not move any position.
    async fn lag_per_partition(&self, stream: &str, group: &str) -> Result<Vec<LogLag>>;

    /// Groups that committed on the stream, sorted.
    async fn consumer_groups(&self, stream: &str) -> Result<Vec<String>>;

    /// Every stream of the backend, sorted.
    async fn stream_names(&self) -> Result<Vec<String>>;
}

/// Wait applied by readers when a poll returns nothing and no explicit timeout is configured.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Roughly 30 years, the deadline of waits too long to be represented.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `now + timeout`, saturating to a far future instant instead of overflowing.
pub(crate) fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}
