//! In-process [LogManager]. Records and committed offsets live as long as the last clone of the
//! manager, which makes it the backend for tests and for single process topologies.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::{Error, Result};
use crate::log::{LogLag, LogManager, LogOffset, LogRecord, deadline_after};
use crate::record::Record;

/// Makes the next N operations of a kind fail, to exercise failure paths.
#[derive(Debug, Default)]
pub struct ErrorInjector {
    fail_next_appends: AtomicUsize,
    fail_next_reads: AtomicUsize,
    fail_next_commits: AtomicUsize,
}

impl ErrorInjector {
    /// Fail the next N appends.
    pub fn fail_appends(&self, count: usize) {
        self.fail_next_appends.store(count, Ordering::Relaxed);
    }

    /// Fail the next N reads.
    pub fn fail_reads(&self, count: usize) {
        self.fail_next_reads.store(count, Ordering::Relaxed);
    }

    /// Fail the next N commits.
    pub fn fail_commits(&self, count: usize) {
        self.fail_next_commits.store(count, Ordering::Relaxed);
    }

    pub(crate) fn should_fail_append(&self) -> bool {
        Self::decrement(&self.fail_next_appends)
    }

    pub(crate) fn should_fail_read(&self) -> bool {
        Self::decrement(&self.fail_next_reads)
    }

    pub(crate) fn should_fail_commit(&self) -> bool {
        Self::decrement(&self.fail_next_commits)
    }

    fn decrement(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| c.checked_sub(1))
            .is_ok()
    }
}

#[derive(Debug, Default)]
struct MemStream {
    partitions: Vec<Vec<Record>>,
    /// committed offsets per group, indexed by partition
    groups: BTreeMap<String, Vec<u64>>,
}

impl MemStream {
    fn partition(&self, stream: &str, partition: u32) -> Result<&Vec<Record>> {
        self.partitions
            .get(partition as usize)
            .ok_or_else(|| Error::InvalidPartition {
                stream: stream.to_string(),
                partition,
                partitions: self.partitions.len() as u32,
            })
    }
}

#[derive(Debug, Default)]
struct Inner {
    streams: RwLock<BTreeMap<String, MemStream>>,
    appended: Notify,
    errors: ErrorInjector,
}

#[derive(Debug, Clone, Default)]
pub struct MemLogManager {
    inner: Arc<Inner>,
}

impl MemLogManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error_injector(&self) -> &ErrorInjector {
        &self.inner.errors
    }

    fn with_stream<T>(&self, stream: &str, f: impl FnOnce(&MemStream) -> Result<T>) -> Result<T> {
        let streams = self.inner.streams.read();
        let s = streams
            .get(stream)
            .ok_or_else(|| Error::StreamNotFound(stream.to_string()))?;
        f(s)
    }

    fn slice(&self, stream: &str, partition: u32, from: u64, max: usize) -> Result<Vec<LogRecord>> {
        self.with_stream(stream, |s| {
            let records = s.partition(stream, partition)?;
            Ok(records
                .iter()
                .enumerate()
                .skip(from as usize)
                .take(max)
                .map(|(offset, record)| LogRecord {
                    partition,
                    offset: offset as u64,
                    record: record.clone(),
                })
                .collect())
        })
    }
}

impl LogManager for MemLogManager {
    async fn create_if_not_exists(&self, stream: &str, partitions: u32) -> Result<bool> {
        if partitions == 0 {
            return Err(Error::Config(format!(
                "stream {stream} needs at least one partition"
            )));
        }
        let mut streams = self.inner.streams.write();
        if streams.contains_key(stream) {
            return Ok(false);
        }
        streams.insert(
            stream.to_string(),
            MemStream {
                partitions: vec![Vec::new(); partitions as usize],
                groups: BTreeMap::new(),
            },
        );
        Ok(true)
    }

    async fn exists(&self, stream: &str) -> bool {
        self.inner.streams.read().contains_key(stream)
    }

    async fn partitions(&self, stream: &str) -> Result<u32> {
        self.with_stream(stream, |s| Ok(s.partitions.len() as u32))
    }

    async fn append(&self, stream: &str, partition: u32, record: Record) -> Result<LogOffset> {
        if self.inner.errors.should_fail_append() {
            return Err(Error::Append(format!(
                "injected append failure on {stream}-{partition}"
            )));
        }
        let offset = {
            let mut streams = self.inner.streams.write();
            let s = streams
                .get_mut(stream)
                .ok_or_else(|| Error::StreamNotFound(stream.to_string()))?;
            let partitions = s.partitions.len() as u32;
            let records =
                s.partitions
                    .get_mut(partition as usize)
                    .ok_or_else(|| Error::InvalidPartition {
                        stream: stream.to_string(),
                        partition,
                        partitions,
                    })?;
            records.push(record);
            records.len() as u64 - 1
        };
        self.inner.appended.notify_waiters();
        Ok(LogOffset { partition, offset })
    }

    async fn read(
        &self,
        stream: &str,
        partition: u32,
        from: u64,
        max: usize,
        timeout: Duration,
    ) -> Result<Vec<LogRecord>> {
        if self.inner.errors.should_fail_read() {
            return Err(Error::Poll(format!(
                "injected read failure on {stream}-{partition}"
            )));
        }
        let deadline = deadline_after(timeout);
        loop {
            // register interest before looking, so an append in between is not missed
            let mut notified = std::pin::pin!(self.inner.appended.notified());
            notified.as_mut().enable();

            let records = self.slice(stream, partition, from, max)?;
            if !records.is_empty() || max == 0 {
                return Ok(records);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(records);
            }
        }
    }

    async fn end_offset(&self, stream: &str, partition: u32) -> Result<u64> {
        self.with_stream(stream, |s| Ok(s.partition(stream, partition)?.len() as u64))
    }

    async fn committed(&self, stream: &str, partition: u32, group: &str) -> Result<u64> {
        self.with_stream(stream, |s| {
            s.partition(stream, partition)?;
            Ok(s.groups
                .get(group)
                .and_then(|offsets| offsets.get(partition as usize))
                .copied()
                .unwrap_or(0))
        })
    }

    async fn commit(&self, stream: &str, partition: u32, group: &str, offset: u64) -> Result<()> {
        if self.inner.errors.should_fail_commit() {
            return Err(Error::Commit(format!(
                "injected commit failure on {stream}-{partition} for {group}"
            )));
        }
        let mut streams = self.inner.streams.write();
        let s = streams
            .get_mut(stream)
            .ok_or_else(|| Error::StreamNotFound(stream.to_string()))?;
        let end = s.partition(stream, partition)?.len() as u64;
        if offset > end {
            return Err(Error::Commit(format!(
                "offset {offset} is past the end {end} of {stream}-{partition}"
            )));
        }
        let partitions = s.partitions.len();
        let offsets = s
            .groups
            .entry(group.to_string())
            .or_insert_with(|| vec![0; partitions]);
        if let Some(current) = offsets.get_mut(partition as usize) {
            if *current < offset {
                *current = offset;
            } else {
                debug!(
                    stream,
                    partition,
                    group,
                    offset,
                    current = *current,
                    "Commit is not ahead of the committed offset, ignoring"
                );
            }
        }
        Ok(())
    }

    async fn lag_per_partition(&self, stream: &str, group: &str) -> Result<Vec<LogLag>> {
        self.with_stream(stream, |s| {
            let committed = s.groups.get(group);
            Ok(s.partitions
                .iter()
                .enumerate()
                .map(|(p, records)| {
                    let pos = committed.and_then(|c| c.get(p)).copied().unwrap_or(0);
                    LogLag::of(pos, records.len() as u64)
                })
                .collect())
        })
    }

    async fn consumer_groups(&self, stream: &str) -> Result<Vec<String>> {
        self.with_stream(stream, |s| Ok(s.groups.keys().cloned().collect()))
    }

    async fn stream_names(&self) -> Result<Vec<String>> {
        Ok(self.inner.streams.read().keys().cloned().collect())
    }
}
