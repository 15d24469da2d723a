use std::time::Duration;

use tracing::debug;

use crate::error::Result;
use crate::log::{LogManager, LogRecord};

/// Cursor of a consumer group over one partition of a stream.
///
/// Reading moves the in-memory position only; nothing is durable until [Tailer::commit].
#[derive(Debug, Clone)]
pub struct Tailer<M> {
    manager: M,
    stream: String,
    partition: u32,
    group: String,
    position: u64,
}

impl<M: LogManager> Tailer<M> {
    /// Creates a tailer positioned on the group's last committed offset.
    pub async fn new(manager: M, stream: &str, partition: u32, group: &str) -> Result<Self> {
        let partitions = manager.partitions(stream).await?;
        if partition >= partitions {
            return Err(crate::Error::InvalidPartition {
                stream: stream.to_string(),
                partition,
                partitions,
            });
        }
        let mut tailer = Self {
            manager,
            stream: stream.to_string(),
            partition,
            group: group.to_string(),
            position: 0,
        };
        tailer.to_last_committed().await?;
        Ok(tailer)
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Offset of the next record to read.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Reads up to `max` records from the current position and moves past them.
    pub async fn read(&mut self, max: usize, timeout: Duration) -> Result<Vec<LogRecord>> {
        let records = self
            .manager
            .read(&self.stream, self.partition, self.position, max, timeout)
            .await?;
        if let Some(last) = records.last() {
            self.position = last.offset + 1;
        }
        Ok(records)
    }

    /// Commits the current position.
    pub async fn commit(&self) -> Result<()> {
        self.commit_offset(self.position).await
    }

    /// Commits an explicit offset, typically one behind the position when only a prefix of what
    /// was read has been processed.
    pub async fn commit_offset(&self, offset: u64) -> Result<()> {
        self.manager
            .commit(&self.stream, self.partition, &self.group, offset)
            .await
    }

    pub fn seek(&mut self, offset: u64) {
        debug!(stream = %self.stream, partition = self.partition, offset, "Seeking tailer");
        self.position = offset;
    }

    pub async fn to_last_committed(&mut self) -> Result<()> {
        self.position = self
            .manager
            .committed(&self.stream, self.partition, &self.group)
            .await?;
        Ok(())
    }

    pub async fn to_end(&mut self) -> Result<()> {
        self.position = self
            .manager
            .end_offset(&self.stream, self.partition)
            .await?;
        Ok(())
    }

    pub fn to_start(&mut self) {
        self.position = 0;
    }
}
