use std::fmt;

use crate::error::Result;
use crate::log::partitioner::{Partitioner, Partitioning};
use crate::log::{LogManager, LogOffset};
use crate::record::Record;

/// Appends to one stream, picking partitions through the configured [Partitioner].
pub struct LogAppender<M> {
    manager: M,
    stream: String,
    partitions: u32,
    partitioner: Box<dyn Partitioner>,
}

impl<M> fmt::Debug for LogAppender<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogAppender")
            .field("stream", &self.stream)
            .field("partitions", &self.partitions)
            .finish()
    }
}

impl<M: LogManager> LogAppender<M> {
    /// The stream must exist.
    pub async fn open(manager: M, stream: &str, partitioning: Partitioning) -> Result<Self> {
        let partitions = manager.partitions(stream).await?;
        Ok(Self {
            manager,
            stream: stream.to_string(),
            partitions,
            partitioner: partitioning.partitioner(),
        })
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    /// Appends to the partition chosen by the partitioner.
    pub async fn append(&mut self, record: Record) -> Result<LogOffset> {
        let partition = self.partitioner.partition(&record, self.partitions);
        self.manager.append(&self.stream, partition, record).await
    }

    /// Appends to an explicit partition.
    pub async fn append_to(&self, partition: u32, record: Record) -> Result<LogOffset> {
        self.manager.append(&self.stream, partition, record).await
    }
}
