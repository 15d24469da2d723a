//! Durable [LogManager] rooted at a directory.
//!
//! ```text
//! <root>/<stream>/metadata.json          partition count
//! <root>/<stream>/partition-<p>.log      length prefixed record frames, append only
//! <root>/<stream>/offsets/<group>.json   committed offset per partition
//! ```
//! Offsets files are replaced atomically (written to a temp file, then renamed). Reopening the
//! directory restores every stream, its records and the committed offsets of every group.
//!
//! A failed append is cut back to the last complete frame before the error is returned, so a
//! segment only ever ends with a partial frame after a crash, and that tail is dropped on open.
//!
//! Segments are loaded whole on open and every appended record stays in memory, reads never touch
//! the disk. Memory use grows with the total size of the logs under the root, there is no
//! retention.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::log::codec::{decode_frames, encode_frame};
use crate::log::memory::ErrorInjector;
use crate::log::{LogLag, LogManager, LogOffset, LogRecord, deadline_after};
use crate::record::Record;

const METADATA_FILE: &str = "metadata.json";
const OFFSETS_DIR: &str = "offsets";

#[derive(Debug, Serialize, Deserialize)]
struct StreamMetadata {
    partitions: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct GroupOffsets {
    offsets: Vec<u64>,
}

#[derive(Debug)]
struct FilePartition {
    records: Vec<Record>,
    file: File,
    /// bytes of complete frames in the segment
    len: u64,
    /// the segment may hold bytes past `len` left by a failed append
    dirty: bool,
}

impl FilePartition {
    /// Appends and syncs one frame. On failure the segment is truncated back to its last
    /// complete frame; if that fails too, the next append retries the truncation first.
    async fn write_frame(&mut self, frame: &[u8], torn: bool) -> std::io::Result<()> {
        if self.dirty {
            self.file.set_len(self.len).await?;
            self.dirty = false;
        }
        if let Err(e) = self.write_and_sync(frame, torn).await {
            match self.file.set_len(self.len).await {
                Ok(()) => debug!(len = self.len, "Rolled back failed append"),
                Err(rollback) => {
                    error!(len = self.len, %rollback, "Rolling back failed append");
                    self.dirty = true;
                }
            }
            return Err(e);
        }
        self.len += frame.len() as u64;
        Ok(())
    }

    async fn write_and_sync(&mut self, frame: &[u8], torn: bool) -> std::io::Result<()> {
        if torn {
            let half = frame.get(..frame.len() / 2).unwrap_or_default();
            self.file.write_all(half).await?;
            self.file.flush().await?;
            return Err(std::io::Error::other("injected failure after a partial write"));
        }
        self.file.write_all(frame).await?;
        self.file.sync_data().await
    }
}

#[derive(Debug)]
struct FileStream {
    dir: PathBuf,
    partitions: Vec<FilePartition>,
    groups: BTreeMap<String, Vec<u64>>,
}

impl FileStream {
    fn partition(&self, stream: &str, partition: u32) -> Result<&FilePartition> {
        self.partitions
            .get(partition as usize)
            .ok_or_else(|| self.invalid(stream, partition))
    }

    fn partition_mut(&mut self, stream: &str, partition: u32) -> Result<&mut FilePartition> {
        let err = self.invalid(stream, partition);
        self.partitions.get_mut(partition as usize).ok_or(err)
    }

    fn invalid(&self, stream: &str, partition: u32) -> Error {
        Error::InvalidPartition {
            stream: stream.to_string(),
            partition,
            partitions: self.partitions.len() as u32,
        }
    }
}

#[derive(Debug)]
struct Inner {
    root: PathBuf,
    streams: Mutex<BTreeMap<String, FileStream>>,
    appended: Notify,
    errors: ErrorInjector,
}

#[derive(Debug, Clone)]
pub struct FileLogManager {
    inner: Arc<Inner>,
}

fn partition_path(dir: &Path, partition: u32) -> PathBuf {
    dir.join(format!("partition-{partition:05}.log"))
}

/// Stream and group names become path components.
fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty()
        || name.starts_with('.')
        || name.contains(|c: char| c == '/' || c == '\\' || c.is_control())
    {
        return Err(Error::Config(format!("invalid {kind} name {name:?}")));
    }
    Ok(())
}

async fn open_partition(dir: &Path, partition: u32) -> Result<FilePartition> {
    let path = partition_path(dir, partition);
    let data = match fs::read(&path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    let (records, consumed) = decode_frames(&data)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await?;
    if consumed < data.len() {
        warn!(
            path = %path.display(),
            dropped = data.len() - consumed,
            "Truncating torn frame at the end of the partition"
        );
        file.set_len(consumed as u64).await?;
    }
    Ok(FilePartition {
        records,
        file,
        len: consumed as u64,
        dirty: false,
    })
}

async fn write_atomically(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    let mut file = File::create(&tmp).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

impl FileLogManager {
    /// Opens (or creates) the log directory and loads every stream found in it.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;

        let mut streams = BTreeMap::new();
        let mut entries = fs::read_dir(&root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let dir = entry.path();
            if !fs::try_exists(dir.join(METADATA_FILE)).await? {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let stream = Self::load_stream(dir).await?;
            debug!(stream = %name, partitions = stream.partitions.len(), "Loaded stream");
            streams.insert(name, stream);
        }
        info!(root = %root.display(), streams = streams.len(), "Opened file log");

        Ok(Self {
            inner: Arc::new(Inner {
                root,
                streams: Mutex::new(streams),
                appended: Notify::new(),
                errors: ErrorInjector::default(),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Failure injection. An injected append failure writes half of its frame before failing,
    /// like a write interrupted by a full disk.
    pub fn error_injector(&self) -> &ErrorInjector {
        &self.inner.errors
    }

    async fn load_stream(dir: PathBuf) -> Result<FileStream> {
        let metadata: StreamMetadata =
            serde_json::from_slice(&fs::read(dir.join(METADATA_FILE)).await?)?;
        let mut partitions = Vec::with_capacity(metadata.partitions as usize);
        for p in 0..metadata.partitions {
            partitions.push(open_partition(&dir, p).await?);
        }

        let mut groups = BTreeMap::new();
        let offsets_dir = dir.join(OFFSETS_DIR);
        if fs::try_exists(&offsets_dir).await? {
            let mut entries = fs::read_dir(&offsets_dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let Some(group) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                let mut saved: GroupOffsets = serde_json::from_slice(&fs::read(&path).await?)?;
                saved.offsets.resize(partitions.len(), 0);
                groups.insert(group.to_string(), saved.offsets);
            }
        }

        Ok(FileStream {
            dir,
            partitions,
            groups,
        })
    }

    async fn slice(
        &self,
        stream: &str,
        partition: u32,
        from: u64,
        max: usize,
    ) -> Result<Vec<LogRecord>> {
        let streams = self.inner.streams.lock().await;
        let s = streams
            .get(stream)
            .ok_or_else(|| Error::StreamNotFound(stream.to_string()))?;
        Ok(s.partition(stream, partition)?
            .records
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
    }
}

impl LogManager for FileLogManager {
    async fn create_if_not_exists(&self, stream: &str, partitions: u32) -> Result<bool> {
        validate_name("stream", stream)?;
        if partitions == 0 {
            return Err(Error::Config(format!(
                "stream {stream} needs at least one partition"
            )));
        }
        let mut streams = self.inner.streams.lock().await;
        if streams.contains_key(stream) {
            return Ok(false);
        }

        let dir = self.inner.root.join(stream);
        fs::create_dir_all(dir.join(OFFSETS_DIR)).await?;
        let mut files = Vec::with_capacity(partitions as usize);
        for p in 0..partitions {
            files.push(open_partition(&dir, p).await?);
        }
        // metadata goes last, a stream without it is ignored on open
        write_atomically(
            &dir.join(METADATA_FILE),
            &serde_json::to_vec(&StreamMetadata { partitions })?,
        )
        .await?;

        info!(stream, partitions, "Created stream");
        streams.insert(
            stream.to_string(),
            FileStream {
                dir,
                partitions: files,
                groups: BTreeMap::new(),
            },
        );
        Ok(true)
    }

    async fn exists(&self, stream: &str) -> bool {
        self.inner.streams.lock().await.contains_key(stream)
    }

    async fn partitions(&self, stream: &str) -> Result<u32> {
        let streams = self.inner.streams.lock().await;
        streams
            .get(stream)
            .map(|s| s.partitions.len() as u32)
            .ok_or_else(|| Error::StreamNotFound(stream.to_string()))
    }

    async fn append(&self, stream: &str, partition: u32, record: Record) -> Result<LogOffset> {
        let frame = encode_frame(&record)?;
        let offset = {
            let mut streams = self.inner.streams.lock().await;
            let s = streams
                .get_mut(stream)
                .ok_or_else(|| Error::StreamNotFound(stream.to_string()))?;
            let p = s.partition_mut(stream, partition)?;
            let torn = self.inner.errors.should_fail_append();
            p.write_frame(&frame, torn)
                .await
                .map_err(|e| Error::Append(format!("writing to {stream}-{partition}: {e}")))?;
            p.records.push(record);
            p.records.len() as u64 - 1
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
            let mut notified = std::pin::pin!(self.inner.appended.notified());
            notified.as_mut().enable();

            let records = self.slice(stream, partition, from, max).await?;
            if !records.is_empty() || max == 0 {
                return Ok(records);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(records);
            }
        }
    }

    async fn end_offset(&self, stream: &str, partition: u32) -> Result<u64> {
        let streams = self.inner.streams.lock().await;
        let s = streams
            .get(stream)
            .ok_or_else(|| Error::StreamNotFound(stream.to_string()))?;
        Ok(s.partition(stream, partition)?.records.len() as u64)
    }

    async fn committed(&self, stream: &str, partition: u32, group: &str) -> Result<u64> {
        let streams = self.inner.streams.lock().await;
        let s = streams
            .get(stream)
            .ok_or_else(|| Error::StreamNotFound(stream.to_string()))?;
        s.partition(stream, partition)?;
        Ok(s.groups
            .get(group)
            .and_then(|offsets| offsets.get(partition as usize))
            .copied()
            .unwrap_or(0))
    }

    async fn commit(&self, stream: &str, partition: u32, group: &str, offset: u64) -> Result<()> {
        validate_name("group", group)?;
        if self.inner.errors.should_fail_commit() {
            return Err(Error::Commit(format!(
                "injected commit failure on {stream}-{partition} for {group}"
            )));
        }
        let mut streams = self.inner.streams.lock().await;
        let s = streams
            .get_mut(stream)
            .ok_or_else(|| Error::StreamNotFound(stream.to_string()))?;
        let end = s.partition(stream, partition)?.records.len() as u64;
        if offset > end {
            return Err(Error::Commit(format!(
                "offset {offset} is past the end {end} of {stream}-{partition}"
            )));
        }

        let partitions = s.partitions.len();
        let known = s.groups.contains_key(group);
        let mut offsets = s
            .groups
            .get(group)
            .cloned()
            .unwrap_or_else(|| vec![0; partitions]);
        let current = offsets.get(partition as usize).copied().unwrap_or(0);
        if current >= offset && known {
            debug!(
                stream,
                partition,
                group,
                offset,
                current,
                "Commit is not ahead of the committed offset, ignoring"
            );
            return Ok(());
        }
        if let Some(slot) = offsets.get_mut(partition as usize) {
            *slot = (*slot).max(offset);
        }

        let path = s.dir.join(OFFSETS_DIR).join(format!("{group}.json"));
        let contents = serde_json::to_vec(&GroupOffsets {
            offsets: offsets.clone(),
        })?;
        write_atomically(&path, &contents)
            .await
            .map_err(|e| Error::Commit(format!("persisting offsets of {group}: {e}")))?;
        s.groups.insert(group.to_string(), offsets);
        Ok(())
    }

    async fn lag_per_partition(&self, stream: &str, group: &str) -> Result<Vec<LogLag>> {
        let streams = self.inner.streams.lock().await;
        let s = streams
            .get(stream)
            .ok_or_else(|| Error::StreamNotFound(stream.to_string()))?;
        let committed = s.groups.get(group);
        Ok(s.partitions
            .iter()
            .enumerate()
            .map(|(p, fp)| {
                let pos = committed.and_then(|c| c.get(p)).copied().unwrap_or(0);
                LogLag::of(pos, fp.records.len() as u64)
            })
            .collect())
    }

    async fn consumer_groups(&self, stream: &str) -> Result<Vec<String>> {
        let streams = self.inner.streams.lock().await;
        streams
            .get(stream)
            .map(|s| s.groups.keys().cloned().collect())
            .ok_or_else(|| Error::StreamNotFound(stream.to_string()))
    }

    async fn stream_names(&self) -> Result<Vec<String>> {
        Ok(self.inner.streams.lock().await.keys().cloned().collect())
    }
}
