//! Backlog reporting: how far every consumer group of a stream is behind its end. Read only,
//! nothing here moves a committed offset.

use std::fmt::Write;

use crate::error::Result;
use crate::log::{LogLag, LogManager};

/// Lag of one consumer group on a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupLag {
    pub group: String,
    pub total: LogLag,
    /// in partition order
    pub partitions: Vec<LogLag>,
}

/// One [GroupLag] per consumer group of the stream.
pub async fn lag<M: LogManager>(manager: &M, stream: &str) -> Result<Vec<GroupLag>> {
    let mut lags = Vec::new();
    for group in manager.consumer_groups(stream).await? {
        let partitions = manager.lag_per_partition(stream, &group).await?;
        lags.push(GroupLag {
            total: partitions.iter().copied().sum(),
            group,
            partitions,
        });
    }
    Ok(lags)
}

/// [lag] for every stream of the backend.
pub async fn lag_all<M: LogManager>(manager: &M) -> Result<Vec<(String, Vec<GroupLag>)>> {
    let mut all = Vec::new();
    for stream in manager.stream_names().await? {
        let groups = lag(manager, &stream).await?;
        all.push((stream, groups));
    }
    Ok(all)
}

fn row(out: &mut String, label: &str, lag: &LogLag) {
    let _ = writeln!(
        out,
        "| {label} | {} | {} | {} | {} | {} |",
        lag.lag,
        lag.lower(),
        lag.upper,
        lag.lower_offset,
        lag.upper_offset
    );
}

/// Markdown table per group: `pos` and `end` count records, `posOffset` and `endOffset` are the
/// committed and end offsets. `verbose` adds one row per partition, `quiet` leaves out groups
/// without lag.
pub fn render_lag(stream: &str, groups: &[GroupLag], verbose: bool, quiet: bool) -> String {
    let mut out = String::new();
    for group in groups {
        if quiet && group.total.lag == 0 {
            continue;
        }
        let _ = writeln!(out, "## Log: {stream} consumer: {}", group.group);
        out.push_str("| partition | lag | pos | end | posOffset | endOffset |\n");
        out.push_str("| --- | ---: | ---: | ---: | ---: | ---: |\n");
        row(&mut out, "All", &group.total);
        if verbose && group.partitions.len() > 1 {
            for (partition, lag) in group.partitions.iter().enumerate() {
                row(&mut out, &partition.to_string(), lag);
            }
        }
        out.push('\n');
    }
    out
}
