use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Append Error - {0}")]
    Append(String),

    #[error("Poll Error - {0}")]
    Poll(String),

    #[error("Commit Error - {0}")]
    Commit(String),

    #[error("Processing Error - {0}")]
    Processing(String),

    #[error("Topology Error - {0}")]
    Topology(String),

    #[error(
        "Fatal Halt - computation {computation} stopped on partition {partition} at offset {offset}"
    )]
    FatalHalt {
        computation: String,
        partition: u32,
        offset: u64,
    },

    #[error("Stream Not Found - {0}")]
    StreamNotFound(String),

    #[error("Invalid Partition - {stream} has {partitions} partitions, got {partition}")]
    InvalidPartition {
        stream: String,
        partition: u32,
        partitions: u32,
    },

    #[error("Config Error - {0}")]
    Config(String),

    #[error("Codec Error - {0}")]
    Codec(String),

    #[error("IO Error - {0}")]
    Io(String),

    #[error("Metrics Error - {0}")]
    Metrics(String),
}

/// Coarse classification of an [`Error`], used by retry policies to decide what is retryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Append,
    Poll,
    Commit,
    Processing,
    Topology,
    Halt,
    Addressing,
    Config,
    Codec,
    Io,
    Metrics,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Append(_) => ErrorKind::Append,
            Error::Poll(_) => ErrorKind::Poll,
            Error::Commit(_) => ErrorKind::Commit,
            Error::Processing(_) => ErrorKind::Processing,
            Error::Topology(_) => ErrorKind::Topology,
            Error::FatalHalt { .. } => ErrorKind::Halt,
            Error::StreamNotFound(_) | Error::InvalidPartition { .. } => ErrorKind::Addressing,
            Error::Config(_) => ErrorKind::Config,
            Error::Codec(_) => ErrorKind::Codec,
            Error::Io(_) => ErrorKind::Io,
            Error::Metrics(_) => ErrorKind::Metrics,
        }
    }

    /// Shorthand for a failure raised by a computation handler.
    pub fn processing(msg: impl Into<String>) -> Self {
        Error::Processing(msg.into())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Codec(format!("json: {e}"))
    }
}

impl From<prost::DecodeError> for Error {
    fn from(e: prost::DecodeError) -> Self {
        Error::Codec(format!("decoding record: {e}"))
    }
}

impl From<prost::EncodeError> for Error {
    fn from(e: prost::EncodeError) -> Self {
        Error::Codec(format!("encoding record: {e}"))
    }
}
