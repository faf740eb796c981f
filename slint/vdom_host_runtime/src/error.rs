use std::io;
use thiserror::Error;

/// Failure of one synchronization round. The scheduler treats any of these as
/// "no updates this round" and keeps the queued work for the next attempt.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("outbound queue full (cap={0})")]
    QueueFull(usize),
    #[error("transport channel closed")]
    Closed,
    #[error("round {0} timed out waiting for a response")]
    Timeout(u64),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {len} > {max}")]
    TooLarge { len: usize, max: usize },
    #[error("payload exceeds u32")]
    LengthOverflow,
    #[error("json codec error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl FrameError {
    pub fn is_eof(&self) -> bool {
        matches!(self, FrameError::Io(err) if err.kind() == io::ErrorKind::UnexpectedEof)
    }
}

/// A native element refused an operation requested by the remote side.
#[derive(Debug, Error)]
pub enum NativeOpError {
    #[error("element is not mounted")]
    NotMounted,
    #[error("element cannot take focus")]
    NotFocusable,
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: String, source: io::Error },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("invalid value for {var}: {value:?}")]
    InvalidVar { var: &'static str, value: String },
}
