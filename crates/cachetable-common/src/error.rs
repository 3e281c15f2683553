//! Error types for the cachetable
//!
//! A non-blocking pin that would have to wait is not an error; it is reported
//! through the pin result. Flush failures never reach this type either: the
//! cache cannot keep running with a dirty block it failed to persist.

use crate::types::{BlockNum, FileNum};
use thiserror::Error;

/// Common result type for cachetable operations
pub type Result<T> = std::result::Result<T, CachetableError>;

/// Common error type for cachetable operations
#[derive(Debug, Error)]
pub enum CachetableError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("fetch of block {blocknum} in file {filenum} failed: {reason}")]
    Fetch {
        filenum: FileNum,
        blocknum: BlockNum,
        reason: String,
    },

    #[error("partial fetch of block {blocknum} in file {filenum} failed: {reason}")]
    PartialFetch {
        filenum: FileNum,
        blocknum: BlockNum,
        reason: String,
    },

    #[error("block {blocknum} in file {filenum} is already cached")]
    KeyExists { filenum: FileNum, blocknum: BlockNum },

    #[error("cachefile {0} is closing")]
    CachefileClosing(FileNum),

    #[error("unknown cachefile {0}")]
    UnknownCachefile(FileNum),

    #[error("a checkpoint is already in progress")]
    CheckpointInProgress,

    #[error("no checkpoint is in progress")]
    NoCheckpointInProgress,

    #[error("callback error: {0}")]
    Callback(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CachetableError {
    /// Create a fetch error
    pub fn fetch(filenum: FileNum, blocknum: BlockNum, reason: impl Into<String>) -> Self {
        Self::Fetch {
            filenum,
            blocknum,
            reason: reason.into(),
        }
    }

    /// Create a callback error
    pub fn callback(msg: impl Into<String>) -> Self {
        Self::Callback(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this error came from reading a block
    #[must_use]
    pub fn is_fetch_error(&self) -> bool {
        matches!(self, Self::Fetch { .. } | Self::PartialFetch { .. } | Self::Io(_))
    }
}
