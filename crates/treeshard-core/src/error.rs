//! Error types for sharding runs.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fatal errors: the run stops and no shard files are produced.
#[derive(Debug, Error)]
pub enum ShardError {
    /// Invalid configuration.
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Configuration file could not be parsed.
    #[error("Invalid configuration file {path}: {message}")]
    ConfigFile { path: PathBuf, message: String },

    /// Exclusion pattern could not be compiled.
    #[error("Invalid exclusion pattern {pattern:?}: {message}")]
    InvalidPattern { pattern: String, message: String },

    /// Permission denied for a path.
    #[error("Permission denied: {path}")]
    PermissionDenied { path: PathBuf },

    /// Path not found.
    #[error("Path not found: {path}")]
    NotFound { path: PathBuf },

    /// Root path is not a directory.
    #[error("Root path is not a directory: {path}")]
    NotADirectory { path: PathBuf },

    /// Generic I/O error.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A shard file or its log could not be written.
    #[error("Failed to write shard {index} ({path}): {source}")]
    ShardWrite {
        index: usize,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A worker thread could not be started or panicked.
    #[error("Worker pool failure: {message}")]
    Worker { message: String },
}

impl ShardError {
    /// Create an I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            std::io::ErrorKind::NotFound => Self::NotFound { path },
            _ => Self::Io { path, source },
        }
    }

    /// Whether the error stems from configuration rather than the filesystem.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig { .. } | Self::ConfigFile { .. } | Self::InvalidPattern { .. }
        )
    }
}

/// Kind of walk warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WarningKind {
    /// Permission was denied.
    PermissionDenied,
    /// Error reading a directory.
    ReadError,
    /// Error reading entry metadata.
    MetadataError,
    /// A symlink leads to a directory already followed through another link.
    SymlinkLoop,
    /// Socket, FIFO or device node; skipped.
    SpecialFile,
}

/// Non-fatal problem recorded during the walk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalkWarning {
    /// Path where the warning occurred.
    pub path: PathBuf,
    /// Human-readable message.
    pub message: String,
    /// Kind of warning.
    pub kind: WarningKind,
}

impl WalkWarning {
    /// Create a new walk warning.
    pub fn new(path: impl Into<PathBuf>, message: impl Into<String>, kind: WarningKind) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
            kind,
        }
    }

    /// Create a warning from a failed directory listing.
    pub fn read_error(path: impl Into<PathBuf>, error: &std::io::Error) -> Self {
        let path = path.into();
        let kind = match error.kind() {
            std::io::ErrorKind::PermissionDenied => WarningKind::PermissionDenied,
            _ => WarningKind::ReadError,
        };
        Self {
            message: format!("Read error: {error}"),
            path,
            kind,
        }
    }

    /// Create a warning from a failed stat of a single entry.
    pub fn metadata_error(path: impl Into<PathBuf>, error: &std::io::Error) -> Self {
        Self::new(path, format!("Metadata error: {error}"), WarningKind::MetadataError)
    }

    /// Create a symlink loop warning.
    pub fn symlink_loop(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            message: format!("Symlink target already followed elsewhere: {}", path.display()),
            path,
            kind: WarningKind::SymlinkLoop,
        }
    }

    /// Whether this warning counts as an error in shard logs.
    pub fn is_error(&self) -> bool {
        !matches!(self.kind, WarningKind::SpecialFile)
    }
}
