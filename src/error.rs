//! Error types for bundle transfers.
//!
//! Every variant is terminal for the transfer that raised it: the packer or
//! unpacker refuses further input and the caller restarts from scratch.

use crate::streaming::record::Phase;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransferError>;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Malformed record stream in {phase} phase: {message}")]
    Framing { phase: Phase, message: String },

    #[error("{field} is {len} bytes, the wire format allows at most 255: {value:?}")]
    NameTooLong {
        field: &'static str,
        value: String,
        len: usize,
    },

    #[error("Content of {key} is {len} bytes, the wire format allows at most {max}")]
    ContentTooLarge { key: String, len: u64, max: u64 },

    #[error("Compression engine failed during {context}: {source}")]
    Compression {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("Quota exceeded writing {key}: needs {requested} bytes, {remaining} remaining")]
    QuotaExceeded {
        key: String,
        requested: u64,
        remaining: u64,
    },

    #[error("Security violation for {path:?}: {reason}")]
    SecurityViolation { path: String, reason: &'static str },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Coarse classification of a [`TransferError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    ProtocolViolation,
    CompressionEngine,
    QuotaExceeded,
    SecurityViolation,
    Io,
    Config,
}

impl TransferError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Protocol(_)
            | Self::Framing { .. }
            | Self::NameTooLong { .. }
            | Self::ContentTooLarge { .. } => ErrorCategory::ProtocolViolation,
            Self::Compression { .. } => ErrorCategory::CompressionEngine,
            Self::QuotaExceeded { .. } => ErrorCategory::QuotaExceeded,
            Self::SecurityViolation { .. } => ErrorCategory::SecurityViolation,
            Self::Io { .. } => ErrorCategory::Io,
            Self::Config(_) => ErrorCategory::Config,
        }
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub(crate) fn compression(context: impl Into<String>, source: io::Error) -> Self {
        Self::Compression {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
