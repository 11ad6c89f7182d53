//! Error types for the transfer engine.
//!
//! [`TransferError`] covers failures of the process as a whole (configuration,
//! transport, serialization). [`FileError`] is the per-file error reported on
//! the wire as `CLASS:detail`.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::protocol::ProtocolError;
use crate::sync::CodecError;
use crate::transfer::chunks::ChunkError;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Delta-sync error: {0}")]
    Codec(#[from] CodecError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TransferError>;

/// Error classes reported to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Eperm,
    Enoent,
    Eio,
    Einval,
    Eexist,
    Eisdir,
    Enotdir,
    Enospc,
    Ecanceled,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Eperm => "EPERM",
            ErrorClass::Enoent => "ENOENT",
            ErrorClass::Eio => "EIO",
            ErrorClass::Einval => "EINVAL",
            ErrorClass::Eexist => "EEXIST",
            ErrorClass::Eisdir => "EISDIR",
            ErrorClass::Enotdir => "ENOTDIR",
            ErrorClass::Enospc => "ENOSPC",
            ErrorClass::Ecanceled => "ECANCELED",
        }
    }

    /// Classifies an I/O error. Anything without a closer match is `EIO`.
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => ErrorClass::Enoent,
            io::ErrorKind::PermissionDenied => ErrorClass::Eperm,
            io::ErrorKind::AlreadyExists => ErrorClass::Eexist,
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => ErrorClass::Einval,
            _ => ErrorClass::Eio,
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure scoped to a single file entry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{class}:{detail}")]
pub struct FileError {
    pub class: ErrorClass,
    pub detail: String,
}

impl FileError {
    pub fn new(class: ErrorClass, detail: impl Into<String>) -> Self {
        Self {
            class,
            detail: detail.into(),
        }
    }

    /// Wire form, e.g. `ENOENT:No such file`.
    pub fn to_status(&self) -> String {
        self.to_string()
    }
}

impl From<io::Error> for FileError {
    fn from(err: io::Error) -> Self {
        FileError::new(ErrorClass::from_io(&err), err.to_string())
    }
}

impl From<CodecError> for FileError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::ChecksumMismatch => FileError::new(ErrorClass::Eio, "Checksum mismatch"),
            CodecError::LimitExceeded(_) => FileError::new(ErrorClass::Enospc, err.to_string()),
            CodecError::Io(io) => FileError::from(io),
            other => FileError::new(ErrorClass::Einval, other.to_string()),
        }
    }
}

impl From<ChunkError> for FileError {
    fn from(err: ChunkError) -> Self {
        match err {
            ChunkError::Inflate(_) => FileError::new(ErrorClass::Eio, err.to_string()),
            other => FileError::new(ErrorClass::Einval, other.to_string()),
        }
    }
}
