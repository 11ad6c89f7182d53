//! Command and status records exchanged with the client.
//!
//! The transport frames and key/value-decodes the escape-code stream into one
//! [`Record`] per command. Inbound records are parsed into [`Command`] before
//! dispatch; outbound records are built with the `with_*` helpers.

pub mod command;

pub use command::{BypassCredential, Chunk, Command, FileSpec, SessionRequest, StatusReport};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const STATUS_OK: &str = "OK";
pub const STATUS_STARTED: &str = "STARTED";
pub const STATUS_PROGRESS: &str = "PROGRESS";
pub const STATUS_CANCELED: &str = "CANCELED";

/// Longest accepted session or file id, in bytes
pub const MAX_ID_LEN: usize = 64;

/// Command verbs of the transfer protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Send,
    Receive,
    File,
    Data,
    EndData,
    Finish,
    Finished,
    Cancel,
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    #[default]
    Regular,
    Directory,
    Symlink,
    #[serde(rename = "link")]
    HardLink,
}

impl FileType {
    pub fn is_link(self) -> bool {
        matches!(self, FileType::Symlink | FileType::HardLink)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TransmissionType {
    #[default]
    #[serde(rename = "simple")]
    Simple,
    #[serde(rename = "rsync")]
    RsyncDelta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Zlib,
}

/// How much acknowledgement traffic a session wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum QuietLevel {
    #[default]
    Verbose,
    ErrorsOnly,
    Silent,
}

impl QuietLevel {
    /// Levels above 2 are treated as silent.
    pub fn from_wire(level: u8) -> Self {
        match level {
            0 => QuietLevel::Verbose,
            1 => QuietLevel::ErrorsOnly,
            _ => QuietLevel::Silent,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid id {0:?}")]
    UnsafeId(String),

    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("invalid value for `{field}`: {value}")]
    InvalidField { field: &'static str, value: String },
}

/// Whether `id` is usable as a session or file id: 1 to 64 bytes of
/// `[A-Za-z0-9_.+-]`.
pub fn is_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'+' | b'-'))
}

/// A decoded command or status record.
///
/// Absent keys decode to empty strings or `None`. `data` carries the raw
/// payload and is base64 encoded in serialized form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub action: Action,
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub file_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ftype: Option<FileType>,
    #[serde(default, alias = "ttype", skip_serializing_if = "Option::is_none")]
    pub transmission_type: Option<TransmissionType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<Compression>,
    /// Modification time, nanoseconds since the epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtime: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parent: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bypass: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quiet: Option<u8>,
    /// Sender clock at the time of the command, nanoseconds since the epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Bytes::is_empty", with = "payload")]
    pub data: Bytes,
}

impl Record {
    pub fn new(action: Action, id: impl Into<String>) -> Self {
        Self {
            action,
            id: id.into(),
            file_id: String::new(),
            name: String::new(),
            status: String::new(),
            ftype: None,
            transmission_type: None,
            compression: None,
            mtime: None,
            permissions: None,
            size: None,
            parent: String::new(),
            bypass: String::new(),
            quiet: None,
            timestamp: None,
            data: Bytes::new(),
        }
    }

    pub fn with_file_id(mut self, file_id: impl Into<String>) -> Self {
        self.file_id = file_id.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    pub fn with_ftype(mut self, ftype: FileType) -> Self {
        self.ftype = Some(ftype);
        self
    }

    pub fn with_transmission(mut self, transmission: TransmissionType) -> Self {
        self.transmission_type = Some(transmission);
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = Some(compression);
        self
    }

    pub fn with_mtime(mut self, mtime: i64) -> Self {
        self.mtime = Some(mtime);
        self
    }

    pub fn with_permissions(mut self, permissions: u32) -> Self {
        self.permissions = Some(permissions);
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = parent.into();
        self
    }

    pub fn with_bypass(mut self, bypass: impl Into<String>) -> Self {
        self.bypass = bypass.into();
        self
    }

    pub fn with_quiet(mut self, quiet: u8) -> Self {
        self.quiet = Some(quiet);
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = data.into();
        self
    }
}

mod payload {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
