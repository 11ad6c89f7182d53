//! Typed view of inbound records.

use bytes::Bytes;

use super::{
    is_safe_id, Action, Compression, FileType, ProtocolError, QuietLevel, Record,
    TransmissionType,
};

/// An inbound command, validated and ready for dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send(SessionRequest),
    Receive(SessionRequest),
    File(FileSpec),
    Data(Chunk),
    EndData(Chunk),
    Finish,
    Finished,
    Cancel,
    Status(StatusReport),
}

impl Command {
    pub fn parse(record: &Record) -> Result<Self, ProtocolError> {
        if !is_safe_id(&record.id) {
            return Err(ProtocolError::UnsafeId(record.id.clone()));
        }

        let command = match record.action {
            Action::Send => Command::Send(SessionRequest::from_record(record)?),
            Action::Receive => Command::Receive(SessionRequest::from_record(record)?),
            Action::File => Command::File(FileSpec::from_record(record)?),
            Action::Data => Command::Data(Chunk::from_record(record)?),
            Action::EndData => Command::EndData(Chunk::from_record(record)?),
            Action::Finish => Command::Finish,
            Action::Finished => Command::Finished,
            Action::Cancel => Command::Cancel,
            Action::Status => Command::Status(StatusReport {
                file_id: Some(record.file_id.clone()).filter(|id| !id.is_empty()),
                status: record.status.clone(),
            }),
        };

        Ok(command)
    }

    pub fn action(&self) -> Action {
        match self {
            Command::Send(_) => Action::Send,
            Command::Receive(_) => Action::Receive,
            Command::File(_) => Action::File,
            Command::Data(_) => Action::Data,
            Command::EndData(_) => Action::EndData,
            Command::Finish => Action::Finish,
            Command::Finished => Action::Finished,
            Command::Cancel => Action::Cancel,
            Command::Status(_) => Action::Status,
        }
    }
}

/// Parameters of a `send` or `receive` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    pub quiet: QuietLevel,
    pub bypass: Option<BypassCredential>,
    /// Sender clock in nanoseconds, checked against the bypass freshness window
    pub timestamp: Option<i64>,
    /// For `receive`: number of file specs that follow
    pub expected_files: u64,
}

impl SessionRequest {
    fn from_record(record: &Record) -> Result<Self, ProtocolError> {
        let bypass = if record.bypass.is_empty() {
            None
        } else {
            Some(BypassCredential::parse(&record.bypass)?)
        };

        Ok(Self {
            quiet: QuietLevel::from_wire(record.quiet.unwrap_or(0)),
            bypass,
            timestamp: record.timestamp,
            expected_files: record.size.unwrap_or(0),
        })
    }
}

/// `bypass=<algorithm>:<hex digest>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BypassCredential {
    pub algorithm: String,
    pub digest: String,
}

impl BypassCredential {
    pub fn parse(value: &str) -> Result<Self, ProtocolError> {
        let (algorithm, digest) = value
            .split_once(':')
            .filter(|(algorithm, digest)| !algorithm.is_empty() && !digest.is_empty())
            .ok_or_else(|| ProtocolError::InvalidField {
                field: "bypass",
                value: value.to_string(),
            })?;

        Ok(Self {
            algorithm: algorithm.to_ascii_lowercase(),
            digest: digest.to_ascii_lowercase(),
        })
    }
}

/// A `file` command: an announcement in send sessions, a query or a content
/// request in receive sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSpec {
    pub file_id: String,
    pub name: String,
    pub file_type: FileType,
    pub transmission: TransmissionType,
    pub compression: Compression,
    pub mtime: Option<i64>,
    pub permissions: Option<u32>,
    pub size: Option<u64>,
    pub parent: Option<String>,
}

impl FileSpec {
    fn from_record(record: &Record) -> Result<Self, ProtocolError> {
        Ok(Self {
            file_id: require_file_id(record)?,
            name: record.name.clone(),
            file_type: record.ftype.unwrap_or_default(),
            transmission: record.transmission_type.unwrap_or_default(),
            compression: record.compression.unwrap_or_default(),
            mtime: record.mtime,
            permissions: record.permissions,
            size: record.size,
            parent: Some(record.parent.clone()).filter(|parent| !parent.is_empty()),
        })
    }
}

/// One `data` or `end_data` fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub file_id: String,
    pub payload: Bytes,
}

impl Chunk {
    fn from_record(record: &Record) -> Result<Self, ProtocolError> {
        Ok(Self {
            file_id: require_file_id(record)?,
            payload: record.data.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub file_id: Option<String>,
    pub status: String,
}

fn require_file_id(record: &Record) -> Result<String, ProtocolError> {
    if record.file_id.is_empty() {
        return Err(ProtocolError::MissingField("file_id"));
    }
    if !is_safe_id(&record.file_id) {
        return Err(ProtocolError::UnsafeId(record.file_id.clone()));
    }
    Ok(record.file_id.clone())
}
