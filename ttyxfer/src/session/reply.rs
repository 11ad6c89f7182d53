//! Outbound status records, filtered by the session's quiet level.

use crate::protocol::{
    Action, QuietLevel, Record, STATUS_OK, STATUS_PROGRESS, STATUS_STARTED,
};
use crate::utils::errors::FileError;

/// What a reply is, for quiet-level filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// `PROGRESS`
    Progress,
    /// Per-file `STARTED` and `OK`
    FileAck,
    /// Per-file errors
    Error,
    /// Authorization result, commit `OK`, listing end, `CANCELED`
    SessionAck,
    /// Commit failure and quota exhaustion
    Fatal,
    /// Signatures, file content and listing entries
    Payload,
}

impl ReplyKind {
    pub fn allowed(self, quiet: QuietLevel) -> bool {
        match quiet {
            QuietLevel::Verbose => true,
            QuietLevel::ErrorsOnly => !matches!(self, ReplyKind::Progress | ReplyKind::FileAck),
            QuietLevel::Silent => matches!(self, ReplyKind::Fatal | ReplyKind::Payload),
        }
    }
}

/// Records produced while handling one command.
#[derive(Debug)]
pub struct Replies {
    id: String,
    quiet: QuietLevel,
    records: Vec<Record>,
}

impl Replies {
    pub fn new(id: &str, quiet: QuietLevel) -> Self {
        Self {
            id: id.to_string(),
            quiet,
            records: Vec::new(),
        }
    }

    /// A blank record addressed to this session.
    pub fn record(&self, action: Action) -> Record {
        Record::new(action, self.id.clone())
    }

    pub fn push(&mut self, kind: ReplyKind, record: Record) {
        if kind.allowed(self.quiet) {
            self.records.push(record);
        }
    }

    pub fn payload(&mut self, record: Record) {
        self.push(ReplyKind::Payload, record);
    }

    pub fn session_ack(&mut self, status: impl Into<String>) {
        let record = self.record(Action::Status).with_status(status);
        self.push(ReplyKind::SessionAck, record);
    }

    pub fn fatal(&mut self, status: impl Into<String>) {
        let record = self.record(Action::Status).with_status(status);
        self.push(ReplyKind::Fatal, record);
    }

    pub fn file_started(&mut self, file_id: &str) {
        let record = self.file_record(file_id, STATUS_STARTED);
        self.push(ReplyKind::FileAck, record);
    }

    pub fn file_progress(&mut self, file_id: &str, size: u64) {
        let record = self.file_record(file_id, STATUS_PROGRESS).with_size(size);
        self.push(ReplyKind::Progress, record);
    }

    pub fn file_ok(&mut self, file_id: &str, size: Option<u64>) {
        let mut record = self.file_record(file_id, STATUS_OK);
        record.size = size;
        self.push(ReplyKind::FileAck, record);
    }

    pub fn file_error(&mut self, file_id: &str, err: &FileError) {
        let record = self.file_record(file_id, err.to_status());
        self.push(ReplyKind::Error, record);
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }

    fn file_record(&self, file_id: &str, status: impl Into<String>) -> Record {
        self.record(Action::Status)
            .with_file_id(file_id)
            .with_status(status)
    }
}
