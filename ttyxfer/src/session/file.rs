//! Per-file state for send sessions.
//!
//! ```text
//! Announced -> Started -> Receiving -> Complete
//!                  \          \
//!                   +----------+----> Error
//! ```
//!
//! Directories go straight to Complete at announce time. Content is written
//! to a staged file and only committed when the session finishes.

use std::fmt;
use std::io::{self, Cursor, Seek, SeekFrom, Write};
use std::path::PathBuf;

use bytes::Bytes;

use crate::fs::local::{Filesystem, ReadSeek, StagedFile};
use crate::fs::metadata::DEFAULT_FILE_MODE;
use crate::protocol::{Compression, FileSpec, FileType, TransmissionType};
use crate::sync::apply::DeltaApplier;
use crate::sync::delta::DeltaDecoder;
use crate::sync::signature::{block_size_for, generate_signature};
use crate::transfer::quota::{QuotaExceeded, StorageQuota};
use crate::utils::errors::{ErrorClass, FileError};

/// Link payloads longer than this are rejected
const MAX_LINK_PAYLOAD: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Announced,
    Started,
    Receiving,
    Complete,
    Error,
}

impl FileStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, FileStatus::Complete | FileStatus::Error)
    }
}

/// Where a symlink or hard link points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkTarget {
    /// Another file of the same session. `absolute` symlinks use the target's
    /// full path instead of a relative one.
    Entry { file_id: String, absolute: bool },
    /// A literal path, stored as given.
    External(PathBuf),
}

impl LinkTarget {
    /// Parse a `fid:`, `fid_abs:` or `path:` payload. Hard links only accept
    /// `fid:`.
    pub fn parse(payload: &[u8], file_type: FileType) -> Result<Self, FileError> {
        let text = std::str::from_utf8(payload)
            .map_err(|_| FileError::new(ErrorClass::Einval, "Link target is not valid UTF-8"))?;

        if let Some(file_id) = text.strip_prefix("fid:") {
            return Ok(LinkTarget::Entry {
                file_id: file_id.to_string(),
                absolute: false,
            });
        }
        if file_type == FileType::HardLink {
            return Err(FileError::new(
                ErrorClass::Einval,
                "Hard links must reference a file in the transfer",
            ));
        }
        if let Some(file_id) = text.strip_prefix("fid_abs:") {
            return Ok(LinkTarget::Entry {
                file_id: file_id.to_string(),
                absolute: true,
            });
        }
        match text.strip_prefix("path:") {
            Some(path) if !path.is_empty() => Ok(LinkTarget::External(PathBuf::from(path))),
            Some(_) => Err(FileError::new(ErrorClass::Einval, "Empty link target")),
            None => Err(FileError::new(ErrorClass::Einval, "Unknown link target type")),
        }
    }
}

/// Why a chunk could not be taken.
#[derive(Debug)]
pub enum EntryFault {
    /// The file failed; the session carries on.
    File(FileError),
    /// The shared staging quota ran out; the session must be dropped.
    Quota(QuotaExceeded),
}

impl From<FileError> for EntryFault {
    fn from(err: FileError) -> Self {
        EntryFault::File(err)
    }
}

impl From<QuotaExceeded> for EntryFault {
    fn from(err: QuotaExceeded) -> Self {
        EntryFault::Quota(err)
    }
}

/// Result of a successful announce.
#[derive(Debug)]
pub enum Announced {
    /// Nothing further to receive (directories)
    Complete,
    /// Data expected. For rsync transfers, carries the serialized signature
    /// to send back.
    Started { signature: Option<Bytes> },
}

enum Sink {
    Raw(Box<dyn StagedFile>),
    Delta {
        decoder: DeltaDecoder,
        applier: DeltaApplier<Box<dyn ReadSeek>, Box<dyn StagedFile>>,
    },
    LinkPayload(Vec<u8>),
}

pub struct FileEntry {
    pub file_id: String,
    pub path: PathBuf,
    pub file_type: FileType,
    pub status: FileStatus,
    pub parent: Option<String>,
    pub link_target: Option<LinkTarget>,
    pub transmission: TransmissionType,
    pub compression: Compression,
    /// Bytes of reconstructed content so far
    pub bytes_written: u64,
    pub expected_size: Option<u64>,
    pub mtime: Option<i64>,
    pub permissions: Option<u32>,
    sink: Option<Sink>,
    staged: Option<Box<dyn StagedFile>>,
    reserved: u64,
}

impl fmt::Debug for FileEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileEntry")
            .field("file_id", &self.file_id)
            .field("path", &self.path)
            .field("file_type", &self.file_type)
            .field("status", &self.status)
            .field("bytes_written", &self.bytes_written)
            .field("staged", &self.staged.is_some())
            .finish()
    }
}

impl FileEntry {
    pub fn new(spec: &FileSpec, path: PathBuf) -> Self {
        Self {
            file_id: spec.file_id.clone(),
            path,
            file_type: spec.file_type,
            status: FileStatus::Announced,
            parent: spec.parent.clone(),
            link_target: None,
            transmission: spec.transmission,
            compression: spec.compression,
            bytes_written: 0,
            expected_size: spec.size,
            mtime: spec.mtime,
            permissions: spec.permissions,
            sink: None,
            staged: None,
            reserved: 0,
        }
    }

    /// Entry for a spec that was rejected before any setup.
    pub fn failed(spec: &FileSpec) -> Self {
        let mut entry = Self::new(spec, PathBuf::from(&spec.name));
        entry.status = FileStatus::Error;
        entry
    }

    /// Prepare to receive. `block_size` of 0 picks one from the size of the
    /// existing destination.
    pub fn announce(&mut self, fs: &dyn Filesystem, block_size: u32) -> Result<Announced, FileError> {
        let result = match self.file_type {
            FileType::Directory => fs
                .create_dir(&self.path)
                .map(|_| Announced::Complete)
                .map_err(FileError::from),
            FileType::Regular => self.open_regular(fs, block_size),
            FileType::Symlink | FileType::HardLink => {
                self.sink = Some(Sink::LinkPayload(Vec::new()));
                Ok(Announced::Started { signature: None })
            }
        };

        match &result {
            Ok(Announced::Complete) => self.status = FileStatus::Complete,
            Ok(Announced::Started { .. }) => self.status = FileStatus::Started,
            Err(_) => {
                self.status = FileStatus::Error;
                self.sink = None;
            }
        }
        result
    }

    fn open_regular(&mut self, fs: &dyn Filesystem, block_size: u32) -> Result<Announced, FileError> {
        if let Ok(existing) = fs.stat(&self.path) {
            if existing.file_type == FileType::Directory {
                return Err(FileError::new(
                    ErrorClass::Eisdir,
                    format!("{} is a directory", self.path.display()),
                ));
            }
        }

        match self.transmission {
            TransmissionType::Simple => {
                self.sink = Some(Sink::Raw(fs.open_for_write(&self.path)?));
                Ok(Announced::Started { signature: None })
            }
            TransmissionType::RsyncDelta => {
                let (mut basis, basis_len) = open_basis(fs, &self.path)?;
                let block_size = if block_size > 0 {
                    block_size
                } else {
                    block_size_for(basis_len)
                };
                let signature = generate_signature(&mut basis, block_size)?;
                let staged = fs.open_for_write(&self.path)?;

                self.sink = Some(Sink::Delta {
                    decoder: DeltaDecoder::new(),
                    applier: DeltaApplier::new(basis, basis_len, block_size, staged),
                });
                Ok(Announced::Started {
                    signature: Some(signature.serialize()),
                })
            }
        }
    }

    /// Take decoded bytes. Returns the new `bytes_written`.
    pub fn append(&mut self, data: &[u8], quota: &mut StorageQuota) -> Result<u64, EntryFault> {
        match self.write_chunk(data, quota) {
            Ok(()) => {
                if self.status == FileStatus::Started {
                    self.status = FileStatus::Receiving;
                }
                Ok(self.bytes_written)
            }
            Err(EntryFault::File(err)) => Err(EntryFault::File(self.abort(err, quota))),
            Err(fault) => Err(fault),
        }
    }

    fn write_chunk(&mut self, data: &[u8], quota: &mut StorageQuota) -> Result<(), EntryFault> {
        match self.sink.as_mut() {
            Some(Sink::Raw(staged)) => {
                let len = data.len() as u64;
                quota.reserve(len)?;
                self.reserved += len;
                staged.write_all(data).map_err(FileError::from)?;
                self.bytes_written += len;
            }
            Some(Sink::Delta { decoder, applier }) => {
                let mut ops = Vec::new();
                decoder.feed(data, &mut ops).map_err(FileError::from)?;
                for op in &ops {
                    let len = applier.output_len(op).map_err(FileError::from)?;
                    quota.reserve(len)?;
                    self.reserved += len;
                    applier.apply(op).map_err(FileError::from)?;
                }
                self.bytes_written = applier.written();
            }
            Some(Sink::LinkPayload(payload)) => {
                if payload.len() + data.len() > MAX_LINK_PAYLOAD {
                    return Err(FileError::new(ErrorClass::Einval, "Link target too long").into());
                }
                payload.extend_from_slice(data);
                self.bytes_written = payload.len() as u64;
            }
            None => {
                return Err(FileError::new(ErrorClass::Einval, "File is not accepting data").into());
            }
        }
        Ok(())
    }

    /// Take the final bytes of a regular file and seal its staged content.
    /// Returns the final size.
    pub fn end(&mut self, data: &[u8], quota: &mut StorageQuota) -> Result<u64, EntryFault> {
        self.append(data, quota)?;

        let sealed = match self.sink.take() {
            Some(Sink::Raw(staged)) => self.seal_raw(staged),
            Some(Sink::Delta { decoder, applier }) => Self::seal_delta(decoder, applier),
            Some(Sink::LinkPayload(_)) | None => Err(FileError::new(
                ErrorClass::Einval,
                "File is not accepting data",
            )),
        };

        match sealed {
            Ok((staged, size)) => {
                self.staged = Some(staged);
                self.bytes_written = size;
                self.status = FileStatus::Complete;
                Ok(size)
            }
            Err(err) => Err(EntryFault::File(self.abort(err, quota))),
        }
    }

    fn seal_raw(&self, mut staged: Box<dyn StagedFile>) -> Result<(Box<dyn StagedFile>, u64), FileError> {
        if let Some(expected) = self.expected_size {
            if expected != self.bytes_written {
                return Err(FileError::new(
                    ErrorClass::Eio,
                    format!(
                        "Size mismatch: expected {} bytes, received {}",
                        expected, self.bytes_written
                    ),
                ));
            }
        }
        staged.seal()?;
        Ok((staged, self.bytes_written))
    }

    fn seal_delta(
        decoder: DeltaDecoder,
        applier: DeltaApplier<Box<dyn ReadSeek>, Box<dyn StagedFile>>,
    ) -> Result<(Box<dyn StagedFile>, u64), FileError> {
        decoder.finish()?;
        if !applier.is_verified() {
            return Err(FileError::new(ErrorClass::Eio, "Delta ended without a checksum"));
        }
        let (mut staged, written) = applier.finish()?;
        staged.seal()?;
        Ok((staged, written))
    }

    /// Final payload of a symlink or hard link.
    pub fn take_link_payload(&mut self) -> Vec<u8> {
        match self.sink.take() {
            Some(Sink::LinkPayload(payload)) => payload,
            other => {
                self.sink = other;
                Vec::new()
            }
        }
    }

    pub fn complete_link(&mut self, target: LinkTarget) {
        self.link_target = Some(target);
        self.status = FileStatus::Complete;
    }

    /// Move staged content to the destination and apply metadata.
    pub fn commit(&mut self, fs: &dyn Filesystem, quota: &mut StorageQuota) -> io::Result<()> {
        let staged = self
            .staged
            .take()
            .ok_or_else(|| io::Error::other(format!("{} has no staged content", self.file_id)))?;
        quota.release(self.reserved);
        self.reserved = 0;

        staged.commit()?;
        fs.set_metadata(
            &self.path,
            self.mtime,
            Some(self.permissions.unwrap_or(DEFAULT_FILE_MODE)),
        )
    }

    /// Mark failed, drop any staged data and release its quota.
    pub fn abort(&mut self, err: FileError, quota: &mut StorageQuota) -> FileError {
        self.status = FileStatus::Error;
        self.discard(quota);
        err
    }

    /// Drop staged data without changing the status.
    pub fn discard(&mut self, quota: &mut StorageQuota) {
        self.sink = None;
        self.staged = None;
        quota.release(self.reserved);
        self.reserved = 0;
    }
}

fn open_basis(fs: &dyn Filesystem, path: &std::path::Path) -> Result<(Box<dyn ReadSeek>, u64), FileError> {
    match fs.open_for_read(path) {
        Ok(mut reader) => {
            let len = reader.seek(SeekFrom::End(0))?;
            reader.seek(SeekFrom::Start(0))?;
            Ok((reader, len))
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            Ok((Box::new(Cursor::new(Vec::new())), 0))
        }
        Err(err) => Err(err.into()),
    }
}
