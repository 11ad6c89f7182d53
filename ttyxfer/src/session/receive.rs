//! Receive sessions: the client pulls files from this side.
//!
//! The client first sends `expected` file specs naming what it wants. Once
//! they have all arrived, each is stat'ed (directories expanded) and listed
//! back under a terminal-assigned id. The client then requests content by
//! terminal id, either whole (`simple`) or as a delta against a signature
//! it streams to us (`rsync`). Content is queued and drained by
//! [`ReceiveSession::pump`].

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read};
use std::path::PathBuf;

use bytes::BytesMut;
use tracing::{debug, info, warn};

use super::reply::Replies;
use super::{EngineContext, Flow, SessionFault};
use crate::fs::local::ReadSeek;
use crate::fs::metadata::{normalize_path, to_protocol_path};
use crate::fs::FileMetadata;
use crate::protocol::{
    Action, Chunk, Command, Compression, FileSpec, FileType, TransmissionType, STATUS_OK,
};
use crate::sync::delta::{DeltaGenerator, DeltaOp};
use crate::sync::signature::SignatureDecoder;
use crate::transfer::chunks::{ChunkAssembler, OutboundStream};
use crate::transfer::progress::TransferStats;
use crate::utils::errors::{ErrorClass, FileError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    CollectingSpecs,
    Listed,
}

#[derive(Debug, Clone)]
struct ListedEntry {
    path: PathBuf,
    metadata: FileMetadata,
}

/// Source bytes read per refill of an outbound job
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// A file whose content is queued for sending.
struct OutboundJob {
    file_id: String,
    source: Option<Box<dyn ReadSeek>>,
    /// For rsync requests; source content goes out as delta operations
    delta: Option<DeltaGenerator>,
    stream: OutboundStream,
    sent: u64,
}

/// A delta request waiting for the client's signature.
struct SignatureIntake {
    decoder: SignatureDecoder,
    compression: Compression,
}

pub struct ReceiveSession {
    expected: u64,
    specs: Vec<FileSpec>,
    phase: Phase,
    listed: HashMap<String, ListedEntry>,
    intakes: HashMap<String, SignatureIntake>,
    assembler: ChunkAssembler,
    jobs: VecDeque<OutboundJob>,
}

impl ReceiveSession {
    pub fn new(expected: u64) -> Self {
        Self {
            expected,
            specs: Vec::new(),
            phase: Phase::CollectingSpecs,
            listed: HashMap::new(),
            intakes: HashMap::new(),
            assembler: ChunkAssembler::new(),
            jobs: VecDeque::new(),
        }
    }

    pub fn has_pending_output(&self) -> bool {
        !self.jobs.is_empty()
    }

    pub fn handle(
        &mut self,
        command: Command,
        ctx: &mut EngineContext<'_>,
        replies: &mut Replies,
    ) -> Result<Flow, SessionFault> {
        match (self.phase, command) {
            (Phase::CollectingSpecs, Command::File(spec)) => {
                self.specs.push(spec);
                if self.specs.len() as u64 >= self.expected {
                    self.list(ctx, replies);
                }
            }
            (Phase::Listed, Command::File(spec)) => self.request(spec, ctx, replies),
            (Phase::Listed, Command::Data(chunk)) => self.signature_chunk(chunk, false, ctx, replies)?,
            (Phase::Listed, Command::EndData(chunk)) => self.signature_chunk(chunk, true, ctx, replies)?,
            (Phase::CollectingSpecs, Command::Data(chunk) | Command::EndData(chunk)) => {
                let err = FileError::new(ErrorClass::Einval, "Data before listing");
                replies.file_error(&chunk.file_id, &err);
            }
            (_, Command::Finish | Command::Finished) => {
                debug!("Receive finished with {} queued files", self.jobs.len());
                return Ok(Flow::Close);
            }
            (_, Command::Status(report)) => debug!("Client status {}", report.status),
            (_, command @ (Command::Send(_) | Command::Receive(_) | Command::Cancel)) => {
                return Err(SessionFault::ProtocolViolation(format!(
                    "{:?} inside a session",
                    command.action()
                )));
            }
        }
        Ok(Flow::Continue)
    }

    /// Stat every requested name and describe what was found.
    fn list(&mut self, ctx: &mut EngineContext<'_>, replies: &mut Replies) {
        let specs = std::mem::take(&mut self.specs);
        let mut next_id = 0usize;

        for spec in &specs {
            let found = normalize_path(&spec.name, &ctx.settings.home)
                .and_then(|path| Ok((ctx.fs.stat(&path)?, path)));
            let (metadata, path) = match found {
                Ok(found) => found,
                Err(err) => {
                    debug!("Cannot list {}: {}", spec.name, err);
                    replies.file_error(&spec.file_id, &err);
                    continue;
                }
            };

            next_id += 1;
            let root_id = format!("t{}", next_id);
            self.emit_listing(&spec.file_id, &root_id, &path, &metadata, None, ctx, replies);

            if metadata.file_type != FileType::Directory {
                continue;
            }
            let children = match ctx.fs.list_directory(&path) {
                Ok(children) => children,
                Err(err) => {
                    replies.file_error(&spec.file_id, &FileError::from(err));
                    continue;
                }
            };

            let mut parents: HashMap<PathBuf, String> = HashMap::new();
            parents.insert(path.clone(), root_id);
            for child in children {
                let Some(parent_id) = child.path.parent().and_then(|p| parents.get(p)).cloned() else {
                    continue;
                };
                next_id += 1;
                let child_id = format!("t{}", next_id);
                self.emit_listing(
                    &spec.file_id,
                    &child_id,
                    &child.path,
                    &child.metadata,
                    Some(&parent_id),
                    ctx,
                    replies,
                );
                if child.metadata.file_type == FileType::Directory {
                    parents.insert(child.path, child_id);
                }
            }
        }

        info!("Listed {} entries for {} specs", next_id, specs.len());
        self.phase = Phase::Listed;
        let done = replies.record(Action::Status).with_status(STATUS_OK).with_size(next_id as u64);
        replies.payload(done);
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_listing(
        &mut self,
        query_id: &str,
        terminal_id: &str,
        path: &std::path::Path,
        metadata: &FileMetadata,
        parent: Option<&str>,
        ctx: &EngineContext<'_>,
        replies: &mut Replies,
    ) {
        let mut record = replies
            .record(Action::File)
            .with_file_id(query_id)
            .with_status(terminal_id)
            .with_name(to_protocol_path(path))
            .with_ftype(metadata.file_type)
            .with_size(metadata.size)
            .with_mtime(metadata.mtime)
            .with_permissions(metadata.permissions);
        if let Some(parent) = parent {
            record = record.with_parent(parent);
        }
        if metadata.file_type == FileType::Symlink {
            match ctx.fs.read_link(path) {
                Ok(target) => {
                    record = record.with_data(format!("path:{}", to_protocol_path(&target)).into_bytes());
                }
                Err(err) => warn!("Cannot read link {}: {}", path.display(), err),
            }
        }
        replies.payload(record);

        self.listed.insert(
            terminal_id.to_string(),
            ListedEntry {
                path: path.to_path_buf(),
                metadata: metadata.clone(),
            },
        );
    }

    /// A content request for a listed file.
    fn request(&mut self, spec: FileSpec, ctx: &mut EngineContext<'_>, replies: &mut Replies) {
        let Some(listed) = self.listed.get(&spec.file_id) else {
            let err = FileError::new(ErrorClass::Einval, "Unknown file id");
            replies.file_error(&spec.file_id, &err);
            return;
        };
        if listed.metadata.file_type != FileType::Regular {
            let err = FileError::new(ErrorClass::Einval, "Only regular files have content");
            replies.file_error(&spec.file_id, &err);
            return;
        }

        match spec.transmission {
            TransmissionType::Simple => match ctx.fs.open_for_read(&listed.path) {
                Ok(source) => {
                    debug!("Queued {} for sending", listed.path.display());
                    self.jobs.push_back(OutboundJob {
                        file_id: spec.file_id,
                        source: Some(source),
                        delta: None,
                        stream: OutboundStream::new(spec.compression, ctx.settings.chunk_size),
                        sent: 0,
                    });
                }
                Err(err) => replies.file_error(&spec.file_id, &FileError::from(err)),
            },
            TransmissionType::RsyncDelta => {
                self.assembler.open(&spec.file_id, spec.compression);
                self.intakes.insert(
                    spec.file_id,
                    SignatureIntake {
                        decoder: SignatureDecoder::new(),
                        compression: spec.compression,
                    },
                );
            }
        }
    }

    fn signature_chunk(
        &mut self,
        chunk: Chunk,
        is_final: bool,
        ctx: &mut EngineContext<'_>,
        replies: &mut Replies,
    ) -> Result<(), SessionFault> {
        if !self.intakes.contains_key(&chunk.file_id) {
            let err = FileError::new(ErrorClass::Einval, "No signature expected for this file");
            replies.file_error(&chunk.file_id, &err);
            return Ok(());
        }

        let fed = self
            .assembler
            .feed(&chunk.file_id, &chunk.payload, is_final)
            .map_err(FileError::from)
            .and_then(|decoded| match self.intakes.get_mut(&chunk.file_id) {
                Some(intake) => intake.decoder.feed(&decoded).map_err(FileError::from),
                None => Ok(()),
            });
        if let Err(err) = fed {
            self.intakes.remove(&chunk.file_id);
            self.assembler.discard(&chunk.file_id);
            if err.class == ErrorClass::Enospc {
                return Err(SessionFault::ResourceExhausted(format!(
                    "signature for {}: {}",
                    chunk.file_id, err.detail
                )));
            }
            replies.file_error(&chunk.file_id, &err);
            return Ok(());
        }
        if !is_final {
            return Ok(());
        }

        let Some(intake) = self.intakes.remove(&chunk.file_id) else {
            return Ok(());
        };
        match self.queue_delta(&chunk.file_id, intake, ctx) {
            Ok(job) => self.jobs.push_back(job),
            Err(err) => replies.file_error(&chunk.file_id, &err),
        }
        Ok(())
    }

    fn queue_delta(
        &self,
        file_id: &str,
        intake: SignatureIntake,
        ctx: &EngineContext<'_>,
    ) -> Result<OutboundJob, FileError> {
        let signature = intake.decoder.finish()?;
        let path = self
            .listed
            .get(file_id)
            .map(|listed| listed.path.clone())
            .ok_or_else(|| FileError::new(ErrorClass::Einval, "Unknown file id"))?;

        let source = ctx.fs.open_for_read(&path)?;
        debug!(
            "Queued delta for {} against {} blocks",
            path.display(),
            signature.blocks.len()
        );

        Ok(OutboundJob {
            file_id: file_id.to_string(),
            source: Some(source),
            delta: Some(DeltaGenerator::new(signature)),
            stream: OutboundStream::new(intake.compression, ctx.settings.chunk_size),
            sent: 0,
        })
    }

    /// Emit queued content until about `budget` payload bytes went out.
    /// Returns the bytes used.
    pub fn pump(&mut self, budget: usize, replies: &mut Replies, stats: &mut TransferStats) -> usize {
        let mut used = 0;

        while used < budget {
            let Some(job) = self.jobs.front_mut() else {
                break;
            };

            if let Some((payload, last)) = job.stream.next_chunk() {
                used += payload.len().max(1);
                job.sent += payload.len() as u64;
                let action = if last { Action::EndData } else { Action::Data };
                let record = replies.record(action).with_file_id(&job.file_id).with_data(payload);
                replies.payload(record);
                if last {
                    stats.record_file(job.sent);
                    self.jobs.pop_front();
                }
                continue;
            }

            if let Err(err) = refill(job) {
                warn!("Reading {} failed: {}", job.file_id, err);
                replies.file_error(&job.file_id, &err);
                stats.record_failure();
                self.jobs.pop_front();
            }
        }
        used
    }
}

/// Move the next slice of source content into the stream, finishing it at
/// end of file.
fn refill(job: &mut OutboundJob) -> Result<(), FileError> {
    let OutboundJob { source, delta, stream, .. } = job;
    let Some(reader) = source.as_mut() else {
        stream.finish()?;
        return Ok(());
    };

    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    let n = reader.read(&mut buf)?;
    if n == 0 {
        *source = None;
        if let Some(generator) = delta.as_mut() {
            generator.finish(|op| push_op(stream, &op))?;
        }
        stream.finish()?;
        return Ok(());
    }

    match delta.as_mut() {
        Some(generator) => generator.update(&buf[..n], |op| push_op(stream, &op))?,
        None => stream.push(&buf[..n])?,
    }
    Ok(())
}

fn push_op(stream: &mut OutboundStream, op: &DeltaOp) -> io::Result<()> {
    let mut encoded = BytesMut::new();
    op.encode(&mut encoded);
    stream.push(&encoded)
}
