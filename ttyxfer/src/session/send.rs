//! Send sessions: the client pushes files to this side.

use std::collections::HashMap;
use std::path::PathBuf;

use tracing::{debug, info, warn};

use super::file::{Announced, EntryFault, FileEntry, FileStatus, LinkTarget};
use super::reply::Replies;
use super::{EngineContext, Flow, SessionFault};
use crate::fs::local::LinkKind;
use crate::fs::metadata::{normalize_path, relative_link_target};
use crate::protocol::{Action, Chunk, Command, FileSpec, FileType};
use crate::transfer::chunks::{ChunkAssembler, OutboundStream};
use crate::transfer::progress::TransferStats;
use crate::transfer::quota::StorageQuota;
use crate::utils::errors::{ErrorClass, FileError};

#[derive(Default)]
pub struct SendSession {
    files: Vec<FileEntry>,
    index: HashMap<String, usize>,
    assembler: ChunkAssembler,
}

impl SendSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file_status(&self, file_id: &str) -> Option<FileStatus> {
        self.entry(file_id).map(|entry| entry.status)
    }

    fn entry(&self, file_id: &str) -> Option<&FileEntry> {
        self.index.get(file_id).map(|&i| &self.files[i])
    }

    pub fn handle(
        &mut self,
        command: Command,
        ctx: &mut EngineContext<'_>,
        replies: &mut Replies,
        stats: &mut TransferStats,
    ) -> Result<Flow, SessionFault> {
        match command {
            Command::File(spec) => {
                self.announce(spec, ctx, replies);
                Ok(Flow::Continue)
            }
            Command::Data(chunk) => self.chunk(chunk, false, ctx, replies, stats),
            Command::EndData(chunk) => self.chunk(chunk, true, ctx, replies, stats),
            Command::Finish | Command::Finished => {
                self.commit(ctx, replies, stats);
                Ok(Flow::Close)
            }
            Command::Status(report) => {
                debug!("Ignoring status {} from sender", report.status);
                Ok(Flow::Continue)
            }
            Command::Send(_) | Command::Receive(_) | Command::Cancel => Err(
                SessionFault::ProtocolViolation(format!("{:?} inside a session", command.action())),
            ),
        }
    }

    fn announce(&mut self, spec: FileSpec, ctx: &mut EngineContext<'_>, replies: &mut Replies) {
        if let Some(existing) = self.entry(&spec.file_id) {
            if existing.status == FileStatus::Error {
                debug!("Ignoring announce for failed file {}", spec.file_id);
                return;
            }
            let err = FileError::new(ErrorClass::Einval, "Duplicate file id");
            replies.file_error(&spec.file_id, &err);
            return;
        }

        let mut entry = match normalize_path(&spec.name, &ctx.settings.home) {
            Ok(path) => FileEntry::new(&spec, path),
            Err(err) => {
                replies.file_error(&spec.file_id, &err);
                self.insert(FileEntry::failed(&spec));
                return;
            }
        };

        match entry.announce(ctx.fs, ctx.settings.default_block_size) {
            Ok(Announced::Complete) => {
                debug!("Created directory {}", entry.path.display());
                replies.file_ok(&spec.file_id, None);
            }
            Ok(Announced::Started { signature }) => {
                self.assembler.open(&spec.file_id, spec.compression);
                replies.file_started(&spec.file_id);
                if let Some(signature) = signature {
                    if let Err(err) = send_signature(&spec, &signature, ctx.settings.chunk_size, replies) {
                        let err = entry.abort(err.into(), ctx.quota);
                        self.assembler.discard(&spec.file_id);
                        replies.file_error(&spec.file_id, &err);
                    }
                }
            }
            Err(err) => {
                warn!("Cannot receive {}: {}", entry.path.display(), err);
                replies.file_error(&spec.file_id, &err);
            }
        }
        self.insert(entry);
    }

    fn insert(&mut self, entry: FileEntry) {
        self.index.insert(entry.file_id.clone(), self.files.len());
        self.files.push(entry);
    }

    fn chunk(
        &mut self,
        chunk: Chunk,
        is_final: bool,
        ctx: &mut EngineContext<'_>,
        replies: &mut Replies,
        stats: &mut TransferStats,
    ) -> Result<Flow, SessionFault> {
        let Some(&position) = self.index.get(&chunk.file_id) else {
            let err = FileError::new(ErrorClass::Einval, "Unknown file id");
            replies.file_error(&chunk.file_id, &err);
            return Ok(Flow::Continue);
        };

        match self.files[position].status {
            FileStatus::Error => return Ok(Flow::Continue),
            FileStatus::Complete => {
                let err = FileError::new(ErrorClass::Einval, "Data after end of file");
                replies.file_error(&chunk.file_id, &err);
                return Ok(Flow::Continue);
            }
            FileStatus::Announced | FileStatus::Started | FileStatus::Receiving => {}
        }

        let decoded = match self.assembler.feed(&chunk.file_id, &chunk.payload, is_final) {
            Ok(decoded) => decoded,
            Err(err) => {
                let err = self.files[position].abort(err.into(), ctx.quota);
                self.fail(position, &err, replies, stats);
                return Ok(Flow::Continue);
            }
        };

        if self.files[position].file_type.is_link() {
            return self.link_chunk(position, &decoded, is_final, ctx.quota, replies, stats);
        }

        let entry = &mut self.files[position];
        let outcome = if is_final {
            entry.end(&decoded, ctx.quota)
        } else {
            entry.append(&decoded, ctx.quota)
        };

        match outcome {
            Ok(size) if is_final => {
                debug!("Received {} ({} bytes)", entry.path.display(), size);
                replies.file_ok(&chunk.file_id, Some(size));
            }
            Ok(size) => replies.file_progress(&chunk.file_id, size),
            Err(EntryFault::File(err)) => self.fail(position, &err, replies, stats),
            Err(EntryFault::Quota(err)) => {
                warn!("{} while receiving {}", err, chunk.file_id);
                return Err(SessionFault::ResourceExhausted(err.to_string()));
            }
        }
        Ok(Flow::Continue)
    }

    fn link_chunk(
        &mut self,
        position: usize,
        decoded: &[u8],
        is_final: bool,
        quota: &mut StorageQuota,
        replies: &mut Replies,
        stats: &mut TransferStats,
    ) -> Result<Flow, SessionFault> {
        match self.files[position].append(decoded, quota) {
            Ok(_) => {}
            Err(EntryFault::File(err)) => {
                self.fail(position, &err, replies, stats);
                return Ok(Flow::Continue);
            }
            Err(EntryFault::Quota(err)) => return Err(SessionFault::ResourceExhausted(err.to_string())),
        }
        if !is_final {
            return Ok(Flow::Continue);
        }

        let entry = &mut self.files[position];
        let payload = entry.take_link_payload();
        let resolved = LinkTarget::parse(&payload, entry.file_type)
            .and_then(|target| self.check_link_target(position, &target).map(|_| target));

        match resolved {
            Ok(target) => {
                let entry = &mut self.files[position];
                debug!("Link {} -> {:?}", entry.path.display(), target);
                entry.complete_link(target);
                replies.file_ok(&entry.file_id, None);
            }
            Err(err) => {
                let err = self.files[position].abort(err, quota);
                self.fail(position, &err, replies, stats);
            }
        }
        Ok(Flow::Continue)
    }

    /// Links may only point at entries that completed before them.
    fn check_link_target(&self, position: usize, target: &LinkTarget) -> Result<(), FileError> {
        let LinkTarget::Entry { file_id, .. } = target else {
            return Ok(());
        };
        let Some(&target_position) = self.index.get(file_id) else {
            return Err(FileError::new(
                ErrorClass::Enoent,
                format!("Link target {} not found", file_id),
            ));
        };
        if target_position == position {
            return Err(FileError::new(ErrorClass::Einval, "Link points at itself"));
        }

        let linked = &self.files[target_position];
        if linked.status != FileStatus::Complete {
            return Err(FileError::new(
                ErrorClass::Enoent,
                format!("Link target {} is not complete", file_id),
            ));
        }
        if self.files[position].file_type == FileType::HardLink && linked.file_type == FileType::Directory {
            return Err(FileError::new(ErrorClass::Eperm, "Cannot hard link a directory"));
        }
        Ok(())
    }

    fn fail(&mut self, position: usize, err: &FileError, replies: &mut Replies, stats: &mut TransferStats) {
        let entry = &self.files[position];
        warn!("File {} failed: {}", entry.file_id, err);
        self.assembler.discard(&entry.file_id);
        replies.file_error(&entry.file_id, err);
        stats.record_failure();
    }

    /// Move everything into place: regular files, then hard links, then
    /// symlinks, then directory metadata deepest first.
    fn commit(&mut self, ctx: &mut EngineContext<'_>, replies: &mut Replies, stats: &mut TransferStats) {
        let mut failures = Vec::new();

        for entry in &mut self.files {
            match (entry.status, entry.file_type) {
                (FileStatus::Complete, FileType::Regular) => match entry.commit(ctx.fs, ctx.quota) {
                    Ok(()) => stats.record_file(entry.bytes_written),
                    Err(err) => failures.push(format!("{}: {}", entry.path.display(), err)),
                },
                (FileStatus::Complete, _) | (FileStatus::Error, _) => {}
                _ => {
                    warn!("Discarding incomplete file {}", entry.file_id);
                    entry.discard(ctx.quota);
                    stats.record_failure();
                }
            }
        }

        for (link_type, kind) in [
            (FileType::HardLink, LinkKind::Hard),
            (FileType::Symlink, LinkKind::Symbolic),
        ] {
            for entry in &self.files {
                if entry.file_type != link_type || entry.status != FileStatus::Complete {
                    continue;
                }
                let Some(target) = self.link_path(entry) else {
                    failures.push(format!("{}: unresolved link target", entry.path.display()));
                    continue;
                };
                let created = ctx.fs.create_link(&entry.path, &target, kind).and_then(|_| {
                    match (kind, entry.mtime) {
                        (LinkKind::Symbolic, Some(mtime)) => ctx.fs.set_metadata(&entry.path, Some(mtime), None),
                        _ => Ok(()),
                    }
                });
                match created {
                    Ok(()) => stats.record_file(0),
                    Err(err) => failures.push(format!("{}: {}", entry.path.display(), err)),
                }
            }
        }

        let mut directories: Vec<&FileEntry> = self
            .files
            .iter()
            .filter(|entry| entry.file_type == FileType::Directory && entry.status == FileStatus::Complete)
            .collect();
        directories.sort_by_key(|entry| std::cmp::Reverse(entry.path.components().count()));
        for entry in directories {
            match ctx.fs.set_metadata(&entry.path, entry.mtime, entry.permissions) {
                Ok(()) => stats.record_file(0),
                Err(err) => failures.push(format!("{}: {}", entry.path.display(), err)),
            }
        }

        if failures.is_empty() {
            info!("Committed {}", stats.summary());
            replies.session_ack(crate::protocol::STATUS_OK);
        } else {
            let err = FileError::new(ErrorClass::Eio, failures.join("; "));
            warn!("Commit failed: {}", err);
            replies.fatal(err.to_status());
        }
    }

    fn link_path(&self, entry: &FileEntry) -> Option<PathBuf> {
        match entry.link_target.as_ref()? {
            LinkTarget::External(path) => Some(path.clone()),
            LinkTarget::Entry { file_id, absolute } => {
                let target = self.entry(file_id)?;
                if entry.file_type == FileType::Symlink && !absolute {
                    Some(relative_link_target(&entry.path, &target.path))
                } else {
                    Some(target.path.clone())
                }
            }
        }
    }

    /// Drop all staged data; nothing reaches its destination.
    pub fn discard(&mut self, quota: &mut StorageQuota) {
        for entry in &mut self.files {
            entry.discard(quota);
        }
        self.assembler = ChunkAssembler::new();
    }
}

fn send_signature(spec: &FileSpec, signature: &[u8], chunk_size: usize, replies: &mut Replies) -> std::io::Result<()> {
    for (payload, last) in OutboundStream::split_all(signature, spec.compression, chunk_size)? {
        let action = if last { Action::EndData } else { Action::Data };
        let record = replies.record(action).with_file_id(&spec.file_id).with_data(payload);
        replies.payload(record);
    }
    Ok(())
}
