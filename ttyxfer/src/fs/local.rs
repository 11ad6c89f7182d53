//! The filesystem collaborator and its local-disk implementation.
//!
//! Writes are staged: [`Filesystem::open_for_write`] returns a temp file next
//! to the destination, and nothing appears at the destination until
//! [`StagedFile::commit`] renames it into place. Dropping a staged file
//! removes the temp file.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};

use tempfile::{NamedTempFile, TempPath};
use tracing::debug;

use super::metadata::{apply_metadata, FileMetadata};
use super::walker::{walk_directory, WalkEntry, WalkOptions};

pub trait ReadSeek: Read + Seek {}

impl<T: Read + Seek> ReadSeek for T {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Symbolic,
    Hard,
}

/// A file being written that is not yet visible at its destination.
pub trait StagedFile: Write {
    /// Flush and close the write handle, keeping the staged content.
    fn seal(&mut self) -> io::Result<()>;

    /// Atomically move the staged content to the destination.
    fn commit(self: Box<Self>) -> io::Result<()>;
}

pub trait Filesystem {
    fn open_for_write(&self, path: &Path) -> io::Result<Box<dyn StagedFile>>;

    fn open_for_read(&self, path: &Path) -> io::Result<Box<dyn ReadSeek>>;

    /// Metadata of `path` itself, without following symlinks
    fn stat(&self, path: &Path) -> io::Result<FileMetadata>;

    /// Everything below `path`, parents before children
    fn list_directory(&self, path: &Path) -> io::Result<Vec<WalkEntry>>;

    fn read_link(&self, path: &Path) -> io::Result<PathBuf>;

    fn create_dir(&self, path: &Path) -> io::Result<()>;

    /// Create a link at `path` pointing to `target`, replacing a non-directory
    /// already there.
    fn create_link(&self, path: &Path, target: &Path, kind: LinkKind) -> io::Result<()>;

    fn set_metadata(&self, path: &Path, mtime: Option<i64>, permissions: Option<u32>) -> io::Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct LocalFs {
    walk_options: WalkOptions,
}

impl LocalFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_walk_options(walk_options: WalkOptions) -> Self {
        Self { walk_options }
    }
}

impl Filesystem for LocalFs {
    fn open_for_write(&self, path: &Path) -> io::Result<Box<dyn StagedFile>> {
        let parent = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;

        let temp = tempfile::Builder::new()
            .prefix(".ttyxfer-")
            .suffix(".part")
            .tempfile_in(parent)?;
        debug!("Staging {} at {}", path.display(), temp.path().display());

        Ok(Box::new(LocalStagedFile {
            destination: path.to_path_buf(),
            state: Staging::Open(BufWriter::new(temp)),
        }))
    }

    fn open_for_read(&self, path: &Path) -> io::Result<Box<dyn ReadSeek>> {
        Ok(Box::new(BufReader::new(File::open(path)?)))
    }

    fn stat(&self, path: &Path) -> io::Result<FileMetadata> {
        FileMetadata::from_path(path)
    }

    fn list_directory(&self, path: &Path) -> io::Result<Vec<WalkEntry>> {
        walk_directory(path, &self.walk_options)
    }

    fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
        fs::read_link(path)
    }

    fn create_dir(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn create_link(&self, path: &Path, target: &Path, kind: LinkKind) -> io::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        match fs::symlink_metadata(path) {
            Ok(existing) if !existing.is_dir() => fs::remove_file(path)?,
            _ => {}
        }

        match kind {
            LinkKind::Hard => fs::hard_link(target, path),
            LinkKind::Symbolic => symlink(target, path),
        }
    }

    fn set_metadata(&self, path: &Path, mtime: Option<i64>, permissions: Option<u32>) -> io::Result<()> {
        apply_metadata(path, mtime, permissions)
    }
}

#[cfg(unix)]
fn symlink(target: &Path, path: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, path)
}

#[cfg(windows)]
fn symlink(target: &Path, path: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(target, path)
}

enum Staging {
    Open(BufWriter<NamedTempFile>),
    Sealed(TempPath),
    Discarded,
}

struct LocalStagedFile {
    destination: PathBuf,
    state: Staging,
}

impl Write for LocalStagedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.state {
            Staging::Open(writer) => writer.write(buf),
            _ => Err(io::Error::other("staged file is no longer writable")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.state {
            Staging::Open(writer) => writer.flush(),
            _ => Ok(()),
        }
    }
}

impl StagedFile for LocalStagedFile {
    fn seal(&mut self) -> io::Result<()> {
        match std::mem::replace(&mut self.state, Staging::Discarded) {
            Staging::Open(writer) => {
                let temp = writer.into_inner().map_err(|e| e.into_error())?;
                temp.as_file().sync_all()?;
                self.state = Staging::Sealed(temp.into_temp_path());
                Ok(())
            }
            other => {
                self.state = other;
                Ok(())
            }
        }
    }

    fn commit(mut self: Box<Self>) -> io::Result<()> {
        self.seal()?;
        match std::mem::replace(&mut self.state, Staging::Discarded) {
            Staging::Sealed(temp_path) => {
                temp_path.persist(&self.destination).map_err(|e| e.error)?;
                debug!("Committed {}", self.destination.display());
                Ok(())
            }
            _ => Err(io::Error::other("staged file was discarded")),
        }
    }
}
