//! Conversion between platform metadata and the protocol's canonical form.
//!
//! On the wire, mtimes are nanoseconds since the epoch, permissions are the
//! twelve Unix mode bits, and paths use `/` separators. Incoming names are
//! normalized against a home directory before they touch the filesystem.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use filetime::FileTime;
use serde::{Deserialize, Serialize};

use crate::protocol::FileType;
use crate::utils::errors::{ErrorClass, FileError};

/// Mode bits carried by the protocol
pub const PERMISSION_MASK: u32 = 0o7777;

/// Mode for received files that were announced without permissions
pub const DEFAULT_FILE_MODE: u32 = 0o644;

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Protocol view of a filesystem object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// Size in bytes (0 for directories and symlinks)
    pub size: u64,

    /// Last modified time, nanoseconds since the Unix epoch
    pub mtime: i64,

    /// Permission bits, masked to [`PERMISSION_MASK`]
    pub permissions: u32,

    pub file_type: FileType,
}

impl FileMetadata {
    /// Metadata of `path` itself; symlinks are not followed.
    pub fn from_path(path: &Path) -> io::Result<Self> {
        let metadata = fs::symlink_metadata(path)?;
        Ok(Self::from_std(&metadata))
    }

    pub fn from_std(metadata: &fs::Metadata) -> Self {
        let file_type = if metadata.file_type().is_symlink() {
            FileType::Symlink
        } else if metadata.is_dir() {
            FileType::Directory
        } else {
            FileType::Regular
        };

        #[cfg(unix)]
        let permissions = {
            use std::os::unix::fs::PermissionsExt;
            protocol_permissions(metadata.permissions().mode())
        };

        #[cfg(not(unix))]
        let permissions = if metadata.permissions().readonly() {
            0o444
        } else {
            DEFAULT_FILE_MODE
        };

        Self {
            size: if file_type == FileType::Regular {
                metadata.len()
            } else {
                0
            },
            mtime: metadata.modified().map(system_time_to_mtime).unwrap_or(0),
            permissions,
            file_type,
        }
    }
}

pub fn protocol_permissions(mode: u32) -> u32 {
    mode & PERMISSION_MASK
}

pub fn system_time_to_mtime(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => i64::try_from(after.as_nanos()).unwrap_or(i64::MAX),
        Err(before) => i64::try_from(before.duration().as_nanos())
            .map(|nanos| -nanos)
            .unwrap_or(i64::MIN),
    }
}

pub fn mtime_to_system_time(mtime: i64) -> SystemTime {
    let offset = Duration::from_nanos(mtime.unsigned_abs());
    let time = if mtime >= 0 {
        UNIX_EPOCH.checked_add(offset)
    } else {
        UNIX_EPOCH.checked_sub(offset)
    };
    time.unwrap_or(UNIX_EPOCH)
}

fn mtime_to_filetime(mtime: i64) -> FileTime {
    FileTime::from_unix_time(
        mtime.div_euclid(NANOS_PER_SEC),
        mtime.rem_euclid(NANOS_PER_SEC) as u32,
    )
}

/// Set mtime and permission bits on `path`.
///
/// Symlinks get their own timestamps set and keep their permissions, since
/// changing a link's mode would follow it to the target.
pub fn apply_metadata(path: &Path, mtime: Option<i64>, permissions: Option<u32>) -> io::Result<()> {
    let metadata = fs::symlink_metadata(path)?;
    let is_symlink = metadata.file_type().is_symlink();

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Some(mode) = permissions.filter(|_| !is_symlink) {
            fs::set_permissions(path, fs::Permissions::from_mode(protocol_permissions(mode)))?;
        }
    }

    #[cfg(not(unix))]
    {
        if let Some(mode) = permissions.filter(|_| !is_symlink) {
            let mut perms = metadata.permissions();
            perms.set_readonly(mode & 0o222 == 0);
            fs::set_permissions(path, perms)?;
        }
    }

    if let Some(mtime) = mtime {
        let time = mtime_to_filetime(mtime);
        if is_symlink {
            filetime::set_symlink_file_times(path, time, time)?;
        } else {
            filetime::set_file_times(path, time, time)?;
        }
    }

    Ok(())
}

/// Resolve a protocol name to an absolute local path.
///
/// `~` and `~/...` expand to `home`, relative names are taken relative to
/// `home`, and `.`/`..` components are folded lexically.
pub fn normalize_path(name: &str, home: &Path) -> Result<PathBuf, FileError> {
    if name.is_empty() {
        return Err(FileError::new(ErrorClass::Einval, "Empty file name"));
    }
    if name.contains('\0') {
        return Err(FileError::new(ErrorClass::Einval, "File name contains NUL"));
    }

    let expanded = if name == "~" {
        home.to_path_buf()
    } else if let Some(rest) = name.strip_prefix("~/") {
        home.join(rest)
    } else if Path::new(name).is_absolute() {
        PathBuf::from(name)
    } else {
        home.join(name)
    };

    Ok(lexical_normalize(&expanded))
}

/// Fold `.` and `..` without touching the filesystem. `..` at the root stays
/// at the root.
pub fn lexical_normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

/// Protocol form of a local path (`/` separated).
pub fn to_protocol_path(path: &Path) -> String {
    let text = path.to_string_lossy();
    if cfg!(windows) {
        text.replace('\\', "/")
    } else {
        text.into_owned()
    }
}

/// Path of `target` relative to the directory containing `link`.
pub fn relative_link_target(link: &Path, target: &Path) -> PathBuf {
    let base: Vec<Component> = link.parent().map(|p| p.components().collect()).unwrap_or_default();
    let target: Vec<Component> = target.components().collect();

    let common = base
        .iter()
        .zip(target.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut relative = PathBuf::new();
    for _ in common..base.len() {
        relative.push("..");
    }
    for component in &target[common..] {
        relative.push(component.as_os_str());
    }
    if relative.as_os_str().is_empty() {
        relative.push(".");
    }
    relative
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_extract_metadata() -> io::Result<()> {
        let mut temp_file = NamedTempFile::new()?;
        temp_file.write_all(b"test content")?;
        temp_file.flush()?;

        let metadata = FileMetadata::from_path(temp_file.path())?;

        assert_eq!(metadata.size, 12);
        assert_eq!(metadata.file_type, FileType::Regular);
        assert!(metadata.mtime > 0);

        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn test_symlink_not_followed() -> io::Result<()> {
        let temp_dir = TempDir::new()?;
        let target = temp_dir.path().join("target");
        fs::write(&target, b"data")?;
        let link = temp_dir.path().join("link");
        std::os::unix::fs::symlink(&target, &link)?;

        let metadata = FileMetadata::from_path(&link)?;
        assert_eq!(metadata.file_type, FileType::Symlink);
        assert_eq!(metadata.size, 0);

        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn test_apply_metadata() -> io::Result<()> {
        let temp_file = NamedTempFile::new()?;
        let mtime = 1_600_000_000 * NANOS_PER_SEC + 123_000_000;

        apply_metadata(temp_file.path(), Some(mtime), Some(0o100640))?;

        let metadata = FileMetadata::from_path(temp_file.path())?;
        assert_eq!(metadata.permissions, 0o640);
        assert_eq!(metadata.mtime / 1_000_000, mtime / 1_000_000);

        Ok(())
    }

    #[test]
    fn test_mtime_conversion() {
        let ns = 1_700_000_000_123_456_789;
        assert_eq!(system_time_to_mtime(mtime_to_system_time(ns)), ns);
        assert_eq!(system_time_to_mtime(mtime_to_system_time(-5)), -5);
    }

    #[test]
    fn test_normalize_path() {
        let home = Path::new("/home/user");

        assert_eq!(normalize_path("~", home).unwrap(), PathBuf::from("/home/user"));
        assert_eq!(
            normalize_path("~/docs/a.txt", home).unwrap(),
            PathBuf::from("/home/user/docs/a.txt")
        );
        assert_eq!(
            normalize_path("docs/./b.txt", home).unwrap(),
            PathBuf::from("/home/user/docs/b.txt")
        );
        assert_eq!(
            normalize_path("/etc/../tmp/x", home).unwrap(),
            PathBuf::from("/tmp/x")
        );
        assert_eq!(normalize_path("/../..", home).unwrap(), PathBuf::from("/"));
    }

    #[test]
    fn test_normalize_rejects_bad_names() {
        let home = Path::new("/home/user");
        assert_eq!(normalize_path("", home).unwrap_err().class, ErrorClass::Einval);
        assert_eq!(normalize_path("a\0b", home).unwrap_err().class, ErrorClass::Einval);
    }

    #[test]
    fn test_relative_link_target() {
        assert_eq!(
            relative_link_target(Path::new("/a/b/link"), Path::new("/a/c/file")),
            PathBuf::from("../c/file")
        );
        assert_eq!(
            relative_link_target(Path::new("/a/link"), Path::new("/a/file")),
            PathBuf::from("file")
        );
        assert_eq!(
            relative_link_target(Path::new("/a/b/c/link"), Path::new("/a")),
            PathBuf::from("../..")
        );
    }
}
