//! Recursive directory expansion for receive listings.
//!
//! Entries come back depth-first in file-name order, with directories listed
//! before their contents so parents always precede children.

use std::io;
use std::path::{Path, PathBuf};

use walkdir::{DirEntry, WalkDir};

use super::metadata::FileMetadata;

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Maximum depth (None = unlimited)
    pub max_depth: Option<usize>,

    /// File names containing any of these are skipped, with their subtrees
    pub exclude_patterns: Vec<String>,
}

/// An object discovered below the walk root
#[derive(Debug, Clone)]
pub struct WalkEntry {
    /// Full path
    pub path: PathBuf,

    /// Path relative to the walk root
    pub relative_path: PathBuf,

    /// Depth below the root (direct children are 1)
    pub depth: usize,

    pub metadata: FileMetadata,
}

impl WalkEntry {
    fn from_entry(entry: &DirEntry, root: &Path) -> io::Result<Self> {
        let metadata = FileMetadata::from_std(&entry.metadata()?);
        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();

        Ok(Self {
            path,
            relative_path,
            depth: entry.depth(),
            metadata,
        })
    }
}

/// Walk everything below `root` (the root itself is not included).
///
/// # Arguments
/// * `root` - Directory to expand
/// * `options` - Walking options (filters, depth, etc.)
///
/// # Returns
/// * `Ok(Vec<WalkEntry>)` - Directories, files and symlinks found
/// * `Err(io::Error)` - If a directory cannot be read
pub fn walk_directory(root: &Path, options: &WalkOptions) -> io::Result<Vec<WalkEntry>> {
    let mut walker = WalkDir::new(root)
        .follow_links(false)
        .min_depth(1)
        .sort_by_file_name();

    if let Some(max_depth) = options.max_depth {
        walker = walker.max_depth(max_depth);
    }

    let mut entries = Vec::new();
    let mut iter = walker.into_iter();
    while let Some(entry) = iter.next() {
        let entry = entry?;

        if should_exclude(&entry, &options.exclude_patterns) {
            if entry.file_type().is_dir() {
                iter.skip_current_dir();
            }
            continue;
        }

        entries.push(WalkEntry::from_entry(&entry, root)?);
    }

    Ok(entries)
}

/// Check if a directory entry should be excluded based on patterns
fn should_exclude(entry: &DirEntry, patterns: &[String]) -> bool {
    let file_name = entry.file_name().to_string_lossy();
    patterns.iter().any(|pattern| file_name.contains(pattern.as_str()))
}
