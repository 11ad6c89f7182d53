//! Filesystem access for the transfer engine.

pub mod local;
pub mod metadata;
pub mod walker;

pub use local::{Filesystem, LinkKind, LocalFs, ReadSeek, StagedFile};
pub use metadata::FileMetadata;
