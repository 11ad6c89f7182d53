//! Rsync-style delta transmission.
//!
//! - [`signature`]: block signatures of the receiver's existing file
//! - [`delta`]: copy/literal operation stream computed against a signature
//! - [`apply`]: reconstruction with whole-file checksum verification
//!
//! All integers on the wire are little-endian.

pub mod apply;
pub mod checksum;
pub mod delta;
pub mod signature;

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("unsupported signature header: {0}")]
    UnsupportedHeader(String),

    #[error("malformed stream: {0}")]
    Malformed(String),

    #[error("truncated {0}")]
    Truncated(&'static str),

    #[error("block {index} is beyond the end of the {basis_len} byte basis")]
    BlockOutOfRange { index: u64, basis_len: u64 },

    #[error("checksum mismatch")]
    ChecksumMismatch,

    #[error("{0} exceeds limit")]
    LimitExceeded(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
