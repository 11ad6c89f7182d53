//! Data movement between the wire and files.

pub mod chunks;
pub mod progress;
pub mod quota;

pub use chunks::{ChunkAssembler, ChunkError, OutboundStream};
pub use progress::TransferStats;
pub use quota::{QuotaExceeded, StorageQuota};
