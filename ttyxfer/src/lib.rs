//! ttyxfer library
//!
//! Session and delta-transfer engine for terminal file transfers: typed
//! protocol records, per-session state machines with an authorization gate,
//! and an rsync-style signature/delta codec.

pub mod config;
pub mod daemon;
pub mod fs;
pub mod protocol;
pub mod session;
pub mod sync;
pub mod transfer;
pub mod transport;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use protocol::{Action, Command, Record};
pub use session::{Consent, DispatchError, EngineSettings, SessionManager};
pub use utils::errors::TransferError;
pub type Result<T> = std::result::Result<T, TransferError>;
