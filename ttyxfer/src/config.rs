//! Configuration management for the transfer engine.
//!
//! Loads configuration from an optional TOML file with `TTYXFER_*`
//! environment variable overrides (`TTYXFER_AUTH__PASSWORD`,
//! `TTYXFER_TRANSFER__QUOTA_BYTES`, ...). CLI flags are applied on top by
//! the binary.

use std::path::{Path, PathBuf};

use ::config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::fs::walker::WalkOptions;
use crate::session::{EngineSettings, DEFAULT_QUOTA_BYTES};
use crate::transfer::chunks::MAX_CHUNK_SIZE;
use crate::utils::errors::TransferError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub transfer: TransferConfig,
    pub auth: AuthConfig,
    pub listing: ListingConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Base directory for `~` and relative names (default: the user's home)
    pub home: Option<PathBuf>,

    /// Outbound payload bytes per record (1-4096)
    pub chunk_size: usize,

    /// Commands parked per session while awaiting consent (0 = drop the
    /// session instead)
    pub max_pending_commands: usize,

    /// Shared bound on staged, uncommitted bytes
    pub quota_bytes: u64,

    /// Delta block size (0 = derive from each file's size)
    pub default_block_size: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Shared secret for bypass authorization; empty disables bypass
    pub password: String,

    /// Answer given when a session needs user consent
    pub consent: ConsentPolicy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsentPolicy {
    /// Leave the session parked until the host delivers a decision
    Ask,
    Allow,
    #[default]
    Deny,
}

/// Directory expansion in receive listings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingConfig {
    /// Names containing any of these are left out, with their subtrees
    pub exclude_patterns: Vec<String>,

    /// Deepest level listed below a requested directory (None = unlimited)
    pub max_depth: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            home: None,
            chunk_size: MAX_CHUNK_SIZE,
            max_pending_commands: 0,
            quota_bytes: DEFAULT_QUOTA_BYTES,
            default_block_size: 0,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load from an optional TOML file plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, TransferError> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }
        builder = builder.add_source(
            Environment::with_prefix("TTYXFER")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder
            .build()
            .and_then(|built| built.try_deserialize())
            .map_err(|e| TransferError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML text, without environment overrides.
    pub fn from_toml_str(content: &str) -> Result<Self, TransferError> {
        let config: Config = ::config::Config::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()
            .and_then(|built| built.try_deserialize())
            .map_err(|e| TransferError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TransferError> {
        if self.transfer.chunk_size == 0 || self.transfer.chunk_size > MAX_CHUNK_SIZE {
            return Err(TransferError::Config(format!(
                "transfer.chunk_size must be between 1 and {}, got {}",
                MAX_CHUNK_SIZE, self.transfer.chunk_size
            )));
        }
        if self.transfer.quota_bytes == 0 {
            return Err(TransferError::Config("transfer.quota_bytes must be positive".to_string()));
        }
        if self.listing.max_depth == Some(0) {
            return Err(TransferError::Config("listing.max_depth must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn home_dir(&self) -> PathBuf {
        self.transfer
            .home
            .clone()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn walk_options(&self) -> WalkOptions {
        WalkOptions {
            max_depth: self.listing.max_depth,
            exclude_patterns: self.listing.exclude_patterns.clone(),
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            home: self.home_dir(),
            chunk_size: self.transfer.chunk_size,
            max_pending_commands: self.transfer.max_pending_commands,
            quota_bytes: self.transfer.quota_bytes,
            default_block_size: self.transfer.default_block_size,
            bypass_secret: Some(self.auth.password.clone()).filter(|p| !p.is_empty()),
        }
    }
}
