//! Shared bound on staged, not yet committed, data.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("staging quota exhausted: {requested} bytes requested, {available} of {limit} available")]
pub struct QuotaExceeded {
    pub requested: u64,
    pub available: u64,
    pub limit: u64,
}

/// Byte budget shared by every session of a manager.
#[derive(Debug, Clone)]
pub struct StorageQuota {
    limit: u64,
    used: u64,
}

impl StorageQuota {
    pub fn new(limit: u64) -> Self {
        Self { limit, used: 0 }
    }

    pub fn reserve(&mut self, bytes: u64) -> Result<(), QuotaExceeded> {
        let available = self.available();
        if bytes > available {
            return Err(QuotaExceeded {
                requested: bytes,
                available,
                limit: self.limit,
            });
        }
        self.used += bytes;
        Ok(())
    }

    pub fn release(&mut self, bytes: u64) {
        self.used = self.used.saturating_sub(bytes);
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn available(&self) -> u64 {
        self.limit.saturating_sub(self.used)
    }
}
