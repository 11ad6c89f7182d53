//! Weak rolling checksum and strong hashes.

use xxhash_rust::xxh3::{xxh3_128, xxh3_64, Xxh3};

/// Rsync rolling checksum over a fixed-length window.
///
/// `a` is the byte sum and `b` the position-weighted sum, both taken mod 2^16
/// when read through [`RollingChecksum::value`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RollingChecksum {
    a: u32,
    b: u32,
    len: u32,
}

impl RollingChecksum {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset the window to `data`.
    pub fn init(&mut self, data: &[u8]) {
        let len = data.len() as u32;
        let mut a = 0u32;
        let mut b = 0u32;
        for (i, &byte) in data.iter().enumerate() {
            a = a.wrapping_add(u32::from(byte));
            b = b.wrapping_add((len - i as u32).wrapping_mul(u32::from(byte)));
        }
        self.a = a;
        self.b = b;
        self.len = len;
    }

    /// Slide the window one byte: drop `outgoing`, append `incoming`.
    pub fn roll(&mut self, outgoing: u8, incoming: u8) {
        self.a = self
            .a
            .wrapping_sub(u32::from(outgoing))
            .wrapping_add(u32::from(incoming));
        self.b = self
            .b
            .wrapping_sub(self.len.wrapping_mul(u32::from(outgoing)))
            .wrapping_add(self.a);
    }

    pub fn value(&self) -> u32 {
        (self.a & 0xffff) | ((self.b & 0xffff) << 16)
    }
}

pub fn weak_hash(data: &[u8]) -> u32 {
    let mut checksum = RollingChecksum::new();
    checksum.init(data);
    checksum.value()
}

/// Per-block strong hash (XXH3-64).
pub fn strong_hash(data: &[u8]) -> u64 {
    xxh3_64(data)
}

/// Whole-file checksum algorithms carried by `VerifyChecksum`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChecksumAlgorithm {
    /// XXH3-128, big-endian digest
    Xxh128 = 0,
}

impl ChecksumAlgorithm {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ChecksumAlgorithm::Xxh128),
            _ => None,
        }
    }

    pub fn digest_len(self) -> usize {
        match self {
            ChecksumAlgorithm::Xxh128 => 16,
        }
    }
}

/// Incremental whole-file digest.
pub struct FileDigest {
    hasher: Xxh3,
}

impl FileDigest {
    pub fn new() -> Self {
        Self {
            hasher: Xxh3::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finish(&self) -> Vec<u8> {
        self.hasher.digest128().to_be_bytes().to_vec()
    }
}

impl Default for FileDigest {
    fn default() -> Self {
        Self::new()
    }
}

pub fn file_digest(data: &[u8]) -> Vec<u8> {
    xxh3_128(data).to_be_bytes().to_vec()
}
