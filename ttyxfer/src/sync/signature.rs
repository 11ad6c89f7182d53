//! Block signatures of an existing file.
//!
//! A signature is a 12-byte header followed by one 20-byte record per block:
//!
//! ```text
//! header: version u16 | checksum_type u16 | strong_hash u16 | weak_hash u16 | block_size u32
//! block:  index u64 | weak u32 | strong u64
//! ```
//!
//! Only version 0 with all type fields 0 (rsync rolling weak hash, XXH3-64
//! strong hash) is understood.

use std::io::{self, Read};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::checksum::{strong_hash, weak_hash};
use super::CodecError;

pub const SIGNATURE_VERSION: u16 = 0;
pub const HEADER_SIZE: usize = 12;
pub const BLOCK_RECORD_SIZE: usize = 20;

/// Smallest block size picked by [`block_size_for`]
pub const MIN_BLOCK_SIZE: u32 = 700;
/// Largest block size picked by [`block_size_for`]
pub const MAX_BLOCK_SIZE: u32 = 128 * 1024;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Pick a block size for a basis of `basis_len` bytes.
///
/// Square root of the length, rounded up to a multiple of 8 and clamped to
/// [`MIN_BLOCK_SIZE`]..=[`MAX_BLOCK_SIZE`].
pub fn block_size_for(basis_len: u64) -> u32 {
    let root = (basis_len as f64).sqrt().ceil() as u64;
    let rounded = root.div_ceil(8) * 8;
    rounded.clamp(u64::from(MIN_BLOCK_SIZE), u64::from(MAX_BLOCK_SIZE)) as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureHeader {
    pub version: u16,
    pub checksum_type: u16,
    pub strong_hash_type: u16,
    pub weak_hash_type: u16,
    pub block_size: u32,
}

impl SignatureHeader {
    pub fn new(block_size: u32) -> Self {
        Self {
            version: SIGNATURE_VERSION,
            checksum_type: 0,
            strong_hash_type: 0,
            weak_hash_type: 0,
            block_size,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.version);
        buf.put_u16_le(self.checksum_type);
        buf.put_u16_le(self.strong_hash_type);
        buf.put_u16_le(self.weak_hash_type);
        buf.put_u32_le(self.block_size);
    }

    pub fn decode(mut data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < HEADER_SIZE {
            return Err(CodecError::Truncated("signature header"));
        }

        let header = Self {
            version: data.get_u16_le(),
            checksum_type: data.get_u16_le(),
            strong_hash_type: data.get_u16_le(),
            weak_hash_type: data.get_u16_le(),
            block_size: data.get_u32_le(),
        };

        if header.version != SIGNATURE_VERSION
            || header.checksum_type != 0
            || header.strong_hash_type != 0
            || header.weak_hash_type != 0
        {
            return Err(CodecError::UnsupportedHeader(format!(
                "version {} checksum {} strong {} weak {}",
                header.version, header.checksum_type, header.strong_hash_type, header.weak_hash_type
            )));
        }
        if header.block_size == 0 {
            return Err(CodecError::Malformed("block size must be positive".to_string()));
        }

        Ok(header)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSignature {
    pub index: u64,
    pub weak_hash: u32,
    pub strong_hash: u64,
}

impl BlockSignature {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.index);
        buf.put_u32_le(self.weak_hash);
        buf.put_u64_le(self.strong_hash);
    }

    /// Decode one record. `data` must hold at least [`BLOCK_RECORD_SIZE`] bytes.
    fn decode(mut data: &[u8]) -> Self {
        Self {
            index: data.get_u64_le(),
            weak_hash: data.get_u32_le(),
            strong_hash: data.get_u64_le(),
        }
    }
}

/// Signature of a file: block size plus per-block hashes in index order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub block_size: u32,
    pub blocks: Vec<BlockSignature>,
}

impl Signature {
    /// Signature of a file that does not exist yet.
    pub fn empty(block_size: u32) -> Self {
        Self {
            block_size,
            blocks: Vec::new(),
        }
    }

    pub fn header(&self) -> SignatureHeader {
        SignatureHeader::new(self.block_size)
    }

    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.blocks.len() * BLOCK_RECORD_SIZE);
        self.header().encode(&mut buf);
        for block in &self.blocks {
            block.encode(&mut buf);
        }
        buf.freeze()
    }

    /// Index of the final block, the only one that may be short.
    pub fn last_index(&self) -> Option<u64> {
        self.blocks.last().map(|block| block.index)
    }
}

/// Builds a signature from data fed in arbitrary pieces.
pub struct SignatureGenerator {
    block_size: usize,
    pending: Vec<u8>,
    blocks: Vec<BlockSignature>,
}

impl SignatureGenerator {
    pub fn new(block_size: u32) -> Self {
        let block_size = block_size.max(1) as usize;
        Self {
            block_size,
            pending: Vec::with_capacity(block_size),
            blocks: Vec::new(),
        }
    }

    pub fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            if self.pending.is_empty() && data.len() >= self.block_size {
                let (block, rest) = data.split_at(self.block_size);
                self.record(block);
                data = rest;
                continue;
            }

            let take = (self.block_size - self.pending.len()).min(data.len());
            self.pending.extend_from_slice(&data[..take]);
            data = &data[take..];

            if self.pending.len() == self.block_size {
                let block = std::mem::take(&mut self.pending);
                self.record(&block);
                self.pending = block;
                self.pending.clear();
            }
        }
    }

    pub fn finish(mut self) -> Signature {
        if !self.pending.is_empty() {
            let block = std::mem::take(&mut self.pending);
            self.record(&block);
        }
        Signature {
            block_size: self.block_size as u32,
            blocks: self.blocks,
        }
    }

    fn record(&mut self, block: &[u8]) {
        self.blocks.push(BlockSignature {
            index: self.blocks.len() as u64,
            weak_hash: weak_hash(block),
            strong_hash: strong_hash(block),
        });
    }
}

/// Generate a signature for everything readable from `reader`.
///
/// # Arguments
/// * `reader` - Source of the existing file content
/// * `block_size` - Block size to cut the content into
///
/// # Returns
/// * `Ok(Signature)` - The generated signature
/// * `Err(io::Error)` - If the reader fails
pub fn generate_signature<R: Read>(mut reader: R, block_size: u32) -> io::Result<Signature> {
    let mut generator = SignatureGenerator::new(block_size);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        generator.update(&buf[..n]);
    }

    Ok(generator.finish())
}

/// Generate a signature from a byte buffer.
pub fn generate_signature_from_bytes(data: &[u8], block_size: u32) -> Signature {
    let mut generator = SignatureGenerator::new(block_size);
    generator.update(data);
    generator.finish()
}

/// Most block records a decoder accepts
pub const MAX_SIGNATURE_BLOCKS: usize = 1 << 20;

/// Incremental signature parser for data arriving in chunks.
#[derive(Debug, Default)]
pub struct SignatureDecoder {
    buf: BytesMut,
    header: Option<SignatureHeader>,
    blocks: Vec<BlockSignature>,
}

impl SignatureDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(&self) -> Option<&SignatureHeader> {
        self.header.as_ref()
    }

    pub fn blocks_received(&self) -> usize {
        self.blocks.len()
    }

    pub fn feed(&mut self, data: &[u8]) -> Result<(), CodecError> {
        self.buf.extend_from_slice(data);

        if self.header.is_none() {
            if self.buf.len() < HEADER_SIZE {
                return Ok(());
            }
            let header = SignatureHeader::decode(&self.buf[..HEADER_SIZE])?;
            self.buf.advance(HEADER_SIZE);
            self.header = Some(header);
        }

        while self.buf.len() >= BLOCK_RECORD_SIZE {
            let block = BlockSignature::decode(&self.buf[..BLOCK_RECORD_SIZE]);
            if block.index != self.blocks.len() as u64 {
                return Err(CodecError::Malformed(format!(
                    "block signature {} out of order, expected {}",
                    block.index,
                    self.blocks.len()
                )));
            }
            if self.blocks.len() >= MAX_SIGNATURE_BLOCKS {
                return Err(CodecError::LimitExceeded("block count"));
            }
            self.buf.advance(BLOCK_RECORD_SIZE);
            self.blocks.push(block);
        }

        Ok(())
    }

    pub fn finish(self) -> Result<Signature, CodecError> {
        let header = self.header.ok_or(CodecError::Truncated("signature header"))?;
        if !self.buf.is_empty() {
            return Err(CodecError::Truncated("block signature"));
        }
        Ok(Signature {
            block_size: header.block_size,
            blocks: self.blocks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_block_size_for() {
        assert_eq!(block_size_for(0), MIN_BLOCK_SIZE);
        assert_eq!(block_size_for(100), MIN_BLOCK_SIZE);
        // sqrt(1_000_000) = 1000, already a multiple of 8
        assert_eq!(block_size_for(1_000_000), 1000);
        // sqrt(1_000_001) rounds up to 1001, then to 1008
        assert_eq!(block_size_for(1_000_001), 1008);
        assert_eq!(block_size_for(u64::MAX / 2), MAX_BLOCK_SIZE);
    }

    #[test]
    fn test_serialized_layout() {
        let sig = generate_signature_from_bytes(&[7u8; 1500], 700);
        let bytes = sig.serialize();

        assert_eq!(sig.blocks.len(), 3);
        assert_eq!(bytes.len(), HEADER_SIZE + 3 * BLOCK_RECORD_SIZE);
        assert_eq!(&bytes[..8], &[0u8; 8]);
        assert_eq!(&bytes[8..12], &700u32.to_le_bytes());
        // Second record starts with its index
        let second = HEADER_SIZE + BLOCK_RECORD_SIZE;
        assert_eq!(&bytes[second..second + 8], &1u64.to_le_bytes());
    }

    #[test]
    fn test_short_last_block() {
        let data = vec![3u8; 1000];
        let sig = generate_signature_from_bytes(&data, 700);

        assert_eq!(sig.blocks.len(), 2);
        assert_eq!(sig.last_index(), Some(1));
        assert_eq!(sig.blocks[1].weak_hash, weak_hash(&data[700..]));
        assert_eq!(sig.blocks[1].strong_hash, strong_hash(&data[700..]));
    }

    #[test]
    fn test_empty_input_has_no_blocks() {
        let sig = generate_signature_from_bytes(&[], 700);
        assert!(sig.blocks.is_empty());
        assert_eq!(sig.serialize().len(), HEADER_SIZE);
    }

    #[test]
    fn test_piecewise_update_matches_oneshot() {
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 97) as u8).collect();
        let mut generator = SignatureGenerator::new(700);
        for piece in data.chunks(333) {
            generator.update(piece);
        }

        assert_eq!(generator.finish(), generate_signature_from_bytes(&data, 700));
    }

    #[test]
    fn test_signature_from_file() -> io::Result<()> {
        let mut temp_file = NamedTempFile::new()?;
        temp_file.write_all(&vec![1u8; 2000])?;
        temp_file.flush()?;

        let sig = generate_signature(std::fs::File::open(temp_file.path())?, 700)?;
        assert_eq!(sig.blocks.len(), 3);

        Ok(())
    }

    #[test]
    fn test_decoder_across_chunk_boundaries() {
        let sig = generate_signature_from_bytes(&[9u8; 3000], 700);
        let bytes = sig.serialize();

        let mut decoder = SignatureDecoder::new();
        for piece in bytes.chunks(7) {
            decoder.feed(piece).unwrap();
        }
        assert_eq!(decoder.blocks_received(), sig.blocks.len());
        assert_eq!(decoder.finish().unwrap(), sig);
    }

    #[test]
    fn test_decoder_rejects_unknown_version() {
        let mut bytes = BytesMut::new();
        SignatureHeader {
            version: 1,
            ..SignatureHeader::new(700)
        }
        .encode(&mut bytes);

        let mut decoder = SignatureDecoder::new();
        assert!(matches!(
            decoder.feed(&bytes),
            Err(CodecError::UnsupportedHeader(_))
        ));
    }

    #[test]
    fn test_decoder_rejects_truncated_record() {
        let bytes = generate_signature_from_bytes(&[1u8; 800], 700).serialize();
        let mut decoder = SignatureDecoder::new();
        decoder.feed(&bytes[..bytes.len() - 3]).unwrap();
        assert!(matches!(
            decoder.finish(),
            Err(CodecError::Truncated("block signature"))
        ));
    }

    #[test]
    fn test_decoder_caps_block_count() {
        let mut decoder = SignatureDecoder::new();
        let mut header = BytesMut::new();
        SignatureHeader::new(1).encode(&mut header);
        decoder.feed(&header).unwrap();

        let mut next = 0u64;
        let mut batch = BytesMut::new();
        while next < MAX_SIGNATURE_BLOCKS as u64 {
            batch.clear();
            for _ in 0..4096 {
                BlockSignature { index: next, weak_hash: 0, strong_hash: 0 }.encode(&mut batch);
                next += 1;
            }
            decoder.feed(&batch).unwrap();
        }
        assert_eq!(decoder.blocks_received(), MAX_SIGNATURE_BLOCKS);

        batch.clear();
        BlockSignature { index: next, weak_hash: 0, strong_hash: 0 }.encode(&mut batch);
        assert!(matches!(
            decoder.feed(&batch),
            Err(CodecError::LimitExceeded(_))
        ));
    }

    #[test]
    fn test_decoder_requires_header() {
        let decoder = SignatureDecoder::new();
        assert!(matches!(
            decoder.finish(),
            Err(CodecError::Truncated("signature header"))
        ));
    }

    proptest! {
        #[test]
        fn prop_signature_is_deterministic(
            content in proptest::collection::vec(any::<u8>(), 0..4000),
            block_size in 1u32..600,
            split in 0usize..4000,
        ) {
            let first = generate_signature_from_bytes(&content, block_size);
            let second = generate_signature(&content[..], block_size).unwrap();
            prop_assert_eq!(&first.blocks, &second.blocks);

            let split = split.min(content.len());
            let mut generator = SignatureGenerator::new(block_size);
            generator.update(&content[..split]);
            generator.update(&content[split..]);
            prop_assert_eq!(&generator.finish().blocks, &first.blocks);
        }
    }
}
