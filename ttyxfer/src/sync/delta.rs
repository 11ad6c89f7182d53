//! Delta operation stream.
//!
//! Wire encoding, one tag byte per operation:
//!
//! | tag    | operation        | body                                  |
//! |--------|------------------|---------------------------------------|
//! | `0x00` | `CopyBlock`      | index u64                             |
//! | `0x01` | `Literal`        | length u32, bytes                     |
//! | `0x02` | `VerifyChecksum` | algorithm u8, length u16, digest      |
//! | `0x03` | `CopyBlockRange` | start index u64, count u32            |

use std::collections::HashMap;
use std::io::{self, Read};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::checksum::{strong_hash, weak_hash, ChecksumAlgorithm, FileDigest, RollingChecksum};
use super::signature::Signature;
use super::CodecError;

pub const OP_COPY_BLOCK: u8 = 0x00;
pub const OP_LITERAL: u8 = 0x01;
pub const OP_VERIFY_CHECKSUM: u8 = 0x02;
pub const OP_COPY_BLOCK_RANGE: u8 = 0x03;

/// Pending literal bytes are flushed once they reach this size
pub const LITERAL_FLUSH_SIZE: usize = 8 * 1024;

/// Largest literal accepted by the decoder
pub const MAX_LITERAL_SIZE: usize = 16 * 1024 * 1024;

const READ_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaOp {
    CopyBlock { index: u64 },
    CopyBlockRange { start_index: u64, count: u32 },
    Literal { bytes: Bytes },
    VerifyChecksum { algorithm: ChecksumAlgorithm, digest: Vec<u8> },
}

impl DeltaOp {
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            DeltaOp::CopyBlock { index } => {
                buf.put_u8(OP_COPY_BLOCK);
                buf.put_u64_le(*index);
            }
            DeltaOp::CopyBlockRange { start_index, count } => {
                buf.put_u8(OP_COPY_BLOCK_RANGE);
                buf.put_u64_le(*start_index);
                buf.put_u32_le(*count);
            }
            DeltaOp::Literal { bytes } => {
                buf.put_u8(OP_LITERAL);
                buf.put_u32_le(bytes.len() as u32);
                buf.put_slice(bytes);
            }
            DeltaOp::VerifyChecksum { algorithm, digest } => {
                buf.put_u8(OP_VERIFY_CHECKSUM);
                buf.put_u8(*algorithm as u8);
                buf.put_u16_le(digest.len() as u16);
                buf.put_slice(digest);
            }
        }
    }
}

/// Encode a complete operation list.
pub fn encode_delta(ops: &[DeltaOp]) -> Bytes {
    let mut buf = BytesMut::new();
    for op in ops {
        op.encode(&mut buf);
    }
    buf.freeze()
}

/// Decode a complete operation stream.
pub fn decode_delta(data: &[u8]) -> Result<Vec<DeltaOp>, CodecError> {
    let mut decoder = DeltaDecoder::new();
    let mut ops = Vec::new();
    decoder.feed(data, &mut ops)?;
    decoder.finish()?;
    Ok(ops)
}

/// Incremental operation parser; an operation may straddle chunk boundaries.
#[derive(Debug, Default)]
pub struct DeltaDecoder {
    buf: BytesMut,
}

impl DeltaDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `data` and push every operation it completes onto `out`.
    pub fn feed(&mut self, data: &[u8], out: &mut Vec<DeltaOp>) -> Result<(), CodecError> {
        self.buf.extend_from_slice(data);
        while let Some(op) = self.next_op()? {
            out.push(op);
        }
        Ok(())
    }

    /// Fails if the stream ended in the middle of an operation.
    pub fn finish(&self) -> Result<(), CodecError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(CodecError::Truncated("delta operation"))
        }
    }

    fn next_op(&mut self) -> Result<Option<DeltaOp>, CodecError> {
        let Some(&tag) = self.buf.first() else {
            return Ok(None);
        };

        let frame_len = match tag {
            OP_COPY_BLOCK => 1 + 8,
            OP_COPY_BLOCK_RANGE => 1 + 8 + 4,
            OP_LITERAL => {
                if self.buf.len() < 5 {
                    return Ok(None);
                }
                let len = u32::from_le_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]])
                    as usize;
                if len > MAX_LITERAL_SIZE {
                    return Err(CodecError::Malformed(format!(
                        "literal of {} bytes exceeds limit",
                        len
                    )));
                }
                5 + len
            }
            OP_VERIFY_CHECKSUM => {
                if self.buf.len() < 4 {
                    return Ok(None);
                }
                4 + u16::from_le_bytes([self.buf[2], self.buf[3]]) as usize
            }
            other => {
                return Err(CodecError::Malformed(format!(
                    "unknown delta operation 0x{:02x}",
                    other
                )))
            }
        };

        if self.buf.len() < frame_len {
            return Ok(None);
        }

        let mut frame = self.buf.split_to(frame_len).freeze();
        frame.advance(1);

        let op = match tag {
            OP_COPY_BLOCK => DeltaOp::CopyBlock {
                index: frame.get_u64_le(),
            },
            OP_COPY_BLOCK_RANGE => DeltaOp::CopyBlockRange {
                start_index: frame.get_u64_le(),
                count: frame.get_u32_le(),
            },
            OP_LITERAL => {
                frame.advance(4);
                DeltaOp::Literal { bytes: frame }
            }
            _ => {
                let raw = frame.get_u8();
                let algorithm = ChecksumAlgorithm::from_u8(raw).ok_or_else(|| {
                    CodecError::Malformed(format!("unknown checksum algorithm {}", raw))
                })?;
                frame.advance(2);
                if frame.len() != algorithm.digest_len() {
                    return Err(CodecError::Malformed(format!(
                        "digest of {} bytes for a {} byte checksum",
                        frame.len(),
                        algorithm.digest_len()
                    )));
                }
                DeltaOp::VerifyChecksum {
                    algorithm,
                    digest: frame.to_vec(),
                }
            }
        };

        Ok(Some(op))
    }
}

/// Computes the delta of new content against a signature.
///
/// Content is pushed in with [`update`](Self::update) in pieces of any size
/// and operations come out as soon as they are decided, so a caller can
/// bound the work done per step. [`finish`](Self::finish) flushes the rest
/// and appends the `VerifyChecksum`.
pub struct DeltaGenerator {
    signature: Signature,
    table: HashMap<u32, Vec<u64>>,
    block_size: usize,
    digest: FileDigest,
    // buf[literal_start..pos] is the pending literal, buf[pos..] unscanned
    buf: Vec<u8>,
    pos: usize,
    literal_start: usize,
    rolling: RollingChecksum,
    rolling_valid: bool,
    pending_copy: Option<(u64, u32)>,
    finished: bool,
}

impl DeltaGenerator {
    pub fn new(signature: Signature) -> Self {
        let mut table: HashMap<u32, Vec<u64>> = HashMap::with_capacity(signature.blocks.len());
        for block in &signature.blocks {
            table.entry(block.weak_hash).or_default().push(block.index);
        }

        Self {
            block_size: signature.block_size.max(1) as usize,
            signature,
            table,
            digest: FileDigest::new(),
            buf: Vec::new(),
            pos: 0,
            literal_start: 0,
            rolling: RollingChecksum::new(),
            rolling_valid: false,
            pending_copy: None,
            finished: false,
        }
    }

    /// Scan the next piece of new content.
    ///
    /// Matching blocks become copies (consecutive ones merged into a range),
    /// everything else literals of at most [`LITERAL_FLUSH_SIZE`] bytes.
    pub fn update<F>(&mut self, data: &[u8], mut emit: F) -> io::Result<()>
    where
        F: FnMut(DeltaOp) -> io::Result<()>,
    {
        if self.finished {
            return Err(io::Error::other("delta generator already finished"));
        }
        if self.literal_start > 0 {
            self.buf.drain(..self.literal_start);
            self.pos -= self.literal_start;
            self.literal_start = 0;
        }
        self.digest.update(data);
        self.buf.extend_from_slice(data);
        self.scan(false, &mut emit)
    }

    /// End of new content: emit what is left and the whole-content checksum.
    pub fn finish<F>(&mut self, mut emit: F) -> io::Result<()>
    where
        F: FnMut(DeltaOp) -> io::Result<()>,
    {
        if self.finished {
            return Ok(());
        }
        self.scan(true, &mut emit)?;
        self.finished = true;

        flush_literal(&self.buf[self.literal_start..self.pos], &mut self.pending_copy, &mut emit)?;
        if let Some((start, count)) = self.pending_copy.take() {
            emit(copy_op(start, count))?;
        }
        self.buf = Vec::new();
        self.pos = 0;
        self.literal_start = 0;

        emit(DeltaOp::VerifyChecksum {
            algorithm: ChecksumAlgorithm::Xxh128,
            digest: self.digest.finish(),
        })
    }

    /// Stream the delta of all of `reader`'s content to `emit`. The last
    /// operation is always a `VerifyChecksum`.
    pub fn generate<R, F>(mut self, mut reader: R, mut emit: F) -> io::Result<()>
    where
        R: Read,
        F: FnMut(DeltaOp) -> io::Result<()>,
    {
        let mut read_buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let n = match reader.read(&mut read_buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            self.update(&read_buf[..n], &mut emit)?;
        }
        self.finish(emit)
    }

    fn scan<F>(&mut self, eof: bool, emit: &mut F) -> io::Result<()>
    where
        F: FnMut(DeltaOp) -> io::Result<()>,
    {
        let block_size = self.block_size;
        loop {
            let available = self.buf.len() - self.pos;
            if available < block_size {
                if !eof || available == 0 {
                    return Ok(());
                }
                // End of input with less than a block left: only the final
                // (possibly short) block of the basis can match.
                let tail = &self.buf[self.pos..];
                let preferred = next_copy_index(self.pending_copy);
                if let Some(index) = self.find_match(weak_hash(tail), tail, true, preferred) {
                    flush_literal(&self.buf[self.literal_start..self.pos], &mut self.pending_copy, emit)?;
                    push_copy(index, &mut self.pending_copy, emit)?;
                    self.literal_start = self.buf.len();
                }
                self.pos = self.buf.len();
                return Ok(());
            }

            let pos = self.pos;
            if !self.rolling_valid {
                self.rolling.init(&self.buf[pos..pos + block_size]);
                self.rolling_valid = true;
            }

            let preferred = next_copy_index(self.pending_copy);
            let window = &self.buf[pos..pos + block_size];
            if let Some(index) = self.find_match(self.rolling.value(), window, false, preferred) {
                flush_literal(&self.buf[self.literal_start..pos], &mut self.pending_copy, emit)?;
                push_copy(index, &mut self.pending_copy, emit)?;
                self.pos += block_size;
                self.literal_start = self.pos;
                self.rolling_valid = false;
            } else {
                if pos + block_size < self.buf.len() {
                    self.rolling.roll(self.buf[pos], self.buf[pos + block_size]);
                } else {
                    self.rolling_valid = false;
                }
                self.pos += 1;
                if self.pos - self.literal_start >= LITERAL_FLUSH_SIZE {
                    flush_literal(&self.buf[self.literal_start..self.pos], &mut self.pending_copy, emit)?;
                    self.literal_start = self.pos;
                }
            }
        }
    }

    /// Find a block whose hashes match `window`, favouring `preferred` so
    /// runs of blocks coalesce. With `tail` set only the last block qualifies.
    fn find_match(&self, weak: u32, window: &[u8], tail: bool, preferred: Option<u64>) -> Option<u64> {
        let candidates = self.table.get(&weak)?;
        let last = self.signature.last_index();
        let strong = strong_hash(window);

        let mut found = None;
        for &index in candidates {
            if tail && Some(index) != last {
                continue;
            }
            let Some(block) = self.signature.blocks.get(index as usize) else {
                continue;
            };
            if block.strong_hash != strong {
                continue;
            }
            if Some(index) == preferred {
                return Some(index);
            }
            found.get_or_insert(index);
        }
        found
    }
}

/// Compute the full delta of `reader` against `signature`.
///
/// # Arguments
/// * `reader` - New content
/// * `signature` - Signature of the receiver's existing content
///
/// # Returns
/// * `Ok(Vec<DeltaOp>)` - Operations, ending with `VerifyChecksum`
/// * `Err(io::Error)` - If the reader fails
pub fn compute_delta<R: Read>(reader: R, signature: &Signature) -> io::Result<Vec<DeltaOp>> {
    let mut ops = Vec::new();
    DeltaGenerator::new(signature.clone()).generate(reader, |op| {
        ops.push(op);
        Ok(())
    })?;
    Ok(ops)
}

fn next_copy_index(pending_copy: Option<(u64, u32)>) -> Option<u64> {
    pending_copy.map(|(start, count)| start + u64::from(count))
}

fn copy_op(start: u64, count: u32) -> DeltaOp {
    if count == 1 {
        DeltaOp::CopyBlock { index: start }
    } else {
        DeltaOp::CopyBlockRange {
            start_index: start,
            count,
        }
    }
}

fn flush_literal<F>(data: &[u8], pending_copy: &mut Option<(u64, u32)>, emit: &mut F) -> io::Result<()>
where
    F: FnMut(DeltaOp) -> io::Result<()>,
{
    if data.is_empty() {
        return Ok(());
    }
    if let Some((start, count)) = pending_copy.take() {
        emit(copy_op(start, count))?;
    }
    for piece in data.chunks(LITERAL_FLUSH_SIZE) {
        emit(DeltaOp::Literal {
            bytes: Bytes::copy_from_slice(piece),
        })?;
    }
    Ok(())
}

fn push_copy<F>(index: u64, pending_copy: &mut Option<(u64, u32)>, emit: &mut F) -> io::Result<()>
where
    F: FnMut(DeltaOp) -> io::Result<()>,
{
    match pending_copy {
        Some((start, count)) if *start + u64::from(*count) == index && *count < u32::MAX => {
            *count += 1;
        }
        _ => {
            if let Some((start, count)) = pending_copy.take() {
                emit(copy_op(start, count))?;
            }
            *pending_copy = Some((index, 1));
        }
    }
    Ok(())
}
