//! Delta application to reconstruct files.
//!
//! Output is written to a caller-supplied sink, normally a staged temp file
//! that is only committed once the trailing `VerifyChecksum` has passed.

use std::io::{self, Read, Seek, SeekFrom, Write};

use super::checksum::{ChecksumAlgorithm, FileDigest};
use super::delta::DeltaOp;
use super::CodecError;

/// Applies operations one at a time against a seekable basis.
pub struct DeltaApplier<R, W> {
    basis: R,
    basis_len: u64,
    block_size: u64,
    output: W,
    digest: FileDigest,
    written: u64,
    verified: bool,
    copy_buf: Vec<u8>,
}

impl<R: Read + Seek, W: Write> DeltaApplier<R, W> {
    pub fn new(basis: R, basis_len: u64, block_size: u32, output: W) -> Self {
        Self {
            basis,
            basis_len,
            block_size: u64::from(block_size.max(1)),
            output,
            digest: FileDigest::new(),
            written: 0,
            verified: false,
            copy_buf: Vec::new(),
        }
    }

    /// Bytes of reconstructed output so far
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn is_verified(&self) -> bool {
        self.verified
    }

    /// Bytes `op` will add to the output, checked against the basis before
    /// anything is written.
    pub fn output_len(&self, op: &DeltaOp) -> Result<u64, CodecError> {
        let (start, count) = match op {
            DeltaOp::Literal { bytes } => return Ok(bytes.len() as u64),
            DeltaOp::VerifyChecksum { .. } => return Ok(0),
            DeltaOp::CopyBlock { index } => (*index, 1),
            DeltaOp::CopyBlockRange { start_index, count } => (*start_index, u64::from(*count)),
        };
        if count == 0 {
            return Ok(0);
        }

        let out_of_range = |index| CodecError::BlockOutOfRange {
            index,
            basis_len: self.basis_len,
        };
        let last = start.checked_add(count - 1).ok_or(out_of_range(u64::MAX))?;
        let last_offset = last
            .checked_mul(self.block_size)
            .filter(|offset| *offset < self.basis_len)
            .ok_or(out_of_range(last))?;
        let first_offset = start * self.block_size;
        let end = (last_offset + self.block_size).min(self.basis_len);
        Ok(end - first_offset)
    }

    pub fn apply(&mut self, op: &DeltaOp) -> Result<(), CodecError> {
        if self.verified {
            return Err(CodecError::Malformed(
                "operation after checksum verification".to_string(),
            ));
        }

        match op {
            DeltaOp::CopyBlock { index } => self.copy_block(*index),
            DeltaOp::CopyBlockRange { start_index, count } => {
                for offset in 0..u64::from(*count) {
                    let index = start_index.checked_add(offset).ok_or(
                        CodecError::BlockOutOfRange {
                            index: u64::MAX,
                            basis_len: self.basis_len,
                        },
                    )?;
                    self.copy_block(index)?;
                }
                Ok(())
            }
            DeltaOp::Literal { bytes } => self.emit(bytes),
            DeltaOp::VerifyChecksum { algorithm, digest } => {
                let actual = match algorithm {
                    ChecksumAlgorithm::Xxh128 => self.digest.finish(),
                };
                if actual != *digest {
                    return Err(CodecError::ChecksumMismatch);
                }
                self.verified = true;
                Ok(())
            }
        }
    }

    /// Flush the sink and hand it back with the number of bytes written.
    pub fn finish(mut self) -> Result<(W, u64), CodecError> {
        self.output.flush()?;
        Ok((self.output, self.written))
    }

    fn copy_block(&mut self, index: u64) -> Result<(), CodecError> {
        let offset = index
            .checked_mul(self.block_size)
            .filter(|offset| *offset < self.basis_len)
            .ok_or(CodecError::BlockOutOfRange {
                index,
                basis_len: self.basis_len,
            })?;
        let len = (self.basis_len - offset).min(self.block_size) as usize;

        self.copy_buf.resize(len, 0);
        self.basis.seek(SeekFrom::Start(offset))?;
        self.basis.read_exact(&mut self.copy_buf)?;

        self.output.write_all(&self.copy_buf)?;
        self.digest.update(&self.copy_buf);
        self.written += len as u64;
        Ok(())
    }

    fn emit(&mut self, data: &[u8]) -> Result<(), CodecError> {
        self.output.write_all(data)?;
        self.digest.update(data);
        self.written += data.len() as u64;
        Ok(())
    }
}

/// Apply a delta to in-memory basis data.
///
/// # Arguments
/// * `existing` - Basis the signature was computed from
/// * `ops` - Delta operations
/// * `block_size` - Block size of that signature
///
/// # Returns
/// * `Ok(Vec<u8>)` - Reconstructed content
/// * `Err(CodecError)` - Out-of-range copy, malformed stream or checksum mismatch
pub fn apply_delta(existing: &[u8], ops: &[DeltaOp], block_size: u32) -> Result<Vec<u8>, CodecError> {
    let mut applier = DeltaApplier::new(
        io::Cursor::new(existing),
        existing.len() as u64,
        block_size,
        Vec::new(),
    );
    for op in ops {
        applier.apply(op)?;
    }
    let (output, _) = applier.finish()?;
    Ok(output)
}

/// Apply a delta and write the result to `sink` only if it verifies.
///
/// On any error `sink` receives nothing.
pub fn apply_delta_to_sink<W: Write>(
    existing: &[u8],
    ops: &[DeltaOp],
    block_size: u32,
    sink: &mut W,
) -> Result<u64, CodecError> {
    let output = apply_delta(existing, ops, block_size)?;
    sink.write_all(&output)?;
    Ok(output.len() as u64)
}
