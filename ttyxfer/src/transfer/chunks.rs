//! Chunk framing and compression.
//!
//! [`ChunkAssembler`] turns inbound `data`/`end_data` payloads back into a
//! decoded byte stream per file id. [`OutboundStream`] does the reverse for
//! bytes the engine sends: compress, then cut into bounded chunks.

use std::collections::HashMap;
use std::io::{self, Write};

use bytes::{Bytes, BytesMut};
use flate2::write::{ZlibDecoder, ZlibEncoder};
use thiserror::Error;

use crate::protocol::Compression;

/// Largest decoded payload carried by one outbound record
pub const MAX_CHUNK_SIZE: usize = 4096;

#[derive(Error, Debug)]
pub enum ChunkError {
    #[error("no open stream for file {0}")]
    UnknownStream(String),

    #[error("stream for file {0} is already closed")]
    StreamClosed(String),

    #[error("decompression failed: {0}")]
    Inflate(io::Error),
}

enum Inflater {
    Identity,
    Zlib(ZlibDecoder<Vec<u8>>),
}

impl Inflater {
    fn new(compression: Compression) -> Self {
        match compression {
            Compression::None => Inflater::Identity,
            Compression::Zlib => Inflater::Zlib(ZlibDecoder::new(Vec::new())),
        }
    }

    fn inflate(&mut self, payload: &[u8], is_final: bool) -> Result<Bytes, ChunkError> {
        match self {
            Inflater::Identity => Ok(Bytes::copy_from_slice(payload)),
            Inflater::Zlib(decoder) => {
                decoder.write_all(payload).map_err(ChunkError::Inflate)?;
                if is_final {
                    decoder.try_finish().map_err(ChunkError::Inflate)?;
                }
                Ok(Bytes::from(std::mem::take(decoder.get_mut())))
            }
        }
    }
}

enum StreamState {
    Open(Inflater),
    Closed,
}

/// Inbound decoding state, one stream per file id.
#[derive(Default)]
pub struct ChunkAssembler {
    streams: HashMap<String, StreamState>,
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or restart) the stream for `file_id`.
    pub fn open(&mut self, file_id: &str, compression: Compression) {
        self.streams
            .insert(file_id.to_string(), StreamState::Open(Inflater::new(compression)));
    }

    /// Decode one payload. After the final payload, or after a decode
    /// failure, the stream is closed and further feeds are errors.
    pub fn feed(&mut self, file_id: &str, payload: &[u8], is_final: bool) -> Result<Bytes, ChunkError> {
        let state = self
            .streams
            .get_mut(file_id)
            .ok_or_else(|| ChunkError::UnknownStream(file_id.to_string()))?;

        let decoded = match state {
            StreamState::Open(inflater) => inflater.inflate(payload, is_final),
            StreamState::Closed => return Err(ChunkError::StreamClosed(file_id.to_string())),
        };

        if is_final || decoded.is_err() {
            *state = StreamState::Closed;
        }
        decoded
    }

    pub fn is_open(&self, file_id: &str) -> bool {
        matches!(self.streams.get(file_id), Some(StreamState::Open(_)))
    }

    pub fn discard(&mut self, file_id: &str) {
        self.streams.remove(file_id);
    }
}

/// Outbound encoder for one file's payload.
pub struct OutboundStream {
    encoder: Option<ZlibEncoder<Vec<u8>>>,
    pending: BytesMut,
    chunk_size: usize,
    finished: bool,
    done: bool,
}

impl OutboundStream {
    /// `chunk_size` is clamped to 1..=[`MAX_CHUNK_SIZE`].
    pub fn new(compression: Compression, chunk_size: usize) -> Self {
        let encoder = match compression {
            Compression::None => None,
            Compression::Zlib => Some(ZlibEncoder::new(Vec::new(), flate2::Compression::default())),
        };
        Self {
            encoder,
            pending: BytesMut::new(),
            chunk_size: chunk_size.clamp(1, MAX_CHUNK_SIZE),
            finished: false,
            done: false,
        }
    }

    pub fn push(&mut self, data: &[u8]) -> io::Result<()> {
        match self.encoder.as_mut() {
            Some(encoder) => {
                encoder.write_all(data)?;
                let compressed = encoder.get_mut();
                self.pending.extend_from_slice(compressed);
                compressed.clear();
            }
            None => self.pending.extend_from_slice(data),
        }
        Ok(())
    }

    /// Mark the end of input and flush the compressor.
    pub fn finish(&mut self) -> io::Result<()> {
        if let Some(encoder) = self.encoder.take() {
            let tail = encoder.finish()?;
            self.pending.extend_from_slice(&tail);
        }
        self.finished = true;
        Ok(())
    }

    /// Next payload and whether it is the last one. The final payload is
    /// produced exactly once, possibly empty.
    pub fn next_chunk(&mut self) -> Option<(Bytes, bool)> {
        if self.done {
            return None;
        }
        if self.pending.len() > self.chunk_size
            || (self.pending.len() == self.chunk_size && !self.finished)
        {
            return Some((self.pending.split_to(self.chunk_size).freeze(), false));
        }
        if self.finished {
            self.done = true;
            return Some((self.pending.split().freeze(), true));
        }
        None
    }

    /// Encode `data` completely and return its payloads.
    pub fn split_all(data: &[u8], compression: Compression, chunk_size: usize) -> io::Result<Vec<(Bytes, bool)>> {
        let mut stream = Self::new(compression, chunk_size);
        stream.push(data)?;
        stream.finish()?;
        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next_chunk() {
            chunks.push(chunk);
        }
        Ok(chunks)
    }
}
