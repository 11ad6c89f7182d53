//! JSON-lines transport used by the binary.
//!
//! One [`Record`] per line in each direction, `data` base64 encoded. Escape
//! code framing is the host terminal's business; this is the decoded form.

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

use crate::protocol::Record;
use crate::utils::errors::{Result, TransferError};

/// Longest accepted inbound line
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

pub fn encode_record(record: &Record) -> Result<String> {
    Ok(serde_json::to_string(record)?)
}

pub fn decode_record(line: &str) -> Result<Record> {
    Ok(serde_json::from_str(line)?)
}

pub struct JsonLinesTransport<R, W> {
    reader: FramedRead<R, LinesCodec>,
    writer: FramedWrite<W, LinesCodec>,
}

impl<R, W> JsonLinesTransport<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH)),
            writer: FramedWrite::new(writer, LinesCodec::new()),
        }
    }

    /// Next inbound record, skipping blank lines. `None` at end of input.
    pub async fn next_record(&mut self) -> Option<Result<Record>> {
        loop {
            let line = match self.reader.next().await? {
                Ok(line) => line,
                Err(e) => return Some(Err(TransferError::Transport(e.to_string()))),
            };
            if line.trim().is_empty() {
                continue;
            }
            return Some(decode_record(&line));
        }
    }

    /// Write records and flush.
    pub async fn send(&mut self, records: Vec<Record>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        for record in &records {
            self.writer
                .feed(encode_record(record)?)
                .await
                .map_err(|e| TransferError::Transport(e.to_string()))?;
        }
        SinkExt::<String>::flush(&mut self.writer)
            .await
            .map_err(|e| TransferError::Transport(e.to_string()))
    }
}
