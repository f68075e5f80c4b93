//! Newline-delimited JSON framing for the coordinator/worker channel.
//!
//! One envelope per `\n`-terminated line. Coordinator -> worker traffic rides
//! the worker's stdin, worker -> coordinator traffic its stdout. Blank lines
//! are skipped, as are lines that are not valid UTF-8 (logged); anything else
//! is handed to the caller verbatim so it can be validated (and dropped if
//! foreign).

use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use super::protocol::Envelope;

/// Serialize an envelope as a single line, newline included.
pub fn encode_line(envelope: &Envelope) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(envelope)?;
    line.push('\n');
    Ok(line)
}

/// Write an already-encoded line and flush.
pub async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

/// Reads frames (non-blank lines) from an async byte stream.
pub struct FrameReader<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            buf: Vec::new(),
        }
    }

    /// Next non-blank line with surrounding whitespace trimmed, `None` on EOF.
    ///
    /// A line that is not UTF-8 is dropped; only I/O failures are errors.
    pub async fn next_frame(&mut self) -> io::Result<Option<String>> {
        loop {
            self.buf.clear();
            if self.reader.read_until(b'\n', &mut self.buf).await? == 0 {
                return Ok(None);
            }
            let line = match std::str::from_utf8(&self.buf) {
                Ok(line) => line.trim(),
                Err(e) => {
                    tracing::warn!(
                        bytes = self.buf.len(),
                        error = %e,
                        line = %String::from_utf8_lossy(&self.buf).trim_end(),
                        "Dropping non-UTF-8 line"
                    );
                    continue;
                }
            };
            if !line.is_empty() {
                return Ok(Some(line.to_string()));
            }
        }
    }
}

/// Read `\n`-terminated lines lossily, for diagnostics streams.
///
/// Invalid UTF-8 is replaced rather than ending the stream; returns `None`
/// on EOF or a read error.
pub async fn next_lossy_line<R: AsyncBufReadExt + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
) -> Option<String> {
    buf.clear();
    match reader.read_until(b'\n', buf).await {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(String::from_utf8_lossy(buf).trim_end().to_string()),
    }
}
