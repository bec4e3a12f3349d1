//! Record reader for the transcoder's diagnostic stream.
//!
//! FFmpeg rewrites its stats line with carriage returns (`\r`), so a plain
//! line reader would only surface progress once the process exits. Records here
//! end at either `\n` or `\r`; runs of delimiters and blank records are skipped.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Yields trimmed, non-empty text records from an async buffered reader.
pub struct RecordReader<R> {
    reader: R,
    partial: Vec<u8>,
}

impl<R> RecordReader<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            partial: Vec::new(),
        }
    }

    /// Next record, or `None` once the stream is exhausted.
    pub async fn next_record(&mut self) -> io::Result<Option<String>> {
        loop {
            let (consumed, complete) = {
                let buf = self.reader.fill_buf().await?;
                if buf.is_empty() {
                    // EOF: flush whatever is left
                    let record = take_record(&mut self.partial);
                    return Ok(record);
                }
                match buf.iter().position(|&b| b == b'\n' || b == b'\r') {
                    Some(pos) => {
                        self.partial.extend_from_slice(&buf[..pos]);
                        (pos + 1, true)
                    }
                    None => {
                        self.partial.extend_from_slice(buf);
                        (buf.len(), false)
                    }
                }
            };
            self.reader.consume(consumed);

            if complete {
                if let Some(record) = take_record(&mut self.partial) {
                    return Ok(Some(record));
                }
            }
        }
    }
}

fn take_record(partial: &mut Vec<u8>) -> Option<String> {
    let record = String::from_utf8_lossy(partial).trim().to_string();
    partial.clear();
    (!record.is_empty()).then_some(record)
}
