// src/utils/streams.rs
use std::collections::VecDeque;
use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::SplitStream;


/// Drains an async reader line by line, keeping only the last `n` lines.
///
/// # Arguments
///
/// * `reader` - stderr handle of a child process.
/// * `n` - Lines to keep.
///
/// # Returns
/// The last `n` lines, without terminators. Invalid UTF-8 is replaced, not
/// rejected, so binary noise on a tool's stderr never aborts capture.
pub async fn read_tail<R>(reader: R, n: usize) -> Result<Vec<String>>
where
    R: AsyncRead + Unpin,
{
    let mut lines = VecDeque::with_capacity(n.min(64));
    let mut stream = SplitStream::new(BufReader::new(reader).split(b'\n'));
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if n == 0 {
            continue;
        }
        if lines.len() == n {
            lines.pop_front();
        }
        let line = String::from_utf8_lossy(&chunk);
        lines.push_back(line.trim_end_matches('\r').to_string());
    }
    Ok(lines.into())
}


/// Last `n` lines joined with newlines, for error reports.
pub fn tail(lines: &[String], n: usize) -> String {
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}
