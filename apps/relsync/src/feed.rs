//! # Live Feed
//!
//! Reads a newline-delimited event stream (stdin or a TCP connection) and
//! hands every line to the coalescer. Nothing here can fail the stream
//! except reading from it: undecodable lines and marker write failures are
//! counted by the coalescer and left to the sweep.

use relsync_core::ingestor::{LineRead, trim_line};
use relsync_core::primitives::MAX_EVENT_LINE_BYTES;
use relsync_core::{Coalescer, CoalescerStats, RetryQueue, SyncError};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::TcpStream;

/// Lines between progress logs.
const PROGRESS_EVERY: u64 = 10_000;

/// Feed `reader` into `coalescer` until end of stream.
pub async fn run_feed<R, Q>(reader: R, coalescer: &mut Coalescer<Q>) -> Result<CoalescerStats, SyncError>
where
    R: AsyncBufRead + Unpin,
    Q: RetryQueue,
{
    let mut reader = reader;
    let mut buf = Vec::new();
    loop {
        match read_line(&mut reader, &mut buf, MAX_EVENT_LINE_BYTES).await? {
            LineRead::Eof => break,
            LineRead::Oversized => {
                coalescer.reject_line();
                continue;
            }
            LineRead::Line => {}
        }
        let line = trim_line(&buf);
        if line.is_empty() {
            continue;
        }
        coalescer.observe_line(line);

        let stats = coalescer.stats();
        if stats.observed % PROGRESS_EVERY == 0 {
            tracing::info!(
                observed = stats.observed,
                enqueued = stats.enqueued,
                malformed = stats.malformed,
                dropped = stats.dropped,
                "feed progress"
            );
        }
    }
    let stats = coalescer.stats();
    tracing::info!(
        observed = stats.observed,
        enqueued = stats.enqueued,
        ignored = stats.ignored,
        malformed = stats.malformed,
        dropped = stats.dropped,
        "feed ended"
    );
    Ok(stats)
}

/// Next line of the stream, holding at most `max_len + 1` bytes.
///
/// An overlong line is drained up to its newline and never buffered.
async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>, max_len: usize) -> Result<LineRead, SyncError>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let limit = max_len as u64 + 1;
    if (&mut *reader).take(limit).read_until(b'\n', buf).await? == 0 {
        return Ok(LineRead::Eof);
    }
    if buf.last() == Some(&b'\n') || (buf.len() as u64) < limit {
        return Ok(LineRead::Line);
    }
    buf.clear();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            break;
        }
        match available.iter().position(|b| *b == b'\n') {
            Some(pos) => {
                reader.consume(pos + 1);
                break;
            }
            None => {
                let len = available.len();
                reader.consume(len);
            }
        }
    }
    Ok(LineRead::Oversized)
}

/// Feed from standard input.
pub async fn run_stdin<Q: RetryQueue>(coalescer: &mut Coalescer<Q>) -> Result<CoalescerStats, SyncError> {
    run_feed(BufReader::new(tokio::io::stdin()), coalescer).await
}

/// Feed from a TCP connection to `addr`.
pub async fn run_tcp<Q: RetryQueue>(
    addr: &str,
    coalescer: &mut Coalescer<Q>,
) -> Result<CoalescerStats, SyncError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| SyncError::Transient(format!("cannot connect to feed {addr}: {e}")))?;
    tracing::info!(addr, "connected to live feed");
    run_feed(BufReader::new(stream), coalescer).await
}
