//! # Ingestor Module
//!
//! Parsing and validation of upstream NDJSON event records.
//!
//! - One JSON object per line
//! - Malformed lines are rejected with `SyncError::MalformedEvent`; callers
//!   skip them and keep going, a bad record is never fatal to a batch
//! - No semantic inference: only the fields the pipeline uses are decoded

use crate::primitives::MAX_EVENT_LINE_BYTES;
use crate::{Event, SyncError};
use std::io::{BufRead, Read};

/// Counters for a pass over NDJSON input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineStats {
    /// Non-empty lines seen.
    pub lines: u64,
    /// Lines that decoded into a valid event.
    pub accepted: u64,
    /// Lines skipped as malformed.
    pub malformed: u64,
}

/// The Ingestor turns raw lines into validated events.
pub struct Ingestor;

impl Ingestor {
    /// Parse one NDJSON line.
    ///
    /// Key and id validation happens during deserialization, so a returned
    /// event is always safe to write into queue file names and bulk tables.
    pub fn parse_line(line: &[u8]) -> Result<Event, SyncError> {
        if line.len() > MAX_EVENT_LINE_BYTES {
            return Err(SyncError::MalformedEvent(format!(
                "line of {} bytes exceeds limit",
                line.len()
            )));
        }
        let event: Event = serde_json::from_slice(line)
            .map_err(|e| SyncError::MalformedEvent(e.to_string()))?;
        Self::validate(&event)?;
        Ok(event)
    }

    /// Structural checks serde cannot express.
    pub fn validate(event: &Event) -> Result<(), SyncError> {
        if event.tags.iter().any(Vec::is_empty) {
            return Err(SyncError::MalformedEvent(format!(
                "event {} has an empty tag",
                event.id
            )));
        }
        Ok(())
    }

    /// Read every event from an NDJSON stream, skipping malformed lines.
    ///
    /// `sink` receives each valid event in input order.
    pub fn read_events<R: BufRead>(
        mut reader: R,
        mut sink: impl FnMut(Event),
    ) -> Result<LineStats, SyncError> {
        let mut stats = LineStats::default();
        let mut buf = Vec::new();
        loop {
            match read_bounded_line(&mut reader, &mut buf, MAX_EVENT_LINE_BYTES)? {
                LineRead::Eof => break,
                LineRead::Oversized => {
                    stats.lines += 1;
                    stats.malformed += 1;
                    tracing::debug!("skipping oversized event line");
                    continue;
                }
                LineRead::Line => {}
            }
            let line = trim_line(&buf);
            if line.is_empty() {
                continue;
            }
            stats.lines += 1;
            match Self::parse_line(line) {
                Ok(event) => {
                    stats.accepted += 1;
                    sink(event);
                }
                Err(e) => {
                    stats.malformed += 1;
                    tracing::debug!(error = %e, "skipping malformed event line");
                }
            }
        }
        Ok(stats)
    }
}

/// Result of [`read_bounded_line`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineRead {
    /// End of input; `buf` is empty.
    Eof,
    /// One line (newline included, if any) is in `buf`.
    Line,
    /// The line exceeded the limit and was skipped up to its newline.
    Oversized,
}

/// Read the next line into `buf`, holding at most `max_len + 1` bytes.
///
/// An overlong line is consumed from `reader` without being buffered and
/// reported as [`LineRead::Oversized`], with `buf` left empty.
pub fn read_bounded_line<R: BufRead>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max_len: usize,
) -> Result<LineRead, SyncError> {
    buf.clear();
    let limit = max_len as u64 + 1;
    if reader.by_ref().take(limit).read_until(b'\n', buf)? == 0 {
        return Ok(LineRead::Eof);
    }
    if buf.last() == Some(&b'\n') || (buf.len() as u64) < limit {
        return Ok(LineRead::Line);
    }
    buf.clear();
    loop {
        let available = reader.fill_buf()?;
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

/// Strip trailing `\n` / `\r\n` and surrounding ASCII whitespace.
#[must_use]
pub fn trim_line(line: &[u8]) -> &[u8] {
    line.trim_ascii()
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Kind;
    use std::io::Cursor;

    #[test]
    fn bounded_read_skips_overlong_line_without_buffering_it() {
        let input = b"short\nxxxxxxxxxxxxxxxxxxxxxxxxxxx\nexact\nlast";
        let mut reader = Cursor::new(&input[..]);
        let mut buf = Vec::new();

        assert_eq!(read_bounded_line(&mut reader, &mut buf, 5).expect("read"), LineRead::Line);
        assert_eq!(buf, b"short\n");
        assert_eq!(
            read_bounded_line(&mut reader, &mut buf, 5).expect("read"),
            LineRead::Oversized
        );
        assert!(buf.is_empty());
        assert_eq!(read_bounded_line(&mut reader, &mut buf, 5).expect("read"), LineRead::Line);
        assert_eq!(buf, b"exact\n");
        assert_eq!(read_bounded_line(&mut reader, &mut buf, 5).expect("read"), LineRead::Line);
        assert_eq!(buf, b"last");
        assert_eq!(read_bounded_line(&mut reader, &mut buf, 5).expect("read"), LineRead::Eof);
    }

    #[test]
    fn oversized_line_counts_as_malformed() {
        let mut input = vec![b'{'; MAX_EVENT_LINE_BYTES + 10];
        input.push(b'\n');
        input.extend_from_slice(
            br#"{"id":"e1","pubkey":"alice","kind":3,"created_at":1,"tags":[]}"#,
        );
        let mut events = Vec::new();
        let stats = Ingestor::read_events(Cursor::new(input), |e| events.push(e)).expect("read");

        assert_eq!(stats.lines, 2);
        assert_eq!(stats.malformed, 1);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn parse_line_accepts_valid_event() {
        let line = br#"{"id":"e1","pubkey":"alice","kind":3,"created_at":1,"tags":[["p","bob"]]}"#;
        let event = Ingestor::parse_line(line).expect("parse");
        assert_eq!(event.kind, Kind(3));
        assert_eq!(event.tags.len(), 1);
    }

    #[test]
    fn parse_line_rejects_garbage() {
        assert!(matches!(
            Ingestor::parse_line(b"{not json"),
            Err(SyncError::MalformedEvent(_))
        ));
        assert!(matches!(
            Ingestor::parse_line(br#"{"id":"e1","kind":3,"created_at":1}"#),
            Err(SyncError::MalformedEvent(_))
        ));
    }

    #[test]
    fn parse_line_rejects_empty_tag() {
        let line = br#"{"id":"e1","pubkey":"alice","kind":3,"created_at":1,"tags":[[]]}"#;
        assert!(Ingestor::parse_line(line).is_err());
    }

    #[test]
    fn read_events_skips_malformed_lines() {
        let input = concat!(
            r#"{"id":"e1","pubkey":"alice","kind":3,"created_at":1,"tags":[]}"#,
            "\n",
            "garbage\n",
            "\n",
            r#"{"id":"e2","pubkey":"bob","kind":3,"created_at":2,"tags":[]}"#,
            "\r\n",
        );
        let mut events = Vec::new();
        let stats = Ingestor::read_events(input.as_bytes(), |e| events.push(e)).expect("read");

        assert_eq!(stats.lines, 3);
        assert_eq!(stats.accepted, 2);
        assert_eq!(stats.malformed, 1);
        assert_eq!(events.len(), 2);
    }
}
