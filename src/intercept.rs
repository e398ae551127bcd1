//! Stream interception: line normalization and output taps.
//!
//! Two entry points feed the delivery pipeline: tailing a child process's
//! stdout/stderr, and a [`Tee`] wrapper that mirrors the host's own writes
//! while submitting a parsed copy of each completed line.

use crate::delivery::{now_timestamp, LogEntry, Severity};
use crate::webrtc::Manager;
use chrono::DateTime;
use serde_json::Value;
use std::io::{self, Write};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::debug;

/// Lines carrying these markers come from the forwarding machinery itself
/// and must never be re-submitted.
const SKIP_MARKERS: [&str; 2] = ["[OpenPull", "DEBUG:"];

pub(crate) fn should_skip(line: &str) -> bool {
    SKIP_MARKERS.iter().any(|marker| line.contains(marker))
}

/// Normalize one raw output line into a [`LogEntry`].
///
/// JSON objects keep their extra top-level fields; `level`/`type`,
/// `message`/`msg` and `timestamp`/`time` feed the canonical trio. Anything
/// that is not a JSON object becomes a plain entry at the stream's default
/// severity.
pub fn parse_line(line: &str, default: Severity) -> LogEntry {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return LogEntry::new(default, "");
    }

    let Ok(Value::Object(object)) = serde_json::from_str::<Value>(trimmed) else {
        return LogEntry::new(default, trimmed);
    };

    let kind = object
        .get("level")
        .and_then(Value::as_str)
        .or_else(|| object.get("type").and_then(Value::as_str))
        .and_then(Severity::from_label)
        .unwrap_or(default);

    let message = object
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| object.get("msg").and_then(Value::as_str))
        .unwrap_or(trimmed)
        .to_string();

    let timestamp = object
        .get("timestamp")
        .and_then(timestamp_value)
        .or_else(|| object.get("time").and_then(timestamp_value))
        .unwrap_or_else(now_timestamp);

    let fields = object
        .into_iter()
        .filter(|(key, _)| !matches!(key.as_str(), "type" | "message" | "timestamp"))
        .collect();

    LogEntry {
        kind,
        message,
        timestamp,
        fields,
    }
}

fn timestamp_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => n
            .as_i64()
            .and_then(DateTime::from_timestamp_millis)
            .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)),
        _ => None,
    }
}

/// Tail a readable line-by-line, submitting each line at `default` severity.
pub(crate) async fn tail_lines<R>(manager: Manager, reader: R, default: Severity)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => manager.submit_line(&line, default),
            Ok(None) => break,
            Err(e) => {
                debug!("stream read error, stopping tail: {e}");
                break;
            }
        }
    }
}

/// Writer wrapper that mirrors every byte to the inner writer unchanged and
/// additionally submits each completed line to the forwarding pipeline.
///
/// Writes produced from inside the delivery path — an observer printing a
/// diagnostic through a tee — pass through without being re-submitted, so
/// the pipeline cannot loop. The guard is scoped to the submitting call
/// stack; writes that are merely concurrent with someone else's submission
/// are forwarded normally.
/// Dropping the tee flushes a trailing partial line and restores plain
/// writing.
pub struct Tee<W: Write> {
    inner: W,
    manager: Manager,
    default: Severity,
    pending: Vec<u8>,
}

impl<W: Write> Tee<W> {
    pub(crate) fn new(manager: Manager, inner: W, default: Severity) -> Self {
        Self {
            inner,
            manager,
            default,
            pending: Vec::new(),
        }
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    fn absorb(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.submit(&line[..line.len() - 1]);
        }
    }

    fn submit(&self, line: &[u8]) {
        if self.manager.in_submission() {
            return;
        }
        let line = String::from_utf8_lossy(line);
        self.manager.submit_line(&line, self.default);
    }
}

impl<W: Write> Write for Tee<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.absorb(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<W: Write> Drop for Tee<W> {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.submit(&line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_line_passes_extra_fields_through() {
        let entry = parse_line(r#"{"level":"error","msg":"boom","code":42}"#, Severity::Info);
        assert_eq!(entry.kind, Severity::Error);
        assert_eq!(entry.message, "boom");
        assert!(!entry.timestamp.is_empty());
        assert_eq!(entry.fields.get("level"), Some(&Value::from("error")));
        assert_eq!(entry.fields.get("msg"), Some(&Value::from("boom")));
        assert_eq!(entry.fields.get("code"), Some(&Value::from(42)));
    }

    #[test]
    fn warning_line_keeps_originals_alongside_canonical_trio() {
        let entry = parse_line(
            r#"{"level":"warning","msg":"m","extra":42}"#,
            Severity::Info,
        );
        assert_eq!(entry.kind, Severity::Warning);
        assert_eq!(entry.message, "m");
        assert_eq!(entry.fields.get("extra"), Some(&Value::from(42)));
        assert_eq!(entry.fields.get("level"), Some(&Value::from("warning")));
        assert_eq!(entry.fields.get("msg"), Some(&Value::from("m")));
    }

    #[test]
    fn plain_text_line_uses_the_stream_default() {
        let entry = parse_line("segfault", Severity::Error);
        assert_eq!(entry.kind, Severity::Error);
        assert_eq!(entry.message, "segfault");
        assert!(entry.fields.is_empty());
    }

    #[test]
    fn unknown_level_collapses_to_default() {
        let entry = parse_line(r#"{"level":"notice","msg":"m"}"#, Severity::Info);
        assert_eq!(entry.kind, Severity::Info);
    }

    #[test]
    fn message_falls_back_to_the_raw_line() {
        let entry = parse_line(r#"{"level":"debug"}"#, Severity::Info);
        assert_eq!(entry.kind, Severity::Debug);
        assert_eq!(entry.message, r#"{"level":"debug"}"#);
    }

    #[test]
    fn explicit_timestamp_passes_through() {
        let entry = parse_line(
            r#"{"msg":"m","timestamp":"2023-11-14T00:00:00Z"}"#,
            Severity::Info,
        );
        assert_eq!(entry.timestamp, "2023-11-14T00:00:00Z");
        // The canonical key is not duplicated into the extras.
        assert!(!entry.fields.contains_key("timestamp"));
    }

    #[test]
    fn numeric_time_becomes_iso() {
        let entry = parse_line(r#"{"msg":"m","time":1700000000000}"#, Severity::Info);
        assert!(entry.timestamp.starts_with("2023-11-14T"));
    }

    #[test]
    fn non_object_json_is_treated_as_text() {
        let entry = parse_line(r#"[1,2,3]"#, Severity::Info);
        assert_eq!(entry.message, "[1,2,3]");
        assert_eq!(entry.kind, Severity::Info);
    }

    #[test]
    fn loop_markers_are_skipped() {
        assert!(should_skip("[OpenPull] replaying 3 entries"));
        assert!(should_skip("DEBUG: negotiating"));
        assert!(!should_skip("ordinary line"));
    }

    #[test]
    fn whitespace_trims_to_empty_message() {
        let entry = parse_line("   \t  ", Severity::Info);
        assert_eq!(entry.message, "");
    }
}
