//! Canonical log entries and the retention-bounded replay buffer.
//!
//! Every entry submitted by the appender lands in the buffer regardless of
//! how many readers are connected; readers joining within the retention
//! window receive the buffered backlog before anything newer.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// How long entries are retained for replay to late-joining readers.
pub const RETENTION_WINDOW: Duration = Duration::from_secs(60);

/// Severity of a log entry. Anything outside this set collapses to the
/// stream's default during parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Error,
    Warning,
    Debug,
    Trace,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Debug => "debug",
            Severity::Trace => "trace",
        }
    }

    /// Map a `level`/`type` label onto the known set.
    pub fn from_label(label: &str) -> Option<Self> {
        let known = [
            Severity::Info,
            Severity::Error,
            Severity::Warning,
            Severity::Debug,
            Severity::Trace,
        ];
        known
            .into_iter()
            .find(|s| label.eq_ignore_ascii_case(s.as_str()))
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical in-memory shape of a delivered log line.
///
/// Serializes to the wire form directly: `type`, `message` and `timestamp`
/// first, then whatever extra fields the producer attached, untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(rename = "type")]
    pub kind: Severity,
    pub message: String,
    pub timestamp: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl LogEntry {
    pub fn new(kind: Severity, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            timestamp: now_timestamp(),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }
}

/// Current wall-clock time in the wire timestamp format (ISO-8601 UTC).
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

struct BufferedEntry {
    line: String,
    at: Instant,
}

/// Time-bounded queue of recently submitted entries.
///
/// Enqueue order equals arrival order, so eviction is a prefix trim. The
/// buffer stores pre-serialized lines. Submission broadcast and the
/// channel-open transition with its backlog replay all run under the one
/// mutex here, which is what gives a freshly opened channel its
/// snapshot-then-live ordering.
pub(crate) struct RetentionBuffer {
    entries: Mutex<VecDeque<BufferedEntry>>,
    retention: Duration,
}

impl RetentionBuffer {
    pub(crate) fn new(retention: Duration) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            retention,
        }
    }

    /// Append `line` and broadcast it while holding the buffer lock.
    pub(crate) fn submit<F: FnOnce(&str)>(&self, line: String, broadcast: F) {
        self.submit_at(line, Instant::now(), broadcast);
    }

    fn submit_at<F: FnOnce(&str)>(&self, line: String, at: Instant, broadcast: F) {
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        Self::purge(&mut entries, self.retention);
        broadcast(&line);
        entries.push_back(BufferedEntry { line, at });
    }

    /// Transition a channel into the broadcast-eligible set and replay the
    /// current snapshot to it, oldest first.
    ///
    /// `mark` runs under the same lock [`RetentionBuffer::submit`] broadcasts
    /// under, so a concurrent submission either lands in the snapshot sent
    /// here or is broadcast to the now-open channel afterwards, never both
    /// and never neither. Returns the snapshot size on the first transition,
    /// `None` when `mark` reports the channel was already open.
    ///
    /// The replay is non-destructive: readers connecting at different times
    /// each see the same recent window; entries only leave by aging out.
    pub(crate) fn open_channel<M, F>(&self, mark: M, mut send: F) -> Option<usize>
    where
        M: FnOnce() -> bool,
        F: FnMut(&str),
    {
        let Ok(mut entries) = self.entries.lock() else {
            return None;
        };
        if !mark() {
            return None;
        }
        Self::purge(&mut entries, self.retention);
        for buffered in entries.iter() {
            send(&buffered.line);
        }
        Some(entries.len())
    }

    pub(crate) fn len(&self) -> usize {
        let Ok(mut entries) = self.entries.lock() else {
            return 0;
        };
        Self::purge(&mut entries, self.retention);
        entries.len()
    }

    fn purge(entries: &mut VecDeque<BufferedEntry>, retention: Duration) {
        while entries
            .front()
            .is_some_and(|e| e.at.elapsed() > retention)
        {
            entries.pop_front();
        }
    }
}
