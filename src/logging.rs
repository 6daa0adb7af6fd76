//! Structured log lines for the session transcript and the recent-log feed.
//!
//! Process-wide diagnostics go through `tracing`; the `LogSink` here is the
//! explicit, constructor-threaded value that renders the transcript line
//! format and feeds the ring buffer consumed by the presentation layer. The
//! default sink is a no-op so components can log unconditionally.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Log severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

/// Subsystem category tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogCategory {
    Fabric,
    Broker,
    Processor,
    Supervisor,
    Persist,
    Mcp,
    Session,
}

impl LogCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            LogCategory::Fabric => "fabric",
            LogCategory::Broker => "broker",
            LogCategory::Processor => "processor",
            LogCategory::Supervisor => "supervisor",
            LogCategory::Persist => "persist",
            LogCategory::Mcp => "mcp",
            LogCategory::Session => "session",
        }
    }
}

/// Fixed-capacity FIFO of rendered log lines. `get_last` returns oldest-first.
#[derive(Debug)]
pub struct RingBuffer {
    capacity: usize,
    entries: Mutex<VecDeque<String>>,
}

impl RingBuffer {
    /// Capacity of zero is normalised to one.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn add(&self, line: impl Into<String>) {
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(line.into());
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Last `n` lines, oldest first.
    pub fn get_last(&self, n: usize) -> Vec<String> {
        let entries = self.entries.lock();
        let skip = entries.len().saturating_sub(n);
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Render one transcript line:
/// `YYYY-MM-DDTHH:MM:SS [LEVEL] [category] message key=value ...`
///
/// `fields` is consumed pairwise; an odd trailing key is rendered with the
/// value `<missing>`.
pub fn format_line(
    timestamp: chrono::DateTime<Utc>,
    level: LogLevel,
    category: LogCategory,
    message: &str,
    fields: &[&str],
) -> String {
    let mut line = format!(
        "{} [{}] [{}] {}",
        timestamp.format("%Y-%m-%dT%H:%M:%S"),
        level.as_str(),
        category.as_str(),
        message
    );

    for pair in fields.chunks(2) {
        match pair {
            [key, value] => {
                line.push(' ');
                line.push_str(key);
                line.push('=');
                line.push_str(value);
            }
            [key] => {
                line.push(' ');
                line.push_str(key);
                line.push_str("=<missing>");
            }
            _ => {}
        }
    }

    line
}

/// Transcript log sink. Cheap to clone; the no-op default carries no buffer,
/// so calls before a session is initialised do nothing.
#[derive(Clone, Default)]
pub struct LogSink {
    buffer: Option<Arc<RingBuffer>>,
}

impl LogSink {
    /// A sink backed by a ring buffer of `capacity` lines.
    pub fn buffered(capacity: usize) -> Self {
        Self {
            buffer: Some(Arc::new(RingBuffer::new(capacity))),
        }
    }

    /// The no-op sink.
    pub fn noop() -> Self {
        Self::default()
    }

    pub fn log(&self, level: LogLevel, category: LogCategory, message: &str, fields: &[&str]) {
        let Some(buffer) = &self.buffer else {
            return;
        };
        buffer.add(format_line(Utc::now(), level, category, message, fields));
    }

    pub fn info(&self, category: LogCategory, message: &str, fields: &[&str]) {
        self.log(LogLevel::Info, category, message, fields);
    }

    pub fn warn(&self, category: LogCategory, message: &str, fields: &[&str]) {
        self.log(LogLevel::Warn, category, message, fields);
    }

    pub fn error(&self, category: LogCategory, message: &str, fields: &[&str]) {
        self.log(LogLevel::Error, category, message, fields);
    }

    pub fn debug(&self, category: LogCategory, message: &str, fields: &[&str]) {
        self.log(LogLevel::Debug, category, message, fields);
    }

    /// Last `n` transcript lines, oldest first. Empty for the no-op sink.
    pub fn recent(&self, n: usize) -> Vec<String> {
        self.buffer
            .as_ref()
            .map(|buffer| buffer.get_last(n))
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for LogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSink")
            .field("buffered", &self.buffer.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone as _;

    fn fixed_time() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 14, 9, 26, 53).unwrap()
    }

    #[test]
    fn line_format_with_fields() {
        let line = format_line(
            fixed_time(),
            LogLevel::Info,
            LogCategory::Fabric,
            "message posted",
            &["channel", "tasks", "sender", "WORKER.1"],
        );
        assert_eq!(
            line,
            "2025-03-14T09:26:53 [INFO] [fabric] message posted channel=tasks sender=WORKER.1"
        );
    }

    #[test]
    fn odd_trailing_key_renders_missing_marker() {
        let line = format_line(
            fixed_time(),
            LogLevel::Warn,
            LogCategory::Broker,
            "dropped",
            &["reason", "queue full", "recipient"],
        );
        assert!(line.ends_with("reason=queue full recipient=<missing>"));
    }

    #[test]
    fn no_fields_no_trailing_space() {
        let line = format_line(
            fixed_time(),
            LogLevel::Error,
            LogCategory::Persist,
            "write failed",
            &[],
        );
        assert_eq!(line, "2025-03-14T09:26:53 [ERROR] [persist] write failed");
    }

    #[test]
    fn ring_buffer_evicts_oldest() {
        let buffer = RingBuffer::new(3);
        for n in 1..=5 {
            buffer.add(format!("line {n}"));
        }
        assert_eq!(buffer.get_last(10), vec!["line 3", "line 4", "line 5"]);
        assert_eq!(buffer.get_last(2), vec!["line 4", "line 5"]);
    }

    #[test]
    fn zero_capacity_normalised_to_one() {
        let buffer = RingBuffer::new(0);
        buffer.add("a");
        buffer.add("b");
        assert_eq!(buffer.get_last(10), vec!["b"]);
    }

    #[test]
    fn noop_sink_is_silent() {
        let sink = LogSink::noop();
        sink.info(LogCategory::Session, "ignored", &[]);
        assert!(sink.recent(10).is_empty());
    }

    #[test]
    fn buffered_sink_records() {
        let sink = LogSink::buffered(10);
        sink.info(LogCategory::Session, "started", &["id", "s-1"]);
        let lines = sink.recent(10);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("[session] started id=s-1"));
    }
}
