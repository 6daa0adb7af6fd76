//! Append-only JSONL event log.
//!
//! Every event is wrapped with a schema version and timestamp and written
//! synchronously under a mutex, with no userspace buffering, so a crash loses
//! at most the line being written. Write failures are counted and logged,
//! never propagated: durability is best-effort and replay tolerates
//! truncation.

use crate::fabric::FabricEvent;
use crate::fabric::service::EventSink;
use crate::logging::{LogCategory, LogSink};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Current wrapper schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// File name of the per-session event log.
pub const LOG_FILE: &str = "fabric.jsonl";

/// One persisted line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedEvent {
    pub version: u32,
    pub persisted_at: DateTime<Utc>,
    pub event: FabricEvent,
}

impl PersistedEvent {
    pub fn wrap(event: FabricEvent) -> Self {
        Self {
            version: SCHEMA_VERSION,
            persisted_at: Utc::now(),
            event,
        }
    }
}

pub struct EventLogger {
    file: Mutex<File>,
    path: PathBuf,
    error_count: AtomicU64,
    last_error: Mutex<Option<String>>,
    log: LogSink,
}

impl EventLogger {
    /// Open (creating if needed) `<session_dir>/fabric.jsonl` for append.
    pub fn open(session_dir: &Path, log: LogSink) -> crate::Result<Arc<Self>> {
        std::fs::create_dir_all(session_dir)?;
        let path = session_dir.join(LOG_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|error| crate::error::PersistError::OpenLog {
                path: path.display().to_string(),
                reason: error.to_string(),
            })?;
        Ok(Arc::new(Self {
            file: Mutex::new(file),
            path,
            error_count: AtomicU64::new(0),
            last_error: Mutex::new(None),
            log,
        }))
    }

    /// Append one event. Failures are swallowed after counting.
    pub fn append(&self, event: &FabricEvent) {
        let wrapped = PersistedEvent::wrap(event.clone());
        let line = match serde_json::to_string(&wrapped) {
            Ok(line) => line,
            Err(error) => {
                self.record_failure(&error.to_string());
                return;
            }
        };

        let mut file = self.file.lock();
        let result = file
            .write_all(line.as_bytes())
            .and_then(|()| file.write_all(b"\n"))
            .and_then(|()| file.flush());
        if let Err(error) = result {
            self.record_failure(&error.to_string());
        }
    }

    fn record_failure(&self, reason: &str) {
        self.error_count.fetch_add(1, Ordering::SeqCst);
        *self.last_error.lock() = Some(reason.to_string());
        tracing::error!(path = %self.path.display(), reason, "event log write failed");
        self.log.error(
            LogCategory::Persist,
            "event log write failed",
            &["reason", reason],
        );
    }

    /// Sink for [`crate::fabric::FabricService`]. The write is synchronous
    /// but small and bounded, which keeps the sink contract honest.
    pub fn sink(self: &Arc<Self>) -> EventSink {
        let logger = Arc::clone(self);
        Arc::new(move |event: &FabricEvent| logger.append(event))
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::types::Thread;

    fn sample_event(n: u64) -> FabricEvent {
        let mut message = Thread::message(format!("m{n}"), "WORKER.1", Vec::new());
        message.id = format!("t-{n}");
        message.seq = n;
        FabricEvent::MessagePosted {
            channel_id: "c-1".into(),
            message,
        }
    }

    #[test]
    fn appends_versioned_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let logger = EventLogger::open(dir.path(), LogSink::noop()).expect("open");
        logger.append(&sample_event(1));
        logger.append(&sample_event(2));
        assert_eq!(logger.error_count(), 0);

        let raw = std::fs::read_to_string(logger.path()).expect("read log");
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: PersistedEvent = serde_json::from_str(lines[0]).expect("valid line");
        assert_eq!(first.version, SCHEMA_VERSION);
        assert_eq!(first.event, sample_event(1));
    }

    #[test]
    fn reopen_appends_rather_than_truncates() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let logger = EventLogger::open(dir.path(), LogSink::noop()).expect("open");
            logger.append(&sample_event(1));
        }
        let logger = EventLogger::open(dir.path(), LogSink::noop()).expect("reopen");
        logger.append(&sample_event(2));
        let raw = std::fs::read_to_string(logger.path()).expect("read log");
        assert_eq!(raw.lines().count(), 2);
    }
}
