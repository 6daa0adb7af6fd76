//! Session metadata and the application index.
//!
//! Each session directory carries a `metadata.json`; the application keeps a
//! `sessions.json` index one level up. Listing operations read the index,
//! optionally consult per-session metadata, and skip corrupt entries instead
//! of failing: a damaged session must never block starting a new one.

use crate::error::{PersistError, Result};
use crate::SessionId;
use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const INDEX_FILE: &str = "sessions.json";
pub const METADATA_FILE: &str = "metadata.json";

/// Index schema version.
pub const INDEX_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
    Interrupted,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Interrupted => "interrupted",
        }
    }

    /// A session still running is never resumable, whatever its metadata says.
    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionStatus::Running)
    }
}

/// Per-session `metadata.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionMetadata {
    pub id: SessionId,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub worker_count: usize,
    pub resumable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinator_session_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<PathBuf>,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub cost_usd: f64,
}

/// One row in the application index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionIndexEntry {
    pub id: SessionId,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub session_dir: PathBuf,
    pub worker_count: usize,
    pub resumable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinator_session_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionIndex {
    version: u32,
    application_name: String,
    sessions: Vec<SessionIndexEntry>,
}

/// Store over `<base_dir>/<app_name>/`.
#[derive(Debug, Clone)]
pub struct SessionStore {
    base_dir: PathBuf,
    app_name: String,
}

impl SessionStore {
    pub fn new(base_dir: impl Into<PathBuf>, app_name: impl Into<String>) -> Self {
        Self {
            base_dir: base_dir.into(),
            app_name: app_name.into(),
        }
    }

    pub fn app_dir(&self) -> PathBuf {
        self.base_dir.join(&self.app_name)
    }

    pub fn session_dir(&self, id: &str) -> PathBuf {
        self.app_dir().join(id)
    }

    fn index_path(&self) -> PathBuf {
        self.app_dir().join(INDEX_FILE)
    }

    /// Create a new session directory plus metadata and index entry.
    pub fn create_session(&self, worker_count: usize, work_dir: Option<PathBuf>) -> Result<SessionMetadata> {
        let id = uuid::Uuid::new_v4().to_string();
        let dir = self.session_dir(&id);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create session dir {}", dir.display()))?;

        let metadata = SessionMetadata {
            id: id.clone(),
            started_at: Utc::now(),
            ended_at: None,
            status: SessionStatus::Running,
            worker_count,
            resumable: false,
            coordinator_session_ref: None,
            work_dir,
            tokens_used: 0,
            cost_usd: 0.0,
        };
        self.save_metadata(&metadata)?;
        self.upsert_index_entry(&metadata)?;
        Ok(metadata)
    }

    pub fn save_metadata(&self, metadata: &SessionMetadata) -> Result<()> {
        let path = self.session_dir(&metadata.id).join(METADATA_FILE);
        let body = serde_json::to_string_pretty(metadata)
            .context("failed to serialize session metadata")?;
        std::fs::write(&path, body)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn load_metadata(&self, id: &str) -> Result<SessionMetadata> {
        let path = self.session_dir(id).join(METADATA_FILE);
        let raw = std::fs::read_to_string(&path).map_err(|_| {
            crate::Error::Persist(PersistError::SessionNotFound { id: id.to_string() })
        })?;
        serde_json::from_str(&raw)
            .with_context(|| format!("corrupt metadata at {}", path.display()))
            .map_err(Into::into)
    }

    /// Write metadata and mirror it into the index.
    pub fn finalize(&self, metadata: &SessionMetadata) -> Result<()> {
        self.save_metadata(metadata)?;
        self.upsert_index_entry(metadata)
    }

    fn upsert_index_entry(&self, metadata: &SessionMetadata) -> Result<()> {
        let mut index = self.read_index();
        let entry = SessionIndexEntry {
            id: metadata.id.clone(),
            started_at: metadata.started_at,
            ended_at: metadata.ended_at,
            status: metadata.status,
            session_dir: self.session_dir(&metadata.id),
            worker_count: metadata.worker_count,
            resumable: metadata.resumable,
            coordinator_session_ref: metadata.coordinator_session_ref.clone(),
            work_dir: metadata.work_dir.clone(),
        };
        if let Some(existing) = index.sessions.iter_mut().find(|e| e.id == entry.id) {
            *existing = entry;
        } else {
            index.sessions.push(entry);
        }
        self.write_index(&index)
    }

    fn read_index(&self) -> SessionIndex {
        let path = self.index_path();
        match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(index) => index,
                Err(error) => {
                    tracing::warn!(path = %path.display(), %error, "corrupt session index, starting fresh");
                    self.empty_index()
                }
            },
            Err(_) => self.empty_index(),
        }
    }

    fn empty_index(&self) -> SessionIndex {
        SessionIndex {
            version: INDEX_VERSION,
            application_name: self.app_name.clone(),
            sessions: Vec::new(),
        }
    }

    fn write_index(&self, index: &SessionIndex) -> Result<()> {
        let path = self.index_path();
        std::fs::create_dir_all(self.app_dir())?;
        let body = serde_json::to_string_pretty(index).map_err(|error| {
            crate::Error::Persist(PersistError::WriteIndex {
                path: path.display().to_string(),
                reason: error.to_string(),
            })
        })?;
        std::fs::write(&path, body).map_err(|error| {
            crate::Error::Persist(PersistError::WriteIndex {
                path: path.display().to_string(),
                reason: error.to_string(),
            })
        })
    }

    /// All sessions, newest first.
    pub fn list_all(&self) -> Vec<SessionIndexEntry> {
        let mut sessions = self.read_index().sessions;
        sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        sessions
    }

    /// Sessions whose metadata allows resuming: the resumable flag is set
    /// AND the status is terminal. Metadata is consulted when readable;
    /// corrupt metadata drops the entry from the listing.
    pub fn list_resumable(&self) -> Vec<SessionIndexEntry> {
        self.list_all()
            .into_iter()
            .filter(|entry| {
                let (resumable, status) = match self.load_metadata(&entry.id) {
                    Ok(metadata) => (metadata.resumable, metadata.status),
                    Err(error) => {
                        tracing::warn!(session = %entry.id, %error, "skipping session with unreadable metadata");
                        return false;
                    }
                };
                resumable && status.is_terminal()
            })
            .collect()
    }

    pub fn find_by_id(&self, id: &str) -> Option<SessionIndexEntry> {
        self.list_all().into_iter().find(|entry| entry.id == id)
    }

    pub fn get_latest(&self) -> Option<SessionIndexEntry> {
        self.list_all().into_iter().next()
    }

    pub fn get_recent(&self, n: usize) -> Vec<SessionIndexEntry> {
        self.list_all().into_iter().take(n).collect()
    }

    /// Sessions across every application under `base_dir`, newest first.
    pub fn list_all_global(base_dir: &Path) -> Vec<(String, SessionIndexEntry)> {
        let mut all = Vec::new();
        let Ok(entries) = std::fs::read_dir(base_dir) else {
            return all;
        };
        for dir_entry in entries.flatten() {
            let path = dir_entry.path();
            if !path.join(INDEX_FILE).exists() {
                continue;
            }
            let Some(app_name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            let store = SessionStore::new(base_dir, app_name);
            for session in store.list_all() {
                all.push((app_name.to_string(), session));
            }
        }
        all.sort_by(|a, b| b.1.started_at.cmp(&a.1.started_at));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, SessionStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(dir.path(), "perles");
        (dir, store)
    }

    #[test]
    fn create_writes_metadata_and_index() {
        let (_dir, store) = store();
        let metadata = store.create_session(3, None).expect("create");

        let loaded = store.load_metadata(&metadata.id).expect("load");
        assert_eq!(loaded, metadata);
        assert_eq!(loaded.status, SessionStatus::Running);
        assert_eq!(loaded.worker_count, 3);

        let listed = store.list_all();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, metadata.id);

        let raw = std::fs::read_to_string(store.app_dir().join(INDEX_FILE)).expect("index");
        let value: serde_json::Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(value["version"], 1);
        assert_eq!(value["application_name"], "perles");
    }

    #[test]
    fn listing_sorts_newest_first() {
        let (_dir, store) = store();
        let first = store.create_session(1, None).expect("first");
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = store.create_session(1, None).expect("second");

        let listed = store.list_all();
        assert_eq!(listed[0].id, second.id);
        assert_eq!(listed[1].id, first.id);
        assert_eq!(store.get_latest().expect("latest").id, second.id);
        assert_eq!(store.get_recent(1).len(), 1);
    }

    #[test]
    fn running_sessions_are_never_resumable() {
        let (_dir, store) = store();
        let mut metadata = store.create_session(1, None).expect("create");

        // Metadata claims resumable while still running.
        metadata.resumable = true;
        store.finalize(&metadata).expect("finalize");
        assert!(store.list_resumable().is_empty());

        metadata.status = SessionStatus::Completed;
        metadata.ended_at = Some(Utc::now());
        store.finalize(&metadata).expect("finalize");
        let resumable = store.list_resumable();
        assert_eq!(resumable.len(), 1);
        assert_eq!(resumable[0].id, metadata.id);
    }

    #[test]
    fn corrupt_metadata_is_skipped_not_fatal() {
        let (_dir, store) = store();
        let mut metadata = store.create_session(1, None).expect("create");
        metadata.resumable = true;
        metadata.status = SessionStatus::Completed;
        store.finalize(&metadata).expect("finalize");

        std::fs::write(
            store.session_dir(&metadata.id).join(METADATA_FILE),
            "{ not json",
        )
        .expect("corrupt it");

        assert!(store.list_resumable().is_empty());
        assert_eq!(store.list_all().len(), 1, "index listing still works");
    }

    #[test]
    fn find_by_id_and_global_listing() {
        let (dir, store) = store();
        let metadata = store.create_session(2, Some(PathBuf::from("/work"))).expect("create");
        assert!(store.find_by_id(&metadata.id).is_some());
        assert!(store.find_by_id("missing").is_none());

        let other = SessionStore::new(dir.path(), "perles-staging");
        other.create_session(1, None).expect("other app session");

        let global = SessionStore::list_all_global(dir.path());
        assert_eq!(global.len(), 2);
        let apps: Vec<&str> = global.iter().map(|(app, _)| app.as_str()).collect();
        assert!(apps.contains(&"perles"));
        assert!(apps.contains(&"perles-staging"));
    }
}
