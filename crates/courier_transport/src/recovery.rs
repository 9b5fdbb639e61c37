//! Background-session recovery log.
//!
//! Requests that must outlive the process are written here before dispatch
//! and removed when their response is delivered. After a relaunch the log
//! tells the scheduler which background tasks belong to whom.
//!
//! The log is a single CBOR document, replaced atomically on every change:
//! 1. write to a temporary file next to the log
//! 2. fsync it
//! 3. rename it over the log

use crate::error::RecoveryLogError;
use crate::request::{Method, RequestId};
use crate::response::Response;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

const LOG_VERSION: u32 = 1;

/// Result type for recovery log operations.
pub type RecoveryResult<T> = Result<T, RecoveryLogError>;

/// One background request awaiting its response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryEntry {
    /// Request id.
    pub request_id: RequestId,
    /// Caller label.
    pub tag: Option<String>,
    /// Method.
    pub method: Method,
    /// Path.
    pub path: String,
    /// Background session identifier.
    pub session: String,
    /// Task identifier within the session.
    pub task_id: String,
    /// When the entry was written (Unix millis).
    pub recorded_at_ms: u64,
}

impl RecoveryEntry {
    /// Creates an entry stamped with the current time.
    pub fn new(
        request_id: RequestId,
        tag: Option<String>,
        method: Method,
        path: impl Into<String>,
        session: impl Into<String>,
        task_id: impl Into<String>,
    ) -> Self {
        let recorded_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self {
            request_id,
            tag,
            method,
            path: path.into(),
            session: session.into(),
            task_id: task_id.into(),
            recorded_at_ms,
        }
    }
}

/// A background response handed back to its originator after relaunch.
#[derive(Debug, Clone)]
pub struct RecoveredResponse {
    /// Id of the original request.
    pub request_id: RequestId,
    /// Caller label of the original request.
    pub tag: Option<String>,
    /// Method of the original request.
    pub method: Method,
    /// Path of the original request.
    pub path: String,
    /// The response.
    pub response: Response,
}

#[derive(Serialize, Deserialize)]
struct LogDocument {
    version: u32,
    entries: Vec<RecoveryEntry>,
}

/// Durable list of background requests.
#[derive(Debug)]
pub struct RecoveryLog {
    path: PathBuf,
    entries: Mutex<Vec<RecoveryEntry>>,
}

impl RecoveryLog {
    /// Opens the log at `path`, loading existing entries.
    pub fn open(path: impl Into<PathBuf>) -> RecoveryResult<Self> {
        let path = path.into();
        let entries = Self::read(&path)?;
        if !entries.is_empty() {
            debug!(path = %path.display(), entries = entries.len(), "loaded recovery log");
        }
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Reads the entries of the log at `path`. A missing file is empty.
    pub fn read(path: &Path) -> RecoveryResult<Vec<RecoveryEntry>> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if data.is_empty() {
            return Ok(Vec::new());
        }
        let document: LogDocument = ciborium::de::from_reader(data.as_slice())
            .map_err(|e| RecoveryLogError::Decode(e.to_string()))?;
        if document.version != LOG_VERSION {
            return Err(RecoveryLogError::Decode(format!(
                "unsupported recovery log version {}",
                document.version
            )));
        }
        Ok(document.entries)
    }

    /// Returns the log path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns a snapshot of all entries.
    pub fn entries(&self) -> Vec<RecoveryEntry> {
        self.entries.lock().clone()
    }

    /// Returns the entries of one session.
    pub fn entries_for_session(&self, session: &str) -> Vec<RecoveryEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.session == session)
            .cloned()
            .collect()
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if the log has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Adds an entry and persists the log.
    pub fn record(&self, entry: RecoveryEntry) -> RecoveryResult<()> {
        let mut entries = self.entries.lock();
        entries.retain(|e| e.request_id != entry.request_id);
        entries.push(entry);
        self.persist(&entries)
    }

    /// Removes an entry and persists the log. Returns false if it was absent.
    pub fn remove(&self, request_id: RequestId) -> RecoveryResult<bool> {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| e.request_id != request_id);
        if entries.len() == before {
            return Ok(false);
        }
        self.persist(&entries)?;
        Ok(true)
    }

    fn persist(&self, entries: &[RecoveryEntry]) -> RecoveryResult<()> {
        let document = LogDocument {
            version: LOG_VERSION,
            entries: entries.to_vec(),
        };
        let mut data = Vec::new();
        ciborium::ser::into_writer(&document, &mut data)
            .map_err(|e| RecoveryLogError::Encode(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let temp_path = self.path.with_extension("tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        if let Err(e) = fs::rename(&temp_path, &self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to replace recovery log");
            let _ = fs::remove_file(&temp_path);
            return Err(e.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(session: &str, task: &str) -> RecoveryEntry {
        RecoveryEntry::new(
            RequestId::new(),
            Some("message".into()),
            Method::Post,
            "/conversations/c1/messages",
            session,
            task,
        )
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let log = RecoveryLog::open(dir.path().join("recovery.cbor")).unwrap();
        assert!(log.is_empty());
    }

    #[test]
    fn entries_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("recovery.cbor");

        let first = entry("bg", "t1");
        let second = entry("bg", "t2");
        {
            let log = RecoveryLog::open(&path).unwrap();
            log.record(first.clone()).unwrap();
            log.record(second.clone()).unwrap();
            assert!(log.remove(first.request_id).unwrap());
            assert!(!log.remove(first.request_id).unwrap());
        }

        let reopened = RecoveryLog::open(&path).unwrap();
        assert_eq!(reopened.entries(), vec![second]);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn filters_by_session() {
        let dir = tempdir().unwrap();
        let log = RecoveryLog::open(dir.path().join("log.cbor")).unwrap();
        log.record(entry("a", "1")).unwrap();
        log.record(entry("b", "2")).unwrap();

        assert_eq!(log.entries_for_session("a").len(), 1);
        assert_eq!(log.entries_for_session("c").len(), 0);
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.cbor");
        fs::write(&path, b"\xff\x00not cbor").unwrap();

        assert!(matches!(
            RecoveryLog::open(&path),
            Err(RecoveryLogError::Decode(_))
        ));
    }
}
