//! # Checkpoint
//!
//! Resumption state for the ingestion pipeline, and the stores that persist it.
use std::fmt;
use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::retry::Retryable;

/// Pipeline mode persisted alongside the cursor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// No checkpoint was ever written.
    #[default]
    Uninitialized,
    /// A historical scan is in progress or due.
    Backfilling,
    /// Periodic incremental polling.
    Steady,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::Uninitialized => "uninitialized",
            Mode::Backfilling => "backfilling",
            Mode::Steady => "steady",
        };
        f.write_str(name)
    }
}

/// The durable marker of the most recently retired comment.
///
/// `cursor` only ever names a comment whose match-and-act step has completed.
/// An empty cursor means nothing has been retired yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub mode: Mode,
    #[serde(default)]
    pub cursor: String,
}

impl Checkpoint {
    pub fn new(mode: Mode, cursor: impl Into<String>) -> Self {
        Self {
            mode,
            cursor: cursor.into(),
        }
    }

    pub fn backfilling(cursor: impl Into<String>) -> Self {
        Self::new(Mode::Backfilling, cursor)
    }

    pub fn steady(cursor: impl Into<String>) -> Self {
        Self::new(Mode::Steady, cursor)
    }
}

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("failed to write checkpoint to {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode checkpoint: {0}")]
    Encode(#[from] serde_json::Error),
}

impl Retryable for PersistenceError {
    /// A full disk or a transient I/O hiccup may clear up. An unencodable checkpoint will not.
    fn is_retryable(&self) -> bool {
        matches!(self, PersistenceError::Io { .. })
    }
}

/// Durable storage for the pipeline `Checkpoint`.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Return the last persisted checkpoint. Missing or unreadable state degrades to the default.
    async fn load(&self) -> Checkpoint;

    /// Persist a checkpoint, replacing the previous one as a whole.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), PersistenceError>;
}

/// A `CheckpointStore` backed by a small JSON file.
///
/// Saves go to a sibling temporary file which is synced and then renamed over the
/// target, so a crash mid-save leaves either the old or the new checkpoint readable.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "checkpoint".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn io_error(&self, source: io::Error) -> PersistenceError {
        PersistenceError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self) -> Checkpoint {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no checkpoint found, starting fresh");
                return Checkpoint::default();
            }
            Err(error) => {
                warn!(path = %self.path.display(), %error, "failed to read checkpoint, starting fresh");
                return Checkpoint::default();
            }
        };

        match serde_json::from_slice::<Checkpoint>(&bytes) {
            Ok(checkpoint) => checkpoint,
            Err(error) => {
                warn!(path = %self.path.display(), %error, "checkpoint is corrupt, starting fresh");
                Checkpoint::default()
            }
        }
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), PersistenceError> {
        let bytes = serde_json::to_vec_pretty(checkpoint)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(e))?;
        }

        let temp_path = self.temp_path();
        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| self.io_error(e))?;
        file.write_all(&bytes).await.map_err(|e| self.io_error(e))?;
        file.sync_all().await.map_err(|e| self.io_error(e))?;
        drop(file);

        fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| self.io_error(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_loads_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("state.json"));

        assert_eq!(store.load().await, Checkpoint::default());
        assert_eq!(store.load().await.mode, Mode::Uninitialized);
    }

    #[tokio::test]
    async fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("state.json"));

        store.save(&Checkpoint::steady("Ugz123")).await.unwrap();
        assert_eq!(store.load().await, Checkpoint::steady("Ugz123"));

        store.save(&Checkpoint::backfilling("")).await.unwrap();
        assert_eq!(store.load().await, Checkpoint::backfilling(""));
    }

    #[tokio::test]
    async fn save_creates_parent_directories_and_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("configs").join("state.json");
        let store = FileCheckpointStore::new(&path);

        store.save(&Checkpoint::steady("c")).await.unwrap();

        assert!(path.exists());
        let entries: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("state.json")]);
    }

    #[tokio::test]
    async fn corrupt_file_loads_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{\"mode\": \"steady\", \"cur").unwrap();

        let store = FileCheckpointStore::new(&path);
        assert_eq!(store.load().await, Checkpoint::default());
    }

    #[tokio::test]
    async fn unknown_mode_loads_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, br#"{"mode": "backfillDone", "cursor": "x"}"#).unwrap();

        let store = FileCheckpointStore::new(&path);
        assert_eq!(store.load().await, Checkpoint::default());
    }

    #[tokio::test]
    async fn missing_cursor_field_defaults_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, br#"{"mode": "backfilling"}"#).unwrap();

        let store = FileCheckpointStore::new(&path);
        assert_eq!(store.load().await, Checkpoint::backfilling(""));
    }

    #[tokio::test]
    async fn unwritable_location_fails_with_io_error() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where a parent directory is expected.
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();
        let store = FileCheckpointStore::new(blocker.join("state.json"));

        let error = store.save(&Checkpoint::steady("c")).await.unwrap_err();
        assert!(matches!(error, PersistenceError::Io { .. }));
    }

    #[test]
    fn mode_serializes_as_snake_case() {
        let encoded = serde_json::to_string(&Checkpoint::steady("abc")).unwrap();
        assert_eq!(encoded, r#"{"mode":"steady","cursor":"abc"}"#);
    }
}
