use crate::StorageError;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use jobpulse_core::{NewAction, QueuedAction};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub const ACTION_LOG_FILE: &str = "pending-actions.json";
pub const ACTION_LOG_LOCK_FILE: &str = "pending-actions.lock";
pub const ACTION_LOG_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct ActionLogRecord {
    version: u32,
    #[serde(default)]
    actions: Vec<QueuedAction>,
}

/// Ordered, file-backed list of writes waiting to be replayed.
///
/// The whole list lives in one JSON record. Every mutation holds an exclusive
/// advisory lock on a sibling lock file for its read-modify-write, and the
/// record is replaced by rename so a crash never leaves a torn file.
#[derive(Debug, Clone)]
pub struct ActionLog {
    path: PathBuf,
    lock_path: PathBuf,
}

struct LogFileLock {
    file: File,
}

impl LogFileLock {
    fn exclusive(path: &Path) -> Result<Self, std::io::Error> {
        let file = Self::open(path)?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }

    fn shared(path: &Path) -> Result<Self, std::io::Error> {
        let file = Self::open(path)?;
        file.lock_shared()?;
        Ok(Self { file })
    }

    fn open(path: &Path) -> Result<File, std::io::Error> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
    }
}

impl Drop for LogFileLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

impl ActionLog {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        Ok(Self {
            path: dir.join(ACTION_LOG_FILE),
            lock_path: dir.join(ACTION_LOG_LOCK_FILE),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Vec<QueuedAction>, StorageError> {
        let _guard = LogFileLock::shared(&self.lock_path)?;
        self.read_actions()
    }

    pub fn len(&self) -> Result<usize, StorageError> {
        Ok(self.load()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }

    pub fn append(&self, action: NewAction) -> Result<QueuedAction, StorageError> {
        self.append_at(action, Utc::now())
    }

    pub fn append_at(
        &self,
        action: NewAction,
        now: DateTime<Utc>,
    ) -> Result<QueuedAction, StorageError> {
        let queued = QueuedAction::from_new(action, now);
        let stored = queued.clone();
        self.update(move |actions| actions.push(stored))?;
        Ok(queued)
    }

    /// Removes the given ids and keeps everything else in its original order.
    /// Returns the number of entries removed.
    pub fn remove(&self, ids: &[String]) -> Result<usize, StorageError> {
        let ids: HashSet<&str> = ids.iter().map(String::as_str).collect();
        self.update(|actions| {
            let before = actions.len();
            actions.retain(|action| !ids.contains(action.id.as_str()));
            before - actions.len()
        })
    }

    pub fn clear(&self) -> Result<usize, StorageError> {
        self.update(|actions| {
            let removed = actions.len();
            actions.clear();
            removed
        })
    }

    fn update<R>(&self, mutate: impl FnOnce(&mut Vec<QueuedAction>) -> R) -> Result<R, StorageError> {
        let _guard = LogFileLock::exclusive(&self.lock_path)?;
        let mut actions = self.read_actions()?;
        let out = mutate(&mut actions);
        self.write_actions(actions)?;
        Ok(out)
    }

    fn read_actions(&self) -> Result<Vec<QueuedAction>, StorageError> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        let record: ActionLogRecord = serde_json::from_slice(&raw)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        if record.version > ACTION_LOG_VERSION {
            return Err(StorageError::UnsupportedLogVersion {
                found: record.version,
                supported: ACTION_LOG_VERSION,
            });
        }
        Ok(record.actions)
    }

    fn write_actions(&self, actions: Vec<QueuedAction>) -> Result<(), StorageError> {
        let record = ActionLogRecord {
            version: ACTION_LOG_VERSION,
            actions,
        };
        let payload = serde_json::to_vec_pretty(&record)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, payload)?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}
