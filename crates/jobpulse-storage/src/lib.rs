use thiserror::Error;

mod action_log;
mod mirror;

pub use action_log::{ActionLog, ACTION_LOG_FILE, ACTION_LOG_LOCK_FILE, ACTION_LOG_VERSION};
pub use mirror::{ActionMirror, SqliteMirror, MIRROR_MESSAGE_TYPE, MIRROR_SCHEMA_VERSION};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("unsupported action log version {found}, max supported {supported}")]
    UnsupportedLogVersion { found: u32, supported: u32 },
    #[error("storage lock poisoned")]
    LockPoisoned,
}
