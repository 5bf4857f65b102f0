use crate::StorageError;
use chrono::{DateTime, SecondsFormat, Utc};
use jobpulse_core::{HttpMethod, QueuedAction};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;

pub const MIRROR_SCHEMA_VERSION: i64 = 1;
pub const MIRROR_MESSAGE_TYPE: &str = "queue-action";

/// Secondary, longer-lived copy of queued actions. Writes are best-effort:
/// callers log failures and carry on.
pub trait ActionMirror: Send + Sync {
    fn mirror(&self, action: &QueuedAction) -> Result<(), StorageError>;

    fn prune(&self, ids: &[String]) -> Result<(), StorageError>;
}

pub struct SqliteMirror {
    conn: Mutex<Connection>,
}

impl SqliteMirror {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn with_conn<R>(
        &self,
        f: impl FnOnce(&Connection) -> Result<R, StorageError>,
    ) -> Result<R, StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
        f(&conn)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        self.with_conn(|conn| Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?))
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > MIRROR_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: MIRROR_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            self.with_conn(|conn| {
                conn.execute_batch(include_str!("../migrations/0001_mirror_schema.sql"))?;
                conn.execute("PRAGMA user_version = 1", []).map(|_| ())?;
                Ok(())
            })?;
        }

        Ok(())
    }

    /// Mirrored actions in enqueue order.
    pub fn list(&self) -> Result<Vec<QueuedAction>, StorageError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "
                SELECT action_id, target, method, payload_json, enqueued_at
                FROM mirrored_actions
                WHERE message_type = ?1
                ORDER BY enqueued_at ASC, rowid ASC
                ",
            )?;
            let rows = stmt.query_map(params![MIRROR_MESSAGE_TYPE], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?;

            let mut actions = Vec::new();
            for row in rows {
                let (id, target, method, payload_json, enqueued_at) = row?;
                let method = method
                    .parse::<HttpMethod>()
                    .map_err(StorageError::Serialization)?;
                let payload = serde_json::from_str(&payload_json)
                    .map_err(|err| StorageError::Serialization(err.to_string()))?;
                actions.push(QueuedAction {
                    id,
                    target,
                    method,
                    payload,
                    enqueued_at: parse_ts(&enqueued_at)?,
                });
            }
            Ok(actions)
        })
    }

    pub fn count(&self) -> Result<usize, StorageError> {
        self.with_conn(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM mirrored_actions", [], |row| row.get(0))?;
            Ok(count.max(0) as usize)
        })
    }
}

impl ActionMirror for SqliteMirror {
    fn mirror(&self, action: &QueuedAction) -> Result<(), StorageError> {
        let payload_json = serde_json::to_string(&action.payload)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        self.with_conn(|conn| {
            conn.execute(
                "
                INSERT OR REPLACE INTO mirrored_actions (
                    action_id,
                    message_type,
                    target,
                    method,
                    payload_json,
                    enqueued_at,
                    mirrored_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ",
                params![
                    action.id,
                    MIRROR_MESSAGE_TYPE,
                    action.target,
                    action.method.as_str(),
                    payload_json,
                    action.enqueued_at.to_rfc3339_opts(SecondsFormat::Micros, true),
                    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
                ],
            )?;
            Ok(())
        })
    }

    fn prune(&self, ids: &[String]) -> Result<(), StorageError> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            {
                let mut stmt = tx.prepare("DELETE FROM mirrored_actions WHERE action_id = ?1")?;
                for id in ids {
                    stmt.execute(params![id])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(err.to_string()))
}
