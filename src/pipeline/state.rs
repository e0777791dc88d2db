//! Pipeline session state: a flat JSON object keyed by well-known strings,
//! persisted through a pluggable store.
//!
//! Writes are deltas; merging is additive with new values overwriting, so
//! re-running a stage is idempotent given deterministic inputs.

use crate::error::{Result, TableRagError};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;

pub type State = serde_json::Map<String, serde_json::Value>;

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn read(&self) -> Result<State>;
    /// Merge a delta into the stored state (shallow, last writer wins).
    async fn write(&self, delta: State) -> Result<()>;
}

/// Fetch a required key, deserialized into its well-known shape.
pub fn require<T: DeserializeOwned>(state: &State, key: &str) -> Result<T> {
    let value = state.get(key).ok_or_else(|| TableRagError::Validation {
        message: format!("missing state key '{}'", key),
    })?;
    serde_json::from_value(value.clone()).map_err(|e| TableRagError::Data {
        message: format!("state key '{}' has unexpected shape: {}", key, e),
    })
}

/// Fetch an optional key; absent or null both read as `None`.
pub fn optional<T: DeserializeOwned>(state: &State, key: &str) -> Result<Option<T>> {
    match state.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|e| TableRagError::Data {
                message: format!("state key '{}' has unexpected shape: {}", key, e),
            }),
    }
}

fn merge(mut state: State, delta: State) -> State {
    for (key, value) in delta {
        state.insert(key, value);
    }
    state
}

// ---------------------------------------------------------------------------
// File store: state.json guarded by a lock file

/// Advisory mutex: a sidecar lock file created with `create_new`, removed
/// on drop. Writers that find it present back off and retry.
struct FileLock {
    path: PathBuf,
}

impl FileLock {
    async fn acquire(path: PathBuf) -> Result<Self> {
        for _ in 0..200 {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    tokio::time::sleep(Duration::from_millis(25)).await;
                }
                Err(e) => {
                    return Err(TableRagError::Internal {
                        message: format!("lock file {} error: {}", path.display(), e),
                    });
                }
            }
        }
        Err(TableRagError::Timeout {
            operation: format!("acquire lock {}", path.display()),
            timeout_ms: 200 * 25,
        })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

pub struct FileStateStore {
    state_path: PathBuf,
    lock_path: PathBuf,
}

impl FileStateStore {
    /// `<session_dir>/<session_id>/state.json`
    pub fn new(session_dir: impl AsRef<Path>, session_id: &str) -> Result<Self> {
        let dir = session_dir.as_ref().join(session_id);
        std::fs::create_dir_all(&dir).map_err(|e| TableRagError::Internal {
            message: format!("failed to create session dir {}: {}", dir.display(), e),
        })?;
        Ok(Self {
            state_path: dir.join("state.json"),
            lock_path: dir.join("state.lock"),
        })
    }

    fn load(&self) -> Result<State> {
        match std::fs::read_to_string(&self.state_path) {
            Ok(content) => {
                let value: serde_json::Value = serde_json::from_str(&content)?;
                match value {
                    serde_json::Value::Object(map) => Ok(map),
                    _ => Err(TableRagError::Data {
                        message: format!("{} is not a JSON object", self.state_path.display()),
                    }),
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(State::new()),
            Err(e) => Err(TableRagError::Internal {
                message: format!("failed to read {}: {}", self.state_path.display(), e),
            }),
        }
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn read(&self) -> Result<State> {
        let _lock = FileLock::acquire(self.lock_path.clone()).await?;
        self.load()
    }

    async fn write(&self, delta: State) -> Result<()> {
        let _lock = FileLock::acquire(self.lock_path.clone()).await?;
        let keys: Vec<&String> = delta.keys().collect();
        tracing::debug!("{:?} saved to {}", keys, self.state_path.display());
        let merged = merge(self.load()?, delta);
        let content = serde_json::to_string_pretty(&serde_json::Value::Object(merged))?;
        std::fs::write(&self.state_path, content).map_err(|e| TableRagError::Internal {
            message: format!("failed to write {}: {}", self.state_path.display(), e),
        })
    }
}

// ---------------------------------------------------------------------------
// SQLite store for multi-session deployments

pub struct SqliteStateStore {
    db_path: PathBuf,
    session_id: String,
}

impl SqliteStateStore {
    pub fn new(db_path: impl Into<PathBuf>, session_id: &str) -> Self {
        Self {
            db_path: db_path.into(),
            session_id: session_id.to_string(),
        }
    }

    fn open(db_path: &Path) -> std::result::Result<rusqlite::Connection, rusqlite::Error> {
        let conn = rusqlite::Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS session_state (\
                 session_id TEXT PRIMARY KEY, \
                 state TEXT NOT NULL, \
                 updated_at TEXT NOT NULL\
             )",
            [],
        )?;
        Ok(conn)
    }

    async fn with_conn<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Connection, &str) -> std::result::Result<T, rusqlite::Error>
            + Send
            + 'static,
    {
        let db_path = self.db_path.clone();
        let session_id = self.session_id.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = Self::open(&db_path).map_err(|e| TableRagError::Internal {
                message: format!("sqlite open failed: {}", e),
            })?;
            op(&mut conn, &session_id).map_err(|e| TableRagError::Internal {
                message: format!("sqlite error: {}", e),
            })
        })
        .await
        .map_err(|e| TableRagError::Internal {
            message: format!("sqlite worker panicked: {}", e),
        })?
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn read(&self) -> Result<State> {
        let raw: Option<String> = self
            .with_conn(|conn, session_id| {
                conn.query_row(
                    "SELECT state FROM session_state WHERE session_id = ?1",
                    [session_id],
                    |row| row.get(0),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })
            })
            .await?;
        match raw {
            Some(text) => {
                let value: serde_json::Value = serde_json::from_str(&text)?;
                match value {
                    serde_json::Value::Object(map) => Ok(map),
                    _ => Err(TableRagError::Data {
                        message: "session_state.state is not a JSON object".into(),
                    }),
                }
            }
            None => Ok(State::new()),
        }
    }

    async fn write(&self, delta: State) -> Result<()> {
        self.with_conn(move |conn, session_id| {
            let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
            let existing: Option<String> = tx
                .query_row(
                    "SELECT state FROM session_state WHERE session_id = ?1",
                    [session_id],
                    |row| row.get(0),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?;
            let state = existing
                .and_then(|text| serde_json::from_str::<serde_json::Value>(&text).ok())
                .and_then(|v| v.as_object().cloned())
                .unwrap_or_default();
            let merged = merge(state, delta);
            let content = serde_json::Value::Object(merged).to_string();
            tx.execute(
                "INSERT INTO session_state (session_id, state, updated_at) \
                 VALUES (?1, ?2, datetime('now')) \
                 ON CONFLICT(session_id) DO UPDATE SET \
                     state = excluded.state, updated_at = excluded.updated_at",
                rusqlite::params![session_id, content],
            )?;
            tx.commit()
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// In-memory store for tests

#[derive(Default)]
pub struct MemoryStateStore {
    state: Mutex<State>,
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn read(&self) -> Result<State> {
        Ok(self.state.lock().await.clone())
    }

    async fn write(&self, delta: State) -> Result<()> {
        let mut state = self.state.lock().await;
        for (key, value) in delta {
            state.insert(key, value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn delta(pairs: &[(&str, serde_json::Value)]) -> State {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn memory_store_merges_deltas() {
        let store = MemoryStateStore::default();
        store
            .write(delta(&[("query", json!("统计销量")), ("db_code", json!("d1"))]))
            .await
            .unwrap();
        store
            .write(delta(&[("query", json!("按月统计销量"))]))
            .await
            .unwrap();
        let state = store.read().await.unwrap();
        assert_eq!(state["query"], json!("按月统计销量"));
        assert_eq!(state["db_code"], json!("d1"));
    }

    #[tokio::test]
    async fn file_store_roundtrips_and_merges() {
        let dir = std::env::temp_dir().join(format!("tablerag_state_{}", std::process::id()));
        let store = FileStateStore::new(&dir, "s1").unwrap();
        store
            .write(delta(&[("keywords", json!(["温度", "精度"]))]))
            .await
            .unwrap();
        store
            .write(delta(&[("db_code", json!("pg_demo"))]))
            .await
            .unwrap();
        let state = store.read().await.unwrap();
        assert_eq!(state["keywords"], json!(["温度", "精度"]));
        assert_eq!(state["db_code"], json!("pg_demo"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn sqlite_store_roundtrips_per_session() {
        let dir = std::env::temp_dir().join(format!("tablerag_sqlite_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let db = dir.join("state.db");
        let s1 = SqliteStateStore::new(&db, "s1");
        let s2 = SqliteStateStore::new(&db, "s2");
        s1.write(delta(&[("query", json!("q1"))])).await.unwrap();
        s2.write(delta(&[("query", json!("q2"))])).await.unwrap();
        s1.write(delta(&[("db_code", json!("d1"))])).await.unwrap();
        let state1 = s1.read().await.unwrap();
        let state2 = s2.read().await.unwrap();
        assert_eq!(state1["query"], json!("q1"));
        assert_eq!(state1["db_code"], json!("d1"));
        assert_eq!(state2["query"], json!("q2"));
        assert!(!state2.contains_key("db_code"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn require_reports_missing_keys() {
        let state = State::new();
        let err = require::<String>(&state, "query").unwrap_err();
        assert!(matches!(err, TableRagError::Validation { .. }));
    }
}
