//! Pluggable session storage backend.
//!
//! The [`SessionStorage`] trait abstracts over where session tokens are
//! persisted between runs, keyed by account identity (phone number).
//!
//! Built-in backends:
//! * [`InMemoryStorage`]: nothing survives the process.
//! * [`JsonFileStorage`]: one JSON object `{identity: {"id": ...}}` on disk.
//! * [`SqliteStorage`]: SQLite (requires the `sqlite-session` Cargo feature).

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::session::Session;

// ─── Trait ────────────────────────────────────────────────────────────────────

/// An abstraction over where and how sessions are persisted.
#[async_trait]
pub trait SessionStorage: Send + Sync {
    /// Load the stored session for `identity`, or `None` if there is none.
    async fn load(&self, identity: &str) -> io::Result<Option<Session>>;

    /// Store `session` for `identity`; `None` removes the stored session.
    async fn upsert(&self, identity: &str, session: Option<&Session>) -> io::Result<()>;

    /// Human-readable name of this backend (for log messages).
    fn name(&self) -> &str;
}

// ─── InMemoryStorage ─────────────────────────────────────────────────────────

/// An ephemeral storage that keeps nothing on disk.
///
/// Useful for tests and for tools that should always log in fresh.
#[derive(Default)]
pub struct InMemoryStorage {
    data: parking_lot::Mutex<HashMap<String, Session>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStorage for InMemoryStorage {
    async fn load(&self, identity: &str) -> io::Result<Option<Session>> {
        Ok(self.data.lock().get(identity).cloned())
    }

    async fn upsert(&self, identity: &str, session: Option<&Session>) -> io::Result<()> {
        let mut data = self.data.lock();
        match session {
            Some(s) => { data.insert(identity.to_string(), s.clone()); }
            None    => { data.remove(identity); }
        }
        Ok(())
    }

    fn name(&self) -> &str { "in-memory" }
}

// ─── JsonFileStorage ─────────────────────────────────────────────────────────

/// Stores every identity's session in a single JSON file.
///
/// A missing file means no sessions. Parent directories are created on the
/// first write.
pub struct JsonFileStorage {
    path: PathBuf,
    // serialises read-modify-write cycles from this process
    write: tokio::sync::Mutex<()>,
}

impl JsonFileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), write: tokio::sync::Mutex::new(()) }
    }

    async fn read_all(&self) -> io::Result<HashMap<String, Session>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(e),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(HashMap::new());
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("decode json: {e}")))
    }
}

#[async_trait]
impl SessionStorage for JsonFileStorage {
    async fn load(&self, identity: &str) -> io::Result<Option<Session>> {
        Ok(self.read_all().await?.remove(identity))
    }

    async fn upsert(&self, identity: &str, session: Option<&Session>) -> io::Result<()> {
        let _write = self.write.lock().await;
        let mut contents = self.read_all().await?;
        match session {
            Some(s) => { contents.insert(identity.to_string(), s.clone()); }
            None    => { contents.remove(identity); }
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let bytes = serde_json::to_vec_pretty(&contents)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("encode json: {e}")))?;
        tokio::fs::write(&self.path, bytes).await
    }

    fn name(&self) -> &str { "json-file" }
}

// ─── SqliteStorage ────────────────────────────────────────────────────────────

#[cfg(feature = "sqlite-session")]
pub use sqlite_backend::SqliteStorage;

#[cfg(feature = "sqlite-session")]
mod sqlite_backend {
    use super::*;
    use rusqlite::{Connection, OptionalExtension, params};

    /// SQLite-backed session store.
    ///
    /// Creates the `sessions` table if it does not exist.
    ///
    /// Enable with the `sqlite-session` Cargo feature:
    /// ```toml
    /// [dependencies]
    /// teller-client = { version = "*", features = ["sqlite-session"] }
    /// ```
    pub struct SqliteStorage {
        path: PathBuf,
    }

    fn other(e: impl std::fmt::Display) -> io::Error {
        io::Error::new(io::ErrorKind::Other, e.to_string())
    }

    impl SqliteStorage {
        pub fn new(path: impl Into<PathBuf>) -> io::Result<Self> {
            let path = path.into();
            // Open and initialise the schema immediately so errors surface early.
            let conn = Connection::open(&path).map_err(other)?;
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS sessions (
                    identity   TEXT PRIMARY KEY,
                    session_id TEXT NOT NULL
                );",
            ).map_err(other)?;
            Ok(Self { path })
        }
    }

    #[async_trait]
    impl SessionStorage for SqliteStorage {
        async fn load(&self, identity: &str) -> io::Result<Option<Session>> {
            let path     = self.path.clone();
            let identity = identity.to_string();
            tokio::task::spawn_blocking(move || {
                let conn = Connection::open(&path).map_err(other)?;
                conn.query_row(
                    "SELECT session_id FROM sessions WHERE identity = ?1",
                    params![identity],
                    |row| row.get::<_, String>(0),
                )
                .optional()
                .map(|id| id.map(Session::new))
                .map_err(other)
            })
            .await
            .map_err(other)?
        }

        async fn upsert(&self, identity: &str, session: Option<&Session>) -> io::Result<()> {
            let path     = self.path.clone();
            let identity = identity.to_string();
            let id       = session.map(|s| s.id.clone());
            tokio::task::spawn_blocking(move || {
                let conn = Connection::open(&path).map_err(other)?;
                match id {
                    Some(id) => conn.execute(
                        "INSERT OR REPLACE INTO sessions (identity, session_id) VALUES (?1, ?2)",
                        params![identity, id],
                    ),
                    None => conn.execute(
                        "DELETE FROM sessions WHERE identity = ?1",
                        params![identity],
                    ),
                }
                .map(|_| ())
                .map_err(other)
            })
            .await
            .map_err(other)?
        }

        fn name(&self) -> &str { "sqlite" }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(name: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        std::env::temp_dir()
            .join(format!("teller-{name}-{}-{nanos}", std::process::id()))
            .join("sessions.json")
    }

    #[tokio::test]
    async fn in_memory_upsert_and_remove() {
        let s = InMemoryStorage::new();
        assert_eq!(s.load("+7").await.unwrap(), None);
        s.upsert("+7", Some(&Session::new("a"))).await.unwrap();
        assert_eq!(s.load("+7").await.unwrap(), Some(Session::new("a")));
        s.upsert("+7", None).await.unwrap();
        assert_eq!(s.load("+7").await.unwrap(), None);
    }

    #[tokio::test]
    async fn json_file_missing_means_empty() {
        let s = JsonFileStorage::new(scratch_path("missing"));
        assert_eq!(s.load("+7").await.unwrap(), None);
    }

    #[tokio::test]
    async fn json_file_keeps_identities_apart() {
        let path = scratch_path("identities");
        let s = JsonFileStorage::new(&path);
        s.upsert("+71", Some(&Session::new("one"))).await.unwrap();
        s.upsert("+72", Some(&Session::new("two"))).await.unwrap();
        s.upsert("+71", None).await.unwrap();

        // a fresh handle sees what the first one wrote
        let reopened = JsonFileStorage::new(&path);
        assert_eq!(reopened.load("+71").await.unwrap(), None);
        assert_eq!(reopened.load("+72").await.unwrap(), Some(Session::new("two")));

        let raw: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw, serde_json::json!({ "+72": { "id": "two" } }));

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn json_file_rejects_garbage() {
        let path = scratch_path("garbage");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"not json").unwrap();
        let err = JsonFileStorage::new(&path).load("+7").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
