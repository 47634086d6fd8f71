//! Session store trait and SQLite implementation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{Map, Value};

use super::error::StateError;
use super::path;
use super::schema;

/// Key stamped into every document on write, in Unix seconds.
pub const UPDATED_AT_KEY: &str = "_updated_at";

/// A session document: the JSON object holding all state for one session.
pub type SessionDocument = Map<String, Value>;

/// Durable, session-scoped key/value store with dot-path addressing.
///
/// Implementors provide whole-document load/save; path reads and writes are
/// built on top. Every `set`/`append` rewrites the entire document, which is
/// fine because a document is bounded by one import's working set.
///
/// This trait is object-safe and is shared as `Arc<dyn SessionStore>`.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load the session document.
    ///
    /// The current store takes precedence; the legacy combined document is
    /// consulted only when the session has no entry of its own. A session
    /// with no data yields an empty document.
    async fn load(&self, session_id: &str) -> Result<SessionDocument, StateError>;

    /// Replace the stored document for `session_id`, stamping `_updated_at`.
    async fn save(&self, session_id: &str, document: SessionDocument) -> Result<(), StateError>;

    /// Delete a session from both the current and the legacy store.
    ///
    /// Returns true if anything was removed.
    async fn delete(&self, session_id: &str) -> Result<bool, StateError>;

    /// All known sessions, current entries shadowing legacy ones.
    async fn list_sessions(&self) -> Result<Vec<(String, SessionDocument)>, StateError>;

    /// Read the value at a dot-separated `path`, or `default` if absent.
    async fn get(&self, session_id: &str, path: &str, default: Value) -> Result<Value, StateError> {
        if session_id.is_empty() {
            return Ok(default);
        }
        let doc = self.load(session_id).await?;
        Ok(path::lookup(&doc, path).cloned().unwrap_or(default))
    }

    /// Assign `value` at `path`, creating intermediate objects. Siblings are
    /// left untouched; nothing is merged recursively.
    async fn set(&self, session_id: &str, path: &str, value: Value) -> Result<(), StateError> {
        if session_id.is_empty() {
            return Err(StateError::EmptySessionId);
        }
        let mut doc = self.load(session_id).await?;
        path::assign(&mut doc, path, value);
        self.save(session_id, doc).await
    }

    /// Append `value` to the sequence at `path`.
    ///
    /// A missing or non-sequence value is treated as an empty sequence.
    async fn append(&self, session_id: &str, path: &str, value: Value) -> Result<(), StateError> {
        let mut items = match self.get(session_id, path, Value::Null).await? {
            Value::Array(items) => items,
            _ => Vec::new(),
        };
        items.push(value);
        self.set(session_id, path, Value::Array(items)).await
    }
}

/// SQLite implementation of the session store.
pub struct SqliteSessionStore {
    /// Wrapped in Mutex because rusqlite::Connection is not Sync.
    /// The guard is never held across an await point.
    conn: Mutex<Connection>,
    /// Path to the database file (for error messages).
    path: PathBuf,
}

impl std::fmt::Debug for SqliteSessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteSessionStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteSessionStore {
    /// Open or create a session database at the given path.
    pub async fn open(path: &Path) -> Result<Self, StateError> {
        let path = path.to_path_buf();
        let path_clone = path.clone();

        let conn = tokio::task::spawn_blocking(move || {
            if let Some(parent) = path_clone.parent() {
                // Connection::open reports the missing directory itself.
                let _ = std::fs::create_dir_all(parent);
            }
            let conn = Connection::open(&path_clone).map_err(|e| StateError::Open {
                path: path_clone.clone(),
                source: e,
            })?;

            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(StateError::Migration)?;
            conn.pragma_update(None, "synchronous", "NORMAL")
                .map_err(StateError::Migration)?;

            schema::migrate(&conn)?;

            Ok::<_, StateError>(conn)
        })
        .await??;

        tracing::debug!(path = %path.display(), "Session database opened");
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Open an in-memory database (tests, dry runs).
    pub fn open_in_memory() -> Result<Self, StateError> {
        let conn = Connection::open_in_memory().map_err(|e| StateError::Open {
            path: PathBuf::from(":memory:"),
            source: e,
        })?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
        })
    }

    /// Path to the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StateError> {
        self.conn
            .lock()
            .map_err(|e| StateError::Query(e.to_string()))
    }

    /// Write the legacy combined document. Only used to stage fixtures;
    /// production code never writes legacy data.
    #[cfg(test)]
    pub(crate) fn write_legacy(&self, combined: &Value) -> Result<(), StateError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO legacy_sessions (id, document) VALUES (1, ?1)",
            [combined.to_string()],
        )
        .map_err(StateError::query)?;
        Ok(())
    }
}

fn parse_document(session_id: &str, text: &str) -> Result<Value, StateError> {
    serde_json::from_str(text).map_err(|source| StateError::Document {
        session_id: session_id.to_string(),
        source,
    })
}

/// Read the legacy combined document, if one exists.
fn read_legacy(conn: &Connection) -> Result<Option<SessionDocument>, StateError> {
    let text: Option<String> = conn
        .query_row("SELECT document FROM legacy_sessions WHERE id = 1", [], |row| {
            row.get(0)
        })
        .optional()
        .map_err(StateError::query)?;

    match text {
        Some(text) => match parse_document("<legacy>", &text)? {
            Value::Object(map) => Ok(Some(map)),
            _ => Ok(None),
        },
        None => Ok(None),
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn load(&self, session_id: &str) -> Result<SessionDocument, StateError> {
        if session_id.is_empty() {
            return Ok(Map::new());
        }

        let conn = self.lock()?;

        let stored: Option<String> = conn
            .query_row(
                "SELECT document FROM sessions WHERE session_id = ?1",
                [session_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(StateError::query)?;

        if let Some(text) = stored {
            if let Value::Object(doc) = parse_document(session_id, &text)? {
                return Ok(doc);
            }
        }

        if let Some(mut legacy) = read_legacy(&conn)? {
            if let Some(Value::Object(doc)) = legacy.remove(session_id) {
                tracing::debug!(session = %session_id, "Read session from legacy store");
                return Ok(doc);
            }
        }

        Ok(Map::new())
    }

    async fn save(&self, session_id: &str, mut document: SessionDocument) -> Result<(), StateError> {
        if session_id.is_empty() {
            return Err(StateError::EmptySessionId);
        }

        let updated_at = Utc::now().timestamp();
        document.insert(UPDATED_AT_KEY.to_string(), Value::from(updated_at));
        let text = serde_json::to_string(&document).map_err(|source| StateError::Document {
            session_id: session_id.to_string(),
            source,
        })?;

        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO sessions (session_id, document, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(session_id) DO UPDATE SET
                document = excluded.document,
                updated_at = excluded.updated_at
            "#,
            rusqlite::params![session_id, text, updated_at],
        )
        .map_err(StateError::query)?;

        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<bool, StateError> {
        if session_id.is_empty() {
            return Ok(false);
        }

        let conn = self.lock()?;
        let removed = conn
            .execute("DELETE FROM sessions WHERE session_id = ?1", [session_id])
            .map_err(StateError::query)?;
        let mut deleted = removed > 0;

        if let Some(mut legacy) = read_legacy(&conn)? {
            if legacy.remove(session_id).is_some() {
                conn.execute(
                    "UPDATE legacy_sessions SET document = ?1 WHERE id = 1",
                    [Value::Object(legacy).to_string()],
                )
                .map_err(StateError::query)?;
                deleted = true;
            }
        }

        if deleted {
            tracing::debug!(session = %session_id, "Deleted session");
        }
        Ok(deleted)
    }

    async fn list_sessions(&self) -> Result<Vec<(String, SessionDocument)>, StateError> {
        let conn = self.lock()?;
        let mut all: BTreeMap<String, SessionDocument> = BTreeMap::new();

        {
            let mut stmt = conn
                .prepare("SELECT session_id, document FROM sessions")
                .map_err(StateError::query)?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
                .map_err(StateError::query)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(StateError::query)?;
            for (session_id, text) in rows {
                if let Value::Object(doc) = parse_document(&session_id, &text)? {
                    all.insert(session_id, doc);
                }
            }
        }

        if let Some(legacy) = read_legacy(&conn)? {
            for (session_id, value) in legacy {
                if let Value::Object(doc) = value {
                    all.entry(session_id).or_insert(doc);
                }
            }
        }

        Ok(all.into_iter().collect())
    }
}
