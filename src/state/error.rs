//! Error types for the session state module.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while reading or writing session state.
///
/// None of these are ever swallowed by the loop executor: a lost checkpoint
/// write would let an already-committed item run a second time.
#[derive(Error, Debug)]
pub enum StateError {
    /// Failed to open or create the database file.
    #[error("Failed to open session database at {path}: {source}")]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },

    /// Failed to run a database migration.
    #[error("Session database migration failed: {0}")]
    Migration(#[from] rusqlite::Error),

    /// A query failed.
    #[error("Session database query failed: {0}")]
    Query(String),

    /// A stored document could not be encoded or decoded.
    #[error("Session document for {session_id} is malformed: {source}")]
    Document {
        session_id: String,
        source: serde_json::Error,
    },

    /// A typed value read from a session path had an unexpected shape.
    #[error("Value at {path} has an unexpected shape: {source}")]
    Shape {
        path: String,
        source: serde_json::Error,
    },

    /// Writes require a non-empty session id.
    #[error("Session id must not be empty")]
    EmptySessionId,

    /// Failed to spawn a blocking task.
    #[error("Failed to spawn blocking task: {0}")]
    Spawn(#[from] tokio::task::JoinError),

    /// The database schema version is newer than supported.
    #[error("Database schema version {found} is newer than supported version {expected}")]
    UnsupportedSchemaVersion { found: i32, expected: i32 },
}

impl StateError {
    /// Create a Query error from a rusqlite error.
    pub fn query(source: rusqlite::Error) -> Self {
        Self::Query(source.to_string())
    }
}
