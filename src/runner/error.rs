use thiserror::Error;

use crate::state::StateError;

/// Failure raised by a per-item operation.
#[derive(Error, Debug)]
pub enum ItemError {
    /// Bounded failure of one item. Under skip-on-error it is recorded and
    /// the loop moves on; otherwise it is promoted to a fatal loop error.
    #[error("{kind} {key}: {message}")]
    Skippable {
        key: String,
        kind: String,
        message: String,
    },

    /// Aborts the whole loop invocation.
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

impl ItemError {
    pub fn skippable(key: impl Into<String>, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Skippable {
            key: key.into(),
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn is_skippable(&self) -> bool {
        matches!(self, Self::Skippable { .. })
    }
}

/// Errors that terminate a loop invocation.
#[derive(Error, Debug)]
pub enum LoopError {
    #[error("Item {key} in {context} failed: {error:#}")]
    Item {
        context: String,
        key: String,
        error: anyhow::Error,
    },

    #[error("Item {key} in {context} failed ({kind}) and skip-on-error is disabled: {message}")]
    SkipDisabled {
        context: String,
        key: String,
        kind: String,
        message: String,
    },

    #[error("Backed-up state for {context} could not be restored: {source}")]
    Restore {
        context: String,
        source: serde_json::Error,
    },

    #[error(transparent)]
    State(#[from] StateError),
}
