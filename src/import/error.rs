use std::path::PathBuf;

use thiserror::Error;

use super::fetch::FetchError;
use crate::content::WriteError;
use crate::runner::LoopError;
use crate::state::StateError;

/// Why an attachment could not be materialized.
#[derive(Error, Debug)]
pub enum AttachmentError {
    #[error("Fetching attachments is not enabled")]
    Disabled,

    #[error("Attachment {id} has no source URL")]
    MissingUrl { id: i64 },

    #[error("Failed to fetch {url}: {source}")]
    Fetch { url: String, source: FetchError },

    #[error("Downloaded file from {url} is invalid: {reason}")]
    Validation { url: String, reason: String },

    #[error("Failed to store attachment at {path}: {source}")]
    Disk {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Write(#[from] WriteError),
}

impl AttachmentError {
    /// Failures of the remote side or of the local copy are bounded per
    /// item; the rest are recorded as ordinary import failures.
    pub fn is_skippable(&self) -> bool {
        matches!(
            self,
            Self::MissingUrl { .. } | Self::Fetch { .. } | Self::Validation { .. } | Self::Disk { .. }
        )
    }
}

/// Terminal import errors.
#[derive(Error, Debug)]
pub enum ImportError {
    #[error(transparent)]
    Loop(#[from] LoopError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("Backfill failed: {0}")]
    Backfill(#[from] WriteError),

    #[error("Import aborted after {count} consecutive skipped items (limit {max})")]
    TooManySkips { count: u32, max: u32 },

    #[error("Failed to emit continuation: {0}")]
    Continuation(#[source] std::io::Error),
}
