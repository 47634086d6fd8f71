//! Export archive model and reader.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Archive-local entity id.
pub type ArchiveId = i64;

/// A parsed export archive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Archive {
    /// Site the archive was exported from; relative attachment URLs are
    /// resolved against it.
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub terms: Vec<ArchiveTerm>,
    #[serde(default)]
    pub entities: Vec<ArchiveEntity>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaEntry {
    pub key: String,
    #[serde(default)]
    pub value: String,
}

/// A hierarchical term (category, tag, menu...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveTerm {
    pub id: ArchiveId,
    pub taxonomy: String,
    pub slug: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Archive id of the parent term.
    #[serde(default)]
    pub parent: Option<ArchiveId>,
    #[serde(default)]
    pub meta: Vec<MetaEntry>,
}

/// A term attached to an entity, by natural key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermRef {
    pub taxonomy: String,
    pub slug: String,
    #[serde(default)]
    pub name: String,
}

/// A post, page, attachment, menu item or any other typed entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEntity {
    pub id: ArchiveId,
    #[serde(rename = "type")]
    pub entity_type: String,
    /// Archive id of the parent entity.
    #[serde(default)]
    pub parent: Option<ArchiveId>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub excerpt: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub guid: String,
    /// `YYYY-MM-DD HH:MM:SS` as exported.
    #[serde(default)]
    pub date: Option<String>,
    /// Source of the binary, for attachments. Falls back to `guid`.
    #[serde(default)]
    pub attachment_url: Option<String>,
    #[serde(default)]
    pub meta: Vec<MetaEntry>,
    #[serde(default)]
    pub terms: Vec<TermRef>,
    /// Secondary size variants to generate, for attachments.
    #[serde(default)]
    pub sizes: Vec<String>,
}

impl ArchiveEntity {
    pub fn meta_value(&self, key: &str) -> Option<&str> {
        self.meta
            .iter()
            .find(|m| m.key == key)
            .map(|m| m.value.as_str())
    }

    /// Parent id with the exporter's `0` placeholder normalized away.
    pub fn parent_id(&self) -> Option<ArchiveId> {
        self.parent.filter(|&id| id != 0)
    }
}

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Failed to read archive {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse archive {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[async_trait]
pub trait ArchiveReader: Send + Sync {
    async fn parse(&self, path: &Path) -> Result<Archive, ArchiveError>;
}

/// Reads archives exported as a single JSON document.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonArchiveReader;

#[async_trait]
impl ArchiveReader for JsonArchiveReader {
    async fn parse(&self, path: &Path) -> Result<Archive, ArchiveError> {
        let bytes = tokio::fs::read(path).await.map_err(|source| ArchiveError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let archive: Archive = serde_json::from_slice(&bytes).map_err(|source| ArchiveError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(
            path = %path.display(),
            terms = archive.terms.len(),
            entities = archive.entities.len(),
            "Parsed archive"
        );
        Ok(archive)
    }
}
