//! Destination content store.
//!
//! The import engine only ever talks to the store through [`ContentWriter`];
//! [`SqliteContentStore`] is the bundled implementation.

mod sqlite;

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use sqlite::SqliteContentStore;

/// Id assigned by the content store.
pub type StoreId = i64;

/// Meta key holding the source-URL hash of a materialized attachment.
pub const SOURCE_HASH_META_KEY: &str = "_source_hash";

/// Meta key holding a menu item's parent menu item.
pub const MENU_ITEM_PARENT_META_KEY: &str = "_menu_item_menu_item_parent";

/// Kinds of stored entity. Attachments share the `Post` remap table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Post,
    Term,
    MenuItem,
    Attachment,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Post => "post",
            Self::Term => "term",
            Self::MenuItem => "menu_item",
            Self::Attachment => "attachment",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields of an entity to create.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityFields {
    /// Archive type tag (`post`, `page`, `nav_menu_item`, a taxonomy name...).
    pub entity_type: String,
    pub title: String,
    pub content: String,
    pub excerpt: String,
    pub status: String,
    pub slug: String,
    pub guid: String,
    pub date: Option<String>,
    pub parent: Option<StoreId>,
    /// Public URL, for materialized attachments.
    pub url: Option<String>,
    /// Local file, for materialized attachments.
    pub file_path: Option<PathBuf>,
}

/// The text fields that URL remapping rewrites.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityText {
    pub content: String,
    pub excerpt: String,
}

#[derive(Error, Debug)]
pub enum WriteError {
    #[error("Failed to open content database at {path}: {source}")]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },

    #[error("Content store query failed: {0}")]
    Query(String),

    #[error("Content store rejected {kind}: {reason}")]
    Rejected { kind: EntityKind, reason: String },

    #[error("Entity {0} does not exist")]
    NotFound(StoreId),

    #[error("Failed to spawn blocking task: {0}")]
    Spawn(#[from] tokio::task::JoinError),
}

impl WriteError {
    pub fn query(source: rusqlite::Error) -> Self {
        Self::Query(source.to_string())
    }
}

impl From<rusqlite::Error> for WriteError {
    fn from(source: rusqlite::Error) -> Self {
        Self::query(source)
    }
}

/// Writes imported entities to the destination store.
#[async_trait]
pub trait ContentWriter: Send + Sync {
    async fn create_entity(&self, kind: EntityKind, fields: &EntityFields) -> Result<StoreId, WriteError>;

    /// Set or clear an entity's parent link. Menu items keep their parent in
    /// [`MENU_ITEM_PARENT_META_KEY`]; everything else uses the parent column.
    async fn set_parent(
        &self,
        kind: EntityKind,
        id: StoreId,
        parent: Option<StoreId>,
    ) -> Result<(), WriteError>;

    /// Add a meta value. Existing values under the same key are kept.
    async fn attach_meta(&self, id: StoreId, key: &str, value: &str) -> Result<(), WriteError>;

    /// Replace every value under `key` with `value`.
    async fn update_meta(&self, id: StoreId, key: &str, value: &str) -> Result<(), WriteError>;

    async fn meta(&self, id: StoreId, key: &str) -> Result<Option<String>, WriteError>;

    /// Entity tagged with the given source hash, if any.
    async fn entity_with_hash(&self, hash: &str) -> Result<Option<StoreId>, WriteError>;

    /// Public URL of a stored entity.
    async fn entity_url(&self, id: StoreId) -> Result<Option<String>, WriteError>;

    /// Existing term with the given natural key.
    async fn find_term(&self, taxonomy: &str, slug: &str) -> Result<Option<StoreId>, WriteError>;

    async fn assign_terms(&self, id: StoreId, terms: &[StoreId]) -> Result<(), WriteError>;

    async fn entity_text(&self, id: StoreId) -> Result<Option<EntityText>, WriteError>;

    async fn update_text(&self, id: StoreId, text: &EntityText) -> Result<(), WriteError>;
}
