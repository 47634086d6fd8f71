use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};

use super::{
    ContentWriter, EntityFields, EntityKind, EntityText, StoreId, WriteError,
    MENU_ITEM_PARENT_META_KEY, SOURCE_HASH_META_KEY,
};

const SCHEMA_VERSION: i32 = 1;

const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS entities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    title TEXT NOT NULL DEFAULT '',
    content TEXT NOT NULL DEFAULT '',
    excerpt TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT '',
    slug TEXT NOT NULL DEFAULT '',
    guid TEXT NOT NULL DEFAULT '',
    date TEXT,
    parent_id INTEGER,
    url TEXT,
    file_path TEXT,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_entities_kind_type_slug ON entities(kind, entity_type, slug);

CREATE TABLE IF NOT EXISTS entity_meta (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_id INTEGER NOT NULL,
    meta_key TEXT NOT NULL,
    meta_value TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_entity_meta_key_value ON entity_meta(meta_key, meta_value);
CREATE INDEX IF NOT EXISTS idx_entity_meta_entity ON entity_meta(entity_id);

CREATE TABLE IF NOT EXISTS entity_terms (
    entity_id INTEGER NOT NULL,
    term_id INTEGER NOT NULL,
    PRIMARY KEY (entity_id, term_id)
);
"#;

fn migrate(conn: &Connection) -> Result<(), WriteError> {
    let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if version < SCHEMA_VERSION {
        conn.execute_batch(SCHEMA_V1)?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        tracing::debug!("Initialized content schema at version {}", SCHEMA_VERSION);
    }
    Ok(())
}

/// SQLite-backed content store.
pub struct SqliteContentStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl std::fmt::Debug for SqliteContentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteContentStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteContentStore {
    pub async fn open(path: &Path) -> Result<Self, WriteError> {
        let path = path.to_path_buf();
        let path_clone = path.clone();

        let conn = tokio::task::spawn_blocking(move || {
            if let Some(parent) = path_clone.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            let conn = Connection::open(&path_clone).map_err(|e| WriteError::Open {
                path: path_clone.clone(),
                source: e,
            })?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            migrate(&conn)?;
            Ok::<_, WriteError>(conn)
        })
        .await??;

        tracing::debug!(path = %path.display(), "Content database opened");
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn open_in_memory() -> Result<Self, WriteError> {
        let conn = Connection::open_in_memory().map_err(|e| WriteError::Open {
            path: PathBuf::from(":memory:"),
            source: e,
        })?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, WriteError> {
        self.conn.lock().map_err(|e| WriteError::Query(e.to_string()))
    }

    /// Current parent of an entity.
    pub fn parent_of(&self, id: StoreId) -> Result<Option<StoreId>, WriteError> {
        let conn = self.lock()?;
        let parent: Option<Option<StoreId>> = conn
            .query_row("SELECT parent_id FROM entities WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .optional()?;
        parent.ok_or(WriteError::NotFound(id))
    }

    /// Number of stored entities of `kind`.
    pub fn count(&self, kind: EntityKind) -> Result<u64, WriteError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM entities WHERE kind = ?1",
            [kind.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Term ids assigned to an entity, ascending.
    pub fn terms_of(&self, id: StoreId) -> Result<Vec<StoreId>, WriteError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT term_id FROM entity_terms WHERE entity_id = ?1 ORDER BY term_id")?;
        let ids = stmt
            .query_map([id], |row| row.get(0))?
            .collect::<Result<Vec<StoreId>, _>>()?;
        Ok(ids)
    }
}

#[async_trait]
impl ContentWriter for SqliteContentStore {
    async fn create_entity(&self, kind: EntityKind, fields: &EntityFields) -> Result<StoreId, WriteError> {
        if fields.entity_type.is_empty() {
            return Err(WriteError::Rejected {
                kind,
                reason: "missing entity type".to_string(),
            });
        }

        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO entities
                (kind, entity_type, title, content, excerpt, status, slug, guid,
                 date, parent_id, url, file_path, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
            rusqlite::params![
                kind.as_str(),
                fields.entity_type,
                fields.title,
                fields.content,
                fields.excerpt,
                fields.status,
                fields.slug,
                fields.guid,
                fields.date,
                fields.parent,
                fields.url,
                fields.file_path.as_ref().map(|p| p.to_string_lossy().into_owned()),
                Utc::now().timestamp(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    async fn set_parent(
        &self,
        kind: EntityKind,
        id: StoreId,
        parent: Option<StoreId>,
    ) -> Result<(), WriteError> {
        if kind == EntityKind::MenuItem {
            // Menu item hierarchy lives in meta, not in the parent column.
            let value = parent.unwrap_or(0).to_string();
            return self.update_meta(id, MENU_ITEM_PARENT_META_KEY, &value).await;
        }

        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE entities SET parent_id = ?1 WHERE id = ?2",
            rusqlite::params![parent, id],
        )?;
        if updated == 0 {
            return Err(WriteError::NotFound(id));
        }
        Ok(())
    }

    async fn attach_meta(&self, id: StoreId, key: &str, value: &str) -> Result<(), WriteError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO entity_meta (entity_id, meta_key, meta_value) VALUES (?1, ?2, ?3)",
            rusqlite::params![id, key, value],
        )?;
        Ok(())
    }

    async fn update_meta(&self, id: StoreId, key: &str, value: &str) -> Result<(), WriteError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM entity_meta WHERE entity_id = ?1 AND meta_key = ?2",
            rusqlite::params![id, key],
        )?;
        tx.execute(
            "INSERT INTO entity_meta (entity_id, meta_key, meta_value) VALUES (?1, ?2, ?3)",
            rusqlite::params![id, key, value],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn meta(&self, id: StoreId, key: &str) -> Result<Option<String>, WriteError> {
        let conn = self.lock()?;
        let value = conn
            .query_row(
                "SELECT meta_value FROM entity_meta WHERE entity_id = ?1 AND meta_key = ?2
                 ORDER BY id LIMIT 1",
                rusqlite::params![id, key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    async fn entity_with_hash(&self, hash: &str) -> Result<Option<StoreId>, WriteError> {
        let conn = self.lock()?;
        let id = conn
            .query_row(
                "SELECT entity_id FROM entity_meta WHERE meta_key = ?1 AND meta_value = ?2
                 ORDER BY id LIMIT 1",
                rusqlite::params![SOURCE_HASH_META_KEY, hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    async fn entity_url(&self, id: StoreId) -> Result<Option<String>, WriteError> {
        let conn = self.lock()?;
        let url: Option<Option<String>> = conn
            .query_row("SELECT url FROM entities WHERE id = ?1", [id], |row| row.get(0))
            .optional()?;
        Ok(url.flatten())
    }

    async fn find_term(&self, taxonomy: &str, slug: &str) -> Result<Option<StoreId>, WriteError> {
        let conn = self.lock()?;
        let id = conn
            .query_row(
                "SELECT id FROM entities WHERE kind = ?1 AND entity_type = ?2 AND slug = ?3
                 ORDER BY id LIMIT 1",
                rusqlite::params![EntityKind::Term.as_str(), taxonomy, slug],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    async fn assign_terms(&self, id: StoreId, terms: &[StoreId]) -> Result<(), WriteError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for term in terms {
            tx.execute(
                "INSERT OR IGNORE INTO entity_terms (entity_id, term_id) VALUES (?1, ?2)",
                rusqlite::params![id, term],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn entity_text(&self, id: StoreId) -> Result<Option<EntityText>, WriteError> {
        let conn = self.lock()?;
        let text = conn
            .query_row(
                "SELECT content, excerpt FROM entities WHERE id = ?1",
                [id],
                |row| {
                    Ok(EntityText {
                        content: row.get(0)?,
                        excerpt: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(text)
    }

    async fn update_text(&self, id: StoreId, text: &EntityText) -> Result<(), WriteError> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE entities SET content = ?1, excerpt = ?2 WHERE id = ?3",
            rusqlite::params![text.content, text.excerpt, id],
        )?;
        if updated == 0 {
            return Err(WriteError::NotFound(id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post(slug: &str) -> EntityFields {
        EntityFields {
            entity_type: "post".into(),
            title: slug.into(),
            slug: slug.into(),
            status: "publish".into(),
            ..EntityFields::default()
        }
    }

    #[tokio::test]
    async fn test_create_and_parent() {
        let store = SqliteContentStore::open_in_memory().unwrap();
        let parent = store.create_entity(EntityKind::Post, &post("a")).await.unwrap();
        let child = store.create_entity(EntityKind::Post, &post("b")).await.unwrap();
        assert_eq!(store.parent_of(child).unwrap(), None);

        store.set_parent(EntityKind::Post, child, Some(parent)).await.unwrap();
        assert_eq!(store.parent_of(child).unwrap(), Some(parent));
        assert_eq!(store.count(EntityKind::Post).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_set_parent_unknown_entity() {
        let store = SqliteContentStore::open_in_memory().unwrap();
        let result = store.set_parent(EntityKind::Post, 42, None).await;
        assert!(matches!(result, Err(WriteError::NotFound(42))));
    }

    #[tokio::test]
    async fn test_menu_item_parent_is_meta() {
        let store = SqliteContentStore::open_in_memory().unwrap();
        let fields = EntityFields {
            entity_type: "nav_menu_item".into(),
            ..EntityFields::default()
        };
        let parent = store.create_entity(EntityKind::MenuItem, &fields).await.unwrap();
        let child = store.create_entity(EntityKind::MenuItem, &fields).await.unwrap();
        store.set_parent(EntityKind::MenuItem, child, Some(parent)).await.unwrap();
        assert_eq!(
            store.meta(child, MENU_ITEM_PARENT_META_KEY).await.unwrap(),
            Some(parent.to_string())
        );
        assert_eq!(store.parent_of(child).unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_type_is_rejected() {
        let store = SqliteContentStore::open_in_memory().unwrap();
        let result = store.create_entity(EntityKind::Post, &EntityFields::default()).await;
        assert!(matches!(result, Err(WriteError::Rejected { .. })));
    }

    #[tokio::test]
    async fn test_hash_lookup() {
        let store = SqliteContentStore::open_in_memory().unwrap();
        let id = store.create_entity(EntityKind::Attachment, &post("img")).await.unwrap();
        assert_eq!(store.entity_with_hash("abc").await.unwrap(), None);
        store.attach_meta(id, SOURCE_HASH_META_KEY, "abc").await.unwrap();
        assert_eq!(store.entity_with_hash("abc").await.unwrap(), Some(id));
    }

    #[tokio::test]
    async fn test_update_meta_replaces() {
        let store = SqliteContentStore::open_in_memory().unwrap();
        let id = store.create_entity(EntityKind::Post, &post("a")).await.unwrap();
        store.attach_meta(id, "_thumbnail_id", "7").await.unwrap();
        store.update_meta(id, "_thumbnail_id", "42").await.unwrap();
        assert_eq!(store.meta(id, "_thumbnail_id").await.unwrap().as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn test_find_term_by_natural_key() {
        let store = SqliteContentStore::open_in_memory().unwrap();
        let term = EntityFields {
            entity_type: "category".into(),
            slug: "news".into(),
            ..EntityFields::default()
        };
        let id = store.create_entity(EntityKind::Term, &term).await.unwrap();
        assert_eq!(store.find_term("category", "news").await.unwrap(), Some(id));
        assert_eq!(store.find_term("post_tag", "news").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_text_roundtrip() {
        let store = SqliteContentStore::open_in_memory().unwrap();
        let id = store.create_entity(EntityKind::Post, &post("a")).await.unwrap();
        let text = EntityText {
            content: "hello".into(),
            excerpt: "h".into(),
        };
        store.update_text(id, &text).await.unwrap();
        assert_eq!(store.entity_text(id).await.unwrap(), Some(text));
        assert!(matches!(
            store.update_text(999, &EntityText::default()).await,
            Err(WriteError::NotFound(999))
        ));
    }
}
