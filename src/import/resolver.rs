//! Forward-reference bookkeeping for the creation pass and the backfill that
//! settles it afterwards.
//!
//! Archives reference entities that may appear later in the file (or never
//! import at all). During creation every new entity is recorded in a remap
//! table; a reference to something not yet remapped is parked as an orphan
//! and resolved once every kind has been created. URLs of materialized
//! attachments are remapped the same way and substituted in one final sweep.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::archive::ArchiveId;
use crate::content::{ContentWriter, EntityKind, StoreId, WriteError};

/// A meta value naming an archive id, rewritten once the remap is complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredMetaRef {
    pub owner: StoreId,
    pub key: String,
    pub kind: EntityKind,
    pub archive_id: ArchiveId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParentBackfill {
    pub linked: usize,
    /// Orphans whose parent never imported; they stay top-level.
    pub unresolved: usize,
}

/// Remap, orphan, URL and hash tables for one import session.
///
/// Serializable so it can ride along in the session's resumable state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceResolver {
    #[serde(default)]
    remap: BTreeMap<EntityKind, BTreeMap<ArchiveId, StoreId>>,
    #[serde(default)]
    orphans: BTreeMap<EntityKind, BTreeMap<ArchiveId, ArchiveId>>,
    #[serde(default)]
    url_remap: BTreeMap<String, String>,
    #[serde(default)]
    deferred_meta: Vec<DeferredMetaRef>,
    /// Source-URL hash to stored attachment id.
    #[serde(default)]
    hash_cache: BTreeMap<String, StoreId>,
}

impl ReferenceResolver {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Id remap ──

    pub fn record_created(&mut self, kind: EntityKind, archive_id: ArchiveId, store_id: StoreId) {
        self.remap.entry(kind).or_default().insert(archive_id, store_id);
    }

    pub fn lookup(&self, kind: EntityKind, archive_id: ArchiveId) -> Option<StoreId> {
        self.remap.get(&kind)?.get(&archive_id).copied()
    }

    pub fn is_remapped(&self, kind: EntityKind, archive_id: ArchiveId) -> bool {
        self.lookup(kind, archive_id).is_some()
    }

    /// Store ids created for `kind`, in archive id order.
    pub fn created(&self, kind: EntityKind) -> Vec<StoreId> {
        self.remap
            .get(&kind)
            .map(|table| table.values().copied().collect())
            .unwrap_or_default()
    }

    /// Resolve a declared parent at creation time.
    ///
    /// Returns the parent's store id when it is already known. Otherwise the
    /// child is parked as an orphan and created top-level.
    pub fn resolve_parent(
        &mut self,
        kind: EntityKind,
        child: ArchiveId,
        parent: Option<ArchiveId>,
    ) -> Option<StoreId> {
        let parent = parent.filter(|&id| id != 0)?;
        if let Some(store_id) = self.lookup(kind, parent) {
            return Some(store_id);
        }
        self.orphans.entry(kind).or_default().insert(child, parent);
        None
    }

    pub fn orphans(&self, kind: EntityKind) -> Option<&BTreeMap<ArchiveId, ArchiveId>> {
        self.orphans.get(&kind)
    }

    // ── URL remap ──

    pub fn record_url(&mut self, from: &str, to: &str) {
        if from.is_empty() || from == to {
            return;
        }
        self.url_remap.insert(from.to_string(), to.to_string());
    }

    /// Remap pairs, longest source first so that no source is replaced
    /// before a longer source it is a prefix of. Ties sort lexicographically.
    pub fn url_replacements(&self) -> Vec<(&str, &str)> {
        let mut pairs: Vec<(&str, &str)> = self
            .url_remap
            .iter()
            .map(|(from, to)| (from.as_str(), to.as_str()))
            .collect();
        pairs.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(b.0)));
        pairs
    }

    /// Apply every URL remap to `text` as literal substring replacements.
    pub fn apply_url_remap(&self, text: &str) -> String {
        let mut out = text.to_string();
        for (from, to) in self.url_replacements() {
            if out.contains(from) {
                out = out.replace(from, to);
            }
        }
        out
    }

    // ── Deferred meta references ──

    pub fn defer_meta_ref(&mut self, owner: StoreId, key: &str, kind: EntityKind, archive_id: ArchiveId) {
        self.deferred_meta.push(DeferredMetaRef {
            owner,
            key: key.to_string(),
            kind,
            archive_id,
        });
    }

    // ── Attachment hash cache ──

    pub fn cached_hash(&self, hash: &str) -> Option<StoreId> {
        self.hash_cache.get(hash).copied()
    }

    pub fn cache_hash(&mut self, hash: &str, id: StoreId) {
        self.hash_cache.insert(hash.to_string(), id);
    }

    // ── Backfill ──

    /// Link every orphan whose parent was eventually created.
    ///
    /// Orphans whose parent never imported keep the empty parent they were
    /// created with; the archive id is never written as a parent.
    pub async fn backfill_parents(&self, writer: &dyn ContentWriter) -> Result<ParentBackfill, WriteError> {
        let mut report = ParentBackfill::default();
        for (&kind, orphans) in &self.orphans {
            for (&child, &parent) in orphans {
                match (self.lookup(kind, child), self.lookup(kind, parent)) {
                    (Some(child_id), Some(parent_id)) => {
                        writer.set_parent(kind, child_id, Some(parent_id)).await?;
                        report.linked += 1;
                    }
                    _ => {
                        tracing::debug!(%kind, child, parent, "Orphan parent never imported");
                        report.unresolved += 1;
                    }
                }
            }
        }
        Ok(report)
    }

    /// Rewrite deferred meta references to store ids. Returns how many changed.
    pub async fn backfill_meta_refs(&self, writer: &dyn ContentWriter) -> Result<usize, WriteError> {
        let mut updated = 0;
        for r in &self.deferred_meta {
            let Some(store_id) = self.lookup(r.kind, r.archive_id) else {
                continue;
            };
            if store_id != r.archive_id {
                writer.update_meta(r.owner, &r.key, &store_id.to_string()).await?;
                updated += 1;
            }
        }
        Ok(updated)
    }

    /// Substitute remapped URLs in the text of every created post-like
    /// entity. Returns how many entities changed.
    pub async fn backfill_urls(&self, writer: &dyn ContentWriter) -> Result<usize, WriteError> {
        if self.url_remap.is_empty() {
            return Ok(0);
        }
        let mut targets = self.created(EntityKind::Post);
        targets.sort_unstable();
        targets.dedup();

        let mut changed = 0;
        for id in targets {
            let Some(mut text) = writer.entity_text(id).await? else {
                continue;
            };
            let content = self.apply_url_remap(&text.content);
            let excerpt = self.apply_url_remap(&text.excerpt);
            if content != text.content || excerpt != text.excerpt {
                text.content = content;
                text.excerpt = excerpt;
                writer.update_text(id, &text).await?;
                changed += 1;
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{EntityFields, EntityText, SqliteContentStore};

    fn fields(entity_type: &str) -> EntityFields {
        EntityFields {
            entity_type: entity_type.into(),
            ..EntityFields::default()
        }
    }

    #[test]
    fn test_longer_url_replaced_first() {
        let mut r = ReferenceResolver::new();
        r.record_url("/img", "/newbase");
        r.record_url("/img.jpg", "/new.jpg");
        assert_eq!(r.apply_url_remap("see /img.jpg here"), "see /new.jpg here");
        assert_eq!(r.apply_url_remap("see /img here"), "see /newbase here");
    }

    #[test]
    fn test_replacement_order_is_deterministic() {
        let mut r = ReferenceResolver::new();
        r.record_url("/b", "/2");
        r.record_url("/a", "/1");
        r.record_url("/long", "/3");
        let sources: Vec<&str> = r.url_replacements().into_iter().map(|(f, _)| f).collect();
        assert_eq!(sources, vec!["/long", "/a", "/b"]);
    }

    #[test]
    fn test_identity_and_empty_urls_ignored() {
        let mut r = ReferenceResolver::new();
        r.record_url("", "/x");
        r.record_url("/same", "/same");
        assert!(r.url_replacements().is_empty());
    }

    #[test]
    fn test_resolve_parent_known_and_unknown() {
        let mut r = ReferenceResolver::new();
        r.record_created(EntityKind::Post, 1, 100);
        assert_eq!(r.resolve_parent(EntityKind::Post, 2, Some(1)), Some(100));
        assert_eq!(r.resolve_parent(EntityKind::Post, 3, Some(9)), None);
        assert_eq!(r.resolve_parent(EntityKind::Post, 4, Some(0)), None);
        assert_eq!(r.resolve_parent(EntityKind::Post, 5, None), None);

        let orphans = r.orphans(EntityKind::Post).unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans.get(&3), Some(&9));
        // Kinds have separate tables.
        assert_eq!(r.resolve_parent(EntityKind::Term, 6, Some(1)), None);
    }

    #[test]
    fn test_serde_roundtrip_keeps_tables() {
        let mut r = ReferenceResolver::new();
        r.record_created(EntityKind::MenuItem, 7, 70);
        r.resolve_parent(EntityKind::MenuItem, 8, Some(9));
        r.record_url("/a", "/b");
        r.cache_hash("h", 70);
        r.defer_meta_ref(70, "_thumbnail_id", EntityKind::Post, 3);

        let json = serde_json::to_value(&r).unwrap();
        let back: ReferenceResolver = serde_json::from_value(json).unwrap();
        assert_eq!(back, r);
    }

    #[tokio::test]
    async fn test_backfill_links_resolved_orphans_only() {
        let store = SqliteContentStore::open_in_memory().unwrap();
        let mut r = ReferenceResolver::new();

        // A (archive 1) references B (archive 2), which comes later.
        let a = store.create_entity(EntityKind::Post, &fields("page")).await.unwrap();
        assert_eq!(r.resolve_parent(EntityKind::Post, 1, Some(2)), None);
        r.record_created(EntityKind::Post, 1, a);
        let b = store.create_entity(EntityKind::Post, &fields("page")).await.unwrap();
        r.record_created(EntityKind::Post, 2, b);

        // C (archive 3) references archive 99, which never imports.
        let c = store.create_entity(EntityKind::Post, &fields("page")).await.unwrap();
        r.resolve_parent(EntityKind::Post, 3, Some(99));
        r.record_created(EntityKind::Post, 3, c);

        let report = r.backfill_parents(&store).await.unwrap();
        assert_eq!(report, ParentBackfill { linked: 1, unresolved: 1 });
        assert_eq!(store.parent_of(a).unwrap(), Some(b));
        assert_eq!(store.parent_of(c).unwrap(), None);
    }

    #[tokio::test]
    async fn test_backfill_meta_refs() {
        let store = SqliteContentStore::open_in_memory().unwrap();
        let mut r = ReferenceResolver::new();
        let post = store.create_entity(EntityKind::Post, &fields("post")).await.unwrap();
        store.attach_meta(post, "_thumbnail_id", "50").await.unwrap();
        r.defer_meta_ref(post, "_thumbnail_id", EntityKind::Post, 50);
        r.defer_meta_ref(post, "_other", EntityKind::Post, 51);
        r.record_created(EntityKind::Post, 50, 500);

        assert_eq!(r.backfill_meta_refs(&store).await.unwrap(), 1);
        assert_eq!(store.meta(post, "_thumbnail_id").await.unwrap().as_deref(), Some("500"));
        assert_eq!(store.meta(post, "_other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_backfill_urls_rewrites_created_entities() {
        let store = SqliteContentStore::open_in_memory().unwrap();
        let mut r = ReferenceResolver::new();
        let id = store.create_entity(EntityKind::Post, &fields("post")).await.unwrap();
        store
            .update_text(
                id,
                &EntityText {
                    content: r#"<img src="https://old/img.jpg"> <img src="https://old/img-300x200.jpg">"#.into(),
                    excerpt: "none".into(),
                },
            )
            .await
            .unwrap();
        r.record_created(EntityKind::Post, 1, id);
        r.record_url("https://old/img.jpg", "https://new/2024/01/img.jpg");
        r.record_url("https://old/img", "https://new/2024/01/img");

        assert_eq!(r.backfill_urls(&store).await.unwrap(), 1);
        let text = store.entity_text(id).await.unwrap().unwrap();
        assert_eq!(
            text.content,
            r#"<img src="https://new/2024/01/img.jpg"> <img src="https://new/2024/01/img-300x200.jpg">"#
        );
        assert_eq!(text.excerpt, "none");
    }
}
