//! Import orchestration.
//!
//! An import runs as a sequence of steps, each guarded by a completion flag
//! in the session document:
//!
//! 1. `terms`: one checkpointed loop over the archive's terms.
//! 2. `creation`: one checkpointed loop over the archive's entities.
//! 3. `backfill_parents`, `backfill_meta`, `backfill_urls`: settle forward
//!    references once every entity exists.
//! 4. `import`: the final summary is stored and returned on every later call.
//!
//! Either loop may suspend. The pipeline then hands the continuation to its
//! sink and returns [`ImportOutcome::Suspended`]; calling [`ImportPipeline::run`]
//! again with the same session resumes where it stopped.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::archive::{Archive, ArchiveEntity, ArchiveId, ArchiveTerm, MetaEntry};
use super::attachment::AttachmentMaterializer;
use super::error::ImportError;
use super::resolver::ReferenceResolver;
use crate::content::{
    ContentWriter, EntityFields, EntityKind, StoreId, WriteError, MENU_ITEM_PARENT_META_KEY,
    SOURCE_HASH_META_KEY,
};
use crate::runner::{
    Continuation, ContinuationSink, ExecutionContext, ItemError, ItemOperation, ItemOutcome,
    LoopExecutor, LoopOutcome, LoopPolicy,
};
use crate::state::{CheckpointTracker, SkipRecord, BATCH_ID_KEY};

pub const TERMS_SITE: &str = "import::terms";
pub const ENTITIES_SITE: &str = "import::entities";
pub const DEFAULT_MAX_CONSECUTIVE_SKIPS: u32 = 5;

const STATE_PATH: &str = "import.state";
const BACKFILL_PATH: &str = "import.backfill";
const SUMMARY_PATH: &str = "import.summary";

const STEP_TERMS: &str = "terms";
const STEP_CREATION: &str = "creation";
const STEP_BACKFILL_PARENTS: &str = "backfill_parents";
const STEP_BACKFILL_META: &str = "backfill_meta";
const STEP_BACKFILL_URLS: &str = "backfill_urls";
const STEP_IMPORT: &str = "import";

/// Archive meta keys the importer manages itself and never copies.
const EXCLUDED_META_KEYS: &[&str] = &[
    "_wp_attached_file",
    "_wp_attachment_metadata",
    "_edit_lock",
    SOURCE_HASH_META_KEY,
];

/// Meta key whose value names another entity by archive id.
const THUMBNAIL_META_KEY: &str = "_thumbnail_id";

const MENU_ITEM_TYPE: &str = "nav_menu_item";
const MENU_TAXONOMY: &str = "nav_menu";

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub policy: LoopPolicy,
    /// Abort once this many items in a row were skipped. Zero disables.
    pub max_consecutive_skips: u32,
    /// Entity types to import. `None` imports every type.
    pub allowed_types: Option<BTreeSet<String>>,
    /// Batch the session is tagged with, for batch housekeeping.
    pub batch_id: Option<String>,
    /// Appended to the loop contexts so one session can run several imports.
    pub discriminator: Option<String>,
    /// Overrides the archive's own base URL.
    pub base_url: Option<String>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            policy: LoopPolicy::default(),
            max_consecutive_skips: DEFAULT_MAX_CONSECUTIVE_SKIPS,
            allowed_types: None,
            batch_id: None,
            discriminator: None,
            base_url: None,
        }
    }
}

impl PipelineOptions {
    fn allows(&self, entity_type: &str) -> bool {
        self.allowed_types
            .as_ref()
            .map_or(true, |types| types.contains(entity_type))
    }
}

/// Working state of the creation pass that must survive a suspension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumableState {
    #[serde(default)]
    pub resolver: ReferenceResolver,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl ResumableState {
    /// Record an error once, however many invocations report it.
    fn push_error(&mut self, message: String) {
        tracing::warn!("{message}");
        if !self.errors.contains(&message) {
            self.errors.push(message);
        }
    }
}

/// Per-kind outcome of a creation loop, keyed by archive id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportTally {
    pub succeed: BTreeMap<String, StoreId>,
    pub failed: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillReport {
    pub parents_linked: usize,
    pub parents_unresolved: usize,
    pub meta_refs_updated: usize,
    pub urls_rewritten: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub terms: ImportTally,
    pub entities: ImportTally,
    pub errors: Vec<String>,
    pub skipped: Vec<SkipRecord>,
    pub backfill: BackfillReport,
}

impl ImportSummary {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
            && self.skipped.is_empty()
            && self.terms.failed.is_empty()
            && self.entities.failed.is_empty()
    }
}

#[derive(Debug)]
pub enum ImportOutcome {
    Completed(ImportSummary),
    Suspended(Continuation),
}

fn store_failure(e: WriteError) -> ItemError {
    ItemError::Fatal(e.into())
}

/// The per-item operation of both creation loops.
struct CreationPass<'a> {
    writer: &'a dyn ContentWriter,
    materializer: &'a AttachmentMaterializer,
    options: &'a PipelineOptions,
    base_url: &'a str,
    state: ResumableState,
}

impl CreationPass<'_> {
    async fn copy_meta(&mut self, id: StoreId, meta: &[MetaEntry]) -> Result<(), ItemError> {
        for entry in meta {
            if EXCLUDED_META_KEYS.contains(&entry.key.as_str()) {
                continue;
            }
            if entry.key == THUMBNAIL_META_KEY {
                if let Ok(archive_id) = entry.value.trim().parse::<ArchiveId>() {
                    self.state
                        .resolver
                        .defer_meta_ref(id, &entry.key, EntityKind::Post, archive_id);
                }
            }
            self.writer
                .attach_meta(id, &entry.key, &entry.value)
                .await
                .map_err(store_failure)?;
        }
        Ok(())
    }

    /// Store ids of an entity's terms, creating terms the store lacks.
    async fn entity_terms(&mut self, entity: &ArchiveEntity) -> Result<Vec<StoreId>, ItemError> {
        let mut ids = Vec::with_capacity(entity.terms.len());
        for term in &entity.terms {
            let taxonomy = if term.taxonomy == "tag" {
                "post_tag"
            } else {
                term.taxonomy.as_str()
            };
            if let Some(id) = self
                .writer
                .find_term(taxonomy, &term.slug)
                .await
                .map_err(store_failure)?
            {
                ids.push(id);
                continue;
            }
            let fields = EntityFields {
                entity_type: taxonomy.to_string(),
                title: if term.name.is_empty() {
                    term.slug.clone()
                } else {
                    term.name.clone()
                },
                slug: term.slug.clone(),
                ..EntityFields::default()
            };
            match self.writer.create_entity(EntityKind::Term, &fields).await {
                Ok(id) => ids.push(id),
                Err(e) => self.state.push_error(format!(
                    "Failed to add {taxonomy} \"{}\" to \"{}\": {e}",
                    term.slug, entity.title
                )),
            }
        }
        Ok(ids)
    }

    async fn import_post(
        &mut self,
        key: &str,
        entity: ArchiveEntity,
        mut acc: ImportTally,
    ) -> Result<ItemOutcome<ImportTally>, ItemError> {
        let parent = self
            .state
            .resolver
            .resolve_parent(EntityKind::Post, entity.id, entity.parent_id());
        let fields = EntityFields {
            entity_type: entity.entity_type.clone(),
            title: entity.title.clone(),
            content: entity.content.clone(),
            excerpt: entity.excerpt.clone(),
            status: entity.status.clone(),
            slug: entity.slug.clone(),
            guid: entity.guid.clone(),
            date: entity.date.clone(),
            parent,
            ..EntityFields::default()
        };
        let id = match self.writer.create_entity(EntityKind::Post, &fields).await {
            Ok(id) => id,
            Err(e) => {
                self.state.push_error(format!(
                    "Failed to import {} \"{}\": {e}",
                    entity.entity_type, entity.title
                ));
                acc.failed.push(key.to_string());
                return Ok(ItemOutcome::Done(acc));
            }
        };
        self.state.resolver.record_created(EntityKind::Post, entity.id, id);

        let terms = self.entity_terms(&entity).await?;
        if !terms.is_empty() {
            self.writer.assign_terms(id, &terms).await.map_err(store_failure)?;
        }
        self.copy_meta(id, &entity.meta).await?;

        tracing::debug!(archive_id = entity.id, id, kind = %entity.entity_type, "Created entity");
        acc.succeed.insert(key.to_string(), id);
        Ok(ItemOutcome::Done(acc))
    }

    async fn import_attachment(
        &mut self,
        key: &str,
        entity: ArchiveEntity,
        mut acc: ImportTally,
    ) -> Result<ItemOutcome<ImportTally>, ItemError> {
        let parent = self
            .state
            .resolver
            .resolve_parent(EntityKind::Post, entity.id, entity.parent_id());
        let result = self
            .materializer
            .materialize(&entity, parent, self.base_url, &mut self.state.resolver)
            .await;
        match result {
            Ok(stored) => {
                self.state
                    .resolver
                    .record_created(EntityKind::Post, entity.id, stored.id);
                if !stored.reused {
                    self.copy_meta(stored.id, &entity.meta).await?;
                }
                acc.succeed.insert(key.to_string(), stored.id);
            }
            Err(e) if e.is_skippable() => {
                return Err(ItemError::skippable(key, "attachment", e.to_string()));
            }
            Err(e) => {
                self.state
                    .push_error(format!("Failed to import attachment \"{}\": {e}", entity.title));
                acc.failed.push(key.to_string());
            }
        }
        Ok(ItemOutcome::Done(acc))
    }

    async fn import_menu_item(
        &mut self,
        key: &str,
        entity: ArchiveEntity,
        mut acc: ImportTally,
    ) -> Result<ItemOutcome<ImportTally>, ItemError> {
        if entity.status == "draft" {
            return Ok(ItemOutcome::Continue);
        }

        let Some(menu) = entity.terms.iter().find(|t| t.taxonomy == MENU_TAXONOMY) else {
            self.state
                .push_error(format!("Menu item {} skipped due to missing menu slug", entity.id));
            return Ok(ItemOutcome::Continue);
        };
        let Some(menu_id) = self
            .writer
            .find_term(MENU_TAXONOMY, &menu.slug)
            .await
            .map_err(store_failure)?
        else {
            self.state.push_error(format!(
                "Menu item {} skipped due to invalid menu slug: {}",
                entity.id, menu.slug
            ));
            return Ok(ItemOutcome::Continue);
        };

        let object_kind = match entity.meta_value("_menu_item_type") {
            Some("taxonomy") => Some(EntityKind::Term),
            Some("post_type") => Some(EntityKind::Post),
            _ => None,
        };
        let object_id = entity
            .meta_value("_menu_item_object_id")
            .and_then(|v| v.trim().parse::<ArchiveId>().ok());
        let object = match (object_kind, object_id) {
            (Some(kind), Some(archive_id)) => match self.state.resolver.lookup(kind, archive_id) {
                Some(id) => Some(id),
                None => {
                    self.state.push_error(format!(
                        "Menu item {} skipped: {kind} {archive_id} was not imported",
                        entity.id
                    ));
                    acc.failed.push(key.to_string());
                    return Ok(ItemOutcome::Done(acc));
                }
            },
            (_, id) => id,
        };

        let fields = EntityFields {
            entity_type: MENU_ITEM_TYPE.to_string(),
            title: entity.title.clone(),
            status: entity.status.clone(),
            slug: entity.slug.clone(),
            guid: entity.guid.clone(),
            date: entity.date.clone(),
            ..EntityFields::default()
        };
        let id = match self.writer.create_entity(EntityKind::MenuItem, &fields).await {
            Ok(id) => id,
            Err(e) => {
                self.state
                    .push_error(format!("Failed to import menu item {}: {e}", entity.id));
                acc.failed.push(key.to_string());
                return Ok(ItemOutcome::Done(acc));
            }
        };
        self.state.resolver.record_created(EntityKind::MenuItem, entity.id, id);
        self.writer.assign_terms(id, &[menu_id]).await.map_err(store_failure)?;

        for entry in &entity.meta {
            let managed = entry.key == "_menu_item_object_id" || entry.key == MENU_ITEM_PARENT_META_KEY;
            if entry.key.starts_with("_menu_item_") && !managed {
                self.writer
                    .attach_meta(id, &entry.key, &entry.value)
                    .await
                    .map_err(store_failure)?;
            }
        }
        if let Some(object) = object {
            self.writer
                .attach_meta(id, "_menu_item_object_id", &object.to_string())
                .await
                .map_err(store_failure)?;
        }

        let declared_parent = entity
            .meta_value(MENU_ITEM_PARENT_META_KEY)
            .and_then(|v| v.trim().parse::<ArchiveId>().ok());
        let parent = self
            .state
            .resolver
            .resolve_parent(EntityKind::MenuItem, entity.id, declared_parent);
        self.writer
            .set_parent(EntityKind::MenuItem, id, parent)
            .await
            .map_err(store_failure)?;

        acc.succeed.insert(key.to_string(), id);
        Ok(ItemOutcome::Done(acc))
    }
}

#[async_trait]
impl<'a> ItemOperation<ArchiveTerm> for CreationPass<'a> {
    type Acc = ImportTally;

    async fn process(
        &mut self,
        key: &str,
        term: ArchiveTerm,
        mut acc: ImportTally,
    ) -> Result<ItemOutcome<ImportTally>, ItemError> {
        if self.state.resolver.is_remapped(EntityKind::Term, term.id) {
            return Ok(ItemOutcome::Continue);
        }

        if let Some(existing) = self
            .writer
            .find_term(&term.taxonomy, &term.slug)
            .await
            .map_err(store_failure)?
        {
            tracing::debug!(taxonomy = %term.taxonomy, slug = %term.slug, id = existing, "Reusing existing term");
            self.state.resolver.record_created(EntityKind::Term, term.id, existing);
            return Ok(ItemOutcome::Done(acc));
        }

        let parent = self
            .state
            .resolver
            .resolve_parent(EntityKind::Term, term.id, term.parent);
        let fields = EntityFields {
            entity_type: term.taxonomy.clone(),
            title: term.name.clone(),
            content: term.description.clone(),
            slug: term.slug.clone(),
            parent,
            ..EntityFields::default()
        };
        match self.writer.create_entity(EntityKind::Term, &fields).await {
            Ok(id) => {
                self.state.resolver.record_created(EntityKind::Term, term.id, id);
                self.copy_meta(id, &term.meta).await?;
                acc.succeed.insert(key.to_string(), id);
            }
            Err(e) => {
                self.state.push_error(format!(
                    "Failed to import {} \"{}\": {e}",
                    term.taxonomy, term.slug
                ));
                acc.failed.push(key.to_string());
            }
        }
        Ok(ItemOutcome::Done(acc))
    }

    fn backup(&self) -> Option<Value> {
        serde_json::to_value(&self.state).ok()
    }

    fn restore(&mut self, snapshot: Value) -> Result<(), serde_json::Error> {
        self.state = serde_json::from_value(snapshot)?;
        Ok(())
    }
}

#[async_trait]
impl<'a> ItemOperation<ArchiveEntity> for CreationPass<'a> {
    type Acc = ImportTally;

    async fn process(
        &mut self,
        key: &str,
        entity: ArchiveEntity,
        acc: ImportTally,
    ) -> Result<ItemOutcome<ImportTally>, ItemError> {
        if !self.options.allows(&entity.entity_type) {
            self.state.push_error(format!(
                "Failed to import \"{}\": invalid entity type {}",
                entity.title, entity.entity_type
            ));
            return Ok(ItemOutcome::Continue);
        }

        let kind = if entity.entity_type == MENU_ITEM_TYPE {
            EntityKind::MenuItem
        } else {
            EntityKind::Post
        };
        if self.state.resolver.is_remapped(kind, entity.id) || entity.status == "auto-draft" {
            return Ok(ItemOutcome::Continue);
        }

        match entity.entity_type.as_str() {
            MENU_ITEM_TYPE => self.import_menu_item(key, entity, acc).await,
            "attachment" => self.import_attachment(key, entity, acc).await,
            _ => self.import_post(key, entity, acc).await,
        }
    }

    fn backup(&self) -> Option<Value> {
        serde_json::to_value(&self.state).ok()
    }

    fn restore(&mut self, snapshot: Value) -> Result<(), serde_json::Error> {
        self.state = serde_json::from_value(snapshot)?;
        Ok(())
    }
}

/// Runs (or resumes) one archive import for one session.
pub struct ImportPipeline {
    executor: LoopExecutor,
    writer: Arc<dyn ContentWriter>,
    materializer: AttachmentMaterializer,
    sink: Arc<dyn ContinuationSink>,
    options: PipelineOptions,
}

impl ImportPipeline {
    pub fn new(
        executor: LoopExecutor,
        writer: Arc<dyn ContentWriter>,
        materializer: AttachmentMaterializer,
        sink: Arc<dyn ContinuationSink>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            executor,
            writer,
            materializer,
            sink,
            options,
        }
    }

    pub fn tracker(&self) -> &CheckpointTracker {
        self.executor.tracker()
    }

    fn context(&self, site: &str) -> ExecutionContext {
        match &self.options.discriminator {
            Some(d) => ExecutionContext::with_discriminator(site, d),
            None => ExecutionContext::new(site),
        }
    }

    async fn check_consecutive_skips(&self) -> Result<(), ImportError> {
        let max = self.options.max_consecutive_skips;
        if max == 0 || !self.options.policy.skip_on_error {
            return Ok(());
        }
        let count = self.tracker().consecutive_skips().await?;
        if count >= max {
            tracing::error!(count, max, "Too many consecutive skipped items, aborting import");
            return Err(ImportError::TooManySkips { count, max });
        }
        Ok(())
    }

    async fn suspend(&self, continuation: Continuation) -> Result<ImportOutcome, ImportError> {
        self.sink
            .emit_continue(&continuation)
            .await
            .map_err(ImportError::Continuation)?;
        Ok(ImportOutcome::Suspended(continuation))
    }

    /// Run the import until it completes or suspends.
    pub async fn run(&self, archive: &Archive) -> Result<ImportOutcome, ImportError> {
        let tracker = self.tracker();
        let session = tracker.session_id();

        if let Some(batch_id) = &self.options.batch_id {
            tracker.put(BATCH_ID_KEY, batch_id).await?;
        }

        if tracker.is_step_complete(STEP_IMPORT).await? {
            if let Some(summary) = tracker.fetch::<ImportSummary>(SUMMARY_PATH).await? {
                tracing::info!(session = %session, "Import already complete");
                return Ok(ImportOutcome::Completed(summary));
            }
        }

        self.check_consecutive_skips().await?;

        let terms_ctx = self.context(TERMS_SITE);
        let entities_ctx = self.context(ENTITIES_SITE);
        let base_url = self.options.base_url.as_deref().unwrap_or(&archive.base_url);

        let mut pass = CreationPass {
            writer: self.writer.as_ref(),
            materializer: &self.materializer,
            options: &self.options,
            base_url,
            state: tracker.fetch(STATE_PATH).await?.unwrap_or_default(),
        };

        if !tracker.is_step_complete(STEP_CREATION).await? {
            if !tracker.is_step_complete(STEP_TERMS).await? {
                tracing::info!(session = %session, terms = archive.terms.len(), "Importing terms");
                let items: Vec<(String, ArchiveTerm)> = archive
                    .terms
                    .iter()
                    .map(|t| (t.id.to_string(), t.clone()))
                    .collect();
                if let LoopOutcome::Suspended(c) = self.executor.run(&terms_ctx, items, &mut pass).await? {
                    return self.suspend(c).await;
                }
                tracker.put(STATE_PATH, &pass.state).await?;
                tracker.mark_step_complete(STEP_TERMS).await?;
                self.check_consecutive_skips().await?;
            }

            tracing::info!(session = %session, entities = archive.entities.len(), "Importing entities");
            let items: Vec<(String, ArchiveEntity)> = archive
                .entities
                .iter()
                .map(|e| (e.id.to_string(), e.clone()))
                .collect();
            if let LoopOutcome::Suspended(c) = self.executor.run(&entities_ctx, items, &mut pass).await? {
                return self.suspend(c).await;
            }
            tracker.put(STATE_PATH, &pass.state).await?;
            tracker.mark_step_complete(STEP_CREATION).await?;
            self.check_consecutive_skips().await?;
        }

        let backfill = self.backfill(tracker, &pass.state.resolver).await?;

        let summary = ImportSummary {
            terms: tracker.get_result(terms_ctx.as_str()).await?.unwrap_or_default(),
            entities: tracker.get_result(entities_ctx.as_str()).await?.unwrap_or_default(),
            errors: pass.state.errors,
            skipped: tracker.skipped_items().await?,
            backfill,
        };
        tracker.put(SUMMARY_PATH, &summary).await?;
        tracker.mark_step_complete(STEP_IMPORT).await?;

        tracing::info!(
            session = %session,
            terms = summary.terms.succeed.len(),
            entities = summary.entities.succeed.len(),
            failed = summary.terms.failed.len() + summary.entities.failed.len(),
            skipped = summary.skipped.len(),
            errors = summary.errors.len(),
            "Import complete"
        );
        Ok(ImportOutcome::Completed(summary))
    }

    /// Run every backfill step not yet marked complete.
    async fn backfill(
        &self,
        tracker: &CheckpointTracker,
        resolver: &ReferenceResolver,
    ) -> Result<BackfillReport, ImportError> {
        let writer = self.writer.as_ref();
        let mut report: BackfillReport = tracker.fetch(BACKFILL_PATH).await?.unwrap_or_default();

        if !tracker.is_step_complete(STEP_BACKFILL_PARENTS).await? {
            let parents = resolver.backfill_parents(writer).await?;
            report.parents_linked = parents.linked;
            report.parents_unresolved = parents.unresolved;
            tracker.put(BACKFILL_PATH, &report).await?;
            tracker.mark_step_complete(STEP_BACKFILL_PARENTS).await?;
            tracing::info!(
                linked = parents.linked,
                unresolved = parents.unresolved,
                "Backfilled parent links"
            );
        }

        if !tracker.is_step_complete(STEP_BACKFILL_META).await? {
            report.meta_refs_updated = resolver.backfill_meta_refs(writer).await?;
            tracker.put(BACKFILL_PATH, &report).await?;
            tracker.mark_step_complete(STEP_BACKFILL_META).await?;
            tracing::info!(updated = report.meta_refs_updated, "Backfilled meta references");
        }

        if !tracker.is_step_complete(STEP_BACKFILL_URLS).await? {
            report.urls_rewritten = resolver.backfill_urls(writer).await?;
            tracker.put(BACKFILL_PATH, &report).await?;
            tracker.mark_step_complete(STEP_BACKFILL_URLS).await?;
            tracing::info!(rewritten = report.urls_rewritten, "Rewrote attachment URLs");
        }

        Ok(report)
    }
}
