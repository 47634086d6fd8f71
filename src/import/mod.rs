//! Archive import: parse, create, materialize attachments, backfill.

pub mod archive;
pub mod attachment;
pub mod error;
pub mod fetch;
pub mod pipeline;
pub mod resolver;

pub use archive::{Archive, ArchiveEntity, ArchiveError, ArchiveReader, ArchiveTerm, JsonArchiveReader};
pub use attachment::{AttachmentMaterializer, AttachmentOptions, Materialized, VariantGenerator};
pub use error::{AttachmentError, ImportError};
pub use fetch::{FetchError, FetchHeaders, FetchedFile, HttpFetcher, RemoteFetcher};
pub use pipeline::{
    BackfillReport, ImportOutcome, ImportPipeline, ImportSummary, ImportTally, PipelineOptions,
    ResumableState, ENTITIES_SITE, TERMS_SITE,
};
pub use resolver::{ParentBackfill, ReferenceResolver};
