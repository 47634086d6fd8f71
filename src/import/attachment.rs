//! Attachment materialization: dedup, fetch, validate, store.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;

use super::archive::ArchiveEntity;
use super::error::AttachmentError;
use super::fetch::{FetchError, FetchedFile, RemoteFetcher};
use super::resolver::ReferenceResolver;
use crate::content::{ContentWriter, EntityFields, EntityKind, StoreId, SOURCE_HASH_META_KEY};
use crate::retry::{self, RetryAction, RetryConfig};

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct AttachmentOptions {
    pub enabled: bool,
    /// Local root; files land under `{uploads_dir}/{YYYY}/{MM}/`.
    pub uploads_dir: PathBuf,
    /// Public URL of `uploads_dir`.
    pub uploads_url: String,
    /// Largest accepted binary in bytes. Zero means unlimited.
    pub max_size: u64,
    pub retry: RetryConfig,
    pub timeout: Duration,
}

impl Default for AttachmentOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            uploads_dir: PathBuf::from("uploads"),
            uploads_url: "/uploads".to_string(),
            max_size: 0,
            retry: RetryConfig::default(),
            timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }
}

/// Produces a resized variant of a stored image.
#[async_trait]
pub trait VariantGenerator: Send + Sync {
    async fn generate(&self, source: &Path, size: &str) -> anyhow::Result<PathBuf>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Materialized {
    pub id: StoreId,
    /// An existing entity with the same source hash was reused.
    pub reused: bool,
}

/// Content-addressed lookup key for a source URL.
pub fn source_hash(url: &str) -> String {
    Sha256::digest(url.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Resolve a site-relative URL (`/path`) against the archive's base URL.
pub fn resolve_url(url: &str, base_url: &str) -> String {
    if url.starts_with('/') && !url.starts_with("//") && !base_url.is_empty() {
        return format!("{}{}", base_url.trim_end_matches('/'), url);
    }
    url.to_string()
}

/// Drop the extension of the last path segment: `a/b/photo.jpg` -> `a/b/photo`.
pub fn strip_extension(url: &str) -> &str {
    let name_start = url.rfind('/').map_or(0, |i| i + 1);
    match url[name_start..].rfind('.') {
        Some(dot) if dot > 0 => &url[..name_start + dot],
        _ => url,
    }
}

/// Filename from a `Content-Disposition` header, unquoted.
pub fn filename_from_disposition(header: &str) -> Option<String> {
    let (_, params) = header.split_once(';')?;
    params.split(';').find_map(|part| {
        let (key, value) = part.split_once('=')?;
        if key.trim() != "filename" {
            return None;
        }
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(value);
        (!value.is_empty()).then(|| value.to_string())
    })
}

/// First extension registered for a MIME type.
pub fn extension_for_mime(content_type: &str) -> Option<&'static str> {
    let mime = content_type.split(';').next()?.trim().to_ascii_lowercase();
    let ext = match mime.as_str() {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/avif" => "avif",
        "image/bmp" => "bmp",
        "image/svg+xml" => "svg",
        "image/x-icon" | "image/vnd.microsoft.icon" => "ico",
        "application/pdf" => "pdf",
        "application/zip" => "zip",
        "application/json" => "json",
        "text/plain" => "txt",
        "text/css" => "css",
        "audio/mpeg" => "mp3",
        "video/mp4" => "mp4",
        "video/webm" => "webm",
        _ => return None,
    };
    Some(ext)
}

fn has_extension(name: &str) -> bool {
    matches!(name.rfind('.'), Some(dot) if dot > 0 && dot + 1 < name.len())
}

fn is_image(content_type: Option<&str>, file_name: &str) -> bool {
    if let Some(ct) = content_type {
        return ct.trim_start().to_ascii_lowercase().starts_with("image/");
    }
    let ext = file_name.rsplit('.').next().unwrap_or_default().to_ascii_lowercase();
    matches!(
        ext.as_str(),
        "jpg" | "jpeg" | "png" | "gif" | "webp" | "avif" | "bmp" | "svg" | "ico"
    )
}

/// Last path segment of a URL, without query or fragment.
fn url_file_name(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    let name = path.rsplit('/').next().unwrap_or_default();
    if name.is_empty() {
        "attachment".to_string()
    } else {
        name.to_string()
    }
}

/// Reduce a server-supplied name to a single path component: the last
/// segment after any `/` or `\`, without filesystem-reserved or control
/// characters and without leading or trailing dots. `None` if nothing is left.
fn sanitize_file_name(name: &str) -> Option<String> {
    let last = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = last
        .chars()
        .filter(|c| !matches!(c, ':' | '*' | '?' | '"' | '<' | '>' | '|') && !c.is_control())
        .collect();
    let cleaned = cleaned.trim().trim_matches('.').trim();
    (!cleaned.is_empty()).then(|| cleaned.to_string())
}

/// `YYYY/MM` upload folder: the archive's attached-file path wins, then the
/// entity date, then today.
fn upload_folder(entity: &ArchiveEntity) -> (String, String) {
    let split = |s: &str, sep: char| -> Option<(String, String)> {
        let year = s.get(0..4)?;
        let month = s.get(5..7)?;
        let valid = year.chars().all(|c| c.is_ascii_digit())
            && month.chars().all(|c| c.is_ascii_digit())
            && s[4..].starts_with(sep);
        valid.then(|| (year.to_string(), month.to_string()))
    };
    entity
        .meta_value("_wp_attached_file")
        .and_then(|f| split(f, '/'))
        .or_else(|| entity.date.as_deref().and_then(|d| split(d, '-')))
        .unwrap_or_else(|| {
            let now = Utc::now();
            (format!("{:04}", now.year()), format!("{:02}", now.month()))
        })
}

/// A name in `dir` that does not exist yet: `name`, `name-1`, `name-2`...
async fn unique_file_name(dir: &Path, name: &str) -> String {
    let (stem, ext) = match name.rfind('.') {
        Some(dot) if dot > 0 => (&name[..dot], &name[dot..]),
        _ => (name, ""),
    };
    let mut candidate = name.to_string();
    let mut n = 1;
    while fs::try_exists(dir.join(&candidate)).await.unwrap_or(false) {
        candidate = format!("{stem}-{n}{ext}");
        n += 1;
    }
    candidate
}

/// Check a fetched file against the transfer's own metadata.
pub fn validate(fetched: &FetchedFile, max_size: u64) -> Result<(), String> {
    if fetched.status != 200 {
        return Err(format!("remote server returned status {}", fetched.status));
    }
    if fetched.bytes_written == 0 {
        return Err("zero size file downloaded".to_string());
    }
    if fetched.headers.content_encoding.is_none() {
        if let Some(expected) = fetched.headers.content_length {
            if expected != fetched.bytes_written {
                return Err(format!(
                    "downloaded file has incorrect size ({} of {} bytes)",
                    fetched.bytes_written, expected
                ));
            }
        }
    }
    if max_size > 0 && fetched.bytes_written > max_size {
        return Err(format!("remote file is too large, limit is {max_size} bytes"));
    }
    Ok(())
}

/// Turns attachment references into stored entities.
pub struct AttachmentMaterializer {
    writer: Arc<dyn ContentWriter>,
    fetcher: Arc<dyn RemoteFetcher>,
    variants: Option<Arc<dyn VariantGenerator>>,
    options: AttachmentOptions,
}

impl AttachmentMaterializer {
    pub fn new(
        writer: Arc<dyn ContentWriter>,
        fetcher: Arc<dyn RemoteFetcher>,
        options: AttachmentOptions,
    ) -> Self {
        Self {
            writer,
            fetcher,
            variants: None,
            options,
        }
    }

    pub fn with_variants(mut self, variants: Arc<dyn VariantGenerator>) -> Self {
        self.variants = Some(variants);
        self
    }

    pub fn options(&self) -> &AttachmentOptions {
        &self.options
    }

    /// Materialize the binary behind `entity`.
    ///
    /// A source already stored (in this session or a previous import) is
    /// reused without fetching. URL remaps for the stored copy are recorded
    /// in `resolver` either way.
    pub async fn materialize(
        &self,
        entity: &ArchiveEntity,
        parent: Option<StoreId>,
        base_url: &str,
        resolver: &mut ReferenceResolver,
    ) -> Result<Materialized, AttachmentError> {
        if !self.options.enabled {
            return Err(AttachmentError::Disabled);
        }

        let raw_url = entity
            .attachment_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .unwrap_or(&entity.guid);
        if raw_url.is_empty() {
            return Err(AttachmentError::MissingUrl { id: entity.id });
        }
        let url = resolve_url(raw_url, base_url);
        let hash = source_hash(&url);

        if let Some(id) = self.find_existing(&hash, resolver).await? {
            if let Some(stored_url) = self.writer.entity_url(id).await? {
                resolver.record_url(&url, &stored_url);
                resolver.record_url(strip_extension(&url), strip_extension(&stored_url));
            }
            tracing::debug!(url = %url, id, "Reusing stored attachment");
            return Ok(Materialized { id, reused: true });
        }

        let (year, month) = upload_folder(entity);
        let dir = self.options.uploads_dir.join(&year).join(&month);
        fs::create_dir_all(&dir)
            .await
            .map_err(|source| AttachmentError::Disk {
                path: dir.clone(),
                source,
            })?;

        let tmp = dir.join(format!(".{hash}.download"));
        let fetched = retry::retry_fixed(
            &self.options.retry,
            |e: &FetchError| {
                if e.is_retryable() {
                    RetryAction::Retry
                } else {
                    RetryAction::Abort
                }
            },
            || self.fetcher.get(&url, &tmp, self.options.timeout),
        )
        .await
        .map_err(|source| AttachmentError::Fetch {
            url: url.clone(),
            source,
        })?;

        if let Err(reason) = validate(&fetched, self.options.max_size) {
            let _ = fs::remove_file(&fetched.path).await;
            return Err(AttachmentError::Validation { url, reason });
        }

        let mut file_name = fetched
            .headers
            .content_disposition
            .as_deref()
            .and_then(filename_from_disposition)
            .and_then(|name| sanitize_file_name(&name))
            .or_else(|| sanitize_file_name(&url_file_name(&url)))
            .unwrap_or_else(|| "attachment".to_string());
        if !has_extension(&file_name) {
            if let Some(ext) = fetched.headers.content_type.as_deref().and_then(extension_for_mime) {
                file_name = format!("{file_name}.{ext}");
            }
        }
        let file_name = unique_file_name(&dir, &file_name).await;
        let final_path = dir.join(&file_name);
        if let Err(source) = fs::rename(&fetched.path, &final_path).await {
            let _ = fs::remove_file(&fetched.path).await;
            return Err(AttachmentError::Disk {
                path: final_path,
                source,
            });
        }

        let stored_url = format!(
            "{}/{year}/{month}/{file_name}",
            self.options.uploads_url.trim_end_matches('/')
        );

        let fields = EntityFields {
            entity_type: "attachment".to_string(),
            title: entity.title.clone(),
            content: entity.content.clone(),
            excerpt: entity.excerpt.clone(),
            status: if entity.status.is_empty() {
                "inherit".to_string()
            } else {
                entity.status.clone()
            },
            slug: entity.slug.clone(),
            guid: stored_url.clone(),
            date: entity.date.clone(),
            parent,
            url: Some(stored_url.clone()),
            file_path: Some(final_path.clone()),
        };
        let id = self.writer.create_entity(EntityKind::Attachment, &fields).await?;
        self.writer.attach_meta(id, SOURCE_HASH_META_KEY, &hash).await?;
        resolver.cache_hash(&hash, id);

        resolver.record_url(&url, &stored_url);
        if !entity.guid.is_empty() {
            resolver.record_url(&resolve_url(&entity.guid, base_url), &stored_url);
        }
        if let Some(location) = &fetched.headers.final_location {
            resolver.record_url(location, &stored_url);
        }
        if is_image(fetched.headers.content_type.as_deref(), &file_name) {
            // Resized variants share the stem: photo-300x200.jpg.
            resolver.record_url(strip_extension(&url), strip_extension(&stored_url));
        }

        self.generate_variants(&final_path, &entity.sizes).await;

        tracing::info!(
            url = %url,
            id,
            bytes = fetched.bytes_written,
            "Stored attachment {}",
            final_path.display()
        );
        Ok(Materialized { id, reused: false })
    }

    async fn find_existing(
        &self,
        hash: &str,
        resolver: &mut ReferenceResolver,
    ) -> Result<Option<StoreId>, AttachmentError> {
        if let Some(id) = resolver.cached_hash(hash) {
            return Ok(Some(id));
        }
        let found = self.writer.entity_with_hash(hash).await?;
        if let Some(id) = found {
            resolver.cache_hash(hash, id);
        }
        Ok(found)
    }

    /// Variant failures never fail the attachment; the full-size file stays.
    async fn generate_variants(&self, source: &Path, sizes: &[String]) {
        let Some(generator) = &self.variants else {
            return;
        };
        for size in sizes {
            if let Err(e) = generator.generate(source, size).await {
                tracing::warn!(size = %size, "Failed to generate variant of {}: {e:#}", source.display());
            }
        }
    }
}
