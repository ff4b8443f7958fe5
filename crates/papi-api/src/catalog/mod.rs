//! Catalog resolver
//!
//! Enumerates deployable items from upstream indexes, fetches and validates
//! their metadata, and serves list/detail/metadata/config views with
//! explicit TTL caching (metadata 6 h, lists 15 min) and single-flight
//! upstream fetches.

mod source;

pub mod handlers;

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use papi_common::{Error, Result, WorkloadKind};

use crate::cache::{Clock, SystemClock, TtlCache};

pub use source::{
    retrieve_docker_tags, CatalogMetadata, CatalogSource, CatalogSummary, GitCatalogSource,
    StaticCatalogSource,
};

/// TTL for full metadata records
pub const METADATA_TTL: Duration = Duration::from_secs(6 * 60 * 60);

/// TTL for item lists
pub const LIST_TTL: Duration = Duration::from_secs(15 * 60);

/// Tag filter with OpenStack-style semantics
///
/// - `tags`: items containing all of the given tags
/// - `tags_any`: items containing at least one
/// - `not_tags`: items not containing exactly all
/// - `not_tags_any`: items containing none
///
/// Each entry supports `*` prefix/suffix/contains wildcards.
#[derive(Debug, Clone, Default)]
pub struct TagFilter {
    /// All of these
    pub tags: Vec<String>,
    /// Any of these
    pub tags_any: Vec<String>,
    /// Not exactly all of these
    pub not_tags: Vec<String>,
    /// None of these
    pub not_tags_any: Vec<String>,
}

impl TagFilter {
    /// Whether the filter selects everything
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
            && self.tags_any.is_empty()
            && self.not_tags.is_empty()
            && self.not_tags_any.is_empty()
    }

    /// Replace wildcard entries with the matching known tags
    fn expand(patterns: &[String], all_tags: &[String]) -> Vec<String> {
        let mut expanded = Vec::new();
        for pattern in patterns {
            let matched: Vec<String> = if pattern.starts_with('*') && pattern.ends_with('*') {
                let needle = &pattern[1..pattern.len() - 1];
                all_tags.iter().filter(|t| t.contains(needle)).cloned().collect()
            } else if let Some(suffix) = pattern.strip_prefix('*') {
                all_tags.iter().filter(|t| t.ends_with(suffix)).cloned().collect()
            } else if let Some(prefix) = pattern.strip_suffix('*') {
                all_tags.iter().filter(|t| t.starts_with(prefix)).cloned().collect()
            } else {
                Vec::new()
            };
            if matched.is_empty() {
                expanded.push(pattern.clone());
            } else {
                expanded.extend(matched);
            }
        }
        expanded
    }

    /// Whether an item with the given keywords passes the filter
    pub fn matches(&self, keywords: &[String], all_tags: &[String]) -> bool {
        let has = |tag: &String| keywords.contains(tag);

        let tags = Self::expand(&self.tags, all_tags);
        let tags_any = Self::expand(&self.tags_any, all_tags);
        let not_tags = Self::expand(&self.not_tags, all_tags);
        let not_tags_any = Self::expand(&self.not_tags_any, all_tags);

        if !tags.is_empty() && !tags.iter().all(has) {
            return false;
        }
        if !tags_any.is_empty() && !tags_any.iter().any(has) {
            return false;
        }
        if !not_tags.is_empty() && not_tags.iter().all(has) {
            return false;
        }
        if !not_tags_any.is_empty() && not_tags_any.iter().any(has) {
            return false;
        }
        true
    }
}

/// Caching catalog over one source
pub struct Catalog {
    kind: WorkloadKind,
    source: Arc<dyn CatalogSource>,
    list_cache: TtlCache<u8, Vec<String>>,
    meta_cache: TtlCache<String, Arc<CatalogMetadata>>,
}

impl Catalog {
    /// Wrap a source with the standard TTLs
    pub fn new(kind: WorkloadKind, source: Arc<dyn CatalogSource>) -> Self {
        Self::with_clock(kind, source, Arc::new(SystemClock))
    }

    /// Wrap a source with an injected clock (deterministic expiry tests)
    pub fn with_clock(
        kind: WorkloadKind,
        source: Arc<dyn CatalogSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            kind,
            source,
            list_cache: TtlCache::with_clock(LIST_TTL, clock.clone()),
            meta_cache: TtlCache::with_clock(METADATA_TTL, clock),
        }
    }

    /// The workload kind this catalog serves
    pub fn kind(&self) -> WorkloadKind {
        self.kind
    }

    /// Names of all valid items.
    ///
    /// Items whose metadata was dropped (validation failure, disallowed
    /// image) are excluded, so everything listed is deployable.
    pub async fn list(&self) -> Result<Vec<String>> {
        let raw = self
            .list_cache
            .get_or_fetch(0, || self.source.list())
            .await?;
        let mut names = Vec::new();
        for name in raw {
            match self.metadata(&name).await {
                Ok(_) => names.push(name),
                Err(Error::UnknownWorkload { .. }) => {}
                Err(err) => {
                    // The resolver swallows per-item failures (one bad item
                    // must not sink the index) but always logs them.
                    warn!(item = %name, error = %err, "catalog item unavailable");
                }
            }
        }
        Ok(names)
    }

    /// Names filtered by tags
    pub async fn filtered_list(&self, filter: &TagFilter) -> Result<Vec<String>> {
        let names = self.list().await?;
        if filter.is_empty() {
            return Ok(names);
        }
        let all_tags = self.tags().await?;
        let mut filtered = Vec::new();
        for name in names {
            let meta = self.metadata(&name).await?;
            if filter.matches(&meta.keywords, &all_tags) {
                filtered.push(name);
            }
        }
        Ok(filtered)
    }

    /// Trimmed records for grid views
    pub async fn summary(&self, filter: &TagFilter) -> Result<Vec<CatalogSummary>> {
        let mut summaries = Vec::new();
        for name in self.filtered_list(filter).await? {
            let meta = self.metadata(&name).await?;
            summaries.push(CatalogSummary::from(meta.as_ref()));
        }
        Ok(summaries)
    }

    /// All known tags, sorted and deduplicated
    pub async fn tags(&self) -> Result<Vec<String>> {
        let mut tags = std::collections::BTreeSet::new();
        for name in self.list().await? {
            if let Ok(meta) = self.metadata(&name).await {
                tags.extend(meta.keywords.iter().cloned());
            }
        }
        Ok(tags.into_iter().collect())
    }

    /// Full metadata of one item
    pub async fn metadata(&self, name: &str) -> Result<Arc<CatalogMetadata>> {
        self.meta_cache
            .get_or_fetch(name.to_string(), || async {
                self.source.metadata(name).await.map(Arc::new)
            })
            .await
    }

    /// Invalidate cached entries: one item, or everything
    pub async fn refresh(&self, name: Option<&str>) {
        match name {
            Some(name) => {
                self.meta_cache.invalidate(&name.to_string()).await;
            }
            None => {
                self.meta_cache.clear().await;
                self.list_cache.clear().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ManualClock;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn meta(name: &str, keywords: &[&str], image: &str) -> CatalogMetadata {
        CatalogMetadata {
            name: name.to_string(),
            title: name.to_uppercase(),
            summary: format!("{name} summary"),
            description: String::new(),
            keywords: keywords.iter().map(|s| s.to_string()).collect(),
            license: "MIT".to_string(),
            date_creation: String::new(),
            last_commit: String::new(),
            docker_image: image.to_string(),
            source_url: String::new(),
        }
    }

    fn catalog() -> Catalog {
        let source = StaticCatalogSource::new(vec![
            meta("image-classifier", &["vision", "image"], "allowed/image-classifier"),
            meta("audio-tagger", &["audio"], "allowed/audio-tagger"),
            meta("text-ranker", &["nlp", "text"], "allowed/text-ranker"),
        ]);
        Catalog::new(WorkloadKind::Module, Arc::new(source))
    }

    fn filter(tags: &[&str]) -> TagFilter {
        TagFilter {
            tags: tags.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_list_all() {
        let names = catalog().list().await.unwrap();
        assert_eq!(names, vec!["image-classifier", "audio-tagger", "text-ranker"]);
    }

    #[tokio::test]
    async fn test_filtered_list() {
        let catalog = catalog();
        assert_eq!(
            catalog.filtered_list(&filter(&["vision"])).await.unwrap(),
            vec!["image-classifier"]
        );
        // tags requires ALL listed tags
        assert!(catalog
            .filtered_list(&filter(&["vision", "audio"]))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_tags_any_filter() {
        let catalog = catalog();
        let f = TagFilter {
            tags_any: vec!["vision".to_string(), "audio".to_string()],
            ..Default::default()
        };
        assert_eq!(
            catalog.filtered_list(&f).await.unwrap(),
            vec!["image-classifier", "audio-tagger"]
        );
    }

    #[tokio::test]
    async fn test_not_tags_any_filter() {
        let catalog = catalog();
        let f = TagFilter {
            not_tags_any: vec!["audio".to_string()],
            ..Default::default()
        };
        assert_eq!(
            catalog.filtered_list(&f).await.unwrap(),
            vec!["image-classifier", "text-ranker"]
        );
    }

    #[tokio::test]
    async fn test_wildcard_expansion() {
        let catalog = catalog();
        // "*ext" matches "text"; "im*" matches "image"
        let f = TagFilter {
            tags_any: vec!["im*".to_string()],
            ..Default::default()
        };
        assert_eq!(
            catalog.filtered_list(&f).await.unwrap(),
            vec!["image-classifier"]
        );

        let f = TagFilter {
            tags_any: vec!["*ext*".to_string()],
            ..Default::default()
        };
        assert_eq!(catalog.filtered_list(&f).await.unwrap(), vec!["text-ranker"]);
    }

    #[tokio::test]
    async fn test_summary_records() {
        let summaries = catalog().summary(&TagFilter::default()).await.unwrap();
        assert_eq!(summaries.len(), 3);
        assert_eq!(summaries[0].name, "image-classifier");
        assert_eq!(summaries[0].title, "IMAGE-CLASSIFIER");
    }

    #[tokio::test]
    async fn test_tags_are_sorted_and_unique() {
        let tags = catalog().tags().await.unwrap();
        assert_eq!(tags, vec!["audio", "image", "nlp", "text", "vision"]);
    }

    /// Allow-list invariant at the static-source seam: sources only hold
    /// validated items, so everything listed carries an allowed image
    #[tokio::test]
    async fn test_listed_items_have_allowed_images() {
        let catalog = catalog();
        for name in catalog.list().await.unwrap() {
            let meta = catalog.metadata(&name).await.unwrap();
            assert!(meta.docker_image.starts_with("allowed/"));
        }
    }

    #[tokio::test]
    async fn test_metadata_cache_expiry_with_clock() {
        struct Source {
            calls: AtomicU32,
        }
        #[async_trait::async_trait]
        impl CatalogSource for Source {
            async fn list(&self) -> Result<Vec<String>> {
                Ok(vec!["one".to_string()])
            }
            async fn metadata(&self, name: &str) -> Result<CatalogMetadata> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Ok(CatalogMetadata {
                    name: name.to_string(),
                    title: "One".to_string(),
                    summary: String::new(),
                    description: String::new(),
                    keywords: Vec::new(),
                    license: String::new(),
                    date_creation: String::new(),
                    last_commit: String::new(),
                    docker_image: "allowed/one".to_string(),
                    source_url: String::new(),
                })
            }
        }

        let source = Arc::new(Source {
            calls: AtomicU32::new(0),
        });
        let clock = ManualClock::new();
        let catalog = Catalog::with_clock(WorkloadKind::Module, source.clone(), clock.clone());

        catalog.metadata("one").await.unwrap();
        catalog.metadata("one").await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        // Within TTL: still cached
        clock.advance(Duration::from_secs(5 * 60 * 60));
        catalog.metadata("one").await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        // Past the 6 h TTL: refetched
        clock.advance(Duration::from_secs(2 * 60 * 60));
        catalog.metadata("one").await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);

        // Explicit refresh also invalidates
        catalog.refresh(Some("one")).await;
        catalog.metadata("one").await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }
}
