//! Catalog sources
//!
//! The catalog capability set (list + metadata) is a trait with two
//! implementations selected at startup: a git-backed source fetching the
//! upstream index and per-item metadata documents over raw-file HTTPS, and
//! a static source for the fixed tool set and for tests. A caching wrapper
//! sits on top (see the parent module).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use papi_common::retry::{retry_read, RetryConfig};
use papi_common::{Error, Result};

/// Validated metadata record of one catalog item
#[derive(Debug, Clone, Serialize)]
pub struct CatalogMetadata {
    /// Item name (the catalog key)
    pub name: String,
    /// Human title
    pub title: String,
    /// One-line summary
    pub summary: String,
    /// Long description
    pub description: String,
    /// Keywords used for tag filtering
    pub keywords: Vec<String>,
    /// License name
    pub license: String,
    /// Creation date as given upstream
    pub date_creation: String,
    /// Date of the last commit, when the source host reports one
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_commit: String,
    /// Docker image reference (registry-prefixed, no tag)
    pub docker_image: String,
    /// Source repository URL
    pub source_url: String,
}

/// Trimmed record for grid views
#[derive(Debug, Clone, Serialize)]
pub struct CatalogSummary {
    /// Item name
    pub name: String,
    /// Human title
    pub title: String,
    /// One-line summary
    pub summary: String,
    /// Keywords
    pub keywords: Vec<String>,
}

impl From<&CatalogMetadata> for CatalogSummary {
    fn from(meta: &CatalogMetadata) -> Self {
        Self {
            name: meta.name.clone(),
            title: meta.title.clone(),
            summary: meta.summary.clone(),
            keywords: meta.keywords.clone(),
        }
    }
}

/// The catalog capability set
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Names of all items, in catalog order
    async fn list(&self) -> Result<Vec<String>>;

    /// Full metadata of one item
    async fn metadata(&self, name: &str) -> Result<CatalogMetadata>;
}

// =============================================================================
// Upstream wire formats
// =============================================================================

/// One entry of the upstream module index
#[derive(Debug, Clone, Deserialize)]
struct IndexEntry {
    /// Repository URL of the module
    module: String,
    /// Branch holding the metadata document (default branch when absent)
    #[serde(default)]
    branch: Option<String>,
}

/// The upstream metadata document, parsed leniently
#[derive(Debug, Deserialize)]
struct MetadataDoc {
    #[serde(default)]
    title: String,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    description: DescriptionField,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    license: String,
    #[serde(default)]
    date_creation: String,
    #[serde(default)]
    links: MetadataLinks,
}

/// Descriptions arrive as a string or a list of lines
#[derive(Debug, Default, Deserialize)]
#[serde(untagged)]
enum DescriptionField {
    #[default]
    None,
    Single(String),
    Lines(Vec<String>),
}

impl DescriptionField {
    fn join(self) -> String {
        match self {
            DescriptionField::None => String::new(),
            DescriptionField::Single(s) => s,
            DescriptionField::Lines(lines) => lines.join("\n"),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct MetadataLinks {
    #[serde(default)]
    docker_image: String,
}

// =============================================================================
// Git-backed source
// =============================================================================

/// Catalog source reading a module index and per-item metadata documents
/// from a git host's raw-file endpoint
pub struct GitCatalogSource {
    http: reqwest::Client,
    index_url: String,
    metadata_file: String,
    allowed_registries: Vec<String>,
    /// Source-host API token for metadata enrichment; without one the
    /// self-declared license and date are served as-is
    github_token: Option<String>,
    retry: RetryConfig,
}

impl GitCatalogSource {
    /// Build a source for one upstream index
    pub fn new(
        index_url: String,
        metadata_file: String,
        allowed_registries: Vec<String>,
        github_token: Option<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .unwrap_or_default(),
            index_url,
            metadata_file,
            allowed_registries,
            github_token,
            retry: RetryConfig::default(),
        }
    }

    async fn fetch_text(&self, url: &str) -> Result<String> {
        retry_read(&self.retry, "catalog fetch", || async {
            let response = self.http.get(url).send().await.map_err(|e| {
                if e.is_timeout() {
                    Error::timeout(format!("catalog fetch {url}"))
                } else {
                    Error::backend("catalog", e.to_string())
                }
            })?;
            if !response.status().is_success() {
                return Err(Error::backend(
                    "catalog",
                    format!("{url} answered {}", response.status()),
                ));
            }
            response
                .text()
                .await
                .map_err(|e| Error::backend("catalog", e.to_string()))
        })
        .await
    }

    async fn index(&self) -> Result<Vec<IndexEntry>> {
        let raw = self.fetch_text(&self.index_url).await?;
        serde_yaml::from_str(&raw)
            .map_err(|e| Error::backend("catalog", format!("invalid module index: {e}")))
    }

    fn entry_name(entry: &IndexEntry) -> String {
        entry
            .module
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_lowercase()
    }

    fn metadata_url(&self, entry: &IndexEntry) -> String {
        let branch = entry.branch.as_deref().unwrap_or("main");
        let raw_base = entry
            .module
            .trim_end_matches('/')
            .replace("github.com", "raw.githubusercontent.com");
        format!("{raw_base}/{branch}/{}", self.metadata_file)
    }

    /// Validate one metadata document; the reason string explains drops
    fn validate(&self, name: &str, source_url: &str, doc: MetadataDoc) -> std::result::Result<CatalogMetadata, String> {
        if doc.title.trim().is_empty() {
            return Err("metadata has no title".to_string());
        }
        let docker_image = doc.links.docker_image.trim().to_string();
        if docker_image.is_empty() {
            return Err("metadata names no docker image".to_string());
        }
        if !self
            .allowed_registries
            .iter()
            .any(|prefix| docker_image.starts_with(prefix.as_str()))
        {
            return Err(format!(
                "docker image {docker_image} is outside the allowed registries"
            ));
        }
        Ok(CatalogMetadata {
            name: name.to_string(),
            title: doc.title,
            summary: doc.summary,
            description: doc.description.join(),
            keywords: doc.keywords,
            license: doc.license,
            date_creation: doc.date_creation,
            last_commit: String::new(),
            docker_image,
            source_url: source_url.to_string(),
        })
    }
}

#[async_trait]
impl CatalogSource for GitCatalogSource {
    async fn list(&self) -> Result<Vec<String>> {
        // One bad item must not sink the index: drops are logged, the rest
        // of the catalog survives.
        let mut names = Vec::new();
        for entry in self.index().await? {
            let name = Self::entry_name(&entry);
            if name.is_empty() {
                warn!(module = %entry.module, "skipping index entry with no name");
                continue;
            }
            names.push(name);
        }
        info!(items = names.len(), "catalog index refreshed");
        Ok(names)
    }

    async fn metadata(&self, name: &str) -> Result<CatalogMetadata> {
        let entry = self
            .index()
            .await?
            .into_iter()
            .find(|e| Self::entry_name(e) == name)
            .ok_or_else(|| Error::unknown_workload("module", name))?;

        let url = self.metadata_url(&entry);
        let raw = self.fetch_text(&url).await?;
        let doc: MetadataDoc = serde_json::from_str(&raw).map_err(|e| {
            warn!(item = name, reason = %e, "dropping catalog item with invalid metadata");
            Error::unknown_workload("module", name)
        })?;

        let mut metadata = self.validate(name, &entry.module, doc).map_err(|reason| {
            warn!(item = name, reason = %reason, "dropping catalog item");
            Error::unknown_workload("module", name)
        })?;
        self.enrich_from_source_host(&mut metadata).await;
        Ok(metadata)
    }
}

impl GitCatalogSource {
    /// Overwrite the self-declared license and creation date with what the
    /// source host reports. Best effort: the self-declared values stay on
    /// any failure.
    async fn enrich_from_source_host(&self, metadata: &mut CatalogMetadata) {
        let Some(token) = &self.github_token else {
            return;
        };
        let Some(repo_path) = metadata
            .source_url
            .trim_end_matches('/')
            .split_once("github.com/")
            .map(|(_, path)| path.to_string())
        else {
            return;
        };

        #[derive(Deserialize)]
        struct RepoInfo {
            #[serde(default)]
            license: Option<RepoLicense>,
            #[serde(default)]
            pushed_at: String,
            #[serde(default)]
            created_at: String,
        }
        #[derive(Deserialize)]
        struct RepoLicense {
            spdx_id: String,
        }

        let request = self
            .http
            .get(format!("https://api.github.com/repos/{repo_path}"))
            .header("User-Agent", "papi")
            .bearer_auth(token)
            .send()
            .await;
        let Ok(response) = request else {
            return;
        };
        let Ok(info) = response.json::<RepoInfo>().await else {
            return;
        };

        if let Some(license) = info.license {
            if !license.spdx_id.is_empty() && license.spdx_id != "NOASSERTION" {
                metadata.license = license.spdx_id;
            }
        }
        if !info.created_at.is_empty() {
            metadata.date_creation = info.created_at;
        }
        if !info.pushed_at.is_empty() {
            metadata.last_commit = info.pushed_at;
        }
    }
}

// =============================================================================
// Static source
// =============================================================================

/// Catalog source over a fixed item set (tools, tests)
pub struct StaticCatalogSource {
    items: HashMap<String, CatalogMetadata>,
    order: Vec<String>,
}

impl StaticCatalogSource {
    /// Build a source from pre-validated items
    pub fn new(items: Vec<CatalogMetadata>) -> Self {
        let order = items.iter().map(|i| i.name.clone()).collect();
        let items = items.into_iter().map(|i| (i.name.clone(), i)).collect();
        Self { items, order }
    }
}

#[async_trait]
impl CatalogSource for StaticCatalogSource {
    async fn list(&self) -> Result<Vec<String>> {
        Ok(self.order.clone())
    }

    async fn metadata(&self, name: &str) -> Result<CatalogMetadata> {
        self.items
            .get(name)
            .cloned()
            .ok_or_else(|| Error::unknown_workload("tool", name))
    }
}

// =============================================================================
// Docker registry tags
// =============================================================================

/// Tags available for an image on the public container registry.
///
/// Private-registry images are not listable this way; callers fall back to
/// a bare `latest`.
pub async fn retrieve_docker_tags(http: &reqwest::Client, image: &str) -> Result<Vec<String>> {
    #[derive(Deserialize)]
    struct TagPage {
        results: Vec<TagEntry>,
    }
    #[derive(Deserialize)]
    struct TagEntry {
        name: String,
    }

    let url = format!("https://registry.hub.docker.com/v2/repositories/{image}/tags");
    let page: TagPage = http
        .get(&url)
        .send()
        .await
        .map_err(|e| Error::backend("dockerhub", e.to_string()))?
        .error_for_status()
        .map_err(|_| Error::bad_request("docker_image", format!("could not retrieve tags for {image}")))?
        .json()
        .await
        .map_err(|e| Error::backend("dockerhub", e.to_string()))?;

    Ok(page.results.into_iter().map(|t| t.name).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> GitCatalogSource {
        GitCatalogSource::new(
            "https://raw.example.org/catalog/MODULES.yml".to_string(),
            "metadata.json".to_string(),
            vec!["allowed/".to_string(), "registry.example.org/".to_string()],
            None,
        )
    }

    fn doc(image: &str) -> MetadataDoc {
        serde_json::from_value(serde_json::json!({
            "title": "Demo app",
            "summary": "A demo",
            "description": ["line one", "line two"],
            "keywords": ["vision", "docker"],
            "license": "MIT",
            "date_creation": "2023-01-01",
            "links": {"docker_image": image}
        }))
        .unwrap()
    }

    #[test]
    fn test_index_entry_name_extraction() {
        let entry: IndexEntry = serde_yaml::from_str(
            "module: https://github.com/org/Demo-App\nbranch: main\n",
        )
        .unwrap();
        assert_eq!(GitCatalogSource::entry_name(&entry), "demo-app");
    }

    #[test]
    fn test_metadata_url_construction() {
        let entry: IndexEntry =
            serde_yaml::from_str("module: https://github.com/org/demo-app\n").unwrap();
        assert_eq!(
            source().metadata_url(&entry),
            "https://raw.githubusercontent.com/org/demo-app/main/metadata.json"
        );

        let entry: IndexEntry =
            serde_yaml::from_str("module: https://github.com/org/demo-app\nbranch: dev\n")
                .unwrap();
        assert!(source().metadata_url(&entry).contains("/dev/"));
    }

    #[test]
    fn test_validation_accepts_allowed_image() {
        let meta = source()
            .validate("demo-app", "https://github.com/org/demo-app", doc("allowed/demo-app"))
            .unwrap();
        assert_eq!(meta.docker_image, "allowed/demo-app");
        assert_eq!(meta.description, "line one\nline two");
        assert_eq!(meta.keywords, vec!["vision", "docker"]);
    }

    /// Allow-list invariant: items outside the allowed registries never
    /// enter the catalog
    #[test]
    fn test_validation_drops_disallowed_image() {
        let err = source()
            .validate("evil", "https://github.com/org/evil", doc("dockerhub.evil/app"))
            .unwrap_err();
        assert!(err.contains("outside the allowed registries"));
    }

    #[test]
    fn test_validation_drops_missing_title() {
        let mut d = doc("allowed/app");
        d.title = "  ".to_string();
        assert!(source().validate("x", "u", d).is_err());
    }

    #[test]
    fn test_validation_drops_missing_image() {
        let mut d = doc("allowed/app");
        d.links.docker_image = String::new();
        assert!(source().validate("x", "u", d).is_err());
    }

    #[test]
    fn test_description_field_forms() {
        assert_eq!(DescriptionField::Single("abc".into()).join(), "abc");
        assert_eq!(
            DescriptionField::Lines(vec!["a".into(), "b".into()]).join(),
            "a\nb"
        );
        assert_eq!(DescriptionField::None.join(), "");
    }

    #[tokio::test]
    async fn test_static_source() {
        let source = StaticCatalogSource::new(vec![CatalogMetadata {
            name: "dev-env".to_string(),
            title: "Development environment".to_string(),
            summary: String::new(),
            description: String::new(),
            keywords: vec!["ide".to_string()],
            license: "Apache-2.0".to_string(),
            date_creation: String::new(),
            last_commit: String::new(),
            docker_image: "allowed/dev-env".to_string(),
            source_url: String::new(),
        }]);
        assert_eq!(source.list().await.unwrap(), vec!["dev-env"]);
        assert_eq!(source.metadata("dev-env").await.unwrap().license, "Apache-2.0");
        assert!(source.metadata("nope").await.is_err());
    }
}
