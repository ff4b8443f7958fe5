//! Shared application state
//!
//! One `AppState` value is constructed at startup and handed to the router;
//! every subsystem handle lives behind an `Arc`. No globals, no import-time
//! side effects: tests build alternate states with fixture configs.

use std::sync::Arc;
use std::time::Duration;

use papi_common::config::{EnvConfig, MainConfig, WorkloadAssets};
use papi_common::{Result, WorkloadKind};
use papi_nomad::NomadClient;

use crate::auth::OidcValidator;
use crate::cache::TtlCache;
use crate::catalog::{Catalog, CatalogMetadata, GitCatalogSource, StaticCatalogSource};
use crate::clients::{HarborClient, VaultClient};
use crate::stats::StatsHolder;

/// TTL for the GPU-model discovery cache
const GPU_MODELS_TTL: Duration = Duration::from_secs(60 * 60);

/// TTL for the historical accounting summaries
const ACCOUNTING_TTL: Duration = Duration::from_secs(6 * 60 * 60);

/// Shared state for all handlers
#[derive(Clone)]
pub struct AppState {
    /// Immutable main configuration
    pub config: Arc<MainConfig>,
    /// Environment values read at startup
    pub env: Arc<EnvConfig>,
    /// Job templates and user-config schemas
    pub assets: Arc<WorkloadAssets>,
    /// Token validator
    pub oidc: Arc<OidcValidator>,
    /// Scheduler client
    pub nomad: Arc<NomadClient>,
    /// Secret store client
    pub vault: Arc<VaultClient>,
    /// Image registry client
    pub harbor: Arc<HarborClient>,
    /// Module catalog
    pub modules: Arc<Catalog>,
    /// Tool catalog
    pub tools: Arc<Catalog>,
    /// Latest cluster stats snapshot
    pub cluster_stats: Arc<StatsHolder>,
    /// GPU models per namespace, discovered from nodes
    pub gpu_models: Arc<TtlCache<String, Vec<String>>>,
    /// Parsed accounting summaries per namespace
    pub accounting: Arc<TtlCache<String, Arc<crate::stats::accounting::NamespaceStats>>>,
    /// Shared outbound client (docker tags, LLM gateway)
    pub http: reqwest::Client,
    /// Short-deadline client for endpoint liveness probes
    pub probe: reqwest::Client,
}

impl AppState {
    /// Wire up all subsystems from the loaded configuration
    pub fn new(
        config: MainConfig,
        env: EnvConfig,
        assets: WorkloadAssets,
    ) -> Result<Self> {
        let nomad = Arc::new(NomadClient::from_env(&env)?);

        let vault = Arc::new(VaultClient::new(
            config.vault.addr.clone(),
            config.vault.secret_root.clone(),
            env.vault_token.clone(),
        ));

        let harbor = Arc::new(HarborClient::new(
            config.registry.addr.clone(),
            config.registry.project.clone(),
            config.registry.robot_user.clone(),
            env.harbor_robot_password.clone(),
        ));

        let modules = Arc::new(Catalog::new(
            WorkloadKind::Module,
            Arc::new(GitCatalogSource::new(
                config.catalog.modules_index.clone(),
                config.catalog.metadata_file.clone(),
                config.catalog.allowed_registries.clone(),
                env.github_token.clone(),
            )),
        ));

        // The tool set is fixed by the installed assets
        let tools = Arc::new(Catalog::new(
            WorkloadKind::Tool,
            Arc::new(StaticCatalogSource::new(tool_items(&assets))),
        ));

        let oidc = OidcValidator::new(config.auth.providers.clone());

        Ok(Self {
            config: Arc::new(config),
            env: Arc::new(env),
            assets: Arc::new(assets),
            oidc,
            nomad,
            vault,
            harbor,
            modules,
            tools,
            cluster_stats: StatsHolder::new(),
            gpu_models: Arc::new(TtlCache::new(GPU_MODELS_TTL)),
            accounting: Arc::new(TtlCache::new(ACCOUNTING_TTL)),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .unwrap_or_default(),
            probe: reqwest::Client::builder()
                .timeout(Duration::from_secs(2))
                .build()
                .unwrap_or_default(),
        })
    }

    /// The catalog serving a deployable kind
    pub fn catalog_for(&self, kind: WorkloadKind) -> &Arc<Catalog> {
        match kind {
            WorkloadKind::Tool => &self.tools,
            _ => &self.modules,
        }
    }
}

/// Build static catalog records for the installed tools
fn tool_items(assets: &WorkloadAssets) -> Vec<CatalogMetadata> {
    let mut items = Vec::new();
    for name in assets.tool_names() {
        let image = assets
            .tool_schemas
            .get(name)
            .and_then(|schema| schema.param("general", "docker_image"))
            .and_then(|spec| spec.value.as_str())
            .unwrap_or_default()
            .to_string();
        items.push(CatalogMetadata {
            name: name.to_string(),
            title: name.replace('-', " "),
            summary: String::new(),
            description: String::new(),
            keywords: vec!["tool".to_string()],
            license: String::new(),
            date_creation: String::new(),
            last_commit: String::new(),
            docker_image: image,
            source_url: String::new(),
        });
    }
    items
}
