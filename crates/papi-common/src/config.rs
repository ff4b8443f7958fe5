//! API configuration
//!
//! Everything is loaded once at startup into immutable values that the
//! subsystems hold by reference (`Arc<Config>`): the environment, the main
//! YAML file, and the per-workload assets (job templates and user-config
//! schemas). The main YAML is a template form: `${VAR}` references are
//! substituted from the process environment before parsing, so deployments
//! can keep one file for all installations.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::schema::ConfSchema;

/// Errors that make the configuration unusable (startup exit code 1)
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("cannot read {path}: {message}")]
    Read {
        /// Path that failed
        path: String,
        /// I/O error detail
        message: String,
    },

    /// Config file could not be parsed
    #[error("cannot parse {path}: {message}")]
    Parse {
        /// Path that failed
        path: String,
        /// Parser error detail
        message: String,
    },

    /// Config contents are inconsistent
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// A secret required in production is missing
    #[error("missing required variable {0} (required when IS_PROD is set)")]
    MissingSecret(&'static str),
}

/// Errors in the process environment itself (startup exit code 2)
#[derive(Debug, Error)]
pub enum EnvError {
    /// An environment variable holds an unparseable value
    #[error("environment variable {name} has invalid value '{value}'")]
    BadValue {
        /// Variable name
        name: &'static str,
        /// The offending value
        value: String,
    },
}

// =============================================================================
// Environment
// =============================================================================

/// Values read from the process environment at startup
#[derive(Debug, Clone)]
pub struct EnvConfig {
    /// Production mode: missing secrets become fatal, external probes run
    pub is_prod: bool,
    /// Scheduler address
    pub nomad_addr: String,
    /// CA certificate for the scheduler API
    pub nomad_cacert: Option<PathBuf>,
    /// Client certificate for scheduler mTLS
    pub nomad_client_cert: Option<PathBuf>,
    /// Client key for scheduler mTLS
    pub nomad_client_key: Option<PathBuf>,
    /// Directory holding the pre-computed accounting summaries
    pub accounting_path: Option<PathBuf>,
    /// Robot password for the snapshot registry
    pub harbor_robot_password: Option<String>,
    /// Server-side token for the secret store
    pub vault_token: Option<String>,
    /// Server-side key for the LLM gateway
    pub llm_api_key: Option<String>,
    /// Token injected into job templates for completion mails
    pub mailing_token: String,
    /// Token for dataset-archive downloads inside jobs
    pub zenodo_token: Option<String>,
    /// Token for source-host metadata enrichment
    pub github_token: Option<String>,
    /// Token for the build pipeline integration
    pub jenkins_token: Option<String>,
    /// Token for provenance records
    pub provenance_token: Option<String>,
    /// Dashboard URL injected into notification links
    pub dashboard_url: Option<String>,
    /// Trusted proxy IPs for X-Forwarded-For handling
    pub forwarded_allow_ips: Option<String>,
}

impl EnvConfig {
    /// Read the environment
    ///
    /// # Errors
    ///
    /// Returns `EnvError` when a variable holds an unparseable value; the
    /// caller exits with code 2.
    pub fn from_env() -> Result<Self, EnvError> {
        Ok(Self {
            is_prod: parse_bool_var("IS_PROD")?,
            nomad_addr: std::env::var("NOMAD_ADDR")
                .unwrap_or_else(|_| "http://127.0.0.1:4646".to_string()),
            nomad_cacert: path_var("NOMAD_CACERT"),
            nomad_client_cert: path_var("NOMAD_CLIENT_CERT"),
            nomad_client_key: path_var("NOMAD_CLIENT_KEY"),
            accounting_path: path_var("ACCOUNTING_PTH"),
            harbor_robot_password: nonempty_var("HARBOR_ROBOT_PASSWORD"),
            vault_token: nonempty_var("VAULT_TOKEN"),
            llm_api_key: nonempty_var("LLM_API_KEY"),
            mailing_token: std::env::var("MAILING_TOKEN").unwrap_or_default(),
            zenodo_token: nonempty_var("ZENODO_TOKEN"),
            github_token: nonempty_var("PAPI_GITHUB_TOKEN"),
            jenkins_token: nonempty_var("PAPI_JENKINS_TOKEN"),
            provenance_token: nonempty_var("PAPI_PROVENANCE_TOKEN"),
            dashboard_url: nonempty_var("DASHBOARD_URL"),
            forwarded_allow_ips: nonempty_var("FORWARDED_ALLOW_IPS"),
        })
    }

    /// Enforce that production installations carry their secrets.
    ///
    /// In dev mode the snapshot, secret and LLM endpoints degrade to
    /// backend errors instead; a warning is logged for each missing value.
    pub fn check_secrets(&self) -> Result<(), ConfigError> {
        let required: [(&'static str, bool); 3] = [
            ("HARBOR_ROBOT_PASSWORD", self.harbor_robot_password.is_some()),
            ("VAULT_TOKEN", self.vault_token.is_some()),
            ("LLM_API_KEY", self.llm_api_key.is_some()),
        ];
        for (name, present) in required {
            if !present {
                if self.is_prod {
                    return Err(ConfigError::MissingSecret(name));
                }
                warn!(variable = name, "secret not set, related endpoints disabled");
            }
        }
        Ok(())
    }
}

fn parse_bool_var(name: &'static str) -> Result<bool, EnvError> {
    match std::env::var(name) {
        Err(_) => Ok(false),
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "" | "0" | "false" | "no" | "off" => Ok(false),
            "1" | "true" | "yes" | "on" => Ok(true),
            _ => Err(EnvError::BadValue { name, value: raw }),
        },
    }
}

fn nonempty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn path_var(name: &str) -> Option<PathBuf> {
    nonempty_var(name).map(PathBuf::from)
}

// =============================================================================
// Main YAML
// =============================================================================

/// The main API configuration file
#[derive(Debug, Clone, Deserialize)]
pub struct MainConfig {
    /// API-facing identity
    #[serde(rename = "self")]
    pub server: SelfSection,
    /// Authentication and tenancy
    pub auth: AuthSection,
    /// Scheduler tenancy mapping
    pub nomad: NomadSection,
    /// Load-balancer domains per VO
    pub lb: LbSection,
    /// Function-platform clusters per VO
    #[serde(default)]
    pub oscar: OscarSection,
    /// Experiment-tracking URL per VO
    #[serde(default)]
    pub mlflow: HashMap<String, String>,
    /// Secret store
    #[serde(default)]
    pub vault: VaultSection,
    /// Snapshot registry
    #[serde(default)]
    pub registry: RegistrySection,
    /// LLM gateway
    #[serde(default)]
    pub llm: LlmSection,
    /// Per-user caps
    #[serde(default)]
    pub quotas: QuotasSection,
    /// Try-me sandbox limits
    #[serde(default)]
    pub tryme: TryMeSection,
    /// Upstream catalog sources
    pub catalog: CatalogSection,
}

/// `self` section
#[derive(Debug, Clone, Deserialize)]
pub struct SelfSection {
    /// Public domain of this API instance
    pub domain: String,
}

/// `auth` section
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    /// Exact origins allowed by CORS
    #[serde(rename = "CORS_origins", default)]
    pub cors_origins: Vec<String>,
    /// Trusted OIDC issuers
    #[serde(rename = "OP")]
    pub providers: Vec<String>,
    /// Allow-listed Virtual Organizations
    #[serde(rename = "VO")]
    pub vos: Vec<String>,
    /// Subjects allowed to call admin routes (catalog refresh)
    #[serde(default)]
    pub admins: Vec<String>,
}

/// `nomad` section
#[derive(Debug, Clone, Deserialize)]
pub struct NomadSection {
    /// VO to scheduler-namespace mapping
    pub namespaces: HashMap<String, String>,
}

/// `lb` section
#[derive(Debug, Clone, Deserialize)]
pub struct LbSection {
    /// VO to deployment base-domain mapping
    pub domain: HashMap<String, String>,
}

/// `oscar` section
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OscarSection {
    /// VO to function-platform cluster mapping
    #[serde(default)]
    pub clusters: HashMap<String, OscarCluster>,
}

/// One function-platform cluster
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OscarCluster {
    /// Cluster API endpoint
    pub endpoint: String,
    /// Cluster identifier used in service URLs
    pub cluster_id: String,
}

/// `vault` section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VaultSection {
    /// Secret store address
    pub addr: String,
    /// KV mount the per-VO trees hang from
    pub secret_root: String,
}

impl Default for VaultSection {
    fn default() -> Self {
        Self {
            addr: "https://vault.services.fedcloud.eu:8200".to_string(),
            secret_root: "secrets".to_string(),
        }
    }
}

/// `registry` section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistrySection {
    /// Registry API address
    pub addr: String,
    /// Project holding the per-user snapshot repositories
    pub project: String,
    /// Robot account user for snapshot pushes
    pub robot_user: String,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            addr: "https://registry.services.ai4os.eu".to_string(),
            project: "user-snapshots".to_string(),
            robot_user: "robot$user-snapshots+snapshot-api".to_string(),
        }
    }
}

/// `llm` section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// Upstream LLM gateway base URL
    pub gateway: String,
    /// Model used when the request names none
    pub default_model: String,
    /// Group whose members may use the proxy (besides allow-listed VOs)
    pub access_group: String,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            gateway: "https://llm.dev.ai4eosc.eu/api".to_string(),
            default_model: "ai4eoscassistant".to_string(),
            access_group: "demo".to_string(),
        }
    }
}

/// Per-user resource caps for one VO
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ResourceCaps {
    /// CPU cores
    pub cpu_num: u64,
    /// GPU count
    pub gpu_num: u64,
    /// RAM in MB
    pub ram: u64,
    /// Disk in MB
    pub disk: u64,
    /// Number of live deployments
    pub deployment_num: u64,
}

impl Default for ResourceCaps {
    fn default() -> Self {
        Self {
            cpu_num: 32,
            gpu_num: 2,
            ram: 64_000,
            disk: 100_000,
            deployment_num: 10,
        }
    }
}

/// `quotas` section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QuotasSection {
    /// Per-VO per-user cap tables; VOs without an entry get the default
    pub per_user: HashMap<String, ResourceCaps>,
    /// Global per-user GPU cap, applied regardless of job kind
    pub gpu_per_user: u64,
    /// Whether dead-but-unpurged jobs count toward the totals
    pub count_dead_in_quota: bool,
    /// Tutorial VOs whose members get clamped hardware ranges and a lower
    /// priority band
    pub restricted: Vec<String>,
}

impl Default for QuotasSection {
    fn default() -> Self {
        Self {
            per_user: HashMap::new(),
            gpu_per_user: 2,
            count_dead_in_quota: false,
            restricted: Vec::new(),
        }
    }
}

/// `tryme` section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TryMeSection {
    /// VO whose namespace hosts all try-me jobs
    pub vo: String,
    /// Concurrent try-me jobs per user
    pub per_user: u64,
    /// Concurrent try-me jobs across the VO
    pub per_vo: u64,
    /// Refuse new demos when tagged nodes are above this usage fraction
    pub saturation: f64,
}

impl Default for TryMeSection {
    fn default() -> Self {
        Self {
            vo: String::new(),
            per_user: 3,
            per_vo: 25,
            saturation: 0.85,
        }
    }
}

/// `catalog` section
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogSection {
    /// URL of the module index document (name + repo URL pairs)
    pub modules_index: String,
    /// Branch-relative path of each item's metadata document
    #[serde(default = "default_metadata_file")]
    pub metadata_file: String,
    /// Allowed docker image prefixes; items outside are dropped
    pub allowed_registries: Vec<String>,
}

fn default_metadata_file() -> String {
    "metadata.json".to_string()
}

/// Read-only view of one VO's mapping (namespace, domains, endpoints)
#[derive(Debug, Clone, PartialEq)]
pub struct VoProfile<'a> {
    /// Scheduler namespace
    pub namespace: &'a str,
    /// Base domain for deployment endpoints
    pub domain: &'a str,
    /// Function-platform cluster, if the VO has one
    pub oscar: Option<&'a OscarCluster>,
    /// Experiment-tracking URL, if the VO has one
    pub mlflow: Option<&'a str>,
    /// Root of the VO's secret subtree
    pub secret_root: &'a str,
}

impl MainConfig {
    /// Load the main YAML file, substituting `${VAR}` from the environment
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let substituted = envsubst(&raw);
        let config: MainConfig =
            serde_yaml::from_str(&substituted).map_err(|e| ConfigError::Parse {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-section consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.vos.is_empty() {
            return Err(ConfigError::Invalid("auth.VO must not be empty".into()));
        }
        if self.auth.providers.is_empty() {
            return Err(ConfigError::Invalid("auth.OP must not be empty".into()));
        }
        for vo in &self.auth.vos {
            if !self.nomad.namespaces.contains_key(vo) {
                return Err(ConfigError::Invalid(format!(
                    "VO {vo} has no nomad.namespaces entry"
                )));
            }
            if !self.lb.domain.contains_key(vo) {
                return Err(ConfigError::Invalid(format!(
                    "VO {vo} has no lb.domain entry"
                )));
            }
        }
        if !self.tryme.vo.is_empty() && !self.auth.vos.contains(&self.tryme.vo) {
            return Err(ConfigError::Invalid(format!(
                "tryme.vo {} is not an allow-listed VO",
                self.tryme.vo
            )));
        }
        if !(0.0..=1.0).contains(&self.tryme.saturation) {
            return Err(ConfigError::Invalid(
                "tryme.saturation must be between 0 and 1".into(),
            ));
        }
        Ok(())
    }

    /// Whether a VO is on the allow-list
    pub fn knows_vo(&self, vo: &str) -> bool {
        self.auth.vos.iter().any(|v| v == vo)
    }

    /// VO mapping, or None for an unknown VO
    pub fn vo_profile<'a>(&'a self, vo: &str) -> Option<VoProfile<'a>> {
        Some(VoProfile {
            namespace: self.nomad.namespaces.get(vo)?.as_str(),
            domain: self.lb.domain.get(vo)?.as_str(),
            oscar: self.oscar.clusters.get(vo),
            mlflow: self.mlflow.get(vo).map(String::as_str),
            secret_root: self.vault.secret_root.as_str(),
        })
    }

    /// Per-user caps for a VO (defaults when the VO has no explicit table)
    pub fn caps_for(&self, vo: &str) -> ResourceCaps {
        self.quotas.per_user.get(vo).copied().unwrap_or_default()
    }

    /// Whether a docker image reference is inside the allowed registries
    pub fn image_allowed(&self, image: &str) -> bool {
        self.catalog
            .allowed_registries
            .iter()
            .any(|prefix| image.starts_with(prefix.as_str()))
    }
}

/// Replace `${VAR}` references with environment values.
///
/// Unset variables substitute to the empty string with a warning, matching
/// envsubst behavior on the config template.
fn envsubst(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(pos) = rest.find("${") {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 2..];
        match after.find('}') {
            Some(end) if after[..end].chars().all(is_env_name_char) && end > 0 => {
                let name = &after[..end];
                match std::env::var(name) {
                    Ok(value) => out.push_str(&value),
                    Err(_) => warn!(variable = name, "config references unset variable"),
                }
                rest = &after[end + 1..];
            }
            _ => {
                out.push_str("${");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn is_env_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

// =============================================================================
// Workload assets
// =============================================================================

/// One deployable LLM from the inference catalog
#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct LlmModel {
    /// Model identifier
    pub name: String,
    /// Model family
    pub family: String,
    /// License name
    pub license: String,
    /// Context window in tokens
    pub context_window: u64,
    /// Arguments passed to the serving engine
    #[serde(default)]
    pub args: Vec<String>,
    /// Whether pulling the weights requires a gated access token
    #[serde(default)]
    pub needs_hf_token: bool,
}

/// Job templates and user-config schemas loaded from the config directory
#[derive(Debug, Clone)]
pub struct WorkloadAssets {
    /// Module job template (also the base for batch jobs)
    pub module_template: String,
    /// Module user-config schema
    pub module_schema: ConfSchema,
    /// Batch job template
    pub batch_template: String,
    /// Per-tool job templates
    pub tool_templates: HashMap<String, String>,
    /// Per-tool user-config schemas
    pub tool_schemas: HashMap<String, ConfSchema>,
    /// Try-me job template
    pub tryme_template: String,
    /// Snapshot job template
    pub snapshot_template: String,
    /// Function-platform service definition template
    pub oscar_service_template: String,
    /// Static LLM catalog
    pub llm_models: Vec<LlmModel>,
}

impl WorkloadAssets {
    /// Load all assets from the config directory.
    ///
    /// Layout: `modules/{job.hcl.tpl,user.yaml}`, `batch/job.hcl.tpl`,
    /// `tools/<name>/{job.hcl.tpl,user.yaml}`, `try_me/job.hcl.tpl`,
    /// `snapshots/job.hcl.tpl`, `oscar/service.yaml`, `llm-models.yaml`.
    /// A missing asset is a fatal startup error.
    pub fn load(conf_dir: &Path) -> Result<Self, ConfigError> {
        let module_template = read_asset(&conf_dir.join("modules/job.hcl.tpl"))?;
        let module_schema = load_schema(&conf_dir.join("modules/user.yaml"))?;
        let batch_template = read_asset(&conf_dir.join("batch/job.hcl.tpl"))?;

        let mut tool_templates = HashMap::new();
        let mut tool_schemas = HashMap::new();
        let tools_dir = conf_dir.join("tools");
        let entries = std::fs::read_dir(&tools_dir).map_err(|e| ConfigError::Read {
            path: tools_dir.display().to_string(),
            message: e.to_string(),
        })?;
        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            tool_templates.insert(name.clone(), read_asset(&entry.path().join("job.hcl.tpl"))?);
            tool_schemas.insert(name, load_schema(&entry.path().join("user.yaml"))?);
        }

        let llm_path = conf_dir.join("llm-models.yaml");
        let llm_models: Vec<LlmModel> = serde_yaml::from_str(&read_asset(&llm_path)?)
            .map_err(|e| ConfigError::Parse {
                path: llm_path.display().to_string(),
                message: e.to_string(),
            })?;

        Ok(Self {
            module_template,
            module_schema,
            batch_template,
            tool_templates,
            tool_schemas,
            tryme_template: read_asset(&conf_dir.join("try_me/job.hcl.tpl"))?,
            snapshot_template: read_asset(&conf_dir.join("snapshots/job.hcl.tpl"))?,
            oscar_service_template: read_asset(&conf_dir.join("oscar/service.yaml"))?,
            llm_models,
        })
    }

    /// Names of all configured tools
    pub fn tool_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tool_schemas.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

fn read_asset(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

fn load_schema(path: &Path) -> Result<ConfSchema, ConfigError> {
    let raw = read_asset(path)?;
    ConfSchema::from_yaml(&raw).map_err(|e| ConfigError::Parse {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL_YAML: &str = r#"
self:
  domain: api.example.org
auth:
  CORS_origins:
    - https://dashboard.example.org
  OP:
    - https://aai.example.org/auth/realms/egi
  VO:
    - vo.a
    - vo.b
nomad:
  namespaces:
    vo.a: ai4eosc
    vo.b: imagine
lb:
  domain:
    vo.a: a.deploy.example
    vo.b: b.deploy.example
mlflow:
  vo.a: https://mlflow.a.example
catalog:
  modules_index: https://raw.example.org/catalog/MODULES.yml
  allowed_registries:
    - allowed/
    - registry.example.org/
"#;

    #[test]
    fn test_parse_minimal_config() {
        let config: MainConfig = serde_yaml::from_str(MINIMAL_YAML).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.domain, "api.example.org");
        assert_eq!(config.auth.vos, vec!["vo.a", "vo.b"]);
        assert!(config.knows_vo("vo.a"));
        assert!(!config.knows_vo("vo.c"));
    }

    #[test]
    fn test_vo_profile() {
        let config: MainConfig = serde_yaml::from_str(MINIMAL_YAML).unwrap();
        let profile = config.vo_profile("vo.a").unwrap();
        assert_eq!(profile.namespace, "ai4eosc");
        assert_eq!(profile.domain, "a.deploy.example");
        assert_eq!(profile.mlflow, Some("https://mlflow.a.example"));
        assert_eq!(profile.secret_root, "secrets");
        assert!(profile.oscar.is_none());
        assert!(config.vo_profile("vo.unknown").is_none());
    }

    #[test]
    fn test_validate_rejects_unmapped_vo() {
        let mut config: MainConfig = serde_yaml::from_str(MINIMAL_YAML).unwrap();
        config.auth.vos.push("vo.c".to_string());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("vo.c"));
    }

    #[test]
    fn test_image_allow_list() {
        let config: MainConfig = serde_yaml::from_str(MINIMAL_YAML).unwrap();
        assert!(config.image_allowed("allowed/demo-app"));
        assert!(config.image_allowed("registry.example.org/ns/app"));
        assert!(!config.image_allowed("evil/app"));
        assert!(!config.image_allowed("docker.io/allowed/app"));
    }

    #[test]
    fn test_caps_default_when_vo_has_no_table() {
        let config: MainConfig = serde_yaml::from_str(MINIMAL_YAML).unwrap();
        let caps = config.caps_for("vo.a");
        assert_eq!(caps.gpu_num, 2);
        assert_eq!(caps.deployment_num, 10);
    }

    #[test]
    fn test_envsubst_replaces_known_vars() {
        std::env::set_var("PAPI_TEST_DOMAIN", "real.example.org");
        let out = envsubst("domain: ${PAPI_TEST_DOMAIN}");
        assert_eq!(out, "domain: real.example.org");
    }

    #[test]
    fn test_envsubst_unset_var_becomes_empty() {
        std::env::remove_var("PAPI_TEST_UNSET");
        let out = envsubst("token: '${PAPI_TEST_UNSET}'");
        assert_eq!(out, "token: ''");
    }

    #[test]
    fn test_envsubst_leaves_non_var_braces() {
        let out = envsubst("pattern: ${not a var}");
        assert_eq!(out, "pattern: ${not a var}");
    }

    #[test]
    fn test_parse_bool_var() {
        std::env::set_var("PAPI_TEST_BOOL", "True");
        assert!(parse_bool_var("PAPI_TEST_BOOL").unwrap());
        std::env::set_var("PAPI_TEST_BOOL", "0");
        assert!(!parse_bool_var("PAPI_TEST_BOOL").unwrap());
        std::env::set_var("PAPI_TEST_BOOL", "maybe");
        assert!(parse_bool_var("PAPI_TEST_BOOL").is_err());
        std::env::remove_var("PAPI_TEST_BOOL");
        assert!(!parse_bool_var("PAPI_TEST_BOOL").unwrap());
    }

    #[test]
    fn test_llm_model_parsing() {
        let yaml = r#"
- name: small-chat
  family: llama
  license: apache-2.0
  context_window: 8192
  args: ["--max-model-len", "8192"]
- name: gated-model
  family: mistral
  license: research-only
  context_window: 32768
  needs_hf_token: true
"#;
        let models: Vec<LlmModel> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(models.len(), 2);
        assert!(!models[0].needs_hf_token);
        assert!(models[1].needs_hf_token);
        assert_eq!(models[1].context_window, 32768);
    }
}
