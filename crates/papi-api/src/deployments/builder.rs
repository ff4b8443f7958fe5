//! Deployment creation
//!
//! Implements the create protocol: resolve the catalog item, merge and
//! validate the user configuration, enforce the image allow-list and the
//! quota ledger, materialize secrets, render the job template, post-process
//! the parsed job (GPU and storage stanzas), and submit.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use papi_common::schema::{
    clamp_description, validate_hostname, validate_ide_password, validate_title, ConfSchema,
    UserConf,
};
use papi_common::template::{JobTemplate, SubstitutionMap};
use papi_common::{Error, Result, WorkloadKind};
use papi_nomad::deployments::endpoints_from_job;
use papi_nomad::types::Job;

use crate::auth::AuthInfo;
use crate::quotas;
use crate::state::AppState;

/// Answer to a successful create
#[derive(Debug, serde::Serialize)]
pub struct CreateResponse {
    /// The new deployment's UUID
    pub uuid: String,
    /// Predicted endpoint URLs (the job may still be queued)
    pub endpoints: BTreeMap<String, String>,
}

/// Tasks removed when the user brings no storage credentials
const STORAGE_TASKS: [&str; 3] = ["storage_mount", "storage_cleanup", "dataset_download"];

/// The workload's schema, clamped for the caller's VO
pub fn schema_for(state: &AppState, kind: WorkloadKind, name: &str, vo: &str) -> Result<ConfSchema> {
    let mut schema = match kind {
        WorkloadKind::Tool => state
            .assets
            .tool_schemas
            .get(name)
            .cloned()
            .ok_or_else(|| Error::unknown_workload("tool", name))?,
        _ => state.assets.module_schema.clone(),
    };
    quotas::limit_resources(&mut schema, vo, &state.config.quotas);
    Ok(schema)
}

/// The workload's job template source
pub fn template_for<'a>(state: &'a AppState, kind: WorkloadKind, name: &str) -> Result<&'a str> {
    match kind {
        WorkloadKind::Module => Ok(&state.assets.module_template),
        WorkloadKind::BatchInference => Ok(&state.assets.batch_template),
        WorkloadKind::Tool => state
            .assets
            .tool_templates
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| Error::unknown_workload("tool", name)),
        _ => Err(Error::internal(
            "deployments",
            format!("kind {kind} is not deployed through the deployment controller"),
        )),
    }
}

/// Merge a submitted configuration over the schema defaults and validate it
pub fn merge_and_validate(schema: &ConfSchema, submitted: Option<&Value>) -> Result<UserConf> {
    let conf = match submitted {
        Some(value) => schema.merge(value)?,
        None => schema.default_values(),
    };
    schema.validate(&conf)?;

    validate_title(conf.str("general", "title"))?;
    validate_hostname(conf.str("general", "hostname"))?;
    if schema.param("general", "jupyter_password").is_some() {
        validate_ide_password(conf.str("general", "jupyter_password"))?;
    }
    Ok(conf)
}

/// Enforce the image allow-list on a (possibly user-overridden) image
pub fn check_image_allowed(state: &AppState, conf: &UserConf) -> Result<()> {
    let image = conf.str("general", "docker_image");
    if image.is_empty() || state.config.image_allowed(image) {
        Ok(())
    } else {
        Err(Error::bad_request(
            "general.docker_image",
            format!("image {image} is outside the allowed registries"),
        ))
    }
}

/// Map the configuration into template placeholder values.
///
/// Keys are the uppercased parameter names; a handful of parameters carry
/// historical placeholder names (`desc`, `gpu_type`, the rclone family).
pub fn substitution_map(
    state: &AppState,
    auth: &AuthInfo,
    vo: &str,
    kind: WorkloadKind,
    job_uuid: &str,
    conf: &UserConf,
) -> Result<SubstitutionMap> {
    let profile = state
        .config
        .vo_profile(vo)
        .ok_or_else(|| Error::internal("deployments", format!("VO {vo} has no profile")))?;

    let mut map = SubstitutionMap::new();
    map.set("JOB_UUID", job_uuid)
        .set("NAMESPACE", profile.namespace)
        .set("PRIORITY", quotas::priority_for(kind, vo, &state.config.quotas))
        .set("OWNER", &auth.subject)
        .set("OWNER_NAME", &auth.name)
        .set("OWNER_EMAIL", &auth.email)
        .set("BASE_DOMAIN", profile.domain)
        .set("HOSTNAME", job_uuid)
        .set("VO", vo)
        .set("PROJECT_NAME", profile.namespace.to_uppercase())
        .set("MAILING_TOKEN", &state.env.mailing_token)
        .set("TODAY", chrono::Utc::now().date_naive())
        .set("MLFLOW_URI", profile.mlflow.unwrap_or(""));

    for (group, params) in &conf.groups {
        for (key, value) in params {
            let rendered = match value {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            };
            match (group.as_str(), key.as_str()) {
                ("general", "title") => {
                    let title: String = rendered.chars().take(45).collect();
                    map.set("TITLE", title);
                }
                ("general", "desc") => {
                    map.set("DESCRIPTION", clamp_description(&rendered));
                }
                // Custom hostnames are validated but reserved; deployments
                // are always reachable under their UUID
                ("general", "hostname") => {}
                ("hardware", "gpu_type") => {
                    map.set("GPU_MODELNAME", rendered);
                }
                ("storage", "rclone_url") => {
                    map.set("RCLONE_CONFIG_RSHARE_URL", rendered);
                }
                ("storage", "rclone_vendor") => {
                    map.set("RCLONE_CONFIG_RSHARE_VENDOR", rendered);
                }
                ("storage", "rclone_user") => {
                    map.set("RCLONE_CONFIG_RSHARE_USER", rendered);
                }
                ("storage", "rclone_password") => {
                    map.set("RCLONE_CONFIG_RSHARE_PASS", rendered);
                }
                ("storage", "rclone_conf") => {
                    map.set("RCLONE_CONFIG", rendered);
                }
                ("storage", "datasets") => {} // handled by task cloning
                _ => {
                    map.set(key.to_uppercase(), rendered);
                }
            }
        }
    }

    // Half the RAM, in bytes
    let ram = conf.u64("hardware", "ram");
    map.set("SHARED_MEMORY", ram * 1_000_000 / 2);

    Ok(map)
}

/// Fetch the secrets a workload depends on and fold them into the map
pub async fn resolve_secrets(
    state: &AppState,
    auth: &AuthInfo,
    vo: &str,
    template: &JobTemplate,
    map: &mut SubstitutionMap,
) -> Result<()> {
    let wanted: Vec<&str> = template.user_vars();

    if wanted.contains(&"MLFLOW_USERNAME") || wanted.contains(&"MLFLOW_PASSWORD") {
        let credentials = state
            .vault
            .get_secret(vo, &auth.subject, "services/mlflow/credentials")
            .await
            .unwrap_or_default()
            .unwrap_or_default();
        map.set(
            "MLFLOW_USERNAME",
            credentials["username"].as_str().unwrap_or(""),
        );
        map.set(
            "MLFLOW_PASSWORD",
            credentials["password"].as_str().unwrap_or(""),
        );
    }

    if wanted.contains(&"FEDERATED_TOKEN") {
        // The federated server reads its client token from the user's
        // secret tree; create a default one per deployment
        let token = random_token();
        let path = format!("deployments/{}/federated/default", map.get("JOB_UUID").unwrap_or(""));
        state
            .vault
            .put_secret(vo, &auth.subject, &path, &serde_json::json!({"token": token}))
            .await?;
        map.set("FEDERATED_TOKEN", token);
    }

    if wanted.contains(&"HARBOR_ROBOT_PASSWORD") {
        map.set(
            "HARBOR_ROBOT_PASSWORD",
            state.env.harbor_robot_password.as_deref().unwrap_or(""),
        );
        map.set("HARBOR_ROBOT_USER", &state.config.registry.robot_user);
    }

    // The storage sidecars expect the rclone password in obscured form
    let password = map.get("RCLONE_CONFIG_RSHARE_PASS").map(str::to_string);
    if let Some(password) = password.filter(|p| !p.is_empty()) {
        let obscured = obscure_rclone_password(state, &password).await?;
        map.set("RCLONE_CONFIG_RSHARE_PASS", obscured);
    }

    Ok(())
}

/// Obscure an rclone password via the rclone binary
async fn obscure_rclone_password(state: &AppState, password: &str) -> Result<String> {
    let output = tokio::process::Command::new("rclone")
        .arg("obscure")
        .arg(password)
        .output()
        .await;
    match output {
        Ok(output) if output.status.success() => {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        }
        Ok(output) => Err(Error::internal(
            "rclone",
            String::from_utf8_lossy(&output.stderr).to_string(),
        )),
        Err(err) if !state.env.is_prod => {
            warn!(error = %err, "rclone binary unavailable, storing password unobscured");
            Ok(password.to_string())
        }
        Err(err) => Err(Error::internal("rclone", err.to_string())),
    }
}

fn random_token() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Drop or relax the GPU stanza of the parsed job
pub fn apply_gpu_policy(job: &mut Job, gpu_num: u64, gpu_model: &str) {
    if gpu_num == 0 {
        if let Some(main) = job.main_task_mut() {
            if let Some(resources) = &mut main.resources {
                resources.devices = None;
            }
            main.set_env("NVIDIA_VISIBLE_DEVICES", "none");
        }
    } else if gpu_model.is_empty() {
        // No model requested: drop the model constraint so any GPU fits
        if let Some(devices) = job
            .main_task_mut()
            .and_then(|t| t.resources.as_mut())
            .and_then(|r| r.devices.as_mut())
        {
            if let Some(first) = devices.first_mut() {
                first.constraints = None;
            }
        }
    }
}

/// Prune or clone the storage sidecar tasks of the parsed job
pub fn apply_storage_policy(job: &mut Job, conf: &UserConf) {
    let rclone_complete = ["rclone_url", "rclone_vendor", "rclone_user", "rclone_password"]
        .iter()
        .all(|key| !conf.str("storage", key).is_empty());

    let Some(group) = job.task_groups.first_mut() else {
        return;
    };

    if !rclone_complete {
        group.tasks.retain(|t| !STORAGE_TASKS.contains(&t.name.as_str()));
        return;
    }

    // Clone the download task per requested dataset, then drop the template
    let datasets = dataset_dois(conf);
    if let Some(download) = group.tasks.iter().find(|t| t.name == "dataset_download").cloned() {
        for (index, doi) in datasets.iter().enumerate() {
            let mut task = download.clone();
            task.name = format!("dataset_download_{index}");
            task.set_env("DOI", doi.clone());
            task.set_env("FORCE_PULL", doi.clone());
            group.tasks.push(task);
        }
    }
    group.tasks.retain(|t| t.name != "dataset_download");
}

/// Datasets arrive as strings or `{doi: ...}` objects
fn dataset_dois(conf: &UserConf) -> Vec<String> {
    conf.get("storage", "datasets")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| {
                    entry
                        .as_str()
                        .map(str::to_string)
                        .or_else(|| entry["doi"].as_str().map(str::to_string))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// The full create protocol
pub async fn create_deployment(
    state: &AppState,
    auth: &AuthInfo,
    vo: &str,
    kind: WorkloadKind,
    name: &str,
    submitted: Option<&Value>,
) -> Result<CreateResponse> {
    // 1. Resolve the workload against the catalog
    let catalog_item = state
        .catalog_for(kind)
        .metadata(name)
        .await
        .map_err(|err| match err {
            Error::UnknownWorkload { .. } => Error::unknown_workload(kind.as_str(), name),
            other => other,
        })?;

    // 2. Merge and validate the configuration
    let schema = schema_for(state, kind, name, vo)?;
    let mut conf = merge_and_validate(&schema, submitted)?;
    if conf.str("general", "docker_image").is_empty() {
        conf.set(
            "general",
            "docker_image",
            Value::String(catalog_item.docker_image.clone()),
        );
    }

    // 3. Image allow-list (the user may have overridden the image)
    check_image_allowed(state, &conf)?;

    // 4. Quota admission against live deployments
    let profile = state
        .config
        .vo_profile(vo)
        .ok_or_else(|| Error::internal("deployments", format!("VO {vo} has no profile")))?;
    let namespace = profile.namespace.to_string();
    let usage = super::live_usage(state, auth, vo, kind).await?;
    let request = quotas::QuotaRequest::from_conf(&conf);
    quotas::check_userwise(&request, &usage, &state.config.caps_for(vo), &state.config.quotas)?;

    // 5-6. Assemble the substitution map, materialize secrets, render
    let job_uuid = Uuid::new_v4().to_string();
    let template = JobTemplate::parse(template_for(state, kind, name)?);
    let mut map = substitution_map(state, auth, vo, kind, &job_uuid, &conf)?;
    resolve_secrets(state, auth, vo, &template, &mut map).await?;
    let rendered = template
        .render(&map)
        .map_err(|e| Error::bad_request(e.placeholder().to_string(), e.to_string()))?;

    // 7. Parse, post-process, submit
    let mut job = state.nomad.parse_job(&rendered).await?;
    job.namespace = namespace;
    apply_gpu_policy(
        &mut job,
        conf.u64("hardware", "gpu_num"),
        conf.str("hardware", "gpu_type"),
    );
    apply_storage_policy(&mut job, &conf);

    // Submission runs detached so a client disconnect cannot cancel it
    // halfway: once posted, the create either returns the uuid or the job
    // exists and shows up in the next listing.
    let submission = {
        let nomad = state.nomad.clone();
        let job = job.clone();
        tokio::spawn(async move { nomad.register_job(&job).await })
    };
    submission
        .await
        .map_err(|e| Error::internal("deployments", e.to_string()))??;

    info!(uuid = %job_uuid, kind = %kind, vo = vo, owner = %auth.subject, "deployment submitted");

    // 8. Predicted endpoints, without waiting for the job to run
    Ok(CreateResponse {
        uuid: job_uuid,
        endpoints: endpoints_from_job(&job),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job_with_storage() -> Job {
        serde_json::from_value(json!({
            "ID": "u1",
            "Name": "module-u1",
            "Type": "service",
            "Namespace": "ai4eosc",
            "TaskGroups": [{
                "Name": "usergroup",
                "Tasks": [
                    {
                        "Name": "main",
                        "Config": {"image": "allowed/demo"},
                        "Resources": {
                            "Cores": 4,
                            "MemoryMB": 8000,
                            "Devices": [{
                                "Name": "gpu",
                                "Count": 1,
                                "Constraints": [{"LTarget": "${device.model}", "RTarget": "Tesla T4", "Operand": "="}]
                            }]
                        }
                    },
                    {"Name": "storage_mount"},
                    {"Name": "storage_cleanup"},
                    {"Name": "dataset_download", "Env": {"DOI": ""}}
                ],
                "Services": []
            }]
        }))
        .unwrap()
    }

    fn conf_with_storage(url: &str, datasets: Value) -> UserConf {
        let mut conf = UserConf::default();
        conf.set("storage", "rclone_url", json!(url));
        conf.set("storage", "rclone_vendor", json!("nextcloud"));
        conf.set("storage", "rclone_user", json!("alice"));
        conf.set("storage", "rclone_password", json!("secret"));
        conf.set("storage", "datasets", datasets);
        conf
    }

    #[test]
    fn test_gpu_policy_cpu_only_drops_devices() {
        let mut job = job_with_storage();
        apply_gpu_policy(&mut job, 0, "");
        let main = job.main_task().unwrap();
        assert!(main.resources.as_ref().unwrap().devices.is_none());
        assert_eq!(
            main.env.as_ref().unwrap().get("NVIDIA_VISIBLE_DEVICES").unwrap(),
            "none"
        );
    }

    #[test]
    fn test_gpu_policy_unpinned_model_drops_constraint() {
        let mut job = job_with_storage();
        apply_gpu_policy(&mut job, 1, "");
        let devices = job
            .main_task()
            .unwrap()
            .resources
            .as_ref()
            .unwrap()
            .devices
            .as_ref()
            .unwrap();
        assert!(devices[0].constraints.is_none());
        assert_eq!(devices[0].count, 1);
    }

    #[test]
    fn test_gpu_policy_pinned_model_keeps_constraint() {
        let mut job = job_with_storage();
        apply_gpu_policy(&mut job, 1, "Tesla T4");
        let devices = job
            .main_task()
            .unwrap()
            .resources
            .as_ref()
            .unwrap()
            .devices
            .as_ref()
            .unwrap();
        assert!(devices[0].constraints.is_some());
    }

    #[test]
    fn test_storage_policy_without_credentials_prunes_tasks() {
        let mut job = job_with_storage();
        apply_storage_policy(&mut job, &conf_with_storage("", json!([])));
        let names: Vec<&str> = job.task_groups[0].tasks.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["main"]);
    }

    #[test]
    fn test_storage_policy_clones_download_task_per_dataset() {
        let mut job = job_with_storage();
        let conf = conf_with_storage(
            "https://share.example/dav",
            json!([{"doi": "10.1/a"}, {"doi": "10.2/b"}]),
        );
        apply_storage_policy(&mut job, &conf);
        let names: Vec<&str> = job.task_groups[0].tasks.iter().map(|t| t.name.as_str()).collect();
        assert!(names.contains(&"storage_mount"));
        assert!(names.contains(&"dataset_download_0"));
        assert!(names.contains(&"dataset_download_1"));
        // The template task itself is always removed
        assert!(!names.contains(&"dataset_download"));

        let download = job.task_groups[0]
            .tasks
            .iter()
            .find(|t| t.name == "dataset_download_1")
            .unwrap();
        assert_eq!(download.env.as_ref().unwrap()["DOI"], "10.2/b");
    }

    #[test]
    fn test_storage_policy_with_credentials_no_datasets() {
        let mut job = job_with_storage();
        let conf = conf_with_storage("https://share.example/dav", json!([]));
        apply_storage_policy(&mut job, &conf);
        let names: Vec<&str> = job.task_groups[0].tasks.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["main", "storage_mount", "storage_cleanup"]);
    }

    #[test]
    fn test_dataset_doi_forms() {
        let conf = conf_with_storage("u", json!(["10.5/z", {"doi": "10.6/y"}]));
        assert_eq!(dataset_dois(&conf), vec!["10.5/z", "10.6/y"]);
    }

    #[test]
    fn test_random_token_shape() {
        let token = random_token();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, random_token());
    }
}
