//! Deployment projection
//!
//! Translates scheduler jobs, allocations and evaluations into the
//! scheduler-independent deployment records the dashboard consumes, and
//! implements the list/get/delete flows on top of the client.
//!
//! Terminology warning: what PAPI calls a "deployment" is a scheduler
//! *job*, not a scheduler "deployment".

use std::collections::BTreeMap;

use chrono::DateTime;
use serde::Serialize;
use tracing::debug;

use papi_common::{Error, Result};

use crate::client::NomadClient;
use crate::types::{Allocation, Evaluation, Job, JobStub};

/// User-facing deployment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    /// Submitted, no allocation yet
    Queued,
    /// Allocation is being placed
    Starting,
    /// Main task running and healthy
    Running,
    /// A task died with a nonzero exit, or placement failed
    Error,
    /// Batch job finished successfully
    Complete,
    /// Node lost connection; transient
    Down,
    /// Stopped by the user
    Deleted,
}

impl DeploymentStatus {
    /// Stable lowercase identifier
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Queued => "queued",
            DeploymentStatus::Starting => "starting",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Error => "error",
            DeploymentStatus::Complete => "complete",
            DeploymentStatus::Down => "down",
            DeploymentStatus::Deleted => "deleted",
        }
    }

    /// Stuck states are purged on delete instead of gracefully stopped
    pub fn needs_purge(&self) -> bool {
        !matches!(self, DeploymentStatus::Running | DeploymentStatus::Starting)
    }
}

/// Resources of a deployment (allocated, or requested while queued)
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeploymentResources {
    /// CPU cores
    pub cpu_num: u64,
    /// CPU shares in MHz (0 before allocation)
    pub cpu_mhz: u64,
    /// GPU count
    pub gpu_num: u64,
    /// GPU model, when one is allocated
    pub gpu_model: Option<String>,
    /// Memory in MB
    pub memory_mb: u64,
    /// Disk in MB
    pub disk_mb: u64,
}

/// A deployment as served to users
#[derive(Debug, Clone, Serialize)]
pub struct Deployment {
    /// Deployment UUID (the scheduler job id)
    pub job_id: String,
    /// Kind-prefixed job name
    pub name: String,
    /// User-facing status
    pub status: DeploymentStatus,
    /// Owner subject
    pub owner: String,
    /// User-given title
    pub title: String,
    /// User-given description
    pub description: String,
    /// Container image of the main task
    pub docker_image: Option<String>,
    /// Command line of the main task
    pub docker_command: Option<String>,
    /// Submission time, `YYYY-MM-DD HH:MM:SS`
    pub submit_time: String,
    /// Allocated or requested resources
    pub resources: DeploymentResources,
    /// role -> URL
    pub endpoints: BTreeMap<String, String>,
    /// Endpoints answering liveness probes (filled on full info only)
    pub active_endpoints: Option<Vec<String>>,
    /// The quick-access endpoint role
    pub main_endpoint: Option<String>,
    /// Current allocation id, if any
    pub alloc_id: Option<String>,
    /// Datacenter the allocation landed in
    pub datacenter: Option<String>,
    /// Failure detail when status is error or down
    pub error_msg: Option<String>,
}

const DOWN_MSG: &str = "There seem to be network issues in the cluster. Please wait until the \
                        network is restored and you should be able to fully recover your deployment.";

const DOCKER_EXIT_MSG: &str = "Docker container exited with non-zero exit code: 1";

/// Server-side filter for a user's jobs of one kind
pub fn job_filter(prefix: &str, owner: &str, include_dead: bool) -> String {
    let mut filter = String::new();
    if !include_dead {
        filter.push_str("Status != \"dead\" and ");
    }
    filter.push_str(&format!(
        "Name matches \"^{prefix}\" and Meta is not empty and Meta.owner == \"{owner}\""
    ));
    filter
}

/// Pick the allocation that represents the deployment.
///
/// Recency alone is wrong after a network cut: when connectivity returns,
/// the temporary replacement allocation (now complete) is newer than the
/// recovered original (running). Unknown wins so users keep seeing the
/// original allocation while the node is disconnected.
pub fn select_allocation(allocs: &[Allocation]) -> Option<&Allocation> {
    if allocs.is_empty() {
        return None;
    }
    let mut ordered: Vec<&Allocation> = allocs.iter().collect();
    ordered.sort_by_key(|a| std::cmp::Reverse(a.create_time));

    for status in ["unknown", "running"] {
        if let Some(alloc) = ordered.iter().find(|a| a.client_status == status) {
            return Some(*alloc);
        }
    }
    ordered.first().copied()
}

/// Count reallocations: every allocation beyond the first is a reschedule
pub fn reallocation_count(allocs: &[Allocation]) -> u64 {
    allocs.len().saturating_sub(1) as u64
}

/// Extract endpoints from the routing tags of the job's services.
///
/// Tags carry `Host(\`url\`)` rules; the port label is the endpoint role.
pub fn endpoints_from_job(job: &Job) -> BTreeMap<String, String> {
    let mut endpoints = BTreeMap::new();
    let Some(group) = job.task_groups.first() else {
        return endpoints;
    };
    for service in &group.services {
        let url = service
            .tags
            .iter()
            .find_map(|tag| host_from_tag(tag))
            .unwrap_or_else(|| "missing-endpoint".to_string());

        // Older deployments exposed the API port as "deepaas"
        let role = if service.port_label == "deepaas" {
            "api".to_string()
        } else {
            service.port_label.clone()
        };
        endpoints.insert(role, format!("https://{url}"));
    }
    // The model API serves its web UI under /ui
    if let Some(api) = endpoints.get_mut("api") {
        api.push_str("/ui");
    }
    endpoints
}

fn host_from_tag(tag: &str) -> Option<String> {
    let start = tag.find("Host(`")? + "Host(`".len();
    let end = tag[start..].find('`')? + start;
    Some(tag[start..end].to_string())
}

/// Pick the quick-access endpoint from the container start command
pub fn main_endpoint(
    docker_command: Option<&str>,
    endpoints: &BTreeMap<String, String>,
) -> Option<String> {
    if let Some(command) = docker_command {
        if let Some(service) = command.split("deep-start --").nth(1) {
            let role = match service.trim() {
                "deepaas" => "api",
                "jupyter" | "vscode" => "ide",
                _ => "",
            };
            if endpoints.contains_key(role) {
                return Some(role.to_string());
            }
        }
    }
    endpoints.keys().next().cloned()
}

/// Resources reported before any allocation exists (the request itself)
pub fn requested_resources(job: &Job) -> DeploymentResources {
    let mut resources = DeploymentResources::default();
    if let Some(group) = job.task_groups.first() {
        if let Some(disk) = &group.ephemeral_disk {
            resources.disk_mb = disk.size_mb;
        }
    }
    if let Some(task) = job.main_task() {
        if let Some(request) = &task.resources {
            resources.cpu_num = request.cores;
            resources.memory_mb = request.memory_mb;
            if let Some(devices) = &request.devices {
                for device in devices {
                    if device.name.contains("gpu") {
                        resources.gpu_num += device.count;
                    }
                }
            }
        }
    }
    resources
}

/// Resources of a placed allocation
pub fn allocated_resources(alloc: &Allocation) -> DeploymentResources {
    let mut resources = DeploymentResources::default();
    let Some(allocated) = &alloc.allocated_resources else {
        return resources;
    };
    resources.disk_mb = allocated.shared.disk_mb;
    if let Some(main) = allocated.tasks.get("main") {
        resources.cpu_mhz = main.cpu.cpu_shares;
        resources.cpu_num = main
            .cpu
            .reserved_cores
            .as_ref()
            .map(|cores| cores.len() as u64)
            .unwrap_or(0);
        resources.memory_mb = main.memory.memory_mb;
        if let Some(devices) = &main.devices {
            if let Some(gpu) = devices.iter().find(|d| d.device_type == "gpu") {
                resources.gpu_num = gpu.device_ids.len() as u64;
                resources.gpu_model = Some(gpu.name.clone());
            }
        }
    }
    resources
}

/// Derive the user-facing status and failure message
pub fn derive_status(
    job: &Job,
    alloc: Option<&Allocation>,
    evals: &[Evaluation],
) -> (DeploymentStatus, Option<String>) {
    let placement_failure = evals
        .iter()
        .find_map(|e| e.failed_tg_allocs.as_ref())
        .map(|f| f.to_string());

    if job.status == "dead" {
        if job.job_type == "batch" && main_exited_cleanly(alloc) {
            return (DeploymentStatus::Complete, None);
        }
        if alloc.is_none() {
            if let Some(failure) = placement_failure {
                return (DeploymentStatus::Error, Some(failure));
            }
        }
        if let Some(a) = alloc {
            if a.client_status == "failed" {
                return (DeploymentStatus::Error, Some(failure_message(job, a)));
            }
        }
        return (DeploymentStatus::Deleted, None);
    }

    if let Some(a) = alloc {
        return match a.client_status.as_str() {
            "pending" => (DeploymentStatus::Starting, None),
            "unknown" | "lost" => (DeploymentStatus::Down, Some(DOWN_MSG.to_string())),
            "failed" => (DeploymentStatus::Error, Some(failure_message(job, a))),
            "complete" => {
                if main_exited_cleanly(Some(a)) {
                    (DeploymentStatus::Complete, None)
                } else {
                    (DeploymentStatus::Error, Some(failure_message(job, a)))
                }
            }
            "running" => {
                if any_task_failed(a) {
                    (DeploymentStatus::Error, Some(failure_message(job, a)))
                } else {
                    (DeploymentStatus::Running, None)
                }
            }
            other => {
                debug!(status = other, "unmapped allocation status");
                (DeploymentStatus::Starting, None)
            }
        };
    }

    match placement_failure {
        Some(failure) => (DeploymentStatus::Error, Some(failure)),
        None => (DeploymentStatus::Queued, None),
    }
}

fn any_task_failed(alloc: &Allocation) -> bool {
    alloc
        .task_states
        .as_ref()
        .map(|states| states.values().any(|s| s.failed))
        .unwrap_or(false)
}

fn main_exited_cleanly(alloc: Option<&Allocation>) -> bool {
    let Some(alloc) = alloc else {
        return false;
    };
    if alloc.client_status != "complete" {
        return false;
    }
    alloc
        .task_states
        .as_ref()
        .and_then(|states| states.get("main"))
        .map(|main| main.state == "dead" && !main.failed)
        .unwrap_or(false)
}

fn failure_message(job: &Job, alloc: &Allocation) -> String {
    let raw = alloc
        .task_states
        .as_ref()
        .and_then(|states| states.get("main"))
        .and_then(|main| main.events.first())
        .map(|event| event.best_message().to_string())
        .unwrap_or_else(|| "Task failed".to_string());

    if raw == DOCKER_EXIT_MSG {
        let command = job
            .main_task()
            .and_then(|t| t.config.as_ref())
            .map(docker_command_of)
            .unwrap_or_default();
        return format!(
            "An error seems to appear when running this Docker container. Try to run this \
             Docker locally with the command `{command}` to find what is the error or \
             contact the module owner."
        );
    }
    raw
}

fn docker_command_of(config: &crate::types::TaskConfig) -> String {
    let command = config.command.clone().unwrap_or_default();
    let args = config
        .args
        .as_ref()
        .map(|a| a.join(" "))
        .unwrap_or_default();
    format!("{command} {args}").trim().to_string()
}

/// Format scheduler nanosecond timestamps for users
pub fn format_submit_time(nanos: i64) -> String {
    DateTime::from_timestamp(nanos / 1_000_000_000, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default()
}

/// List a user's jobs of one kind in a namespace
pub async fn list_deployments(
    client: &NomadClient,
    namespace: &str,
    owner: &str,
    prefix: &str,
    include_dead: bool,
) -> Result<Vec<JobStub>> {
    client
        .list_jobs(namespace, &job_filter(prefix, owner, include_dead))
        .await
}

/// Fetch one deployment, verifying ownership.
///
/// With a probe client, every endpoint is checked for liveness (2 s
/// deadline each) and the responsive ones are listed in
/// `active_endpoints`; probing is skipped while the node is disconnected.
pub async fn get_deployment(
    client: &NomadClient,
    uuid: &str,
    namespace: &str,
    owner: &str,
    probe: Option<&reqwest::Client>,
) -> Result<Deployment> {
    let job = client
        .get_job(uuid, namespace)
        .await?
        .ok_or_else(|| Error::bad_request("deployment_uuid", "no deployment exists with this uuid"))?;

    if job.owner() != Some(owner) {
        return Err(Error::forbidden("you are not the owner of that deployment"));
    }

    let allocs = client.job_allocations(uuid, namespace).await?;
    let evals = client.job_evaluations(uuid, namespace).await?;
    let selected = select_allocation(&allocs);

    // The list endpoint returns trimmed allocations; fetch the chosen one
    // in full for its allocated resources.
    let full_alloc = match selected {
        Some(stub) => Some(client.get_allocation(&stub.id).await?),
        None => None,
    };

    let (status, error_msg) = derive_status(&job, full_alloc.as_ref(), &evals);

    let mut endpoints = endpoints_from_job(&job);
    let mut datacenter = None;
    if let Some(alloc) = &full_alloc {
        let node = client.get_node(&alloc.node_id).await?;
        datacenter = Some(node.datacenter.clone());
        // Tags may defer the domain to the landing node's metadata
        let domain = node.meta_value("domain").to_string();
        if !domain.is_empty() {
            for url in endpoints.values_mut() {
                *url = url.replace("${meta.domain}", &domain);
            }
        }
    }

    let resources = match &full_alloc {
        Some(alloc) => allocated_resources(alloc),
        None => requested_resources(&job),
    };

    let docker_image = job
        .main_task()
        .and_then(|t| t.config.as_ref())
        .and_then(|c| c.image.clone());
    let docker_command = job
        .main_task()
        .and_then(|t| t.config.as_ref())
        .map(docker_command_of);

    let mut active_endpoints = None;
    if let Some(probe) = probe {
        if status == DeploymentStatus::Down {
            active_endpoints = Some(Vec::new());
        } else {
            let mut active = Vec::new();
            for (role, url) in &endpoints {
                match probe.get(url).send().await {
                    Ok(response) if response.status().is_success() => active.push(role.clone()),
                    _ => {}
                }
            }
            active_endpoints = Some(active);
        }
    }

    Ok(Deployment {
        job_id: job.id.clone(),
        name: job.name.clone(),
        status,
        owner: owner.to_string(),
        title: job.meta_value("title").to_string(),
        description: job.meta_value("description").to_string(),
        docker_image,
        docker_command: docker_command.clone(),
        submit_time: format_submit_time(job.submit_time),
        resources,
        main_endpoint: main_endpoint(docker_command.as_deref(), &endpoints),
        endpoints,
        active_endpoints,
        alloc_id: full_alloc.map(|a| a.id),
        datacenter,
        error_msg,
    })
}

/// Delete a deployment, purging jobs stuck in a non-running state
pub async fn delete_deployment(
    client: &NomadClient,
    uuid: &str,
    namespace: &str,
    owner: &str,
) -> Result<()> {
    // Also verifies the job exists and the caller owns it
    let info = get_deployment(client, uuid, namespace, owner, None).await?;
    client
        .deregister_job(uuid, namespace, info.status.needs_purge())
        .await
}
