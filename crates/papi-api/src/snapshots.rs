//! Snapshot orchestrator
//!
//! A snapshot commits a running deployment's main container to the image
//! registry. The work happens in a scheduler batch job pinned to the node
//! hosting the target allocation: it locates the container, refuses
//! filesystems over 10 GiB, commits the image with provenance labels and
//! pushes it under the user's registry repository tagged
//! `<jobID>_<timestamp>`.

use std::collections::HashMap;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use papi_common::template::{JobTemplate, SubstitutionMap};
use papi_common::{Error, Result};
use papi_nomad::deployments as nomad_deployments;
use papi_nomad::types::{Allocation, TaskState};
use papi_nomad::DeploymentStatus;

use crate::auth::bearer_token;
use crate::error::ApiResult;
use crate::state::AppState;

/// Per-user snapshot storage quota, in bytes
const STORAGE_QUOTA_BYTES: u64 = 15 * 1024 * 1024 * 1024;

/// Containers over this size are refused by the snapshot job
const MAX_CONTAINER_BYTES: u64 = 10 * 1024 * 1024 * 1024;

/// Snapshot routes (merged at the version root)
pub fn router() -> Router<AppState> {
    Router::new().route(
        "/snapshots",
        get(list_handler).post(create_handler).delete(delete_handler),
    )
}

/// One snapshot, completed (registry) or in flight (scheduler)
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotRecord {
    /// Snapshot id, `<jobID>_<timestamp>`
    pub snapshot_id: String,
    /// complete | in progress | starting | failed
    pub status: String,
    /// Failure detail, when failed
    pub error_msg: Option<String>,
    /// Submission time
    pub submit_time: String,
    /// Size in bytes (completed snapshots only)
    pub size: Option<u64>,
    /// Title of the snapshotted deployment
    pub title: Option<String>,
    /// Description of the snapshotted deployment
    pub description: Option<String>,
    /// Scheduler job id of the in-flight snapshot job
    pub nomad_id: Option<String>,
    /// Image reference of the completed snapshot
    pub docker_image: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    vos: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateQuery {
    vo: String,
    deployment_uuid: String,
}

#[derive(Debug, Deserialize)]
struct DeleteQuery {
    vo: String,
    snapshot_uuid: String,
}

/// Completed snapshots, read from the registry's label-filtered artifacts
async fn harbor_snapshots(
    state: &AppState,
    owner: &str,
    vo: &str,
) -> Result<Vec<SnapshotRecord>> {
    let artifacts = state.harbor.list_artifacts(owner).await?;
    let image = state.harbor.image_for(owner);
    Ok(artifacts
        .iter()
        .filter(|artifact| artifact.label("VO") == vo)
        .filter_map(|artifact| {
            Some(SnapshotRecord {
                snapshot_id: artifact.snapshot_id()?.to_string(),
                status: "complete".to_string(),
                error_msg: None,
                submit_time: artifact.label("DATE").to_string(),
                size: Some(artifact.size),
                title: Some(artifact.label("TITLE").to_string()),
                description: Some(artifact.label("DESCRIPTION").to_string()),
                nomad_id: None,
                docker_image: Some(image.clone()),
            })
        })
        .collect())
}

/// Derive the status of an in-flight snapshot job from its two task states
fn snapshot_job_status(
    client_status: Option<&str>,
    tasks: &HashMap<String, TaskState>,
) -> (String, Option<String>) {
    let size = tasks.get("check-container-size");
    let upload = tasks.get("upload-image-registry");

    if size.map(|t| t.failed).unwrap_or(false) {
        return (
            "failed".to_string(),
            Some(
                "The deployment is too big to make a snapshot. Please delete some data to \
                 make it lighter."
                    .to_string(),
            ),
        );
    }
    if upload.map(|t| t.failed).unwrap_or(false) {
        return (
            "failed".to_string(),
            Some("Upload failed. Please contact support.".to_string()),
        );
    }
    let running = |t: Option<&TaskState>| t.map(|t| t.state == "running").unwrap_or(false);
    if running(size) || running(upload) {
        return ("in progress".to_string(), None);
    }
    if client_status == Some("pending") || size.is_none() || upload.is_none() {
        return ("starting".to_string(), None);
    }
    // Completed snapshot jobs are served from the registry instead
    (String::new(), None)
}

/// In-flight and failed snapshots, read from the scheduler
async fn nomad_snapshots(state: &AppState, owner: &str, vo: &str) -> Result<Vec<SnapshotRecord>> {
    let namespace = state
        .config
        .vo_profile(vo)
        .map(|p| p.namespace.to_string())
        .ok_or_else(|| Error::internal("snapshots", format!("VO {vo} has no profile")))?;

    let stubs =
        nomad_deployments::list_deployments(&state.nomad, &namespace, owner, "snapshot", true)
            .await?;

    let mut records = Vec::new();
    for stub in stubs {
        let Some(job) = state.nomad.get_job(&stub.id, &namespace).await? else {
            continue;
        };
        let allocs = state.nomad.job_allocations(&stub.id, &namespace).await?;
        let latest: Option<&Allocation> =
            allocs.iter().max_by_key(|a| a.create_time);
        let tasks = latest
            .and_then(|a| a.task_states.clone())
            .unwrap_or_default();
        let (status, error_msg) =
            snapshot_job_status(latest.map(|a| a.client_status.as_str()), &tasks);
        if status.is_empty() {
            continue;
        }
        records.push(SnapshotRecord {
            snapshot_id: job.meta_value("snapshot_id").to_string(),
            status,
            error_msg,
            submit_time: job.meta_value("submit_time").to_string(),
            size: None,
            title: Some(job.meta_value("title").to_string()),
            description: None,
            nomad_id: Some(stub.id.clone()),
            docker_image: None,
        });
    }
    Ok(records)
}

async fn list_handler(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<SnapshotRecord>>> {
    let auth = state.oidc.validate(bearer_token(&headers)?).await?;
    let requested: Option<Vec<String>> = query
        .vos
        .map(|vos| vos.split(',').map(str::trim).map(str::to_string).collect());
    let vos = auth.resolve_vos(requested.as_deref(), &state.config)?;

    let mut snapshots = Vec::new();
    for vo in &vos {
        snapshots.extend(harbor_snapshots(&state, &auth.subject, vo).await?);
        snapshots.extend(nomad_snapshots(&state, &auth.subject, vo).await?);
    }
    Ok(Json(snapshots))
}

async fn create_handler(
    State(state): State<AppState>,
    Query(query): Query<CreateQuery>,
    headers: HeaderMap,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let auth = state.oidc.validate(bearer_token(&headers)?).await?;
    auth.check_vo(&query.vo, &state.config)?;

    let namespace = state
        .config
        .vo_profile(&query.vo)
        .map(|p| p.namespace.to_string())
        .ok_or_else(|| Error::internal("snapshots", "VO has no profile"))?;

    // Storage quota: the sum of the user's snapshot sizes in the registry
    let existing = harbor_snapshots(&state, &auth.subject, &query.vo).await?;
    let total: u64 = existing.iter().filter_map(|s| s.size).sum();
    if total > STORAGE_QUOTA_BYTES {
        return Err(Error::quota("snapshot-storage", STORAGE_QUOTA_BYTES, total).into());
    }

    // One in-flight snapshot per deployment: concurrent submissions would
    // mint the same `<jobID>_<timestamp>` tag
    let in_flight = nomad_snapshots(&state, &auth.subject, &query.vo).await?;
    if in_flight
        .iter()
        .any(|s| s.snapshot_id.starts_with(&query.deployment_uuid))
    {
        return Err(Error::bad_request(
            "deployment_uuid",
            "a snapshot of this deployment is already in progress",
        )
        .into());
    }

    // The target must be running, and we need its allocation for node
    // pinning
    let target = nomad_deployments::get_deployment(
        &state.nomad,
        &query.deployment_uuid,
        &namespace,
        &auth.subject,
        None,
    )
    .await?;
    if target.status != DeploymentStatus::Running {
        return Err(Error::bad_request(
            "deployment_uuid",
            "you cannot make a snapshot of a deployment that is not running",
        )
        .into());
    }
    if target.resources.disk_mb * 1_000_000 > MAX_CONTAINER_BYTES {
        return Err(Error::bad_request(
            "deployment_uuid",
            "too-large: the container filesystem exceeds the 10 GiB snapshot limit",
        )
        .into());
    }
    let alloc_id = target
        .alloc_id
        .as_deref()
        .ok_or_else(|| Error::internal("snapshots", "running deployment has no allocation"))?;
    let alloc = state.nomad.get_allocation(alloc_id).await?;

    let now = chrono::Utc::now();
    let timestamp = now.timestamp().to_string();
    let snapshot_id = format!("{}_{timestamp}", query.deployment_uuid);

    let mut map = SubstitutionMap::new();
    map.set("JOB_UUID", Uuid::new_v4())
        .set("NAMESPACE", &namespace)
        .set("OWNER", &auth.subject)
        .set("OWNER_NAME", &auth.name)
        .set("OWNER_EMAIL", &auth.email)
        .set("TARGET_NODE_ID", &alloc.node_id)
        .set("TARGET_JOB_ID", &query.deployment_uuid)
        .set("FORMATTED_OWNER", crate::clients::HarborClient::repository_for(&auth.subject))
        .set("TIMESTAMP", &timestamp)
        .set("SNAPSHOT_ID", &snapshot_id)
        .set("TITLE", &target.title)
        .set("DESCRIPTION", &target.description)
        .set("SUBMIT_TIME", now.format("%Y-%m-%d %H:%M:%S").to_string())
        .set("HARBOR_ROBOT_USER", &state.config.registry.robot_user)
        .set(
            "HARBOR_ROBOT_PASSWORD",
            state.env.harbor_robot_password.as_deref().unwrap_or(""),
        )
        .set("VO", &query.vo);

    let template = JobTemplate::parse(&state.assets.snapshot_template);
    let rendered = template
        .render(&map)
        .map_err(|e| Error::internal("snapshots", e.to_string()))?;
    let mut job = state.nomad.parse_job(&rendered).await?;
    job.namespace = namespace;
    state.nomad.register_job(&job).await?;

    info!(snapshot = %snapshot_id, owner = %auth.subject, "snapshot job submitted");

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "status": "success",
            "snapshot_id": snapshot_id,
        })),
    ))
}

async fn delete_handler(
    State(state): State<AppState>,
    Query(query): Query<DeleteQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    let auth = state.oidc.validate(bearer_token(&headers)?).await?;
    auth.check_vo(&query.vo, &state.config)?;

    // Completed snapshots live in the registry
    let completed = harbor_snapshots(&state, &auth.subject, &query.vo).await?;
    if completed.iter().any(|s| s.snapshot_id == query.snapshot_uuid) {
        state
            .harbor
            .delete_artifact(&auth.subject, &query.snapshot_uuid)
            .await?;
        return Ok(Json(serde_json::json!({"status": "success"})));
    }

    // In-flight snapshots are scheduler jobs; purge them
    let in_flight = nomad_snapshots(&state, &auth.subject, &query.vo).await?;
    if let Some(record) = in_flight
        .iter()
        .find(|s| s.snapshot_id == query.snapshot_uuid)
    {
        let namespace = state
            .config
            .vo_profile(&query.vo)
            .map(|p| p.namespace.to_string())
            .ok_or_else(|| Error::internal("snapshots", "VO has no profile"))?;
        let nomad_id = record
            .nomad_id
            .as_deref()
            .ok_or_else(|| Error::internal("snapshots", "in-flight snapshot has no job id"))?;
        state.nomad.deregister_job(nomad_id, &namespace, true).await?;
        return Ok(Json(serde_json::json!({"status": "success"})));
    }

    Err(Error::bad_request(
        "snapshot_uuid",
        "the UUID does not correspond to any of your available snapshots",
    )
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(state: &str, failed: bool) -> TaskState {
        serde_json::from_value(serde_json::json!({
            "State": state,
            "Failed": failed,
            "Events": []
        }))
        .unwrap()
    }

    #[test]
    fn test_oversize_container_fails_the_size_check_task() {
        let tasks = HashMap::from([
            ("check-container-size".to_string(), task("dead", true)),
            ("upload-image-registry".to_string(), task("pending", false)),
        ]);
        let (status, msg) = snapshot_job_status(Some("failed"), &tasks);
        assert_eq!(status, "failed");
        assert!(msg.unwrap().contains("too big"));
    }

    #[test]
    fn test_upload_failure() {
        let tasks = HashMap::from([
            ("check-container-size".to_string(), task("dead", false)),
            ("upload-image-registry".to_string(), task("dead", true)),
        ]);
        let (status, msg) = snapshot_job_status(Some("failed"), &tasks);
        assert_eq!(status, "failed");
        assert!(msg.unwrap().contains("Upload failed"));
    }

    #[test]
    fn test_in_progress_while_uploading() {
        let tasks = HashMap::from([
            ("check-container-size".to_string(), task("dead", false)),
            ("upload-image-registry".to_string(), task("running", false)),
        ]);
        let (status, _) = snapshot_job_status(Some("running"), &tasks);
        assert_eq!(status, "in progress");
    }

    #[test]
    fn test_starting_before_tasks_exist() {
        let (status, _) = snapshot_job_status(Some("pending"), &HashMap::new());
        assert_eq!(status, "starting");
    }

    #[test]
    fn test_finished_jobs_are_hidden() {
        // Both tasks dead and clean: the snapshot shows up in the registry
        // listing instead
        let tasks = HashMap::from([
            ("check-container-size".to_string(), task("dead", false)),
            ("upload-image-registry".to_string(), task("dead", false)),
        ]);
        let (status, _) = snapshot_job_status(Some("complete"), &tasks);
        assert!(status.is_empty());
    }

    #[test]
    fn test_quota_constants() {
        assert_eq!(STORAGE_QUOTA_BYTES, 16_106_127_360);
        assert_eq!(MAX_CONTAINER_BYTES, 10_737_418_240);
    }
}
