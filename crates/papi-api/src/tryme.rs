//! Try-me sandboxes
//!
//! Short-lived anonymous demo deployments: CPU-only, a fixed small
//! envelope, a ten-minute lifetime baked into the template, and tight
//! concurrency caps. Any authenticated user may try a module, VO
//! membership is not required; all demos land in one fixed namespace.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use papi_common::template::{JobTemplate, SubstitutionMap};
use papi_common::{Error, Result};
use papi_nomad::deployments as nomad_deployments;

use crate::auth::bearer_token;
use crate::deployments::builder::CreateResponse;
use crate::error::ApiResult;
use crate::state::AppState;

/// Try-me routes (demos run on the scheduler backend)
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/nomad", get(list_handler).post(create_handler))
        .route("/nomad/{uuid}", get(get_handler).delete(delete_handler))
}

#[derive(Debug, Deserialize)]
struct CreateQuery {
    /// Module to demo
    module_name: String,
    /// Optional title shown in the dashboard
    #[serde(default)]
    title: String,
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    full_info: bool,
}

fn tryme_namespace(state: &AppState) -> Result<(String, String)> {
    let vo = &state.config.tryme.vo;
    let profile = state
        .config
        .vo_profile(vo)
        .ok_or_else(|| Error::internal("tryme", "no try-me VO is configured"))?;
    Ok((vo.clone(), profile.namespace.to_string()))
}

/// Refuse demos when the tagged nodes are close to saturation: these jobs
/// cannot be left queueing, the whole point is instant feedback
fn check_capacity(state: &AppState, stats: &crate::stats::ClusterStats) -> Result<()> {
    let threshold = state.config.tryme.saturation;
    let mut cpu = (0u64, 0u64);
    let mut ram = (0u64, 0u64);
    let mut disk = (0u64, 0u64);
    for node in stats.nodes.values() {
        if node.status != "ready" || !node.tags.iter().any(|t| t == "tryme") {
            continue;
        }
        cpu = (cpu.0 + node.cpu_used, cpu.1 + node.cpu_total);
        ram = (ram.0 + node.ram_used, ram.1 + node.ram_total);
        disk = (disk.0 + node.disk_used, disk.1 + node.disk_total);
    }
    for (used, total) in [cpu, ram, disk] {
        if total == 0 || used as f64 / total as f64 > threshold {
            let percent = (threshold * 100.0) as u64;
            let current = if total == 0 {
                100
            } else {
                used * 100 / total
            };
            return Err(Error::quota("tryme-capacity", percent, current));
        }
    }
    Ok(())
}

async fn list_handler(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<Value>>> {
    let auth = state.oidc.validate(bearer_token(&headers)?).await?;
    let (_, namespace) = tryme_namespace(&state)?;

    let probe = query.full_info.then_some(&state.probe);
    let stubs =
        nomad_deployments::list_deployments(&state.nomad, &namespace, &auth.subject, "try", false)
            .await?;
    let mut out = Vec::new();
    for stub in stubs {
        if let Ok(deployment) = nomad_deployments::get_deployment(
            &state.nomad,
            &stub.id,
            &namespace,
            &auth.subject,
            probe,
        )
        .await
        {
            out.push(serde_json::to_value(deployment).unwrap_or_default());
        }
    }
    out.sort_by(|a, b| b["submit_time"].as_str().cmp(&a["submit_time"].as_str()));
    Ok(Json(out))
}

async fn get_handler(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let auth = state.oidc.validate(bearer_token(&headers)?).await?;
    let (_, namespace) = tryme_namespace(&state)?;

    let deployment = nomad_deployments::get_deployment(
        &state.nomad,
        &uuid,
        &namespace,
        &auth.subject,
        Some(&state.probe),
    )
    .await?;
    let mut value = serde_json::to_value(deployment).unwrap_or_default();
    // Demos open straight into the web UI
    value["main_endpoint"] = Value::String("ui".to_string());
    Ok(Json(value))
}

async fn create_handler(
    State(state): State<AppState>,
    Query(query): Query<CreateQuery>,
    headers: HeaderMap,
) -> ApiResult<(StatusCode, Json<CreateResponse>)> {
    let auth = state.oidc.validate(bearer_token(&headers)?).await?;
    let (vo, namespace) = tryme_namespace(&state)?;

    // Demos always run the catalog image, never a user override
    let metadata = state.modules.metadata(&query.module_name).await?;

    check_capacity(&state, state.cluster_stats.get().await.as_ref())?;

    // Per-user concurrency cap
    let mine =
        nomad_deployments::list_deployments(&state.nomad, &namespace, &auth.subject, "try", false)
            .await?;
    let per_user = state.config.tryme.per_user;
    if mine.len() as u64 >= per_user {
        return Err(Error::quota("tryme-concurrency", per_user, mine.len() as u64).into());
    }

    // Per-VO concurrency cap
    let everyone = state
        .nomad
        .list_jobs(
            &namespace,
            "Status != \"dead\" and Name matches \"^try\"",
        )
        .await?;
    let per_vo = state.config.tryme.per_vo;
    if everyone.len() as u64 >= per_vo {
        return Err(Error::quota("tryme-vo-concurrency", per_vo, everyone.len() as u64).into());
    }

    let job_uuid = Uuid::new_v4().to_string();
    let profile = state
        .config
        .vo_profile(&vo)
        .ok_or_else(|| Error::internal("tryme", "try-me VO lost its profile"))?;

    let title: String = query.title.chars().take(45).collect();
    let mut map = SubstitutionMap::new();
    map.set("JOB_UUID", &job_uuid)
        .set("NAMESPACE", &namespace)
        .set("TITLE", title)
        .set("OWNER", &auth.subject)
        .set("OWNER_NAME", &auth.name)
        .set("OWNER_EMAIL", &auth.email)
        .set("BASE_DOMAIN", profile.domain)
        .set("HOSTNAME", &job_uuid)
        .set("DOCKER_IMAGE", &metadata.docker_image);

    let template = JobTemplate::parse(&state.assets.tryme_template);
    let rendered = template
        .render(&map)
        .map_err(|e| Error::internal("tryme", e.to_string()))?;

    let mut job = state.nomad.parse_job(&rendered).await?;
    job.namespace = namespace;
    state.nomad.register_job(&job).await?;

    info!(uuid = %job_uuid, module = %query.module_name, owner = %auth.subject, "try-me submitted");

    Ok((
        StatusCode::CREATED,
        Json(CreateResponse {
            uuid: job_uuid,
            endpoints: nomad_deployments::endpoints_from_job(&job),
        }),
    ))
}

async fn delete_handler(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let auth = state.oidc.validate(bearer_token(&headers)?).await?;
    let (_, namespace) = tryme_namespace(&state)?;
    nomad_deployments::delete_deployment(&state.nomad, &uuid, &namespace, &auth.subject).await?;
    Ok(Json(serde_json::json!({"status": "success"})))
}
