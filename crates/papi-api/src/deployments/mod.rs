//! Deployment controller routes
//!
//! `/v1/deployments/{kind}` for the deployable kinds (module, tool,
//! batch-inference). Listing spans the caller's VOs; get/delete locate the
//! deployment across VOs when none is given. Creation runs the full
//! admission protocol in [`builder`].

pub mod builder;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use papi_common::{Error, Result, WorkloadKind};
use papi_nomad::deployments as nomad_deployments;
use papi_nomad::Deployment;

use crate::auth::{bearer_token, AuthInfo};
use crate::error::{ApiError, ApiResult};
use crate::quotas::{self, QuotaUsage};
use crate::state::AppState;

/// Routes of the deployment controller
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{kind}", get(list_handler).post(create_handler))
        .route("/{kind}/{uuid}", get(get_handler).delete(delete_handler))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    /// Comma-separated VO subset; defaults to all the caller's VOs
    vos: Option<String>,
    /// Probe endpoint liveness for each deployment (slower)
    #[serde(default)]
    full_info: bool,
}

#[derive(Debug, Deserialize)]
struct VoQuery {
    /// VO holding the deployment; searched across the caller's VOs when
    /// absent
    vo: Option<String>,
}

/// Resolve a route segment into a deployable kind
fn deployable_kind(segment: &str) -> Result<WorkloadKind> {
    WorkloadKind::from_route(segment)
        .filter(|kind| WorkloadKind::DEPLOYABLE.contains(kind))
        .ok_or_else(|| Error::unknown_workload("kind", segment))
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<AuthInfo> {
    let token = bearer_token(headers)?;
    state.oidc.validate(token).await
}

/// The prefixes whose jobs count toward a kind's user quota.
///
/// Modules and tools share one budget; batch jobs are accounted
/// separately.
fn quota_prefixes(kind: WorkloadKind) -> &'static [&'static str] {
    match kind {
        WorkloadKind::BatchInference => &["batch"],
        _ => &["module", "tool"],
    }
}

/// Aggregate the caller's live usage in a VO for admission checks
pub(crate) async fn live_usage(
    state: &AppState,
    auth: &AuthInfo,
    vo: &str,
    kind: WorkloadKind,
) -> Result<QuotaUsage> {
    let namespace = state
        .config
        .vo_profile(vo)
        .map(|p| p.namespace.to_string())
        .ok_or_else(|| Error::internal("quotas", format!("VO {vo} has no profile")))?;

    let include_dead = state.config.quotas.count_dead_in_quota;
    let mut deployments = Vec::new();
    for prefix in quota_prefixes(kind) {
        let stubs = nomad_deployments::list_deployments(
            &state.nomad,
            &namespace,
            &auth.subject,
            prefix,
            include_dead,
        )
        .await?;
        for stub in stubs {
            match nomad_deployments::get_deployment(
                &state.nomad,
                &stub.id,
                &namespace,
                &auth.subject,
                None,
            )
            .await
            {
                Ok(deployment) => deployments.push(deployment),
                Err(err) => warn!(uuid = %stub.id, error = %err, "skipping job in usage aggregation"),
            }
        }
    }
    Ok(quotas::aggregate_usage(&deployments))
}

/// List the caller's deployments of one kind across VOs, newest first
async fn list_for_user(
    state: &AppState,
    auth: &AuthInfo,
    vos: &[String],
    kind: WorkloadKind,
    full_info: bool,
) -> Result<Vec<Value>> {
    let probe = full_info.then_some(&state.probe);
    let mut out = Vec::new();
    for vo in vos {
        let Some(namespace) = state.config.vo_profile(vo).map(|p| p.namespace.to_string())
        else {
            continue;
        };
        let stubs = nomad_deployments::list_deployments(
            &state.nomad,
            &namespace,
            &auth.subject,
            kind.job_prefix(),
            false,
        )
        .await?;
        for stub in stubs {
            match nomad_deployments::get_deployment(
                &state.nomad,
                &stub.id,
                &namespace,
                &auth.subject,
                probe,
            )
            .await
            {
                Ok(mut deployment) => {
                    if !deployment.name.starts_with(kind.job_prefix()) {
                        continue;
                    }
                    out.push(decorate(kind, &mut deployment, vo));
                }
                Err(err) => {
                    warn!(uuid = %stub.id, error = %err, "skipping unreadable deployment")
                }
            }
        }
    }
    out.sort_by(|a, b| b["submit_time"].as_str().cmp(&a["submit_time"].as_str()));
    Ok(out)
}

/// Find a deployment by uuid: in the given VO, or across all of the
/// caller's VOs
async fn locate(
    state: &AppState,
    auth: &AuthInfo,
    vo: Option<&str>,
    uuid: &str,
    full_info: bool,
) -> Result<(String, Deployment)> {
    let probe = full_info.then_some(&state.probe);
    let vos = match vo {
        Some(vo) => {
            auth.check_vo(vo, &state.config)?;
            vec![vo.to_string()]
        }
        None => auth.resolve_vos(None, &state.config)?,
    };
    for vo in &vos {
        let Some(namespace) = state.config.vo_profile(vo).map(|p| p.namespace.to_string())
        else {
            continue;
        };
        match nomad_deployments::get_deployment(
            &state.nomad,
            uuid,
            &namespace,
            &auth.subject,
            probe,
        )
        .await
        {
            Ok(deployment) => return Ok((vo.clone(), deployment)),
            // Ownership violations surface immediately; an unknown uuid in
            // one VO may exist in the next
            Err(err @ Error::Forbidden { .. }) => return Err(err),
            Err(_) => continue,
        }
    }
    Err(Error::bad_request(
        "deployment_uuid",
        "no deployment exists with this uuid",
    ))
}

/// Tool id embedded in a job name (`tool-<id>-<uuid>`)
fn tool_name_of(job_name: &str) -> Option<&str> {
    let rest = job_name.strip_prefix("tool-")?;
    // The trailing uuid is 36 chars plus the separating hyphen
    if rest.len() > 37 {
        Some(&rest[..rest.len() - 37])
    } else {
        None
    }
}

/// Kind-specific response shaping
fn decorate(kind: WorkloadKind, deployment: &mut Deployment, vo: &str) -> Value {
    if kind == WorkloadKind::Tool {
        if let Some(tool) = tool_name_of(&deployment.name).map(str::to_string) {
            // Some tools expose internal endpoints that users should not
            // open directly
            let ignored: &[&str] = if tool.ends_with("cvat") {
                &["server", "grafana"]
            } else if tool.ends_with("nvflare") {
                &["server-admin", "server-fl"]
            } else {
                &[]
            };
            deployment.endpoints.retain(|role, _| !ignored.contains(&role.as_str()));
            if let Some(active) = &mut deployment.active_endpoints {
                active.retain(|role| !ignored.contains(&role.as_str()));
            }

            let mut value = serde_json::to_value(&*deployment).unwrap_or_default();
            value["tool_name"] = Value::String(tool);
            value["vo"] = Value::String(vo.to_string());
            return value;
        }
    }
    let mut value = serde_json::to_value(&*deployment).unwrap_or_default();
    value["vo"] = Value::String(vo.to_string());
    value
}

async fn list_handler(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Query(query): Query<ListQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<Value>>> {
    let kind = deployable_kind(&kind)?;
    let auth = authenticate(&state, &headers).await?;
    let requested: Option<Vec<String>> = query
        .vos
        .map(|vos| vos.split(',').map(str::trim).map(str::to_string).collect());
    let vos = auth.resolve_vos(requested.as_deref(), &state.config)?;
    let deployments = list_for_user(&state, &auth, &vos, kind, query.full_info).await?;
    Ok(Json(deployments))
}

async fn get_handler(
    State(state): State<AppState>,
    Path((kind, uuid)): Path<(String, String)>,
    Query(query): Query<VoQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let kind = deployable_kind(&kind)?;
    let auth = authenticate(&state, &headers).await?;
    let (vo, mut deployment) = locate(&state, &auth, query.vo.as_deref(), &uuid, true).await?;
    if !deployment.name.starts_with(kind.job_prefix()) {
        return Err(ApiError(Error::bad_request(
            "deployment_uuid",
            format!("this deployment is not a {kind}"),
        )));
    }
    Ok(Json(decorate(kind, &mut deployment, &vo)))
}

async fn create_handler(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Query(query): Query<VoQuery>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> ApiResult<(StatusCode, Json<builder::CreateResponse>)> {
    let kind = deployable_kind(&kind)?;
    let auth = authenticate(&state, &headers).await?;

    let vo = match query.vo {
        Some(vo) => vo,
        None => auth
            .resolve_vos(None, &state.config)?
            .into_iter()
            .next()
            .expect("resolve_vos never returns an empty set"),
    };
    auth.check_vo(&vo, &state.config)?;

    let name = body
        .get("name")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::bad_request("name", "the request body must name a workload"))?;
    let mut conf = body;
    if let Some(object) = conf.as_object_mut() {
        object.remove("name");
    }
    let submitted = (!conf.is_null()).then_some(&conf);

    let response = builder::create_deployment(&state, &auth, &vo, kind, &name, submitted).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

async fn delete_handler(
    State(state): State<AppState>,
    Path((kind, uuid)): Path<(String, String)>,
    Query(query): Query<VoQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let kind = deployable_kind(&kind)?;
    let auth = authenticate(&state, &headers).await?;
    let (vo, deployment) = locate(&state, &auth, query.vo.as_deref(), &uuid, false).await?;
    if !deployment.name.starts_with(kind.job_prefix()) {
        return Err(ApiError(Error::bad_request(
            "deployment_uuid",
            format!("this deployment is not a {kind}"),
        )));
    }
    let namespace = state
        .config
        .vo_profile(&vo)
        .map(|p| p.namespace.to_string())
        .ok_or_else(|| Error::internal("deployments", format!("VO {vo} has no profile")))?;
    nomad_deployments::delete_deployment(&state.nomad, &uuid, &namespace, &auth.subject).await?;
    Ok(Json(serde_json::json!({"status": "success"})))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deployable_kind_parsing() {
        assert_eq!(deployable_kind("module").unwrap(), WorkloadKind::Module);
        assert_eq!(deployable_kind("modules").unwrap(), WorkloadKind::Module);
        assert_eq!(deployable_kind("tool").unwrap(), WorkloadKind::Tool);
        assert_eq!(
            deployable_kind("batch").unwrap(),
            WorkloadKind::BatchInference
        );
        // Non-deployable kinds have their own routes
        assert!(deployable_kind("try-me").is_err());
        assert!(deployable_kind("snapshot").is_err());
        assert!(deployable_kind("gibberish").is_err());
    }

    #[test]
    fn test_quota_prefixes() {
        assert_eq!(quota_prefixes(WorkloadKind::Module), &["module", "tool"]);
        assert_eq!(quota_prefixes(WorkloadKind::Tool), &["module", "tool"]);
        assert_eq!(quota_prefixes(WorkloadKind::BatchInference), &["batch"]);
    }

    #[test]
    fn test_tool_name_extraction() {
        assert_eq!(
            tool_name_of("tool-fl-1c0be4b5-67f6-4583-b786-64bc2f197f52"),
            Some("fl")
        );
        assert_eq!(
            tool_name_of("tool-ai4os-cvat-1c0be4b5-67f6-4583-b786-64bc2f197f52"),
            Some("ai4os-cvat")
        );
        assert_eq!(tool_name_of("module-1c0be4b5"), None);
        assert_eq!(tool_name_of("tool-short"), None);
    }
}
