//! Catalog routes
//!
//! Public read surface (list, detail, tags, metadata, config) plus an
//! admin-only cache refresh.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use papi_common::schema::ConfSchema;
use papi_common::{Error, Result, WorkloadKind};
use papi_nomad::nodes::gpu_models;

use crate::auth::bearer_token;
use crate::catalog::{retrieve_docker_tags, Catalog, CatalogSummary, TagFilter};
use crate::deployments::builder::schema_for;
use crate::error::ApiResult;
use crate::state::AppState;

/// Catalog routes
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/refresh", post(refresh_handler))
        .route("/{kind}", get(list_handler))
        .route("/{kind}/detail", get(detail_handler))
        .route("/{kind}/tags", get(tags_handler))
        .route("/{kind}/{name}/metadata", get(metadata_handler))
        .route("/{kind}/{name}/config", get(config_handler))
}

#[derive(Debug, Default, Deserialize)]
struct TagQuery {
    /// Items containing all of these (comma-separated, `*` wildcards)
    tags: Option<String>,
    /// Items containing at least one of these
    tags_any: Option<String>,
    /// Items not containing exactly all of these
    not_tags: Option<String>,
    /// Items containing none of these
    not_tags_any: Option<String>,
}

impl TagQuery {
    fn into_filter(self) -> TagFilter {
        let split = |value: Option<String>| -> Vec<String> {
            value
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        };
        TagFilter {
            tags: split(self.tags),
            tags_any: split(self.tags_any),
            not_tags: split(self.not_tags),
            not_tags_any: split(self.not_tags_any),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ConfigQuery {
    /// Clamp hardware limits for this VO (tutorial VOs get smaller ranges)
    vo: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RefreshRequest {
    /// Restrict the refresh to one kind
    kind: Option<String>,
    /// Restrict the refresh to one item
    name: Option<String>,
}

/// Kinds with a catalog behind them
fn catalog_of(state: &AppState, segment: &str) -> Result<(WorkloadKind, Arc<Catalog>)> {
    let kind = WorkloadKind::from_route(segment)
        .filter(|k| matches!(k, WorkloadKind::Module | WorkloadKind::Tool))
        .ok_or_else(|| Error::unknown_workload("catalog", segment))?;
    Ok((kind, state.catalog_for(kind).clone()))
}

async fn list_handler(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Query(query): Query<TagQuery>,
) -> ApiResult<Json<Vec<String>>> {
    let (_, catalog) = catalog_of(&state, &kind)?;
    Ok(Json(catalog.filtered_list(&query.into_filter()).await?))
}

async fn detail_handler(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Query(query): Query<TagQuery>,
) -> ApiResult<Json<Vec<CatalogSummary>>> {
    let (_, catalog) = catalog_of(&state, &kind)?;
    Ok(Json(catalog.summary(&query.into_filter()).await?))
}

async fn tags_handler(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> ApiResult<Json<Vec<String>>> {
    let (_, catalog) = catalog_of(&state, &kind)?;
    Ok(Json(catalog.tags().await?))
}

async fn metadata_handler(
    State(state): State<AppState>,
    Path((kind, name)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let (_, catalog) = catalog_of(&state, &kind)?;
    let metadata = catalog.metadata(&name).await?;
    Ok(Json(serde_json::to_value(metadata.as_ref()).unwrap_or_default()))
}

/// The user-facing parameter schema, pre-filled for one item:
/// its docker image, the live image tags, the GPU models the cluster can
/// serve, and the VO's hardware limits.
async fn config_handler(
    State(state): State<AppState>,
    Path((kind, name)): Path<(String, String)>,
    Query(query): Query<ConfigQuery>,
) -> ApiResult<Json<ConfSchema>> {
    let (kind, catalog) = catalog_of(&state, &kind)?;
    let metadata = catalog.metadata(&name).await?;

    let vo = query.vo.as_deref().unwrap_or("");
    let mut schema = schema_for(&state, kind, &name, vo)?;

    if let Some(spec) = schema.param_mut("general", "docker_image") {
        spec.value = Value::String(metadata.docker_image.clone());
    }

    // Live tags from the public registry; private images keep `latest`
    let tags = retrieve_docker_tags(&state.http, &metadata.docker_image)
        .await
        .unwrap_or_else(|_| vec!["latest".to_string()]);
    if let Some(spec) = schema.param_mut("general", "docker_tag") {
        if let Some(first) = tags.first() {
            spec.value = Value::String(first.clone());
        }
        spec.options = Some(tags.into_iter().map(Value::String).collect());
    }

    // GPU models discovered from the VO's eligible nodes
    if let Some(profile) = state.config.vo_profile(vo) {
        let namespace = profile.namespace.to_string();
        let nomad = state.nomad.clone();
        let models = state
            .gpu_models
            .get_or_fetch(namespace.clone(), || async move {
                gpu_models(&nomad, &namespace).await
            })
            .await
            .unwrap_or_default();
        if !models.is_empty() {
            if let Some(spec) = schema.param_mut("hardware", "gpu_type") {
                let mut options: Vec<Value> = vec![Value::String(String::new())];
                options.extend(models.into_iter().map(Value::String));
                spec.options = Some(options);
            }
        }
    }

    Ok(Json(schema))
}

async fn refresh_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<Value>> {
    let token = bearer_token(&headers)?;
    let auth = state.oidc.validate(token).await?;
    auth.check_admin(&state.config)?;

    let request: RefreshRequest = if body.trim().is_empty() {
        RefreshRequest::default()
    } else {
        serde_json::from_str(&body)
            .map_err(|e| Error::bad_request("body", format!("invalid refresh request: {e}")))?
    };
    let name = request.name.as_deref();
    match request.kind.as_deref() {
        Some(segment) => {
            let (_, catalog) = catalog_of(&state, segment)?;
            catalog.refresh(name).await;
        }
        None => {
            state.modules.refresh(name).await;
            state.tools.refresh(name).await;
        }
    }
    info!(admin = %auth.subject, kind = ?request.kind, item = ?name, "catalog cache refreshed");
    Ok(Json(serde_json::json!({"status": "success"})))
}
