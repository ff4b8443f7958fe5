//! Stats routes
//!
//! The cluster snapshot is public; per-user deployment stats require
//! authentication and VO membership.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;

use papi_common::{Error, WorkloadKind};

use crate::auth::bearer_token;
use crate::error::ApiResult;
use crate::state::AppState;
use crate::stats::accounting::{load_namespace_stats, user_stats, NamespaceStats};

/// Stats routes
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/cluster", get(cluster_handler))
        .route("/deployments", get(deployments_handler))
}

#[derive(Debug, Deserialize)]
struct VoQuery {
    vo: String,
}

/// Latest cluster capacity/usage snapshot
async fn cluster_handler(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.cluster_stats.get().await;
    Json(serde_json::to_value(snapshot.as_ref()).unwrap_or_default())
}

/// Historical summaries plus the caller's live quota snapshot
async fn deployments_handler(
    State(state): State<AppState>,
    Query(query): Query<VoQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let auth = state.oidc.validate(bearer_token(&headers)?).await?;
    auth.check_vo(&query.vo, &state.config)?;

    let namespace = state
        .config
        .vo_profile(&query.vo)
        .map(|p| p.namespace.to_string())
        .ok_or_else(|| Error::internal("stats", "VO has no profile"))?;

    let accounting_path = state.env.accounting_path.clone().ok_or_else(|| {
        Error::internal(
            "stats",
            "deployments stats information not available (no env var)",
        )
    })?;

    let namespace_stats: Arc<NamespaceStats> = state
        .accounting
        .get_or_fetch(namespace.clone(), || async move {
            tokio::task::spawn_blocking(move || {
                load_namespace_stats(&accounting_path, &namespace).map(Arc::new)
            })
            .await
            .map_err(|e| Error::internal("stats", e.to_string()))?
        })
        .await?;

    let mut value = serde_json::to_value(user_stats(&namespace_stats, &auth.subject))
        .unwrap_or_default();

    // The live quota snapshot complements the historical aggregates
    let usage =
        crate::deployments::live_usage(&state, &auth, &query.vo, WorkloadKind::Module).await?;
    value["live"] = serde_json::to_value(usage).unwrap_or_default();

    Ok(Json(value))
}
