//! Secrets routes
//!
//! CRUD over the caller's subtree of the secret store. Users address
//! secrets by relative paths; the VO- and user-scoped prefix is derived
//! server-side and cannot be escaped.

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;

use crate::auth::bearer_token;
use crate::error::ApiResult;
use crate::state::AppState;

/// Secrets routes (merged at the version root)
pub fn router() -> Router<AppState> {
    Router::new().route(
        "/secrets",
        get(list_handler).post(put_handler).delete(delete_handler),
    )
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    /// VO whose subtree to read
    vo: String,
    /// Narrow the listing to a subpath
    #[serde(default)]
    subpath: String,
}

#[derive(Debug, Deserialize)]
struct PathQuery {
    /// VO whose subtree to write
    vo: String,
    /// Path of the secret, relative to the user subtree
    secret_path: String,
}

async fn list_handler(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let auth = state.oidc.validate(bearer_token(&headers)?).await?;
    auth.check_vo(&query.vo, &state.config)?;

    let secrets = state
        .vault
        .list_secrets(&query.vo, &auth.subject, &query.subpath)
        .await?;
    Ok(Json(serde_json::to_value(secrets).unwrap_or_default()))
}

async fn put_handler(
    State(state): State<AppState>,
    Query(query): Query<PathQuery>,
    headers: HeaderMap,
    Json(data): Json<Value>,
) -> ApiResult<Json<Value>> {
    let auth = state.oidc.validate(bearer_token(&headers)?).await?;
    auth.check_vo(&query.vo, &state.config)?;

    state
        .vault
        .put_secret(&query.vo, &auth.subject, &query.secret_path, &data)
        .await?;
    Ok(Json(serde_json::json!({"status": "success"})))
}

async fn delete_handler(
    State(state): State<AppState>,
    Query(query): Query<PathQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let auth = state.oidc.validate(bearer_token(&headers)?).await?;
    auth.check_vo(&query.vo, &state.config)?;

    state
        .vault
        .delete_secret(&query.vo, &auth.subject, &query.secret_path)
        .await?;
    Ok(Json(serde_json::json!({"status": "success"})))
}
