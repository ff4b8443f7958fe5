//! Function-platform services
//!
//! Wraps the serverless inference platform: a declarative service spec is
//! translated into the platform's native request, with provenance metadata
//! injected and the image allow-list enforced. The cluster is chosen by
//! the caller's VO.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use papi_common::config::OscarCluster;
use papi_common::{Error, Result};

use crate::auth::{bearer_token, AuthInfo};
use crate::clients::OscarClient;
use crate::error::ApiResult;
use crate::state::AppState;

/// Function-platform routes
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/cluster", get(cluster_handler))
        .route("/services", get(list_handler).post(create_handler))
        .route(
            "/services/{name}",
            get(get_handler).put(update_handler).delete(delete_handler),
        )
        .route("/services/{name}/logs", get(logs_handler))
}

/// Declarative service specification accepted from users
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceSpec {
    /// Service name
    pub name: String,
    /// Container image
    pub image: String,
    /// CPU request (e.g. "1.0")
    pub cpu: String,
    /// Memory request (e.g. "2Gi")
    pub memory: String,
    /// Kind of input the service consumes (maps into the script)
    pub input_type: String,
    /// Users allowed to invoke the service
    #[serde(default)]
    pub allowed_users: Vec<String>,
    /// Environment variables of the service
    #[serde(default)]
    pub environment: std::collections::BTreeMap<String, String>,
    /// Input bucket path
    #[serde(default)]
    pub input_path: Option<String>,
    /// Output bucket path
    #[serde(default)]
    pub output_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VoQuery {
    vo: String,
}

fn cluster_for<'a>(state: &'a AppState, vo: &str) -> Result<&'a OscarCluster> {
    state
        .config
        .oscar
        .clusters
        .get(vo)
        .ok_or_else(|| Error::bad_request("vo", format!("VO {vo} has no inference cluster")))
}

async fn client_for(
    state: &AppState,
    headers: &HeaderMap,
    vo: &str,
) -> Result<(AuthInfo, OscarClient)> {
    let token = bearer_token(headers)?;
    let auth = state.oidc.validate(token).await?;
    auth.check_vo(vo, &state.config)?;
    let cluster = cluster_for(state, vo)?;
    Ok((auth, OscarClient::new(cluster, token)))
}

/// Translate a service spec into the platform's native definition
pub fn service_definition(
    state: &AppState,
    auth: &AuthInfo,
    vo: &str,
    spec: &ServiceSpec,
) -> Result<Value> {
    if !state.config.image_allowed(&spec.image) {
        return Err(Error::bad_request(
            "image",
            format!("image {} is outside the allowed registries", spec.image),
        ));
    }

    let mut definition: Value = serde_yaml::from_str(&state.assets.oscar_service_template)
        .map_err(|e| Error::internal("inference", format!("invalid service template: {e}")))?;

    definition["name"] = Value::String(spec.name.clone());
    definition["image"] = Value::String(spec.image.clone());
    definition["cpu"] = Value::String(spec.cpu.clone());
    definition["memory"] = Value::String(spec.memory.clone());
    definition["vo"] = Value::String(vo.to_string());
    definition["allowed_users"] = Value::Array(
        spec.allowed_users
            .iter()
            .cloned()
            .map(Value::String)
            .collect(),
    );

    // Provenance: who created the service, through which broker
    definition["labels"] = serde_json::json!({
        "owner": auth.subject,
        "created-by": "papi",
    });

    // The template script processes a generic `.type` input; specialize it
    let specialized = definition["script"]
        .as_str()
        .map(|script| script.replace(".type", &format!(".{}", spec.input_type)));
    if let Some(specialized) = specialized {
        definition["script"] = Value::String(specialized);
    }

    if !spec.environment.is_empty() {
        definition["environment"] = serde_json::json!({ "Variables": spec.environment });
    }
    if let Some(input) = &spec.input_path {
        definition["input"] = serde_json::json!([{
            "storage_provider": "minio.default",
            "path": input,
        }]);
    }
    if let Some(output) = &spec.output_path {
        definition["output"] = serde_json::json!([{
            "storage_provider": "minio.default",
            "path": output,
        }]);
    }

    Ok(definition)
}

/// Public URL of a service on its cluster
fn service_url(cluster: &OscarCluster, name: &str) -> String {
    format!(
        "{}/services/{}/{name}",
        cluster.endpoint.trim_end_matches('/'),
        cluster.cluster_id
    )
}

async fn cluster_handler(
    State(state): State<AppState>,
    Query(query): Query<VoQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let (_, client) = client_for(&state, &headers, &query.vo).await?;
    Ok(Json(client.cluster_info().await?))
}

async fn list_handler(
    State(state): State<AppState>,
    Query(query): Query<VoQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let (_, client) = client_for(&state, &headers, &query.vo).await?;
    Ok(Json(client.list_services().await?))
}

async fn get_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<VoQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let (_, client) = client_for(&state, &headers, &query.vo).await?;
    Ok(Json(client.get_service(&name).await?))
}

async fn create_handler(
    State(state): State<AppState>,
    Query(query): Query<VoQuery>,
    headers: HeaderMap,
    Json(spec): Json<ServiceSpec>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let (auth, client) = client_for(&state, &headers, &query.vo).await?;
    let definition = service_definition(&state, &auth, &query.vo, &spec)?;
    client.create_service(&definition).await?;

    let cluster = cluster_for(&state, &query.vo)?;
    info!(service = %spec.name, vo = %query.vo, owner = %auth.subject, "service created");
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "status": "success",
            "url": service_url(cluster, &spec.name),
        })),
    ))
}

async fn update_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<VoQuery>,
    headers: HeaderMap,
    Json(mut spec): Json<ServiceSpec>,
) -> ApiResult<Json<Value>> {
    let (auth, client) = client_for(&state, &headers, &query.vo).await?;
    // The platform needs the full definition on update; the path segment
    // pins the name
    spec.name = name;
    let definition = service_definition(&state, &auth, &query.vo, &spec)?;
    client.update_service(&definition).await?;

    let cluster = cluster_for(&state, &query.vo)?;
    Ok(Json(serde_json::json!({
        "status": "success",
        "url": service_url(cluster, &spec.name),
    })))
}

async fn delete_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<VoQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let (_, client) = client_for(&state, &headers, &query.vo).await?;
    client.delete_service(&name).await?;
    Ok(Json(serde_json::json!({"status": "success"})))
}

async fn logs_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<VoQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let (_, client) = client_for(&state, &headers, &query.vo).await?;
    Ok(Json(client.service_logs(&name).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    fn spec() -> ServiceSpec {
        serde_json::from_value(serde_json::json!({
            "name": "plant-classifier",
            "image": "allowed/plant-classifier",
            "cpu": "1.0",
            "memory": "2Gi",
            "input_type": "json",
            "allowed_users": ["alice@x"],
            "environment": {"THRESHOLD": "0.5"},
            "input_path": "plant-in",
            "output_path": "plant-out"
        }))
        .unwrap()
    }

    #[test]
    fn test_definition_translation() {
        let state = test_support::state();
        let auth = test_support::auth_info("alice@x");
        let definition = service_definition(&state, &auth, "vo.a", &spec()).unwrap();

        assert_eq!(definition["name"], "plant-classifier");
        assert_eq!(definition["vo"], "vo.a");
        assert_eq!(definition["labels"]["owner"], "alice@x");
        assert_eq!(definition["allowed_users"][0], "alice@x");
        assert_eq!(definition["environment"]["Variables"]["THRESHOLD"], "0.5");
        assert_eq!(definition["input"][0]["path"], "plant-in");
        // The generic script is specialized to the input type
        assert!(definition["script"].as_str().unwrap().contains(".json"));
        assert!(!definition["script"].as_str().unwrap().contains(".type"));
    }

    #[test]
    fn test_disallowed_image_rejected() {
        let state = test_support::state();
        let auth = test_support::auth_info("alice@x");
        let mut bad = spec();
        bad.image = "evil/miner".to_string();
        let err = service_definition(&state, &auth, "vo.a", &bad).unwrap_err();
        assert!(matches!(err, Error::BadRequest { ref field, .. } if field == "image"));
    }

    #[test]
    fn test_service_url() {
        let cluster = OscarCluster {
            endpoint: "https://inference.a.example".to_string(),
            cluster_id: "oscar-a".to_string(),
        };
        assert_eq!(
            service_url(&cluster, "plant-classifier"),
            "https://inference.a.example/services/oscar-a/plant-classifier"
        );
    }
}
