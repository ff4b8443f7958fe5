//! Router assembly
//!
//! One place wires every subsystem under `/v1`, applies the CORS
//! allow-list and request tracing, and exposes the root version document
//! and the health probe.

use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderValue, Method};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use papi_common::config::MainConfig;

use crate::state::AppState;
use crate::{catalog, deployments, inference, llm, secrets, snapshots, stats, tryme};

/// Build the full application router
pub fn build_router(state: AppState) -> Router {
    let v1 = Router::new()
        .nest("/catalog", catalog::handlers::router())
        .nest("/deployments", deployments::router())
        .nest("/try_me", tryme::router())
        .nest("/inference", inference::router())
        .nest("/stats", stats::handlers::router())
        .merge(secrets::router())
        .merge(snapshots::router())
        .merge(llm::router());

    let cors = cors_layer(&state.config);

    Router::new()
        .route("/", get(root_handler))
        .route("/healthz", get(|| async { "ok" }))
        .nest("/v1", v1)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// CORS from the configured exact-origin allow-list
fn cors_layer(config: &MainConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .auth
        .cors_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "skipping unparseable CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
        .allow_credentials(true)
}

/// Version discovery document at the API root
async fn root_handler() -> Json<Value> {
    Json(json!({
        "versions": [{
            "id": "v1",
            "links": [{
                "rel": "self",
                "type": "application/json",
                "href": "/v1",
            }],
        }],
        "links": [{
            "rel": "describedby",
            "type": "application/json",
            "href": "/openapi.json",
        }],
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use crate::test_support;

    async fn send(request: Request<Body>) -> axum::response::Response {
        build_router(test_support::state()).oneshot(request).await.unwrap()
    }

    #[tokio::test]
    async fn test_healthz() {
        let response = send(Request::get("/healthz").body(Body::empty()).unwrap()).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_root_document() {
        let response = send(Request::get("/").body(Body::empty()).unwrap()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["versions"][0]["id"], "v1");
    }

    #[tokio::test]
    async fn test_cluster_stats_is_public() {
        let response = send(
            Request::get("/v1/stats/cluster")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_catalog_list_is_public() {
        let response = send(
            Request::get("/v1/catalog/tools")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let names: Vec<String> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(names, vec!["dev-env"]);
    }

    #[tokio::test]
    async fn test_llm_models_catalog() {
        let response = send(
            Request::get("/v1/llm/models")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let models: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(models[0]["name"], "small-chat");
    }

    #[tokio::test]
    async fn test_deployments_require_auth() {
        let response = send(
            Request::get("/v1/deployments/module")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_secrets_require_auth() {
        let response = send(
            Request::get("/v1/secrets?vo=vo.a")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_unknown_kind_is_404() {
        let response = send(
            Request::get("/v1/catalog/gibberish")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cors_preflight_for_allowed_origin() {
        let response = send(
            Request::builder()
                .method(Method::OPTIONS)
                .uri("/v1/stats/cluster")
                .header("Origin", "https://dashboard.example.org")
                .header("Access-Control-Request-Method", "GET")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(
            response
                .headers()
                .get("access-control-allow-origin")
                .and_then(|v| v.to_str().ok()),
            Some("https://dashboard.example.org")
        );
    }

    #[tokio::test]
    async fn test_cors_denies_unlisted_origin() {
        let response = send(
            Request::builder()
                .method(Method::OPTIONS)
                .uri("/v1/stats/cluster")
                .header("Origin", "https://evil.example.org")
                .header("Access-Control-Request-Method", "GET")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert!(response.headers().get("access-control-allow-origin").is_none());
    }
}
