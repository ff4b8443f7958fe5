//! LLM proxy and inference catalog
//!
//! Serves the static model catalog and forwards chat requests to the
//! hosted LLM gateway with a server-side API key; response bodies are
//! streamed back unchanged.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use papi_common::config::LlmModel;
use papi_common::Error;

use crate::auth::bearer_token;
use crate::error::ApiResult;
use crate::state::AppState;

/// LLM routes (merged at the version root)
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/llm", post(chat_handler))
        .route("/llm/models", get(models_handler))
}

/// One chat message
#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct ChatMessage {
    /// Message role (system, user, assistant)
    pub role: String,
    /// Message content
    pub content: String,
}

/// A chat completion request
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    /// Model to use; the configured default when absent
    #[serde(default)]
    pub model: Option<String>,
    /// Conversation so far
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

/// The static model catalog
async fn models_handler(State(state): State<AppState>) -> Json<Vec<LlmModel>> {
    Json(state.assets.llm_models.clone())
}

/// Authenticated passthrough to the gateway, streaming the answer
async fn chat_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> ApiResult<Response> {
    let auth = state.oidc.validate(bearer_token(&headers)?).await?;
    // Anyone with an account in the access group or an allow-listed VO may
    // use the assistant
    let group = &state.config.llm.access_group;
    if auth.check_group(group).is_err() {
        auth.resolve_vos(None, &state.config)?;
    }

    let api_key = state
        .env
        .llm_api_key
        .as_deref()
        .ok_or_else(|| Error::backend("llm", "the LLM gateway key is not configured"))?;

    let model = request
        .model
        .unwrap_or_else(|| state.config.llm.default_model.clone());

    let upstream = state
        .http
        .post(format!(
            "{}/chat/completions",
            state.config.llm.gateway.trim_end_matches('/')
        ))
        .bearer_auth(api_key)
        .json(&serde_json::json!({
            "model": model,
            "messages": request.messages,
            "stream": true,
        }))
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                Error::timeout("llm gateway")
            } else {
                Error::backend("llm", e.to_string())
            }
        })?;

    let status = upstream.status();
    if !status.is_success() {
        let message = upstream.text().await.unwrap_or_default();
        return Err(Error::backend("llm", message).into());
    }

    let content_type = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| "text/event-stream".parse().expect("static header value"));

    let response = Response::builder()
        .status(status.as_u16())
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from_stream(upstream.bytes_stream()))
        .map_err(|e| Error::internal("llm", e.to_string()))?;
    Ok(response)
}
