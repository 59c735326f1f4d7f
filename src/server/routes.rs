//! Axum route handlers for the agentmcp HTTP server.
//!
//! # Routes
//!
//! - `GET  /health`       : Returns `{"status": "ok", "version": "2.0.0"}`
//! - `GET  /actions`      : Catalog of invokable actions
//! - `POST /actions/:name`: Invoke an action with a JSON object of arguments
//!
//! Action responses are `{"ok": true, "result": ...}` on success and
//! `{"ok": false, "error": {"code": ..., "message": ...}}` on failure.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::actions::{ActionRouter, Args};
use crate::error::RegistryError;

/// Shared application state for the HTTP server.
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<ActionRouter>,
}

impl AppState {
    pub fn new(router: ActionRouter) -> Self {
        Self {
            router: Arc::new(router),
        }
    }
}

/// Build the axum router with all routes.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/actions", get(list_actions_handler))
        .route("/actions/:name", post(invoke_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// GET /health: liveness probe.
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": crate::VERSION,
        "service": "agentmcp",
    }))
}

/// GET /actions: published action catalog.
async fn list_actions_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "actions": state.router.list_actions() }))
}

/// POST /actions/:name: invoke one action.
///
/// An empty body is treated as an empty argument object.
async fn invoke_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    let args = match parse_args(&body) {
        Ok(args) => args,
        Err(e) => return error_response(&e),
    };

    match state.router.invoke(&name, &args).await {
        Ok(result) => (StatusCode::OK, Json(json!({ "ok": true, "result": result }))),
        Err(e) => {
            match &e {
                RegistryError::Persistence(_) => log::error!("Action {} failed: {}", name, e),
                _ => log::debug!("Action {} rejected: {}", name, e),
            }
            error_response(&e)
        }
    }
}

fn parse_args(body: &[u8]) -> Result<Args, RegistryError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Args::new());
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(args)) => Ok(args),
        Ok(_) => Err(RegistryError::Validation(
            "request body must be a JSON object".into(),
        )),
        Err(e) => Err(RegistryError::Validation(format!("invalid JSON body: {}", e))),
    }
}

fn status_for(err: &RegistryError) -> StatusCode {
    match err {
        RegistryError::NotFound { .. } => StatusCode::NOT_FOUND,
        RegistryError::Forbidden(_) => StatusCode::FORBIDDEN,
        RegistryError::Validation(_) => StatusCode::BAD_REQUEST,
        RegistryError::Conflict(_) => StatusCode::CONFLICT,
        RegistryError::Degraded(_) => StatusCode::SERVICE_UNAVAILABLE,
        RegistryError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &RegistryError) -> (StatusCode, Json<Value>) {
    (
        status_for(err),
        Json(json!({
            "ok": false,
            "error": {
                "code": err.code(),
                "message": err.to_string(),
            },
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::config::{DispatchConfig, GovernanceConfig, Limits};
    use crate::dispatch::CapabilityDispatcher;
    use crate::governance::GovernanceEngine;
    use crate::store::MemoryStore;

    fn app() -> Router {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = CapabilityDispatcher::new(store.clone(), DispatchConfig::default());
        let governance = GovernanceEngine::new(store.clone(), GovernanceConfig::default());
        let router = ActionRouter::new(store, dispatcher, governance, Limits::default());
        app_router(AppState::new(router))
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let body = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn post(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();

        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["version"], crate::VERSION);
        assert_eq!(json["service"], "agentmcp");
    }

    #[tokio::test]
    async fn test_action_catalog() {
        let request = Request::builder()
            .uri("/actions")
            .body(Body::empty())
            .unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        let names: Vec<&str> = json["actions"]
            .as_array()
            .unwrap()
            .iter()
            .map(|a| a["name"].as_str().unwrap())
            .collect();
        assert!(names.contains(&"use_agent"));
        assert!(names.contains(&"governance_action"));
    }

    #[tokio::test]
    async fn test_register_then_get() {
        let app = app();
        let response = app
            .clone()
            .oneshot(post(
                "/actions/register_skill",
                json!({"name": "curl", "description": "HTTP client", "content": "curl -s URL"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["ok"], true);
        assert_eq!(json["result"]["name"], "curl");

        let response = app
            .oneshot(post("/actions/get_skill", json!({"name": "curl"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["result"]["body"]["kind"], "skill");
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let app = app();

        let response = app
            .clone()
            .oneshot(post("/actions/get_agent", json!({"name": "ghost"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = body_json(response).await;
        assert_eq!(json["ok"], false);
        assert_eq!(json["error"]["code"], "not_found");

        let response = app
            .clone()
            .oneshot(post("/actions/use_agent", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .clone()
            .oneshot(post("/actions/use_agent", json!([1, 2])))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(post(
                "/actions/find_similar_skills",
                json!({"description": "http"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(response).await["error"]["code"], "degraded_dependency");
    }

    #[tokio::test]
    async fn test_empty_body_is_empty_args() {
        let request = Request::builder()
            .method("POST")
            .uri("/actions/governance_stats")
            .body(Body::empty())
            .unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["result"]["banned_count"], 0);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&RegistryError::Conflict("x".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&RegistryError::Forbidden("x".into())),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_for(&RegistryError::Persistence("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
