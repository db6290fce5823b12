//! The raw kernel/session REST + WebSocket surface.
//!
//! Thin handlers that delegate almost everything to the manager/session
//! registry and only translate between HTTP and their
//! `Result<_, GatewayError>`.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::app::AppState;
use crate::error::GatewayError;
use crate::kernel::KernelState;
use crate::{bridge, http};

/// Build the raw surface's router, to be nested under the configured base URL.
pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/api", get(api_version))
        .route("/api/kernelspecs", get(list_kernelspecs))
        .route("/api/kernels", get(list_kernels).post(create_kernel))
        .route("/api/kernels/:id", get(get_kernel).delete(delete_kernel))
        .route("/api/kernels/:id/restart", post(restart_kernel))
        .route("/api/kernels/:id/channels", get(channels))
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route(
            "/api/sessions/:id",
            get(get_session).patch(patch_session).delete(delete_session),
        )
        .route("/api/swagger.json", get(http::swagger::swagger_json))
        .route("/api/swagger.yaml", get(http::swagger::swagger_yaml))
        .route("/api/activity", get(activity))
        .with_state(state)
}

async fn api_version() -> Json<serde_json::Value> {
    Json(json!({ "version": env!("CARGO_PKG_VERSION") }))
}

async fn list_kernelspecs(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut kernelspecs = BTreeMap::new();
    for (name, spec, resources) in state.specs.all() {
        kernelspecs.insert(
            name,
            json!({
                "name": name,
                "spec": spec,
                "resources": resources,
            }),
        );
    }
    Json(json!({
        "default": state.specs.default_name(),
        "kernelspecs": kernelspecs,
    }))
}

async fn list_kernels(State(state): State<AppState>) -> Result<Response, GatewayError> {
    if !state.settings.list_kernels {
        return Err(GatewayError::ListForbidden);
    }
    Ok(Json(state.manager.list().await).into_response())
}

#[derive(Deserialize)]
struct CreateKernelBody {
    name: Option<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

async fn create_kernel(
    State(state): State<AppState>,
    body: Option<Json<CreateKernelBody>>,
) -> Result<Response, GatewayError> {
    let body = body.map(|Json(b)| b).unwrap_or(CreateKernelBody { name: None, env: BTreeMap::new() });
    let kernel = state.manager.create(body.name.as_deref(), body.env, None).await?;
    let descriptor = state
        .manager
        .list()
        .await
        .into_iter()
        .find(|k| k.id == kernel.id())
        .expect("just-created kernel is in the map");
    Ok((axum::http::StatusCode::CREATED, Json(descriptor)).into_response())
}

async fn get_kernel(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, GatewayError> {
    let kernel = state.manager.get(id).await?;
    Ok(Json(json!({
        "id": kernel.id(),
        "name": kernel.spec_name(),
        "connections": kernel.connections(),
        "execution_state": kernel.state().await,
    }))
    .into_response())
}

async fn delete_kernel(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<axum::http::StatusCode, GatewayError> {
    state.manager.shutdown(id).await?;
    state.sessions.remove_for_kernel(id).await;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

/// Restart a kernel in place, keeping its id and session bindings.
async fn restart_kernel(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, GatewayError> {
    let kernel = state.manager.restart(id).await?;
    Ok(Json(json!({
        "id": kernel.id(),
        "name": kernel.spec_name(),
    }))
    .into_response())
}

async fn channels(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    ws: WebSocketUpgrade,
) -> Result<Response, GatewayError> {
    let kernel = state.manager.get(id).await?;
    if !matches!(kernel.state().await, KernelState::Idle | KernelState::Busy) {
        return Err(GatewayError::NotFound("kernel"));
    }
    let ping_interval = state.settings.ws_ping_interval_secs;
    Ok(ws.on_upgrade(move |socket| async move { bridge::run(socket, kernel, ping_interval).await }))
}

async fn list_sessions(State(state): State<AppState>) -> Result<Response, GatewayError> {
    if !state.settings.list_kernels {
        return Err(GatewayError::ListForbidden);
    }
    Ok(Json(state.sessions.list().await).into_response())
}

#[derive(Deserialize)]
struct KernelRef {
    name: Option<String>,
}

#[derive(Deserialize)]
struct CreateSessionBody {
    id: Option<String>,
    path: String,
    #[serde(default)]
    name: String,
    #[serde(default = "default_session_type", rename = "type")]
    session_type: String,
    kernel: KernelRef,
}

fn default_session_type() -> String {
    "notebook".to_string()
}

async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionBody>,
) -> Result<Response, GatewayError> {
    let kernel = state.manager.create(body.kernel.name.as_deref(), BTreeMap::new(), None).await?;
    let session = state
        .sessions
        .create(body.id, body.path, body.name, body.session_type, kernel.id())
        .await;
    Ok((axum::http::StatusCode::CREATED, Json(session)).into_response())
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<crate::session::Session>, GatewayError> {
    Ok(Json(state.sessions.get(&id).await?))
}

#[derive(Deserialize, Default)]
struct PatchSessionBody {
    path: Option<String>,
    name: Option<String>,
    kernel: Option<KernelRef>,
}

async fn patch_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<PatchSessionBody>>,
) -> Result<Json<crate::session::Session>, GatewayError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let kernel_id = match body.kernel.and_then(|k| k.name) {
        Some(name) => Some(state.manager.create(Some(&name), BTreeMap::new(), None).await?.id()),
        None => None,
    };
    Ok(Json(state.sessions.patch(&id, body.path, body.name, kernel_id).await?))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<axum::http::StatusCode, GatewayError> {
    state.sessions.delete(&id).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

/// A lightweight summary of activity across every live kernel, used by
/// dashboards polling for load.
async fn activity(State(state): State<AppState>) -> Json<serde_json::Value> {
    let kernels = state.manager.list().await;
    Json(json!({
        "kernel_count": kernels.len(),
        "kernels": kernels,
    }))
}
