//! Static OpenAPI document describing the raw surface (`/api/swagger.json`,
//! `/api/swagger.yaml`), built once from a literal since there is no bundled
//! asset directory to read from.

use axum::response::{IntoResponse, Response};
use serde_json::{json, Value};

fn document() -> Value {
    json!({
        "swagger": "2.0",
        "info": {
            "title": "Kernel Gateway",
            "version": env!("CARGO_PKG_VERSION"),
        },
        "basePath": "/",
        "paths": {
            "/api": { "get": { "summary": "Get the gateway version" } },
            "/api/kernelspecs": { "get": { "summary": "List installed kernel specs" } },
            "/api/kernels": {
                "get": { "summary": "List running kernels" },
                "post": { "summary": "Create a kernel" },
            },
            "/api/kernels/{kernel_id}": {
                "get": { "summary": "Get a kernel" },
                "delete": { "summary": "Shut down a kernel" },
            },
            "/api/kernels/{kernel_id}/restart": {
                "post": { "summary": "Restart a kernel in place" },
            },
            "/api/kernels/{kernel_id}/channels": {
                "get": { "summary": "Open the kernel's WebSocket channels" },
            },
            "/api/sessions": {
                "get": { "summary": "List sessions" },
                "post": { "summary": "Create a session" },
            },
            "/api/sessions/{session_id}": {
                "get": { "summary": "Get a session" },
                "patch": { "summary": "Update a session" },
                "delete": { "summary": "Delete a session" },
            },
        },
    })
}

pub async fn swagger_json() -> Response {
    axum::Json(document()).into_response()
}

pub async fn swagger_yaml() -> Response {
    let yaml = serde_yaml::to_string(&document()).unwrap_or_default();
    ([("content-type", "application/yaml")], yaml).into_response()
}
