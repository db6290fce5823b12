//! The notebook-as-API surface: every endpoint cell in the seed notebook
//! becomes one HTTP route, backed by the kernel pool.
//!
//! One catch-all axum route is registered per distinct path template (built
//! from [`crate::notebook::router::EndpointRouter::path_templates`]), since
//! axum resolves its own route table at startup rather than per request. The
//! concrete `(verb, path)` is re-matched against [`NotebookDispatcher`]'s own
//! router to extract path parameters; axum's route match only decides which
//! template fired.

use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{RawQuery, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use bytes::Bytes;

use crate::error::GatewayError;
use crate::notebook::cellparser::HttpVerb;
use crate::notebook::dispatcher::NotebookDispatcher;

/// Build the notebook-HTTP router. One axum route per distinct path
/// template is registered with a catch-all verb handler, since a given path
/// may bind different cells to different verbs. The returned router is
/// already state-erased (`with_state` applied), ready to `.merge()` with
/// any other state-erased router the personality needs.
pub fn router(dispatcher: Arc<NotebookDispatcher>) -> Router {
    let mut app = Router::new();
    for template in dispatcher.path_templates() {
        app = app.route(template, any(dispatch));
    }
    app.with_state(dispatcher)
}

async fn dispatch(
    State(dispatcher): State<Arc<NotebookDispatcher>>,
    method: axum::http::Method,
    uri: Uri,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Ok(verb) = HttpVerb::from_str(method.as_str()) else {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    };
    let query = query.unwrap_or_default();

    match dispatcher.dispatch(verb, uri.path(), &query, &headers, &body).await {
        Ok(response) => response.into_axum(),
        Err(GatewayError::ExecutionError { ename, evalue, .. }) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Error {ename}: {evalue}"),
        )
            .into_response(),
        Err(err) => err.into_response(),
    }
}
