//! Wires the kernel spec registry, kernel manager, session registry, and
//! the chosen personality's HTTP surface into one axum [`Router`] (C4/C8/C9
//! top-level assembly).
//!
//! The personality is an explicit tagged enum decided once at startup and
//! injected here, rather than dispatched dynamically per request.

use std::path::Path;
use std::sync::Arc;

use axum::extract::FromRef;
use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::{Personality, Settings};
use crate::error::GatewayError;
use crate::http;
use crate::kernelspec::KernelSpecRegistry;
use crate::manager::{KernelManager, SeedConfig};
use crate::notebook::cellparser::{self, parse_cells, ParsedNotebook};
use crate::notebook::dispatcher::NotebookDispatcher;
use crate::notebook::router::EndpointRouter;
use crate::pool::KernelPool;
use crate::session::SessionRegistry;

/// Shared state for the raw (`jupyter_websocket`) personality's routes.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub specs: Arc<KernelSpecRegistry>,
    pub manager: Arc<KernelManager>,
    pub sessions: Arc<SessionRegistry>,
}

impl FromRef<AppState> for Arc<Settings> {
    fn from_ref(state: &AppState) -> Self {
        state.settings.clone()
    }
}

/// The fully assembled gateway: its router and the manager it owns, so
/// `main` can drive a graceful shutdown after the server stops accepting.
pub struct GatewayApp {
    pub router: Router,
    pub manager: Arc<KernelManager>,
}

impl GatewayApp {
    /// Build the gateway from resolved settings: discover kernel specs,
    /// load the seed notebook if configured, and assemble the router for
    /// whichever personality was selected.
    pub async fn build(settings: Settings) -> Result<Self, GatewayError> {
        let settings = Arc::new(settings);
        let specs = Arc::new(KernelSpecRegistry::discover().await);
        if specs.is_empty() {
            warn!("no kernel specs discovered; kernel creation will fail until one is installed");
        }

        let seed_notebook = match &settings.seed_uri {
            Some(uri) => Some(Arc::new(load_seed_notebook(uri).await?)),
            None => None,
        };

        let seed = seed_notebook.as_ref().map(|notebook| SeedConfig {
            kernelspec_name: notebook.kernelspec_name.clone(),
            notebook: notebook.clone(),
        });

        let manager = Arc::new(KernelManager::new(
            specs.clone(),
            settings.max_kernels,
            settings.force_kernel_name.clone(),
            settings.default_kernel_name.clone(),
            settings.env_whitelist.clone(),
            settings.runtime_dir(),
            settings.ws_ping_interval_secs,
            seed,
        ));

        let router = match settings.api {
            Personality::JupyterWebsocket => {
                build_jupyter_websocket_router(settings.clone(), specs.clone(), manager.clone())
            }
            Personality::NotebookHttp => {
                let notebook = seed_notebook.ok_or_else(|| {
                    GatewayError::LaunchFailed(
                        "notebook_http personality requires KG_SEED_URI".to_string(),
                    )
                })?;
                build_notebook_http_router(settings.clone(), manager.clone(), notebook).await?
            }
        };

        Ok(Self { router, manager })
    }
}

fn build_jupyter_websocket_router(
    settings: Arc<Settings>,
    specs: Arc<KernelSpecRegistry>,
    manager: Arc<KernelManager>,
) -> Router {
    let state = AppState {
        settings: settings.clone(),
        specs,
        manager,
        sessions: Arc::new(SessionRegistry::default()),
    };
    http::raw::router(state.clone())
        .fallback(http::not_found)
        .layer(axum::middleware::from_fn_with_state(state.clone(), http::require_auth))
        .layer(http::cors_layer(&settings))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn build_notebook_http_router(
    settings: Arc<Settings>,
    manager: Arc<KernelManager>,
    notebook: Arc<ParsedNotebook>,
) -> Result<Router, GatewayError> {
    let spec = manager.resolve_spec(&notebook.kernelspec_name)?;

    let prespawn_count = settings.prespawn_count.unwrap_or(1);
    let kernel_pool = KernelPool::initialize(&manager, &spec, prespawn_count).await?;

    let endpoints = cellparser::collect_endpoints(&notebook.cells);
    let response_metadata = cellparser::collect_response_metadata(&notebook.cells);
    let router = EndpointRouter::build(endpoints);

    let dispatcher = Arc::new(NotebookDispatcher::new(
        router,
        response_metadata,
        kernel_pool,
        manager,
        notebook.kernel_language.clone(),
        std::time::Duration::from_secs(settings.execution_timeout_secs),
    ));

    let mut app = http::notebook_http::router(dispatcher);

    if settings.allow_notebook_download {
        let source_router = Router::new()
            .route("/_api/source", get(serve_notebook_source))
            .with_state(notebook);
        app = app.merge(source_router);
    }

    Ok(app
        .fallback(http::not_found)
        .layer(http::cors_layer(&settings))
        .layer(TraceLayer::new_for_http()))
}

async fn serve_notebook_source(
    axum::extract::State(notebook): axum::extract::State<Arc<ParsedNotebook>>,
) -> String {
    notebook
        .cells
        .iter()
        .map(|c| c.source.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

async fn load_seed_notebook(uri: &str) -> Result<ParsedNotebook, GatewayError> {
    let raw = if uri.starts_with("http://") || uri.starts_with("https://") {
        reqwest::get(uri)
            .await
            .map_err(|err| GatewayError::LaunchFailed(err.to_string()))?
            .bytes()
            .await
            .map_err(|err| GatewayError::LaunchFailed(err.to_string()))?
            .to_vec()
    } else {
        tokio::fs::read(Path::new(uri)).await?
    };

    let notebook: serde_json::Value = serde_json::from_slice(&raw)?;
    let kernelspec_name = notebook["metadata"]["kernelspec"]["name"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    let kernel_language = notebook["metadata"]["kernelspec"]["language"]
        .as_str()
        .or_else(|| notebook["metadata"]["language_info"]["name"].as_str())
        .unwrap_or("python")
        .to_string();

    let sources: Vec<String> = notebook["cells"]
        .as_array()
        .into_iter()
        .flatten()
        .filter(|cell| cell["cell_type"] == "code")
        .map(|cell| cell_source(cell))
        .collect();

    info!(kernelspec_name, cells = sources.len(), "loaded seed notebook");

    let cells = parse_cells(sources, &kernel_language);
    Ok(ParsedNotebook { cells, kernelspec_name, kernel_language })
}

fn cell_source(cell: &serde_json::Value) -> String {
    match &cell["source"] {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(lines) => {
            lines.iter().filter_map(|l| l.as_str()).collect::<Vec<_>>().join("")
        }
        _ => String::new(),
    }
}
