//! For each request, picks a kernel from the pool, injects the request
//! object, executes the matched cell, collects the response, and applies
//! any response-metadata cell (C9).
//!
//! The `REQUEST` assignment is executed first (silently), then the endpoint
//! source, with iopub output classified by type (`stream`/`execute_result`/
//! `error`) before being turned into an HTTP response. A `stream` response
//! defaults to `text/plain`; an `execute_result` response instead uses
//! whichever MIME type the kernel itself attached to the result.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use tokio::time::timeout;

use crate::error::GatewayError;
use crate::manager::KernelManager;
use crate::notebook::cellparser::HttpVerb;
use crate::notebook::request::Request;
use crate::notebook::router::{EndpointRouter, Matched};
use crate::pool::KernelPool;
use crate::wire::{
    ExecuteReply, ExecuteRequest, KernelStatus, Message, MessageType, Reply, Status,
};

/// The HTTP response a dispatched request produced.
pub struct DispatchResponse {
    pub status: StatusCode,
    pub content_type: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl DispatchResponse {
    fn plain(status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            content_type: "text/plain".to_string(),
            headers: Vec::new(),
            body: body.into(),
        }
    }
}

/// Parsed printed JSON from a response-metadata cell.
#[derive(serde::Deserialize, Default)]
struct ResponseMetadataOutput {
    status: Option<u16>,
    headers: Option<BTreeMap<String, String>>,
}

/// Executes matched notebook endpoint cells against pooled kernels.
pub struct NotebookDispatcher {
    router: EndpointRouter,
    response_metadata: BTreeMap<(String, HttpVerb), String>,
    pool: KernelPool,
    manager: Arc<KernelManager>,
    kernel_language: String,
    execution_timeout: Duration,
}

impl NotebookDispatcher {
    /// Build a dispatcher over an already-initialized pool and route table.
    pub fn new(
        router: EndpointRouter,
        response_metadata: BTreeMap<(String, HttpVerb), String>,
        pool: KernelPool,
        manager: Arc<KernelManager>,
        kernel_language: String,
        execution_timeout: Duration,
    ) -> Self {
        Self {
            router,
            response_metadata,
            pool,
            manager,
            kernel_language,
            execution_timeout,
        }
    }

    /// Every distinct path template this dispatcher's router knows about,
    /// for the HTTP layer to register one axum route per template.
    pub fn path_templates(&self) -> impl Iterator<Item = &str> {
        self.router.path_templates()
    }

    /// Dispatch one HTTP request to a pooled kernel.
    pub async fn dispatch(
        &self,
        verb: HttpVerb,
        path: &str,
        query: &str,
        headers: &HeaderMap,
        raw_body: &[u8],
    ) -> Result<DispatchResponse, GatewayError> {
        let (source, path_params) = match self.router.route(verb, path) {
            Matched::Found { source, path_params } => (source.to_string(), path_params),
            Matched::MethodNotAllowed => {
                return Ok(DispatchResponse::plain(StatusCode::METHOD_NOT_ALLOWED, ""))
            }
            Matched::NotFound => return Ok(DispatchResponse::plain(StatusCode::NOT_FOUND, "")),
        };

        let request_obj = Request::build(headers, query, raw_body, path_params.clone());
        let assignment = request_obj.assignment_statement(&self.kernel_language);

        let borrowed = self.pool.acquire(&self.manager).await?;
        let session = borrowed.kernel_id.to_string();

        let outcome = self
            .run_on_kernel(&session, &assignment, &source, borrowed.kernel.conn())
            .await;

        // The endpoint cell and its response-metadata cell share one
        // exclusive kernel hold: the metadata cell often reads state the
        // endpoint cell just produced, so it must run on the same kernel
        // before that kernel is released back to the pool.
        let mut metadata_result = None;
        if outcome.is_ok() {
            if let Some(metadata_source) = self.response_metadata.get(&(path.to_string(), verb)) {
                metadata_result = Some(
                    self.run_on_kernel(&session, &assignment, metadata_source, borrowed.kernel.conn())
                        .await,
                );
            }
        }

        self.pool.release(borrowed.kernel_id).await;

        let mut response = outcome?;

        if let Some(Ok(metadata_response)) = metadata_result {
            if let Ok(parsed) =
                serde_json::from_slice::<ResponseMetadataOutput>(&metadata_response.body)
            {
                if let Some(status) = parsed.status {
                    response.status = StatusCode::from_u16(status).unwrap_or(response.status);
                }
                if let Some(extra_headers) = parsed.headers {
                    for (name, value) in extra_headers {
                        response.headers.push((name, value));
                    }
                }
            }
        }

        Ok(response)
    }

    async fn run_on_kernel(
        &self,
        session: &str,
        assignment: &str,
        source: &str,
        conn: &crate::wire::zeromq::KernelConnection,
    ) -> Result<DispatchResponse, GatewayError> {
        self.execute_silent(session, assignment, conn).await?;
        self.execute_and_collect(session, source, conn).await
    }

    async fn execute_silent(
        &self,
        session: &str,
        code: &str,
        conn: &crate::wire::zeromq::KernelConnection,
    ) -> Result<(), GatewayError> {
        let request = Message::new(
            MessageType::ExecuteRequest,
            session,
            ExecuteRequest::silent_or_not(code, true),
        );
        let pending = conn.call_shell(request).await?;
        let reply: Message<Reply<ExecuteReply>> =
            timeout(self.execution_timeout, pending.get_reply())
                .await
                .map_err(|_| GatewayError::UpstreamTimeout)??;
        if let Reply::Error(err) = reply.content {
            return Err(GatewayError::ExecutionError {
                ename: err.ename,
                evalue: err.evalue,
                traceback: err.traceback,
            });
        }
        Ok(())
    }

    async fn execute_and_collect(
        &self,
        session: &str,
        code: &str,
        conn: &crate::wire::zeromq::KernelConnection,
    ) -> Result<DispatchResponse, GatewayError> {
        let mut iopub = conn.subscribe_iopub();

        let request = Message::new(MessageType::ExecuteRequest, session, ExecuteRequest::silent_or_not(code, false));
        let msg_id = request.header.msg_id.clone();
        let pending = conn.call_shell(request).await?;

        let mut stdout = String::new();
        let mut execute_result: Option<(String, serde_json::Value)> = None;
        let mut execution_error: Option<GatewayError> = None;

        let collect = async {
            loop {
                let Ok(msg) = iopub.recv().await else {
                    break;
                };
                let Some(parent) = &msg.parent_header else {
                    continue;
                };
                if parent.msg_id != msg_id {
                    continue;
                }
                match msg.header.msg_type {
                    MessageType::Stream => {
                        if let Ok(stream) = serde_json::from_value::<crate::wire::Stream>(msg.content.clone()) {
                            if stream.name == "stdout" {
                                stdout.push_str(&stream.text);
                            }
                        }
                    }
                    MessageType::ExecuteResult => {
                        if let Ok(result) =
                            serde_json::from_value::<crate::wire::ExecuteResult>(msg.content.clone())
                        {
                            execute_result = result.data.into_iter().next();
                        }
                    }
                    MessageType::Error => {
                        if let Ok(err) =
                            serde_json::from_value::<crate::wire::ErrorReply>(msg.content.clone())
                        {
                            execution_error = Some(GatewayError::ExecutionError {
                                ename: err.ename,
                                evalue: err.evalue,
                                traceback: err.traceback,
                            });
                        }
                    }
                    MessageType::Status => {
                        if let Ok(status) = serde_json::from_value::<Status>(msg.content.clone()) {
                            if status.execution_state == KernelStatus::Idle {
                                break;
                            }
                        }
                    }
                    _ => {}
                }
            }
        };

        timeout(self.execution_timeout, collect)
            .await
            .map_err(|_| GatewayError::UpstreamTimeout)?;

        // Drain the shell reply so its reply-map entry is cleaned up even
        // though the HTTP response is built from iopub, not from it.
        let _: Result<Message<Reply<ExecuteReply>>, _> = pending.get_reply().await;

        if let Some(err) = execution_error {
            return Err(err);
        }

        let (content_type, body) = match execute_result {
            Some((mime, serde_json::Value::String(text))) => (mime, text.into_bytes()),
            Some((mime, value)) => (mime, serde_json::to_vec(&value)?),
            None => ("text/plain".to_string(), stdout.into_bytes()),
        };

        Ok(DispatchResponse {
            status: StatusCode::OK,
            content_type,
            headers: Vec::new(),
            body,
        })
    }
}

impl DispatchResponse {
    /// Convert to an axum response.
    pub fn into_axum(self) -> axum::response::Response {
        let mut builder = axum::http::Response::builder().status(self.status);
        let headers_mut = builder.headers_mut().expect("builder has no error yet");
        headers_mut.insert(
            axum::http::header::CONTENT_TYPE,
            HeaderValue::from_str(&self.content_type).unwrap_or_else(|_| HeaderValue::from_static("text/plain")),
        );
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::from_str(value),
            ) {
                headers_mut.insert(name, value);
            }
        }
        builder
            .body(axum::body::Body::from(self.body))
            .expect("response body is always valid")
    }
}

