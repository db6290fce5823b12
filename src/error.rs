//! The crate's single error type and its HTTP/JSON representation.
//!
//! Every fallible core operation returns [`GatewayError`]. The `IntoResponse`
//! impl gives each variant a stable HTTP status and serializes it using the
//! `{reason, message, traceback?}` envelope that every JSON response (except
//! notebook-HTTP bodies, which are whatever the executed cell produced)
//! carries.

use std::io;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Errors surfaced by the kernel gateway core.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// No `Authorization` header or `token` query parameter was supplied.
    #[error("authorization required")]
    AuthMissing,

    /// The supplied bearer token did not match the configured auth token.
    #[error("invalid authorization token")]
    AuthInvalid,

    /// `GET /api/kernels` or `/api/sessions` was called with `list_kernels = false`.
    #[error("listing kernels is disabled")]
    ListForbidden,

    /// `max_kernels` would be exceeded by this request.
    #[error("kernel capacity exceeded")]
    CapacityExceeded,

    /// No kernel, session, or route matched the request.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// The route exists but the verb has no bound cell.
    #[error("method not allowed")]
    MethodNotAllowed,

    /// `spec_name` does not name an installed [`KernelSpec`](crate::kernelspec::KernelSpec).
    #[error("no such kernel spec: {0}")]
    UnknownSpec(String),

    /// The kernel subprocess could not be started or connected to.
    #[error("failed to launch kernel: {0}")]
    LaunchFailed(String),

    /// A seed cell failed during kernel provisioning.
    #[error("seeding failed: {ename}: {evalue}")]
    SeedFailed {
        /// Exception name reported by the kernel.
        ename: String,
        /// Exception message reported by the kernel.
        evalue: String,
        /// Traceback frames reported by the kernel.
        traceback: Vec<String>,
    },

    /// An `error` message was received in reply to an endpoint cell's execution.
    #[error("error: {ename}: {evalue}")]
    ExecutionError {
        /// Exception name reported by the kernel.
        ename: String,
        /// Exception message reported by the kernel.
        evalue: String,
        /// Traceback frames reported by the kernel.
        traceback: Vec<String>,
    },

    /// The dispatcher exhausted its configured execution timeout.
    #[error("upstream kernel timed out")]
    UpstreamTimeout,

    /// Disconnected from a kernel mid-operation (socket closed, channel dropped).
    #[error("disconnected from the kernel")]
    KernelDisconnect,

    /// An error occurred while starting or managing a subprocess.
    #[error("failed to run subprocess: {0}")]
    Subprocess(#[source] io::Error),

    /// Error while (de)serializing a wire message or HTTP body.
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Error originating from the ZeroMQ transport.
    #[error("zeromq error: {0}")]
    Zmq(#[from] zeromq::ZmqError),

    /// Generic I/O failure (connection file, seed notebook, runtime dir).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// JSON body shape returned by every non-notebook-HTTP error response.
#[derive(Serialize)]
struct ErrorBody {
    reason: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    traceback: Option<Vec<String>>,
}

impl GatewayError {
    fn status(&self) -> StatusCode {
        match self {
            GatewayError::AuthMissing | GatewayError::AuthInvalid => StatusCode::UNAUTHORIZED,
            GatewayError::ListForbidden | GatewayError::CapacityExceeded => StatusCode::FORBIDDEN,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            GatewayError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::UnknownSpec(_)
            | GatewayError::LaunchFailed(_)
            | GatewayError::SeedFailed { .. }
            | GatewayError::ExecutionError { .. }
            | GatewayError::KernelDisconnect
            | GatewayError::Subprocess(_)
            | GatewayError::Serialize(_)
            | GatewayError::Zmq(_)
            | GatewayError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            GatewayError::AuthMissing | GatewayError::AuthInvalid => "Unauthorized",
            GatewayError::ListForbidden => "Forbidden",
            GatewayError::CapacityExceeded => "CapacityExceeded",
            GatewayError::NotFound(_) => "NotFound",
            GatewayError::MethodNotAllowed => "MethodNotAllowed",
            GatewayError::UnknownSpec(_) => "NoSuchKernel",
            GatewayError::LaunchFailed(_) => "LaunchFailed",
            GatewayError::SeedFailed { .. } => "SeedFailed",
            GatewayError::ExecutionError { .. } => "ExecutionError",
            GatewayError::UpstreamTimeout => "UpstreamTimeout",
            GatewayError::KernelDisconnect | GatewayError::Subprocess(_) => "InternalError",
            GatewayError::Serialize(_) | GatewayError::Zmq(_) | GatewayError::Io(_) => {
                "InternalError"
            }
        }
    }

    fn traceback(&self) -> Option<Vec<String>> {
        match self {
            GatewayError::SeedFailed { traceback, .. }
            | GatewayError::ExecutionError { traceback, .. } => Some(traceback.clone()),
            _ => None,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            reason: self.reason(),
            message: self.to_string(),
            traceback: self.traceback(),
        };
        (status, Json(body)).into_response()
    }
}
