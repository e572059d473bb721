//! JSON error bodies for requests the proxy answers itself.
//!
//! The envelope matches what the wrapped backend's own framework produces,
//! so clients can handle proxy-originated failures and backend failures
//! uniformly.

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Response header identifying which worker served (or failed) a request.
pub const X_WORKER: &str = "x-worker";

/// Machine-matchable reason for a 503 produced by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerErrorReason {
    /// The request's deadline expired; the worker is killed and restarted.
    Timeout,
    /// Any other failure forwarding to the worker. Most often collateral
    /// damage from a timeout kill triggered by another request on the same
    /// worker.
    Unknown,
}

impl WorkerErrorReason {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerErrorReason::Timeout => "hss_worker_timeout",
            WorkerErrorReason::Unknown => "hss_worker_unknown_error",
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    /// HTTP error code.
    code: u16,
    /// Error string that can be matched on.
    reason: &'static str,
    /// PII-safe human-readable description, usable for logging.
    description: String,
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

/// Builds the 503 a failed dispatch answers with: `X-Worker` header plus the
/// JSON envelope.
pub fn worker_error_response(
    reason: WorkerErrorReason,
    description: String,
    pid: u32,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let envelope = ErrorEnvelope {
        error: ErrorBody {
            code: StatusCode::SERVICE_UNAVAILABLE.as_u16(),
            reason: reason.as_str(),
            description,
        },
    };
    let body = serde_json::to_string(&envelope).expect("error envelope serializes to JSON");

    Response::builder()
        .status(StatusCode::SERVICE_UNAVAILABLE)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .header(X_WORKER, pid)
        .body(
            Full::new(Bytes::from(body))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response builder")
}
