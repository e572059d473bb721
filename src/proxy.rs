//! Front HTTP server and per-request dispatch.
//!
//! Every inbound request draws a permit from the supervisor's pool, is
//! forwarded to that worker's loopback port under a deadline, and releases
//! the permit in exactly one of two hooks: the response hook on success or
//! the error hook on failure. A request whose deadline expires forcibly
//! cancels its worker. The worker may be wedged in a non-yielding compute
//! loop, so cancellation never relies on the worker cooperating; the
//! supervisor respawns it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{worker_error_response, WorkerErrorReason, X_WORKER};
use crate::metrics::Metrics;
use crate::supervisor::Supervisor;
use crate::worker::Worker;

/// Outbound transport policy. Loopback traffic is plaintext, so the dial
/// timeout is the only connection-setup bound.
const DIAL_TIMEOUT: Duration = Duration::from_millis(2000);
const TCP_KEEPALIVE: Duration = Duration::from_secs(30);

/// Per-request dispatch logic: director, response hook and error hook.
pub struct Dispatcher {
    supervisor: Arc<Supervisor>,
    metrics: Metrics,
    client: Client<HttpConnector, Incoming>,
    default_timeout: Duration,
    /// Request header that overrides the default timeout; `None` disables.
    timeout_header: Option<String>,
}

impl Dispatcher {
    pub fn new(
        supervisor: Arc<Supervisor>,
        metrics: Metrics,
        default_timeout: Duration,
        timeout_header: Option<String>,
    ) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);
        connector.set_connect_timeout(Some(DIAL_TIMEOUT));
        connector.set_keepalive(Some(TCP_KEEPALIVE));

        let client = Client::builder(TokioExecutor::new()).build(connector);

        Self {
            supervisor,
            metrics,
            client,
            default_timeout,
            timeout_header,
        }
    }

    /// Binds the request to a worker and forwards it. The acquired worker is
    /// held for the whole request, so the hooks identify it directly instead
    /// of re-deriving it from the rewritten URL.
    pub async fn dispatch(&self, req: Request<Incoming>) -> Response<BoxBody<Bytes, hyper::Error>> {
        let timeout = self.request_timeout(&req);
        // The deadline starts before permit acquisition: time spent queueing
        // for a permit counts against the request, not just the forward.
        let deadline = tokio::time::Instant::now() + timeout;
        let worker = self.supervisor.acquire().await;

        let outbound = match build_worker_request(req, worker.port) {
            Ok(outbound) => outbound,
            Err(e) => return self.on_error(&worker, &describe(e)),
        };
        debug!(uri = %outbound.uri(), pid = worker.pid, "forwarding request");

        match tokio::time::timeout_at(deadline, self.client.request(outbound)).await {
            Ok(Ok(response)) => self.on_response(response, &worker),
            Ok(Err(e)) => self.on_error(&worker, &describe(e)),
            Err(_) => self.on_timeout(&worker, timeout),
        }
    }

    /// Per-request deadline: the override header when configured and
    /// parseable, the default otherwise.
    fn request_timeout<B>(&self, req: &Request<B>) -> Duration {
        let Some(name) = self.timeout_header.as_deref() else {
            return self.default_timeout;
        };
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| humantime::parse_duration(v).ok())
            .unwrap_or(self.default_timeout)
    }

    /// Response hook. The permit goes back before the header is stamped;
    /// the worker value stays readable afterwards because the supervisor
    /// replaces index entries instead of mutating them.
    fn on_response(
        &self,
        response: Response<Incoming>,
        worker: &Arc<Worker>,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        self.supervisor.release(Arc::clone(worker));

        let (mut parts, body) = response.into_parts();
        parts
            .headers
            .insert(X_WORKER, HeaderValue::from(worker.pid_or_zero()));
        Response::from_parts(parts, body.boxed())
    }

    /// Error hook, timeout classification: the worker may be stuck, so kill
    /// it. The supervisor restarts it automatically.
    fn on_timeout(
        &self,
        worker: &Arc<Worker>,
        timeout: Duration,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        self.supervisor.release(Arc::clone(worker));

        warn!(
            port = worker.port,
            pid = worker.pid,
            timeout = %humantime::format_duration(timeout),
            "restarting worker due to timeout"
        );
        self.metrics.inc_worker_restarts();
        worker.cancel();

        worker_error_response(
            WorkerErrorReason::Timeout,
            format!(
                "Worker (pid: {}) failed to highlight file; restarting it",
                worker.pid_or_zero()
            ),
            worker.pid_or_zero(),
        )
    }

    /// Error hook, everything else. In practice the usual cause is a kill
    /// triggered by another request timing out on the same worker, so this
    /// never escalates to a cancel of its own.
    fn on_error(&self, worker: &Arc<Worker>, err: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
        self.supervisor.release(Arc::clone(worker));

        error!(port = worker.port, pid = worker.pid, error = err, "error encountered");

        worker_error_response(
            WorkerErrorReason::Unknown,
            format!(
                "Worker (pid: {}) unknown error: {}",
                worker.pid_or_zero(),
                err
            ),
            worker.pid_or_zero(),
        )
    }
}

/// Rewrites the inbound request to target the worker's loopback endpoint.
/// Workers serve at the root, so the prefix join reduces to the request's
/// own path and query. An absent User-Agent is forwarded as an explicit
/// empty value so the client stack cannot substitute a default.
fn build_worker_request<B>(req: Request<B>, port: u16) -> Result<Request<B>, hyper::http::Error> {
    let (parts, body) = req.into_parts();

    let path = join_paths("", parts.uri.path());
    let path = if path.is_empty() { "/".to_string() } else { path };
    let query = join_query("", parts.uri.query().unwrap_or(""));
    let target = if query.is_empty() {
        format!("http://127.0.0.1:{port}{path}")
    } else {
        format!("http://127.0.0.1:{port}{path}?{query}")
    };
    let uri: hyper::Uri = target.parse()?;

    let mut builder = Request::builder().method(parts.method).uri(uri);
    for (key, value) in parts.headers.iter() {
        builder = builder.header(key, value);
    }
    if !parts.headers.contains_key(hyper::header::USER_AGENT) {
        builder = builder.header(hyper::header::USER_AGENT, "");
    }
    builder.body(body)
}

/// Slash-joins a target path prefix with the request path.
fn join_paths(prefix: &str, path: &str) -> String {
    match (prefix.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", prefix, &path[1..]),
        (false, false) if !prefix.is_empty() && !path.is_empty() => format!("{prefix}/{path}"),
        _ => format!("{prefix}{path}"),
    }
}

/// Concatenates raw query strings, with `&` only when both are non-empty.
fn join_query(target: &str, request: &str) -> String {
    if target.is_empty() || request.is_empty() {
        format!("{target}{request}")
    } else {
        format!("{target}&{request}")
    }
}

fn describe(e: impl std::error::Error + Send + Sync + 'static) -> String {
    format!("{:#}", anyhow::Error::new(e))
}

/// The front server: accepts inbound connections and hands every request to
/// the dispatcher.
pub struct ProxyServer {
    bind_addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        dispatcher: Dispatcher,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            dispatcher: Arc::new(dispatcher),
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "proxy server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let dispatcher = Arc::clone(&self.dispatcher);
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, dispatcher).await {
                                    debug!(peer = %peer, error = %e, "connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection(stream: TcpStream, dispatcher: Arc<Dispatcher>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let dispatcher = Arc::clone(&dispatcher);
        async move { Ok::<_, hyper::Error>(dispatcher.dispatch(req).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("connection error: {e}"))
}
