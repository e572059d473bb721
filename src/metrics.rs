//! Prometheus metrics and the scrape endpoint.

use std::net::SocketAddr;

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use prometheus::{Encoder, IntCounter, Opts, Registry, TextEncoder};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Errors from metrics registration or encoding.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

/// Metrics shared by the dispatcher and the scrape endpoint. Cheap to clone;
/// counters use lock-free interior mutability.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    worker_restarts: IntCounter,
}

impl Metrics {
    /// Creates the registry. `app_name` prefixes every metric name, matching
    /// the deployment's Prometheus naming scheme.
    pub fn new(app_name: &str) -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let worker_restarts = IntCounter::with_opts(Opts::new(
            format!("{app_name}_hss_worker_restarts"),
            "The total number of worker process restarts",
        ))?;
        registry.register(Box::new(worker_restarts.clone()))?;

        Ok(Self {
            registry,
            worker_restarts,
        })
    }

    /// Records one timeout-driven forced restart.
    pub fn inc_worker_restarts(&self) {
        self.worker_restarts.inc();
    }

    pub fn worker_restarts(&self) -> u64 {
        self.worker_restarts.get()
    }

    /// Renders the registry in the Prometheus text exposition format.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buf)
            .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buf).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
    }
}

/// Serves `/metrics` on `addr` until shutdown is signalled.
pub async fn serve(
    addr: SocketAddr,
    metrics: Metrics,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "metrics server listening");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let metrics = metrics.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req: Request<Incoming>| {
                                let metrics = metrics.clone();
                                async move { Ok::<_, hyper::Error>(handle_scrape(&metrics, &req)) }
                            });
                            if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                .serve_connection(io, service)
                                .await
                            {
                                debug!(peer = %peer, error = %e, "metrics connection error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "failed to accept metrics connection"),
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("metrics server shutting down");
                    break;
                }
            }
        }
    }

    Ok(())
}

fn handle_scrape(
    metrics: &Metrics,
    req: &Request<Incoming>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    if req.uri().path() != "/metrics" {
        return text_response(StatusCode::NOT_FOUND, "not found\n".to_string());
    }
    match metrics.encode_text() {
        Ok(body) => text_response(StatusCode::OK, body),
        Err(e) => {
            error!(error = %e, "encoding metrics");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{e}\n"))
        }
    }
}

fn text_response(status: StatusCode, body: String) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_name_carries_app_prefix() {
        let metrics = Metrics::new("syntect_server").unwrap();
        metrics.inc_worker_restarts();

        let text = metrics.encode_text().unwrap();
        assert!(text.contains("syntect_server_hss_worker_restarts 1"));
    }

    #[test]
    fn empty_app_name_still_registers() {
        let metrics = Metrics::new("").unwrap();
        assert_eq!(metrics.worker_restarts(), 0);

        metrics.inc_worker_restarts();
        metrics.inc_worker_restarts();
        assert_eq!(metrics.worker_restarts(), 2);

        let text = metrics.encode_text().unwrap();
        assert!(text.contains("_hss_worker_restarts 2"));
    }

    #[test]
    fn clones_share_the_counter() {
        let metrics = Metrics::new("app").unwrap();
        let clone = metrics.clone();
        clone.inc_worker_restarts();
        assert_eq!(metrics.worker_restarts(), 1);
    }
}
