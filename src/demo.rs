//! Demo backend: an HTTP server whose handler flips a coin and either
//! answers or wedges its serving thread in a busy loop forever. Run a pool
//! of these behind the stabilizer to watch forced restarts in action.

use std::net::SocketAddr;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub async fn run(addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "demo server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |_req: Request<Incoming>| async move {
                if rand::random::<bool>() {
                    warn!("stuck");
                    // Pretend the server thread has gotten completely stuck:
                    // this loop never yields back to the runtime.
                    loop {
                        std::hint::spin_loop();
                    }
                }
                Ok::<_, hyper::Error>(Response::new(Full::new(Bytes::from(format!(
                    "Hello from worker {addr}\n"
                )))))
            });
            let _ = AutoBuilder::new(TokioExecutor::new())
                .serve_connection(io, service)
                .await;
        });
    }
}
