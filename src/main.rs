use std::sync::Arc;

use clap::{CommandFactory, Parser};
use stabilizer::config::{parse_listen_addr, CliArgs, Config};
use stabilizer::demo;
use stabilizer::metrics::{self, Metrics};
use stabilizer::proxy::{Dispatcher, ProxyServer};
use stabilizer::supervisor::Supervisor;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("stabilizer=debug".parse().expect("valid log directive")),
        )
        .init();

    let args = CliArgs::parse();

    if args.demo {
        let addr = parse_listen_addr(&args.demo_listen)?;
        return demo::run(addr).await;
    }

    if args.command.is_empty() {
        CliArgs::command().print_help()?;
        std::process::exit(2);
    }

    let config = Config::try_from(args)?;
    info!(
        listen = %config.listen,
        workers = config.workers,
        concurrency = config.concurrency,
        timeout = %humantime::format_duration(config.timeout),
        header = config.timeout_header.as_deref().unwrap_or(""),
        "starting stabilizer"
    );

    let metrics = Metrics::new(&config.prometheus_app_name)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if let Some(addr) = config.prometheus {
        let metrics = metrics.clone();
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics::serve(addr, metrics, shutdown_rx).await {
                error!(error = %e, "metrics server error");
            }
        });
    }

    let supervisor = Supervisor::new(
        config.command.clone(),
        config.args.clone(),
        config.workers,
        config.concurrency,
    );
    supervisor.ensure_workers(config.workers);

    let dispatcher = Dispatcher::new(
        Arc::clone(&supervisor),
        metrics,
        config.timeout,
        config.timeout_header.clone(),
    );
    let proxy = ProxyServer::new(config.listen, dispatcher, shutdown_rx.clone());
    let server = tokio::spawn(proxy.run());

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            result = server => result??,
            _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        }
    }

    #[cfg(not(unix))]
    tokio::select! {
        result = server => result??,
        _ = tokio::signal::ctrl_c() => info!("received Ctrl+C, shutting down"),
    }

    let _ = shutdown_tx.send(true);
    supervisor.cancel_all();
    Ok(())
}
