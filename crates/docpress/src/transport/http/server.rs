//! HTTP server implementation.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::config::ServerConfig;
use crate::service::ConversionService;

use super::routes::routes;

/// Serve the HTTP API, then drain the service once a shutdown source fires.
pub async fn serve(config: ServerConfig, service: Arc<ConversionService>) -> anyhow::Result<()> {
    let shutdown_rx = service.shutdown_rx();
    let app = routes(service.clone());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!(addr = %actual_addr, "docpress listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(config.await_explicit_shutdown, shutdown_rx))
        .await?;

    info!("HTTP server stopped");

    let report = service.shutdown().await;
    info!(
        drained = report.drained,
        detached = report.detached,
        "Affinity workers stopped"
    );

    Ok(())
}

/// Resolves on SIGINT, on SIGTERM unless `await_explicit_shutdown` is set,
/// or once the service's shutdown flag flips.
async fn shutdown_signal(await_explicit_shutdown: bool, mut shutdown_rx: watch::Receiver<bool>) {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "SIGINT handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        if await_explicit_shutdown {
            info!("Ignoring SIGTERM until an explicit shutdown request");
            return std::future::pending::<()>().await;
        }
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = {
        let _ = await_explicit_shutdown;
        std::future::pending::<()>()
    };

    let requested = async {
        while !*shutdown_rx.borrow_and_update() {
            if shutdown_rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    };

    let source = tokio::select! {
        _ = interrupt => "SIGINT",
        _ = terminate => "SIGTERM",
        _ = requested => "shutdown request",
    };
    info!(source, "Stopping HTTP server");
}
