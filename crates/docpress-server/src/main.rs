//! docpress server: HTTP front-end over the LibreOffice backend.

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use docpress::backend::{SofficeFactory, SofficeOptions};
use docpress::resources::ProcSampler;
use docpress::{ConversionService, ConvertConfig, ServerConfig, SignalReaper, transport};

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("DOCPRESS_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("docpress={level},docpress_server={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = ConvertConfig::from_env().context("invalid conversion configuration")?;
    let server_config = ServerConfig::from_env().context("invalid server configuration")?;

    let mut options = SofficeOptions::default();
    if let Ok(binary) = std::env::var("DOCPRESS_SOFFICE") {
        options = options.with_binary(binary);
    }

    let service = Arc::new(ConversionService::new(
        config,
        Arc::new(SofficeFactory::new(options)),
        Arc::new(SignalReaper::default()),
    )?);

    if !service.check_availability().await {
        tracing::warn!("LibreOffice is not available; conversions will be rejected until it is");
    }

    let monitor = service.spawn_health_monitor(Arc::new(ProcSampler));

    transport::serve(server_config, Arc::clone(&service)).await?;

    if let Err(e) = monitor.await {
        tracing::warn!(error = %e, "Health monitor task failed");
    }

    Ok(())
}
