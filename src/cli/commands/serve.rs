//! `serve`: loads tapes and runs the server until shutdown.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::bounds::BoundsRegistry;
use crate::cli::args::ServeArgs;
use crate::config::{ConfigLoader, TapedeckConfig};
use crate::error::TapedeckError;
use crate::observability::metrics;
use crate::processor::CallProcessor;
use crate::replay::HttpUpstream;
use crate::server::{AppState, build_router, parse_bind_addr, serve};
use crate::tape::TapeCatalog;

/// Effective configuration: the file (or defaults), then CLI overrides.
///
/// # Errors
///
/// Returns a config error if the file cannot be loaded.
pub fn resolve_config(args: &ServeArgs) -> Result<TapedeckConfig, TapedeckError> {
    let mut config = match &args.config {
        Some(path) => {
            tracing::info!(config = %path.display(), "loading configuration");
            let loaded = ConfigLoader::new().load(path)?;
            for warning in &loaded.warnings {
                tracing::warn!(
                    location = warning.location.as_deref().unwrap_or("<unknown>"),
                    "{}",
                    warning.message
                );
            }
            loaded.config
        }
        None => TapedeckConfig::default(),
    };
    if let Some(bind) = &args.bind {
        config.server.bind = parse_bind_addr(bind)?;
    }
    if let Some(dir) = &args.tapes_dir {
        config.tapes.dir.clone_from(dir);
    }
    if args.read_only {
        config.tapes.read_only = true;
    }
    Ok(config)
}

/// Starts the server and blocks until `cancel` fires.
///
/// Pending tape saves are flushed before returning.
///
/// # Errors
///
/// Returns an error if configuration, tape loading, metrics or the
/// listener fail.
pub async fn run(args: &ServeArgs, cancel: CancellationToken) -> Result<(), TapedeckError> {
    let config = resolve_config(args)?;

    if let Some(port) = args.metrics_port {
        crate::observability::init_metrics(Some(port))?;
        tracing::info!(port, "Prometheus metrics endpoint started");
    }

    let catalog = Arc::new(
        TapeCatalog::new(Some(config.tapes.dir.clone())).with_read_only(config.tapes.read_only),
    );
    let loaded = catalog.load_dir()?;
    metrics::set_tapes(loaded);

    let upstream = HttpUpstream::new(config.live.timeout(), config.live.user_agent.as_deref())?;
    let processor = Arc::new(CallProcessor::new(
        Arc::clone(&catalog),
        Arc::new(upstream),
        Arc::new(BoundsRegistry::new()),
    ));
    let state = AppState::new(processor).with_max_body_size(config.server.max_body_size);

    let (addr, server) = serve(&config.server.bind, build_router(state), cancel.clone()).await?;
    tracing::info!(
        %addr,
        tapes = loaded,
        dir = %config.tapes.dir.display(),
        read_only = config.tapes.read_only,
        "tapedeck ready"
    );

    cancel.cancelled().await;
    if let Err(e) = server.await {
        tracing::error!(error = %e, "server task failed");
    }
    catalog.flush().await;
    tracing::info!("pending tape saves flushed");
    Ok(())
}
