//! # Death Marker Server
//!
//! Collects death markers submitted by game clients and serves them back as
//! CSV or compact binary exports.
//!
//! ## Routes
//! - `GET /list`: position listing for a level.
//! - `GET /analysis`: full rows for a level with anonymised identifiers.
//! - `ANY /submit`: stores one marker.
//! - `GET /robots.txt`, `GET /health`, and static files from the front-end
//!   directory; anything else redirects to `/`.
//!
//! The three data routes sit behind the admission controller, which admits
//! everything for a start-up grace period and then rate-limits per client
//! address, escalating repeat offenders to timed bans.
//!
//! ## Lifecycle
//! Configuration is layered defaults < `server_markers.conf` < env/CLI. On
//! Ctrl-C or SIGTERM the server stops accepting connections, cancels
//! in-flight exports through a shared `CancellationToken`, and drains for up
//! to ten seconds.

#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum_server::tls_rustls::RustlsConfig;
use lib_markers::connections::PostgresStore;
use lib_markers::core::admission::AdmissionController;
use lib_markers::loggers::setup_logging;
use lib_markers::store::{DummyStore, MarkerStore};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod markers_logic;
use markers_logic::config::{self, StoreKind};
use markers_logic::routes::build_router;
use markers_logic::state::{AppState, DEFAULT_ROBOTS, now_ms, spawn_reaper};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- Phase 1: Configuration & Logging ---
    let settings = config::load_config()?;
    let _log_guard = setup_logging(&settings.log_dir, &settings.log_level, "server_markers")?;
    info!(port = settings.port, "Death marker server booting.");

    // --- Phase 2: Storage ---
    let store: Arc<dyn MarkerStore> = match &settings.store {
        StoreKind::Dummy => {
            warn!("Using the dummy store; submissions are discarded.");
            Arc::new(DummyStore)
        }
        StoreKind::Postgres { url, pool_size } => Arc::new(PostgresStore::connect(url, *pool_size).await?),
    };

    // --- Phase 3: Admission Control ---
    let shutdown = CancellationToken::new();
    let admission = Arc::new(AdmissionController::new(settings.admission.clone(), now_ms()));
    if settings.admission.grace_ms > 0 {
        info!(grace_ms = settings.admission.grace_ms, "Rate limiter inactive during start-up grace period.");
    }
    let reaper = spawn_reaper(admission.clone(), shutdown.clone());

    // --- Phase 4: Router ---
    let robots = tokio::fs::read_to_string(settings.static_dir.join("robots.txt"))
        .await
        .unwrap_or_else(|_| DEFAULT_ROBOTS.to_string());
    let state = AppState {
        store,
        admission,
        excluded_levels: Arc::from(settings.excluded_levels.clone()),
        trust_proxy: settings.trust_proxy,
        batch_rows: settings.batch_rows,
        robots: Arc::from(robots),
        shutdown: shutdown.clone(),
    };
    let app = build_router(state, &settings.static_dir);

    // --- Phase 5: Serve until signalled ---
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    let handle = axum_server::Handle::new();
    let signal_handle = handle.clone();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        warn!("Shutdown signal received. Closing server gracefully...");
        signal_token.cancel();
        signal_handle.graceful_shutdown(Some(Duration::from_secs(10)));
    });

    let service = app.into_make_service_with_connect_info::<SocketAddr>();
    match &settings.tls {
        Some(tls) => {
            // Rustls 0.23+ requires an explicit crypto provider.
            rustls::crypto::ring::default_provider()
                .install_default()
                .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;
            info!("Loading TLS certs from: {}", tls.cert_path.display());
            let tls_config = RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
                .await
                .map_err(|e| anyhow::anyhow!("TLS Configuration Error: {}", e))?;
            info!("Listening on https://{}", addr);
            axum_server::bind_rustls(addr, tls_config)
                .handle(handle)
                .serve(service)
                .await?;
        }
        None => {
            info!("Listening on http://{}", addr);
            axum_server::bind(addr).handle(handle).serve(service).await?;
        }
    }

    shutdown.cancel();
    if let Err(e) = reaper.await {
        error!("Admission reaper ended abnormally: {}", e);
    }
    info!("Server stopped.");
    Ok(())
}

/// # Graceful Shutdown Signal Handler
///
/// Resolves on Ctrl-C, or SIGTERM on UNIX. A handler that cannot be installed
/// is logged and never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
