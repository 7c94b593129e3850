//! Atrium update server - main entry point.

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use atrium_updates::api::{create_router, AppState};
use atrium_updates::cdn::CdnRedirector;
use atrium_updates::config::ServerOptions;
use atrium_updates::guard::{GuardConfig, RequestGuard};
use atrium_updates::stats::StatsCollector;
use atrium_updates::store::ReleaseStore;
use atrium_updates::verify::Verifier;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("ATRIUM_UPDATES_LOG")
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let options = ServerOptions::parse();
    // Fail-closed: invalid key material or a missing release directory must
    // stop the process before it serves a single request.
    let config = options.validate().context("invalid configuration")?;
    let verifier =
        Verifier::from_hex(&config.public_key_hex).context("invalid public key material")?;

    let store = Arc::new(ReleaseStore::new(config.release_dir.clone(), verifier));
    let summary = store
        .scan()
        .await
        .context("initial release directory scan failed")?;
    tracing::info!(
        release_dir = %config.release_dir.display(),
        loaded = summary.loaded,
        skipped = summary.skipped,
        "catalog loaded"
    );

    tokio::spawn(Arc::clone(&store).reload_loop(config.scan_interval_secs));

    let state = AppState {
        store,
        stats: Arc::new(StatsCollector::new(config.stats_enabled)),
        guard: Arc::new(RequestGuard::new(GuardConfig {
            metadata_limit: config.metadata_rate_limit,
            download_limit: config.download_rate_limit,
            window: Duration::from_secs(config.rate_window_secs),
            ..Default::default()
        })),
        cdn: Arc::new(CdnRedirector::new(
            config.cdn_enabled,
            config.cdn_base_url.clone(),
        )),
    };
    let app = create_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    tracing::info!(%addr, cdn = config.cdn_enabled, stats = config.stats_enabled, "serving updates");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
