//! HTTP Surface
//!
//! Composes the Release Store, Request Guard, Stats Collector and CDN
//! Redirector behind the update protocol routes. Every response either
//! carries a verified manifest's data or is an explicit 404/429/500; the
//! request pipeline is guard, then route, then respond.

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Path, Query, Request, State};
use axum::http::{header, HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::{Extension, Router};
use chrono::{DateTime, Utc};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio_util::io::ReaderStream;
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::cdn::{CdnRedirector, Delivery};
use crate::error::ApiError;
use crate::guard::{RequestGuard, RouteClass};
use crate::manifest::{Platform, ReleaseManifest};
use crate::stats::{self, DownloadEvent, EventType, StatsCollector, StatsSnapshot};
use crate::store::{OpenError, ReleaseStore};

pub const CHECKSUM_HEADER: &str = "x-checksum-sha256";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<ReleaseStore>,
    pub stats: Arc<StatsCollector>,
    pub guard: Arc<RequestGuard>,
    pub cdn: Arc<CdnRedirector>,
}

/// Coarse per-request client identity, attached by the guard middleware.
#[derive(Debug, Clone)]
pub struct ClientId(pub String);

pub fn create_router(state: AppState) -> Router {
    // The desktop client's update check runs cross-origin; the surface is
    // read-only, so GET from anywhere is the whole allowance.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET]);

    let guarded = Router::new()
        .route("/latest", get(latest))
        .route("/releases/{version}/{platform}/manifest", get(manifest))
        .route("/releases/{version}/{platform}/download", get(download))
        .route("/stats", get(stats_report))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            guard_middleware,
        ));

    Router::new()
        .merge(guarded)
        // Liveness stays outside the guard and never touches the catalog.
        .route("/healthz", get(health))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("cross-origin-resource-policy"),
            HeaderValue::from_static("cross-origin"),
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn route_class(path: &str) -> RouteClass {
    if path.ends_with("/download") {
        RouteClass::Download
    } else {
        RouteClass::Metadata
    }
}

fn peer_ip(req: &Request) -> IpAddr {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

async fn guard_middleware(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let client_id = stats::client_id(peer_ip(&req));
    let class = route_class(req.uri().path());

    if let Err(rejection) = state.guard.admit(&client_id, class) {
        // Rejections are visible to operators as their own event class.
        state
            .stats
            .record(DownloadEvent::unknown(&client_id, EventType::RateLimited));
        return ApiError::RateLimited {
            retry_after_secs: rejection.retry_after_secs,
        }
        .into_response();
    }

    req.extensions_mut().insert(ClientId(client_id));
    next.run(req).await
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Client-facing manifest shape, with the download route included.
#[derive(Serialize)]
pub struct ManifestView {
    pub version: String,
    pub platform: Platform,
    pub checksum: String,
    pub signature: String,
    pub published_at: DateTime<Utc>,
    pub download_url: String,
}

impl From<&ReleaseManifest> for ManifestView {
    fn from(m: &ReleaseManifest) -> Self {
        Self {
            version: m.version.clone(),
            platform: m.platform,
            checksum: m.checksum.clone(),
            signature: m.signature.clone(),
            published_at: m.published_at,
            download_url: format!("/releases/{}/{}/download", m.version, m.platform),
        }
    }
}

/// Manifests must never be cached: "latest" changes out from under caches.
fn manifest_response(manifest: &ReleaseManifest) -> Response {
    (
        [(header::CACHE_CONTROL, "no-store")],
        Json(ManifestView::from(manifest)),
    )
        .into_response()
}

#[derive(Deserialize)]
struct LatestParams {
    platform: String,
}

async fn latest(
    State(state): State<AppState>,
    Extension(client): Extension<ClientId>,
    Query(params): Query<LatestParams>,
) -> Result<Response, ApiError> {
    let Ok(platform) = params.platform.parse::<Platform>() else {
        state
            .stats
            .record(DownloadEvent::unknown(&client.0, EventType::Check));
        return Err(ApiError::NotFound);
    };

    let snapshot = state.store.snapshot();
    match snapshot.latest(platform) {
        Some(release) => {
            state.stats.record(DownloadEvent::new(
                &release.manifest.version,
                platform.as_str(),
                &client.0,
                EventType::Check,
            ));
            Ok(manifest_response(&release.manifest))
        }
        None => {
            state.stats.record(DownloadEvent::new(
                stats::UNKNOWN,
                platform.as_str(),
                &client.0,
                EventType::Check,
            ));
            Err(ApiError::NotFound)
        }
    }
}

async fn manifest(
    State(state): State<AppState>,
    Extension(client): Extension<ClientId>,
    Path((version, platform)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let Ok(platform) = platform.parse::<Platform>() else {
        state
            .stats
            .record(DownloadEvent::unknown(&client.0, EventType::Check));
        return Err(ApiError::NotFound);
    };

    let snapshot = state.store.snapshot();
    match snapshot.get(&version, platform) {
        Some(release) => {
            state.stats.record(DownloadEvent::new(
                &release.manifest.version,
                platform.as_str(),
                &client.0,
                EventType::Check,
            ));
            Ok(manifest_response(&release.manifest))
        }
        None => {
            state.stats.record(DownloadEvent::new(
                stats::UNKNOWN,
                platform.as_str(),
                &client.0,
                EventType::Check,
            ));
            Err(ApiError::NotFound)
        }
    }
}

async fn download(
    State(state): State<AppState>,
    Extension(client): Extension<ClientId>,
    Path((version, platform)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let Ok(platform) = platform.parse::<Platform>() else {
        state
            .stats
            .record(DownloadEvent::unknown(&client.0, EventType::DownloadStart));
        return Err(ApiError::NotFound);
    };

    let snapshot = state.store.snapshot();
    let Some(release) = snapshot.get(&version, platform) else {
        state.stats.record(DownloadEvent::new(
            stats::UNKNOWN,
            platform.as_str(),
            &client.0,
            EventType::DownloadStart,
        ));
        return Err(ApiError::NotFound);
    };

    state.stats.record(DownloadEvent::new(
        &release.manifest.version,
        platform.as_str(),
        &client.0,
        EventType::DownloadStart,
    ));

    if let Delivery::Redirect(url) = state.cdn.resolve(&release.manifest) {
        let location =
            HeaderValue::from_str(&url).map_err(|_| ApiError::Internal)?;
        return Response::builder()
            .status(StatusCode::TEMPORARY_REDIRECT)
            .header(header::LOCATION, location)
            .header(header::CACHE_CONTROL, "no-store")
            .body(Body::empty())
            .map_err(|_| ApiError::Internal);
    }

    // Opened from the same snapshot the release resolved against; a
    // rescan landing mid-request cannot retract the promised bytes.
    let file = match state.store.open_artifact(release).await {
        Ok(file) => file,
        Err(OpenError::Unavailable(reason)) => {
            tracing::error!(%version, %platform, %reason, "artifact open failed");
            return Err(ApiError::Internal);
        }
    };

    let stream = TrackedStream::new(
        ReaderStream::new(file),
        Arc::clone(&state.stats),
        release.manifest.version.clone(),
        platform,
        client.0.clone(),
    );

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, release.artifact_len)
        // Artifact bytes are immutable and keyed by checksum; caches may
        // hold them as long as they like.
        .header(header::CACHE_CONTROL, "public, max-age=31536000, immutable")
        .header(CHECKSUM_HEADER, release.manifest.checksum.as_str())
        .body(Body::from_stream(stream))
        .map_err(|_| ApiError::Internal)
}

async fn stats_report(State(state): State<AppState>) -> Json<StatsSnapshot> {
    Json(state.stats.snapshot())
}

/// Byte stream that reports how the transfer ended: `download-complete` on
/// EOF, `download-partial` when the client disconnects first (the stream is
/// dropped before EOF) or the read errors. Dropping the stream also drops
/// the file handle.
struct TrackedStream {
    inner: ReaderStream<tokio::fs::File>,
    stats: Arc<StatsCollector>,
    version: String,
    platform: Platform,
    client_id: String,
    outcome_recorded: bool,
}

impl TrackedStream {
    fn new(
        inner: ReaderStream<tokio::fs::File>,
        stats: Arc<StatsCollector>,
        version: String,
        platform: Platform,
        client_id: String,
    ) -> Self {
        Self {
            inner,
            stats,
            version,
            platform,
            client_id,
            outcome_recorded: false,
        }
    }

    fn record_outcome(&mut self, event_type: EventType) {
        if !self.outcome_recorded {
            self.outcome_recorded = true;
            self.stats.record(DownloadEvent::new(
                &self.version,
                self.platform.as_str(),
                &self.client_id,
                event_type,
            ));
        }
    }
}

impl Stream for TrackedStream {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(None) => {
                this.record_outcome(EventType::DownloadComplete);
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(e))) => {
                this.record_outcome(EventType::DownloadPartial);
                Poll::Ready(Some(Err(e)))
            }
            other => other,
        }
    }
}

impl Drop for TrackedStream {
    fn drop(&mut self) {
        self.record_outcome(EventType::DownloadPartial);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_classification() {
        assert_eq!(route_class("/latest"), RouteClass::Metadata);
        assert_eq!(
            route_class("/releases/1.3.0/linux-x64/manifest"),
            RouteClass::Metadata
        );
        assert_eq!(
            route_class("/releases/1.3.0/linux-x64/download"),
            RouteClass::Download
        );
        assert_eq!(route_class("/stats"), RouteClass::Metadata);
    }

    #[test]
    fn test_manifest_view_download_url() {
        let m = ReleaseManifest {
            version: "1.3.0".to_string(),
            platform: Platform::LinuxX64,
            artifact_path: "a.tar.gz".to_string(),
            checksum: "cafe01".to_string(),
            signature: "00".to_string(),
            published_at: Utc::now(),
            cdn_url: None,
            mirrored: None,
        };
        let view = ManifestView::from(&m);
        assert_eq!(view.download_url, "/releases/1.3.0/linux-x64/download");
    }

    #[tokio::test]
    async fn test_tracked_stream_records_complete_on_eof() {
        use futures_util::StreamExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact");
        std::fs::write(&path, b"all the bytes").unwrap();

        let stats = Arc::new(StatsCollector::new(true));
        let file = tokio::fs::File::open(&path).await.unwrap();
        let mut stream = TrackedStream::new(
            ReaderStream::new(file),
            Arc::clone(&stats),
            "1.3.0".to_string(),
            Platform::LinuxX64,
            "client".to_string(),
        );

        while stream.next().await.is_some() {}
        drop(stream);

        assert_eq!(
            stats.count("1.3.0", "linux-x64", EventType::DownloadComplete),
            1
        );
        assert_eq!(
            stats.count("1.3.0", "linux-x64", EventType::DownloadPartial),
            0
        );
    }

    #[tokio::test]
    async fn test_tracked_stream_records_partial_on_early_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact");
        std::fs::write(&path, b"never delivered").unwrap();

        let stats = Arc::new(StatsCollector::new(true));
        let file = tokio::fs::File::open(&path).await.unwrap();
        let stream = TrackedStream::new(
            ReaderStream::new(file),
            Arc::clone(&stats),
            "1.3.0".to_string(),
            Platform::LinuxX64,
            "client".to_string(),
        );

        // Client disconnects before any chunk is polled.
        drop(stream);

        assert_eq!(
            stats.count("1.3.0", "linux-x64", EventType::DownloadPartial),
            1
        );
    }
}
