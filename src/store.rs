//! Release Store
//!
//! Filesystem-backed catalog of published releases. The release directory
//! holds `*.manifest.json` files, each naming an artifact file in the same
//! directory. A scan builds an immutable [`Catalog`] snapshot; request
//! handlers clone one `Arc` per request and the periodic rescan swaps a new
//! snapshot in atomically, so no in-flight request ever observes a torn
//! catalog mixing old and new manifests.
//!
//! Every load-time check failure (parse, missing artifact, checksum or
//! signature mismatch, duplicate) excludes that one manifest and is logged;
//! it never aborts the scan and never surfaces to clients. A scan that fails
//! outright leaves the previous good catalog in place.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;

use crate::manifest::{Platform, ReleaseManifest, SemVer};
use crate::verify::Verifier;

const MANIFEST_SUFFIX: &str = ".manifest.json";

/// Upper bound on one directory scan, hashing included. A stalled storage
/// backend degrades to serving the last-known-good catalog.
const SCAN_TIMEOUT: Duration = Duration::from_secs(120);

/// Upper bound on opening one artifact for streaming.
const OPEN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("release directory unreadable: {0}")]
    Io(#[from] std::io::Error),
    #[error("scan timed out")]
    TimedOut,
    #[error("scan task aborted")]
    Aborted,
}

#[derive(Debug, Error)]
pub enum OpenError {
    #[error("artifact unavailable: {0}")]
    Unavailable(String),
}

/// One catalog entry: a verified manifest plus the resolved artifact path.
#[derive(Debug, Clone)]
pub struct StoredRelease {
    pub manifest: ReleaseManifest,
    pub artifact: PathBuf,
    pub artifact_len: u64,
}

/// Immutable view of all currently servable releases.
#[derive(Debug, Default)]
pub struct Catalog {
    releases: HashMap<(String, Platform), StoredRelease>,
    latest: HashMap<Platform, String>,
}

impl Catalog {
    pub fn get(&self, version: &str, platform: Platform) -> Option<&StoredRelease> {
        self.releases.get(&(version.to_string(), platform))
    }

    pub fn latest(&self, platform: Platform) -> Option<&StoredRelease> {
        let version = self.latest.get(&platform)?;
        self.releases.get(&(version.clone(), platform))
    }

    pub fn len(&self) -> usize {
        self.releases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.releases.is_empty()
    }

    fn insert(&mut self, release: StoredRelease, version: SemVer) {
        let platform = release.manifest.platform;
        let key = (release.manifest.version.clone(), platform);

        let supersedes = match self.latest.get(&platform) {
            Some(current) => current.parse::<SemVer>().map_or(true, |c| version > c),
            None => true,
        };
        if supersedes {
            self.latest.insert(platform, release.manifest.version.clone());
        }
        self.releases.insert(key, release);
    }
}

/// Outcome counts for one scan, for the logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanSummary {
    pub loaded: usize,
    pub skipped: usize,
}

/// Owner of the catalog and the release directory.
pub struct ReleaseStore {
    release_dir: PathBuf,
    verifier: Verifier,
    catalog: RwLock<Arc<Catalog>>,
}

impl ReleaseStore {
    /// Create a store with an empty catalog. Call [`scan`](Self::scan)
    /// before serving.
    pub fn new(release_dir: PathBuf, verifier: Verifier) -> Self {
        Self {
            release_dir,
            verifier,
            catalog: RwLock::new(Arc::new(Catalog::default())),
        }
    }

    /// The current catalog snapshot. Cheap; cloned once per request.
    pub fn snapshot(&self) -> Arc<Catalog> {
        self.catalog
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Rescan the release directory and atomically swap in the new catalog.
    ///
    /// On any failure the previous catalog stays active and the error is
    /// returned for logging.
    pub async fn scan(&self) -> Result<ScanSummary, ScanError> {
        let dir = self.release_dir.clone();
        let verifier = self.verifier.clone();

        let scan_task =
            tokio::task::spawn_blocking(move || scan_release_dir(&dir, &verifier));
        let (catalog, summary) = match tokio::time::timeout(SCAN_TIMEOUT, scan_task).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_join_error)) => return Err(ScanError::Aborted),
            Err(_elapsed) => return Err(ScanError::TimedOut),
        };

        let mut guard = self
            .catalog
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = Arc::new(catalog);
        Ok(summary)
    }

    /// Open a catalogued release's artifact for streaming. Resolution
    /// stays with the caller so one request reads one catalog snapshot.
    pub async fn open_artifact(
        &self,
        release: &StoredRelease,
    ) -> Result<tokio::fs::File, OpenError> {
        let open = tokio::fs::File::open(&release.artifact);
        match tokio::time::timeout(OPEN_TIMEOUT, open).await {
            Ok(Ok(file)) => Ok(file),
            Ok(Err(e)) => Err(OpenError::Unavailable(e.to_string())),
            Err(_elapsed) => Err(OpenError::Unavailable("open timed out".to_string())),
        }
    }

    /// Periodic rescan driver; runs until the process exits.
    pub async fn reload_loop(self: Arc<Self>, interval_secs: u64) {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The immediate first tick; the startup scan already ran.
        interval.tick().await;

        loop {
            interval.tick().await;
            match self.scan().await {
                Ok(summary) => {
                    tracing::debug!(
                        loaded = summary.loaded,
                        skipped = summary.skipped,
                        "catalog rescan complete"
                    );
                }
                Err(e) => {
                    tracing::warn!(error = %e, "catalog rescan failed; keeping previous catalog");
                }
            }
        }
    }
}

/// Artifact paths are confined to the release directory.
fn artifact_path_is_safe(path: &str) -> bool {
    let path = Path::new(path);
    !path.is_absolute()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

fn scan_release_dir(
    dir: &Path,
    verifier: &Verifier,
) -> Result<(Catalog, ScanSummary), ScanError> {
    let mut catalog = Catalog::default();
    let mut summary = ScanSummary::default();

    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.ends_with(MANIFEST_SUFFIX))
                .unwrap_or(false)
        })
        .collect();
    // Deterministic load order so duplicate resolution is stable across scans.
    entries.sort();

    for path in entries {
        match load_one(dir, &path, verifier, &catalog) {
            Ok((release, version)) => {
                catalog.insert(release, version);
                summary.loaded += 1;
            }
            Err(reason) => {
                tracing::warn!(manifest = %path.display(), %reason, "excluding manifest from catalog");
                summary.skipped += 1;
            }
        }
    }

    Ok((catalog, summary))
}

fn load_one(
    dir: &Path,
    path: &Path,
    verifier: &Verifier,
    catalog: &Catalog,
) -> Result<(StoredRelease, SemVer), String> {
    let raw = std::fs::read_to_string(path).map_err(|e| format!("read failed: {e}"))?;
    let manifest: ReleaseManifest =
        serde_json::from_str(&raw).map_err(|e| format!("malformed manifest: {e}"))?;

    let version = manifest
        .semver()
        .map_err(|e| format!("bad version: {e}"))?;

    if catalog
        .get(&manifest.version, manifest.platform)
        .is_some()
    {
        return Err(format!(
            "duplicate release {} for {}",
            manifest.version, manifest.platform
        ));
    }

    if !artifact_path_is_safe(&manifest.artifact_path) {
        return Err(format!(
            "artifact path escapes release dir: {}",
            manifest.artifact_path
        ));
    }

    let artifact = dir.join(&manifest.artifact_path);
    let metadata =
        std::fs::metadata(&artifact).map_err(|e| format!("artifact missing: {e}"))?;
    if !metadata.is_file() {
        return Err("artifact is not a regular file".to_string());
    }

    verifier
        .verify_artifact(&artifact, &manifest.checksum)
        .map_err(|e| format!("artifact integrity: {e}"))?;
    verifier
        .verify_manifest(&manifest)
        .map_err(|e| format!("signature: {e}"))?;

    Ok((
        StoredRelease {
            manifest,
            artifact,
            artifact_len: metadata.len(),
        },
        version,
    ))
}
