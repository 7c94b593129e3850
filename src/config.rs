//! Server Configuration
//!
//! Every option is a CLI flag doubling as an `ATRIUM_UPDATES_*` environment
//! variable. Validation is fail-closed: without valid public key material
//! the process refuses to start rather than serve unverified manifests.

use clap::Parser;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("release directory not found: {0}")]
    ReleaseDirMissing(PathBuf),
    #[error("no public key configured; refusing to serve unverified releases")]
    MissingPublicKey,
    #[error("public key is not a 64-character hex string")]
    InvalidPublicKey,
    #[error("failed to read public key file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid rate limit settings: {0}")]
    InvalidRateLimit(&'static str),
}

/// Command line / environment options, unvalidated.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "atrium-update-server",
    version,
    about = "Atrium update distribution server"
)]
pub struct ServerOptions {
    /// Bind address.
    #[arg(long, env = "ATRIUM_UPDATES_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Bind port.
    #[arg(long, env = "ATRIUM_UPDATES_PORT", default_value_t = 8639)]
    pub port: u16,

    /// Directory holding `*.manifest.json` files and their artifacts.
    #[arg(long, env = "ATRIUM_UPDATES_RELEASE_DIR")]
    pub release_dir: PathBuf,

    /// ED25519 public key as 64 hex chars, inline.
    #[arg(long, env = "ATRIUM_UPDATES_PUBLIC_KEY")]
    pub public_key: Option<String>,

    /// Path to a file containing the hex public key. Ignored when
    /// --public-key is given.
    #[arg(long, env = "ATRIUM_UPDATES_PUBLIC_KEY_FILE")]
    pub public_key_file: Option<PathBuf>,

    /// Record download/check statistics.
    #[arg(
        long,
        env = "ATRIUM_UPDATES_STATS_ENABLED",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub stats_enabled: bool,

    /// Redirect artifact downloads to a CDN mirror when possible.
    #[arg(
        long,
        env = "ATRIUM_UPDATES_CDN_ENABLED",
        default_value_t = false,
        action = clap::ArgAction::Set
    )]
    pub cdn_enabled: bool,

    /// CDN URL template; `{version}`, `{platform}` and `{filename}` are
    /// substituted per artifact.
    #[arg(long, env = "ATRIUM_UPDATES_CDN_BASE_URL")]
    pub cdn_base_url: Option<String>,

    /// Seconds between catalog rescans of the release directory.
    #[arg(long, env = "ATRIUM_UPDATES_SCAN_INTERVAL_SECS", default_value_t = 30)]
    pub scan_interval_secs: u64,

    /// Requests per window for manifest/check routes, per client.
    #[arg(long, env = "ATRIUM_UPDATES_METADATA_RATE_LIMIT", default_value_t = 120)]
    pub metadata_rate_limit: u32,

    /// Requests per window for artifact downloads, per client.
    #[arg(long, env = "ATRIUM_UPDATES_DOWNLOAD_RATE_LIMIT", default_value_t = 20)]
    pub download_rate_limit: u32,

    /// Rate limit window length in seconds.
    #[arg(long, env = "ATRIUM_UPDATES_RATE_WINDOW_SECS", default_value_t = 60)]
    pub rate_window_secs: u64,
}

/// Validated configuration the server actually runs with.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub release_dir: PathBuf,
    pub public_key_hex: String,
    pub stats_enabled: bool,
    pub cdn_enabled: bool,
    pub cdn_base_url: Option<String>,
    pub scan_interval_secs: u64,
    pub metadata_rate_limit: u32,
    pub download_rate_limit: u32,
    pub rate_window_secs: u64,
}

impl ServerOptions {
    pub fn validate(self) -> Result<Config, ConfigError> {
        if !self.release_dir.is_dir() {
            return Err(ConfigError::ReleaseDirMissing(self.release_dir));
        }

        let public_key_hex = match (&self.public_key, &self.public_key_file) {
            (Some(inline), _) => inline.trim().to_string(),
            (None, Some(path)) => std::fs::read_to_string(path)?.trim().to_string(),
            (None, None) => return Err(ConfigError::MissingPublicKey),
        };

        match hex::decode(&public_key_hex) {
            Ok(bytes) if bytes.len() == 32 => {}
            _ => return Err(ConfigError::InvalidPublicKey),
        }

        // A zero-second window expires every bucket instantly and a zero
        // limit admits nothing.
        if self.rate_window_secs == 0 {
            return Err(ConfigError::InvalidRateLimit(
                "rate window must be at least one second",
            ));
        }
        if self.metadata_rate_limit == 0 || self.download_rate_limit == 0 {
            return Err(ConfigError::InvalidRateLimit(
                "per-window request limits must be nonzero",
            ));
        }

        Ok(Config {
            host: self.host,
            port: self.port,
            release_dir: self.release_dir,
            public_key_hex,
            stats_enabled: self.stats_enabled,
            cdn_enabled: self.cdn_enabled,
            cdn_base_url: self.cdn_base_url,
            scan_interval_secs: self.scan_interval_secs,
            metadata_rate_limit: self.metadata_rate_limit,
            download_rate_limit: self.download_rate_limit,
            rate_window_secs: self.rate_window_secs,
        })
    }
}
