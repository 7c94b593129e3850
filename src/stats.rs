//! Stats Collector
//!
//! Aggregated delivery counters keyed by `(version, platform, event type)`.
//!
//! Recording never blocks the response path and never fails the caller:
//! existing counters are bumped with an atomic increment under a shared read
//! lock, and the write lock is only taken to insert a key the collector has
//! not seen before. Handlers only record versions/platforms they resolved
//! from the catalog, and everything else lands in a single `unknown` slot,
//! so counter cardinality stays bounded by the catalog contents — arbitrary
//! client input cannot grow the map.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// Bucket label for anything not resolved against the catalog.
pub const UNKNOWN: &str = "unknown";

/// Hard cap on distinct counter keys; past it, new keys fold into `unknown`.
const MAX_COUNTER_KEYS: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum EventType {
    #[serde(rename = "check")]
    Check,
    #[serde(rename = "download-start")]
    DownloadStart,
    #[serde(rename = "download-complete")]
    DownloadComplete,
    #[serde(rename = "download-partial")]
    DownloadPartial,
    #[serde(rename = "rate-limited")]
    RateLimited,
}

/// One observed client interaction. Created on request, folded into a
/// counter, then dropped — raw events are never retained.
#[derive(Debug, Clone)]
pub struct DownloadEvent {
    pub version: String,
    pub platform: String,
    pub client_id: String,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
}

impl DownloadEvent {
    pub fn new(version: &str, platform: &str, client_id: &str, event_type: EventType) -> Self {
        Self {
            version: version.to_string(),
            platform: platform.to_string(),
            client_id: client_id.to_string(),
            event_type,
            timestamp: Utc::now(),
        }
    }

    /// An event for a request that never resolved a catalog entry.
    pub fn unknown(client_id: &str, event_type: EventType) -> Self {
        Self::new(UNKNOWN, UNKNOWN, client_id, event_type)
    }
}

/// Coarse client identity: truncated hex SHA-256 of the peer IP. Raw
/// addresses are never retained past the request.
pub fn client_id(ip: IpAddr) -> String {
    let digest = Sha256::digest(ip.to_string().as_bytes());
    hex::encode(&digest[..8])
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StatKey {
    version: String,
    platform: String,
    event_type: EventType,
}

/// One aggregate entry in a snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct StatEntry {
    pub version: String,
    pub platform: String,
    pub event_type: EventType,
    pub count: u64,
}

/// Snapshot of all counters at one point in time.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub generated_at: DateTime<Utc>,
    pub entries: Vec<StatEntry>,
}

/// Owner of the aggregate counters.
pub struct StatsCollector {
    enabled: bool,
    counters: RwLock<HashMap<StatKey, AtomicU64>>,
}

impl StatsCollector {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            counters: RwLock::new(HashMap::new()),
        }
    }

    /// Fold one event into the counters. Infallible and non-blocking from
    /// the caller's perspective; a disabled collector discards events.
    pub fn record(&self, event: DownloadEvent) {
        if !self.enabled {
            return;
        }

        let mut key = StatKey {
            version: event.version,
            platform: event.platform,
            event_type: event.event_type,
        };

        // Common case: the key exists and an atomic bump under the read
        // lock suffices; unrelated keys never contend.
        {
            let counters = self
                .counters
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(counter) = counters.get(&key) {
                counter.fetch_add(1, Ordering::Relaxed);
                return;
            }
            if counters.len() >= MAX_COUNTER_KEYS {
                key = StatKey {
                    version: UNKNOWN.to_string(),
                    platform: UNKNOWN.to_string(),
                    event_type: key.event_type,
                };
            }
        }

        let mut counters = self
            .counters
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        counters
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Aggregate counts by version/platform/event type, sorted for stable
    /// output.
    pub fn snapshot(&self) -> StatsSnapshot {
        let counters = self
            .counters
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut entries: Vec<StatEntry> = counters
            .iter()
            .map(|(key, count)| StatEntry {
                version: key.version.clone(),
                platform: key.platform.clone(),
                event_type: key.event_type,
                count: count.load(Ordering::Relaxed),
            })
            .collect();
        entries.sort_by(|a, b| {
            (&a.version, &a.platform, a.event_type).cmp(&(&b.version, &b.platform, b.event_type))
        });
        StatsSnapshot {
            generated_at: Utc::now(),
            entries,
        }
    }

    /// Count for one combination; zero when never recorded.
    pub fn count(&self, version: &str, platform: &str, event_type: EventType) -> u64 {
        let counters = self
            .counters
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        counters
            .get(&StatKey {
                version: version.to_string(),
                platform: platform.to_string(),
                event_type,
            })
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}
