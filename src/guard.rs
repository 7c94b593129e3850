//! Rate Limiter / Request Guard
//!
//! Fixed-window request counter per `(client, route class)`. Cheap metadata
//! queries and expensive artifact downloads are budgeted independently, so a
//! burst of downloads cannot starve update checks and vice versa.
//!
//! Buckets live in a read-mostly map: admissions for tracked clients take
//! the shared read lock and serialize only on their own bucket's mutex. The
//! exclusive write lock is taken once per first-seen client, to insert.
//!
//! Memory is bounded two ways: idle buckets are swept every
//! `cleanup_interval` admissions, and `max_tracked_clients` puts a hard cap
//! on the map — at the cap, cleanup is forced on the insert path and a
//! still-unknown client is rejected rather than tracked. Windows are
//! wall-clock; state is per-process only.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// Coarse cost category of an endpoint, limited independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteClass {
    /// Manifest and check-for-update queries.
    Metadata,
    /// Artifact byte transfers.
    Download,
}

#[derive(Debug, Clone)]
pub struct GuardConfig {
    pub metadata_limit: u32,
    pub download_limit: u32,
    pub window: Duration,
    /// Sweep idle buckets every N admissions.
    pub cleanup_interval: u64,
    /// Hard cap on tracked `(client, class)` buckets.
    pub max_tracked_clients: usize,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            metadata_limit: 120,
            download_limit: 20,
            window: Duration::from_secs(60),
            cleanup_interval: 100,
            max_tracked_clients: 10_000,
        }
    }
}

/// Per-client window state, guarded by its own mutex in the map.
#[derive(Debug)]
struct RateBucket {
    window_start: Instant,
    count: u32,
}

/// Rejection signal with the client's retry hint in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejected {
    pub retry_after_secs: u64,
}

pub struct RequestGuard {
    config: GuardConfig,
    state: RwLock<HashMap<(String, RouteClass), Mutex<RateBucket>>>,
    admissions: AtomicU64,
}

impl RequestGuard {
    pub fn new(config: GuardConfig) -> Self {
        Self {
            config,
            state: RwLock::new(HashMap::new()),
            admissions: AtomicU64::new(0),
        }
    }

    fn limit_for(&self, class: RouteClass) -> u32 {
        match class {
            RouteClass::Metadata => self.config.metadata_limit,
            RouteClass::Download => self.config.download_limit,
        }
    }

    /// Admit or reject one request. Exactly `limit` requests pass per
    /// window; rejection never grows the counter past the cap.
    pub fn admit(&self, client_id: &str, class: RouteClass) -> Result<(), Rejected> {
        let now = Instant::now();

        let count = self.admissions.fetch_add(1, Ordering::Relaxed);
        if count > 0 && count % self.config.cleanup_interval == 0 {
            self.cleanup();
        }

        let key = (client_id.to_string(), class);

        // Fast path: a tracked client touches only its own bucket under
        // the shared read lock.
        {
            let state = self
                .state
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(bucket) = state.get(&key) {
                return self.tick(bucket, client_id, class, now);
            }
        }

        // First sighting of this (client, class): insert under the write
        // lock. Another thread may have raced the insert; `entry` keeps
        // exactly one bucket either way.
        let mut state = self
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if !state.contains_key(&key) && state.len() >= self.config.max_tracked_clients {
            // Try to reclaim expired buckets before rejecting a new client.
            Self::sweep(&mut state, now, self.config.window);
            if state.len() >= self.config.max_tracked_clients {
                tracing::warn!(
                    tracked = state.len(),
                    "rejecting new client: tracked-client cap reached"
                );
                return Err(Rejected {
                    retry_after_secs: self.config.window.as_secs().max(1),
                });
            }
        }

        let bucket = state.entry(key).or_insert_with(|| {
            Mutex::new(RateBucket {
                window_start: now,
                count: 0,
            })
        });
        self.tick(bucket, client_id, class, now)
    }

    /// Window arithmetic for one bucket. Callers hold the map lock in
    /// either mode; only the bucket's own mutex is contended here.
    fn tick(
        &self,
        bucket: &Mutex<RateBucket>,
        client_id: &str,
        class: RouteClass,
        now: Instant,
    ) -> Result<(), Rejected> {
        let limit = self.limit_for(class);
        let mut bucket = bucket.lock().unwrap_or_else(PoisonError::into_inner);

        if now.duration_since(bucket.window_start) >= self.config.window {
            bucket.window_start = now;
            bucket.count = 0;
        }

        if bucket.count >= limit {
            let remaining = self
                .config
                .window
                .saturating_sub(now.duration_since(bucket.window_start));
            tracing::debug!(client = client_id, ?class, "rate limit exceeded");
            return Err(Rejected {
                retry_after_secs: remaining.as_secs().max(1),
            });
        }

        bucket.count += 1;
        Ok(())
    }

    /// Drop buckets idle for a full window past expiry.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let mut state = self
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        Self::sweep(&mut state, now, self.config.window);
    }

    fn sweep(
        state: &mut HashMap<(String, RouteClass), Mutex<RateBucket>>,
        now: Instant,
        window: Duration,
    ) {
        let ttl = window * 2;
        state.retain(|_, bucket| {
            let bucket = bucket.lock().unwrap_or_else(PoisonError::into_inner);
            now.duration_since(bucket.window_start) < ttl
        });
    }

    pub fn tracked_clients(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
