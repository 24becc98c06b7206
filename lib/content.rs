//! Per-file content cache.
//!
//! Each listed file's bytes are produced by the transform command with the filename bound into
//! its environment. At most one transform runs per filename at a time: callers arriving while one
//! is running wait for it and observe the same outcome. Failures are cached too, for a shorter
//! window, so a persistently failing transform is not re-run on every read.

use std::ffi::OsStr;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::cache::async_backed::FutureBackedCache;
use crate::cache::eviction::lru::LruEvictionTracker;
use crate::command::{CommandError, CommandRunner};
use crate::fs::FsError;
use crate::listing::Listing;

/// The most recent outcome of materializing one file.
#[derive(Debug, Clone)]
pub enum ContentRecord {
    /// The transform succeeded.
    Ready {
        /// Captured standard output.
        bytes: Bytes,
        /// When the transform finished.
        obtained_at: Instant,
    },
    /// The transform failed.
    Failed {
        /// Why it failed.
        error: Arc<CommandError>,
        /// When the transform finished.
        obtained_at: Instant,
    },
}

impl ContentRecord {
    /// When the transform that produced this record finished.
    #[must_use]
    pub fn obtained_at(&self) -> Instant {
        match self {
            Self::Ready { obtained_at, .. } | Self::Failed { obtained_at, .. } => *obtained_at,
        }
    }

    fn is_fresh(&self, freshness: Duration, failure_window: Duration) -> bool {
        let window = match self {
            Self::Ready { .. } => freshness,
            Self::Failed { .. } => failure_window,
        };
        self.obtained_at().elapsed() < window
    }
}

/// Tunables for a [`ContentCache`].
#[derive(Debug, Clone)]
pub struct ContentCacheConfig {
    /// Transform command template.
    pub command: Arc<str>,
    /// Name of the environment variable the filename is bound to.
    pub input_var: Arc<str>,
    /// How long `Ready` content is served without re-running the transform.
    pub freshness: Duration,
    /// How long a failure is served without re-running the transform.
    pub failure_window: Duration,
    /// Upper bound on the total size of `Ready` content kept in memory.
    pub max_bytes: Option<u64>,
}

/// Maps logical filenames to their materialized content.
pub struct ContentCache<R: CommandRunner> {
    runner: Arc<R>,
    config: ContentCacheConfig,
    records: FutureBackedCache<Arc<OsStr>, ContentRecord>,
    lru: Option<LruEvictionTracker<Arc<OsStr>>>,
    /// The newest listing records were pruned against.
    pruned_against: Mutex<Option<Arc<Listing>>>,
}

impl<R: CommandRunner> ContentCache<R> {
    /// Create an empty content cache.
    pub fn new(runner: Arc<R>, config: ContentCacheConfig) -> Self {
        let lru = config.max_bytes.map(LruEvictionTracker::new);
        Self {
            runner,
            config,
            records: FutureBackedCache::default(),
            lru,
            pruned_against: Mutex::new(None),
        }
    }

    /// Return the content of `name`, running the transform if nothing fresh is cached.
    ///
    /// Fails with [`FsError::NameNotFound`] without running anything if `name` is not in
    /// `listing`, and with [`FsError::ContentUnavailable`] if the transform failed.
    #[instrument(name = "ContentCache::get_content", skip(self, listing))]
    pub async fn get_content(&self, listing: &Listing, name: &OsStr) -> Result<Bytes, FsError> {
        let Some(key) = listing.get(name) else {
            return Err(FsError::NameNotFound(name.to_os_string()));
        };

        let (freshness, failure_window) = (self.config.freshness, self.config.failure_window);
        let record = self
            .records
            .get_or_refresh(
                Arc::clone(key),
                |r| r.is_fresh(freshness, failure_window),
                |_| self.materialize(Arc::clone(key)),
            )
            .await;

        self.forget_if_pruned(key, listing.generation());

        match record {
            ContentRecord::Ready { bytes, .. } => {
                self.account(key, bytes.len());
                Ok(bytes)
            }
            ContentRecord::Failed { error, .. } => {
                // No bytes are held for a failed record.
                if let Some(lru) = &self.lru {
                    lru.remove(key);
                }
                Err(FsError::ContentUnavailable {
                    name: key.to_os_string(),
                    source: error,
                })
            }
        }
    }

    /// Size of the materialized content of `name`, if it is currently `Ready`.
    #[must_use]
    pub fn known_size(&self, name: &Arc<OsStr>) -> Option<u64> {
        match self.records.peek_ready(name)? {
            ContentRecord::Ready { bytes, .. } => Some(bytes.len() as u64),
            ContentRecord::Failed { .. } => None,
        }
    }

    /// Returns `true` if a transform is currently running for `name`.
    #[must_use]
    pub fn is_fetching(&self, name: &Arc<OsStr>) -> bool {
        self.records.is_in_flight(name)
    }

    /// Drop the record (and any in-flight reservation) of every name that is not in `listing`.
    ///
    /// Readers still working from an older listing do not re-create records for the dropped
    /// names.
    pub fn retain_listed(&self, listing: &Arc<Listing>) {
        {
            let mut pruned = self
                .pruned_against
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if pruned
                .as_ref()
                .is_some_and(|p| p.generation() >= listing.generation())
            {
                return;
            }
            *pruned = Some(Arc::clone(listing));
        }
        self.records.retain_sync(|name| listing.contains(name));
        if let Some(lru) = &self.lru {
            lru.retain(|name| listing.contains(name));
        }
    }

    /// Drop `key` again if a listing newer than `generation` was pruned against and no longer
    /// lists it.
    ///
    /// Runs after the record was stored: either the pruning pass saw the record, or this check
    /// sees the newer listing.
    fn forget_if_pruned(&self, key: &Arc<OsStr>, generation: u64) {
        let pruned = self
            .pruned_against
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        let Some(pruned) = pruned else {
            return;
        };
        if pruned.generation() > generation && !pruned.contains(key) {
            debug!(name = ?key, "dropping content of a name that left the listing");
            self.records.remove_sync(key);
            if let Some(lru) = &self.lru {
                lru.remove(key);
            }
        }
    }

    /// Number of records, including in-flight ones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns `true` if nothing is cached or in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Bytes currently accounted against the memory bound, if one is configured.
    #[must_use]
    pub fn accounted_bytes(&self) -> Option<u64> {
        self.lru.as_ref().map(LruEvictionTracker::total_bytes)
    }

    fn account(&self, key: &Arc<OsStr>, len: usize) {
        let Some(lru) = &self.lru else {
            return;
        };
        for victim in lru.touch(key, len as u64) {
            if self.records.evict_ready_sync(&victim) {
                debug!(name = ?victim, "evicted content to respect the memory bound");
            }
        }
    }

    /// Build the materialization future. The transform runs in its own task so a caller that
    /// gives up does not cancel it.
    fn materialize(
        &self,
        name: Arc<OsStr>,
    ) -> impl Future<Output = ContentRecord> + Send + use<R> {
        let runner = Arc::clone(&self.runner);
        let command = Arc::clone(&self.config.command);
        let bindings = vec![(self.config.input_var.to_string(), name.to_os_string())];
        async move {
            let task = tokio::spawn(async move { runner.run(&command, &bindings).await });
            let outcome = task
                .await
                .unwrap_or_else(|e| Err(CommandError::Aborted(e.to_string())));
            let obtained_at = Instant::now();

            match outcome {
                Ok(out) => {
                    debug!(name = ?name, bytes = out.stdout.len(), "content materialized");
                    ContentRecord::Ready {
                        bytes: out.stdout,
                        obtained_at,
                    }
                }
                Err(e) => {
                    warn!(
                        name = ?name,
                        exit_code = ?e.exit_code(),
                        error = %e,
                        "transform command failed"
                    );
                    ContentRecord::Failed {
                        error: Arc::new(e),
                        obtained_at,
                    }
                }
            }
        }
    }
}
