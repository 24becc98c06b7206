//! Cache of the logical file listing produced by the list command.
//!
//! There is exactly one listing per mount. Refreshes run through a single-key
//! [`FutureBackedCache`], so concurrent callers that find the listing stale share one invocation
//! of the list command.

use std::collections::HashSet;
use std::ffi::OsStr;
use std::future::Future;
use std::os::unix::ffi::OsStrExt as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::cache::async_backed::FutureBackedCache;
use crate::command::{CommandError, CommandRunner};
use crate::fs::FsError;

/// An ordered, duplicate-free set of logical filenames.
#[derive(Debug)]
pub struct Listing {
    names: Vec<Arc<OsStr>>,
    index: HashSet<Arc<OsStr>>,
    obtained_at: Instant,
    generation: u64,
}

impl Listing {
    /// Parse list command output: one name per line, empty lines discarded, first occurrence of a
    /// duplicate wins.
    ///
    /// Names that cannot be directory entries (`.`, `..`, or containing `/` or NUL) are skipped.
    #[must_use]
    pub fn parse(stdout: &[u8], obtained_at: Instant, generation: u64) -> Self {
        let mut names = Vec::new();
        let mut index = HashSet::new();
        for line in stdout.split(|b| *b == b'\n') {
            if line.is_empty() {
                continue;
            }
            if !is_valid_entry_name(line) {
                warn!(name = ?OsStr::from_bytes(line), "skipping listed name that cannot be a file name");
                continue;
            }
            let name: Arc<OsStr> = Arc::from(OsStr::from_bytes(line));
            if index.insert(Arc::clone(&name)) {
                names.push(name);
            }
        }
        Self {
            names,
            index,
            obtained_at,
            generation,
        }
    }

    /// Names in listing order.
    #[must_use]
    pub fn names(&self) -> &[Arc<OsStr>] {
        &self.names
    }

    /// Returns the shared name if `name` is listed.
    #[must_use]
    pub fn get(&self, name: &OsStr) -> Option<&Arc<OsStr>> {
        self.index.get(name)
    }

    /// Returns `true` if `name` is listed.
    #[must_use]
    pub fn contains(&self, name: &OsStr) -> bool {
        self.index.contains(name)
    }

    /// Number of listed names.
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Returns `true` if nothing is listed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// When the list command that produced this listing finished.
    #[must_use]
    pub fn obtained_at(&self) -> Instant {
        self.obtained_at
    }

    /// Monotonic counter distinguishing successive successful refreshes.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

fn is_valid_entry_name(name: &[u8]) -> bool {
    name != b"." && name != b".." && !name.iter().any(|b| *b == b'/' || *b == 0)
}

/// The listing as served to a caller.
#[derive(Debug, Clone)]
pub struct ListingView {
    /// The listing to use.
    pub listing: Arc<Listing>,
    /// Set when the last refresh failed and `listing` is a stale fallback.
    pub degraded: Option<Arc<CommandError>>,
}

impl ListingView {
    /// Returns `true` if the listing is a stale fallback after a failed refresh.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }
}

/// Outcome of the last refresh attempt, kept in the single cache slot.
#[derive(Debug, Clone)]
struct ListingRecord {
    listing: Option<Arc<Listing>>,
    error: Option<Arc<CommandError>>,
    checked_at: Instant,
}

impl ListingRecord {
    fn is_fresh(&self, freshness: Duration, failure_window: Duration) -> bool {
        let window = if self.error.is_some() {
            failure_window
        } else {
            freshness
        };
        self.checked_at.elapsed() < window
    }
}

/// Caches the most recent [`Listing`] and refreshes it from the list command once it is older
/// than the freshness window.
pub struct ListingCache<R: CommandRunner> {
    runner: Arc<R>,
    command: Arc<str>,
    freshness: Duration,
    failure_window: Duration,
    slot: FutureBackedCache<(), ListingRecord>,
    generation: Arc<AtomicU64>,
}

impl<R: CommandRunner> ListingCache<R> {
    /// Create an empty listing cache. Nothing runs until the first [`get_listing`](Self::get_listing).
    pub fn new(
        runner: Arc<R>,
        command: impl Into<Arc<str>>,
        freshness: Duration,
        failure_window: Duration,
    ) -> Self {
        Self {
            runner,
            command: command.into(),
            freshness,
            failure_window,
            slot: FutureBackedCache::default(),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Return the current listing, refreshing it if it is stale.
    ///
    /// A failed refresh falls back to the previous listing and reports it as degraded. Without a
    /// previous listing the failure is returned as [`FsError::ListingUnavailable`]. A failure is
    /// remembered for the failure window, during which the list command is not re-run.
    #[instrument(name = "ListingCache::get_listing", skip(self))]
    pub async fn get_listing(&self) -> Result<ListingView, FsError> {
        let (freshness, failure_window) = (self.freshness, self.failure_window);
        let record = self
            .slot
            .get_or_refresh(
                (),
                |r| r.is_fresh(freshness, failure_window),
                |prev| self.refresh(prev),
            )
            .await;

        match (record.listing, record.error) {
            (Some(listing), None) => Ok(ListingView {
                listing,
                degraded: None,
            }),
            (Some(listing), Some(error)) => {
                debug!(error = %error, "serving stale listing");
                Ok(ListingView {
                    listing,
                    degraded: Some(error),
                })
            }
            (None, Some(error)) => Err(FsError::ListingUnavailable(error)),
            (None, None) => unreachable!("listing record without listing or error"),
        }
    }

    /// The last successfully obtained listing, without triggering a refresh.
    #[must_use]
    pub fn peek(&self) -> Option<Arc<Listing>> {
        self.slot.peek_ready(&()).and_then(|r| r.listing)
    }

    /// Build the refresh future. The list command runs in its own task so a caller that gives up
    /// does not cancel it.
    fn refresh(
        &self,
        prev: Option<ListingRecord>,
    ) -> impl Future<Output = ListingRecord> + Send + use<R> {
        let runner = Arc::clone(&self.runner);
        let command = Arc::clone(&self.command);
        let generation = Arc::clone(&self.generation);
        async move {
            let stale = prev.and_then(|p| p.listing);
            let task = tokio::spawn(async move { runner.run(&command, &[]).await });
            let outcome = task
                .await
                .unwrap_or_else(|e| Err(CommandError::Aborted(e.to_string())));
            let now = Instant::now();

            match outcome {
                Ok(out) => {
                    let next = generation.fetch_add(1, Ordering::Relaxed) + 1;
                    let listing = Listing::parse(&out.stdout, now, next);
                    debug!(entries = listing.len(), generation = next, "listing refreshed");
                    ListingRecord {
                        listing: Some(Arc::new(listing)),
                        error: None,
                        checked_at: now,
                    }
                }
                Err(e) => {
                    if stale.is_some() {
                        warn!(error = %e, "list command failed, serving stale listing");
                    } else {
                        warn!(error = %e, "list command failed and no listing is cached");
                    }
                    ListingRecord {
                        listing: stale,
                        error: Some(Arc::new(e)),
                        checked_at: now,
                    }
                }
            }
        }
    }
}
