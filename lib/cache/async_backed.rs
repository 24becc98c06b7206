//! Concurrent deduplication cache for async computations with freshness-driven refresh.
//!
//! Given a key, a freshness predicate and an async factory, ensures at most one factory runs per
//! key at any time. Callers arriving while a factory is running await the same computation via a
//! [`Shared`] future. A `Ready` value that the predicate reports as stale is replaced by a fresh
//! in-flight computation on the next access; the stale value is handed to the factory so it can
//! fall back to it.
//!
//! This cache does not evict on its own. Removal is explicit via [`FutureBackedCache::remove_sync`],
//! [`FutureBackedCache::evict_ready_sync`] and [`FutureBackedCache::retain_sync`].

use std::panic::AssertUnwindSafe;
use std::{fmt::Debug, future::Future, hash::Hash, pin::Pin};

use futures::FutureExt as _;
use futures::future::Shared;

type SharedFut<V> = Shared<Pin<Box<dyn Future<Output = Option<V>> + Send>>>;

/// Two-state slot: `InFlight` while a factory future is running, then promoted to `Ready` once
/// the future completes.
///
/// The `InFlight` variant holds a `Shared<..., Output = Option<V>>` where `None` signals that the
/// factory panicked (caught by `catch_unwind`). On `None`, callers remove the entry and retry.
enum Slot<V: Clone + Send + 'static> {
    InFlight(SharedFut<V>),
    Ready(V),
}

/// Deduplicating, refreshable async cache.
///
/// If [`get_or_refresh`](Self::get_or_refresh) is called concurrently for the same key while the
/// value is missing or stale, only one invocation of the factory runs. All callers receive a clone
/// of its result.
pub struct FutureBackedCache<K, V: Clone + Send + 'static> {
    map: scc::HashMap<K, Slot<V>>,
}

impl<K, V> Default for FutureBackedCache<K, V>
where
    K: Eq + Hash,
    V: Clone + Send + 'static,
{
    fn default() -> Self {
        Self {
            map: scc::HashMap::default(),
        }
    }
}

impl<K, V> FutureBackedCache<K, V>
where
    K: Eq + Hash + Debug + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Get the value for `key` if it is `Ready` and `is_fresh` accepts it, otherwise join or start
    /// a computation of a new value.
    ///
    /// The factory receives the previous (stale) value, if any. If another caller is already
    /// computing the value for this key, this awaits the in-flight computation instead of starting
    /// a duplicate. If the factory panics, the entry is removed and the next caller retries with a
    /// fresh factory invocation.
    ///
    /// # Panics
    ///
    /// Panics if this caller joins an in-flight factory that itself panicked (i.e. the caller
    /// lost the race to insert a fresh entry after the poisoned slot was removed).
    pub async fn get_or_refresh<P, F, Fut>(&self, key: K, is_fresh: P, factory: F) -> V
    where
        P: Fn(&V) -> bool,
        F: FnOnce(Option<V>) -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        // Fast path: fresh value already cached, or a computation is already running.
        let existing = self
            .map
            .read_async(&key, |_, slot| match slot {
                Slot::Ready(v) => Ok(v.clone()),
                Slot::InFlight(shared) => Err(shared.clone()),
            })
            .await;

        match existing {
            Some(Ok(v)) if is_fresh(&v) => return v,
            Some(Err(shared)) => {
                if let Some(v) = self.await_shared(&key, shared).await {
                    return v;
                }
                // Factory panicked; entry removed. Fall through to re-insert below.
            }
            Some(Ok(_)) | None => {}
        }

        // Slow path: use entry_async for atomic check-and-replace.
        let shared = match self.map.entry_async(key.clone()).await {
            scc::hash_map::Entry::Occupied(mut occ) => match occ.get() {
                Slot::Ready(v) if is_fresh(v) => return v.clone(),
                Slot::Ready(stale) => {
                    let shared = Self::make_shared(factory(Some(stale.clone())));
                    *occ.get_mut() = Slot::InFlight(shared.clone());
                    shared
                }
                Slot::InFlight(shared) => shared.clone(),
            },
            scc::hash_map::Entry::Vacant(vac) => {
                let shared = Self::make_shared(factory(None));
                let ret = shared.clone();
                vac.insert_entry(Slot::InFlight(shared));
                ret
            }
        };

        if let Some(v) = self.await_shared(&key, shared).await {
            return v;
        }

        panic!("FutureBackedCache: joined an in-flight factory that panicked for key {key:?}");
    }

    /// Get the cached value for `key` without starting a computation.
    ///
    /// - If the value is `Ready`, returns `Some(v)` immediately, fresh or not.
    /// - If the value is `InFlight`, awaits the in-flight computation and returns `Some(v)`.
    /// - If the key is absent, returns `None`.
    /// - If the in-flight factory panicked, returns `None` (and removes the poisoned entry).
    pub async fn get(&self, key: &K) -> Option<V> {
        let existing = self
            .map
            .read_async(key, |_, slot| match slot {
                Slot::Ready(v) => Ok(v.clone()),
                Slot::InFlight(shared) => Err(shared.clone()),
            })
            .await;

        match existing {
            Some(Ok(v)) => Some(v),
            Some(Err(shared)) => self.await_shared(key, shared).await,
            None => None,
        }
    }

    /// Peek at a `Ready` value without waiting on in-flight computations.
    #[must_use]
    pub fn peek_ready(&self, key: &K) -> Option<V> {
        self.map
            .read_sync(key, |_, slot| match slot {
                Slot::Ready(v) => Some(v.clone()),
                Slot::InFlight(_) => None,
            })
            .flatten()
    }

    /// Returns `true` if a factory is currently running for `key`.
    #[must_use]
    pub fn is_in_flight(&self, key: &K) -> bool {
        self.map
            .read_sync(key, |_, slot| matches!(slot, Slot::InFlight(_)))
            .unwrap_or(false)
    }

    /// Await a `Shared` future, handle promotion to `Ready`, and handle panic recovery.
    ///
    /// Promotion only happens if the slot still holds this exact in-flight computation; a slot
    /// that was removed or replaced in the meantime is left alone.
    ///
    /// Returns `Some(v)` on success. Returns `None` if the factory panicked, after removing
    /// the poisoned entry from the map.
    async fn await_shared(&self, key: &K, shared: SharedFut<V>) -> Option<V> {
        let mut guard = PromoteGuard {
            map: &self.map,
            key,
            shared: shared.clone(),
            value: None,
        };

        let result = shared.clone().await;

        if let Some(v) = result {
            guard.value = Some(v.clone());

            self.map
                .update_async(key, |_, slot| {
                    if is_same_flight(slot, &shared) {
                        *slot = Slot::Ready(v.clone());
                    }
                })
                .await;

            guard.value = None;
            Some(v)
        } else {
            // Factory panicked. Remove the poisoned InFlight entry so the next caller
            // can retry.
            drop(
                self.map
                    .remove_if_sync(key, |slot| is_same_flight(slot, &shared)),
            );
            None
        }
    }

    /// Wrap a factory future in `catch_unwind`, producing a `Shared` with `Output = Option<V>`.
    fn make_shared<Fut>(fut: Fut) -> SharedFut<V>
    where
        Fut: Future<Output = V> + Send + 'static,
    {
        let fut = AssertUnwindSafe(fut).catch_unwind();
        let boxed: Pin<Box<dyn Future<Output = Option<V>> + Send>> =
            Box::pin(async move { fut.await.ok() });
        boxed.shared()
    }

    /// Returns the number of entries in the cache (both `Ready` and `InFlight`).
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns `true` if the cache contains no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Synchronously insert a value, overwriting any existing entry.
    pub fn insert_sync(&self, key: K, value: V) {
        drop(self.map.upsert_sync(key, Slot::Ready(value)));
    }

    /// Synchronously remove the entry for `key`, returning `true` if it was present.
    ///
    /// Removing an `InFlight` entry drops the reservation: waiters already attached still receive
    /// the result, but it is not stored.
    pub fn remove_sync(&self, key: &K) -> bool {
        self.map.remove_sync(key).is_some()
    }

    /// Remove the entry for `key` only if it is `Ready`. In-flight computations are left alone.
    pub fn evict_ready_sync(&self, key: &K) -> bool {
        self.map
            .remove_if_sync(key, |slot| matches!(slot, Slot::Ready(_)))
            .is_some()
    }

    /// Keep only the entries whose key satisfies `keep`.
    pub fn retain_sync(&self, mut keep: impl FnMut(&K) -> bool) {
        self.map.retain_sync(|k, _| keep(k));
    }
}

fn is_same_flight<V: Clone + Send + 'static>(slot: &Slot<V>, shared: &SharedFut<V>) -> bool {
    matches!(slot, Slot::InFlight(current) if current.ptr_eq(shared))
}

/// Drop guard that synchronously promotes an `InFlight` entry to `Ready` if the caller
/// is cancelled between `shared.await` completing and the async promotion running.
///
/// Set `value = None` to defuse after successful promotion.
struct PromoteGuard<'a, K, V>
where
    K: Eq + Hash,
    V: Clone + Send + Sync + 'static,
{
    map: &'a scc::HashMap<K, Slot<V>>,
    key: &'a K,
    shared: SharedFut<V>,
    value: Option<V>,
}

impl<K, V> Drop for PromoteGuard<'_, K, V>
where
    K: Eq + Hash,
    V: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if let Some(v) = self.value.take() {
            self.map.update_sync(self.key, |_, slot| {
                if is_same_flight(slot, &self.shared) {
                    *slot = Slot::Ready(v);
                }
            });
        }
    }
}
