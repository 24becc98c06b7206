//! Caching primitives shared by the listing and content caches.

/// Deduplicating async cache with freshness-driven refresh.
pub mod async_backed;
/// Cache eviction policies.
pub mod eviction;
