//! Cache eviction policies.

/// Least-recently-used eviction against a byte budget.
pub mod lru;
