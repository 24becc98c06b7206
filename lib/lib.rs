//! shell-fs shared library.
//!
//! Exposes a flat, read-only virtual filesystem whose listing and file contents come from
//! external shell commands.

/// Caching primitives for shell-fs.
pub mod cache;
/// The command runner capability and its shell-backed implementation.
pub mod command;
/// Per-file content cache with in-flight deduplication.
pub mod content;
/// Filesystem abstractions and the FUSE adapter.
pub mod fs;
/// Cache of the logical file listing.
pub mod listing;
