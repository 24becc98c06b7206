#![allow(clippy::unwrap_used, missing_docs)]

mod common;

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;

use common::{FakeRunner, TRANSFORM};
use shell_fs::content::{ContentCache, ContentCacheConfig};
use shell_fs::fs::FsError;
use shell_fs::listing::Listing;
use tokio::time::Instant;

fn listing(stdout: &str, generation: u64) -> Listing {
    Listing::parse(stdout.as_bytes(), Instant::now(), generation)
}

fn cache(runner: &FakeRunner, max_bytes: Option<u64>) -> ContentCache<FakeRunner> {
    ContentCache::new(
        Arc::new(runner.clone()),
        ContentCacheConfig {
            command: TRANSFORM.into(),
            input_var: "INPUT".into(),
            freshness: Duration::from_secs(60),
            failure_window: Duration::from_secs(5),
            max_bytes,
        },
    )
}

fn key(name: &str) -> Arc<OsStr> {
    Arc::from(OsStr::new(name))
}

#[tokio::test]
async fn unlisted_name_is_not_found() {
    let runner = FakeRunner::new();
    let content = cache(&runner, None);
    let listed = listing("a\n", 1);

    let err = content
        .get_content(&listed, OsStr::new("b"))
        .await
        .unwrap_err();
    assert!(matches!(err, FsError::NameNotFound(_)));
    assert_eq!(runner.total_transform_calls(), 0);
    assert!(content.is_empty());
}

#[tokio::test]
async fn known_size_follows_materialization() {
    let runner = FakeRunner::new();
    runner.set_content("a", b"12345678");
    let content = cache(&runner, None);
    let listed = listing("a\n", 1);

    assert_eq!(content.known_size(&key("a")), None);
    content.get_content(&listed, OsStr::new("a")).await.unwrap();
    assert_eq!(content.known_size(&key("a")), Some(8));
    assert!(!content.is_fetching(&key("a")));
}

#[tokio::test]
async fn failed_record_has_no_known_size() {
    let runner = FakeRunner::new();
    runner.fail_content("a", 1);
    let content = cache(&runner, None);
    let listed = listing("a\n", 1);

    content
        .get_content(&listed, OsStr::new("a"))
        .await
        .unwrap_err();
    assert_eq!(content.known_size(&key("a")), None);
    assert_eq!(content.len(), 1, "the failure itself is cached");
}

#[tokio::test]
async fn retain_listed_drops_unlisted_records() {
    let runner = FakeRunner::new();
    let content = cache(&runner, Some(1 << 20));
    let before = listing("a\nb\n", 1);

    content.get_content(&before, OsStr::new("a")).await.unwrap();
    content.get_content(&before, OsStr::new("b")).await.unwrap();
    assert_eq!(content.len(), 2);

    let after = Arc::new(listing("b\n", 2));
    content.retain_listed(&after);
    assert_eq!(content.len(), 1);
    assert_eq!(content.known_size(&key("a")), None);
    assert_eq!(
        content.accounted_bytes(),
        Some("content of b".len() as u64)
    );
}

#[tokio::test]
async fn memory_bound_evicts_least_recently_read() {
    let runner = FakeRunner::new();
    runner.set_content("a", &[b'a'; 40]);
    runner.set_content("b", &[b'b'; 40]);
    runner.set_content("c", &[b'c'; 40]);
    let content = cache(&runner, Some(100));
    let listed = listing("a\nb\nc\n", 1);

    content.get_content(&listed, OsStr::new("a")).await.unwrap();
    content.get_content(&listed, OsStr::new("b")).await.unwrap();
    // Touch a again so b is now least recently used.
    content.get_content(&listed, OsStr::new("a")).await.unwrap();
    content.get_content(&listed, OsStr::new("c")).await.unwrap();

    assert_eq!(content.known_size(&key("b")), None, "b was evicted");
    assert_eq!(content.known_size(&key("a")), Some(40));
    assert_eq!(content.known_size(&key("c")), Some(40));
    assert_eq!(content.accounted_bytes(), Some(80));

    // An evicted file is simply materialized again.
    let data = content.get_content(&listed, OsStr::new("b")).await.unwrap();
    assert_eq!(data.len(), 40);
    assert_eq!(runner.transform_calls("b"), 2);
    assert_eq!(runner.transform_calls("a"), 1);
}

#[tokio::test]
async fn unbounded_cache_accounts_nothing() {
    let runner = FakeRunner::new();
    let content = cache(&runner, None);
    let listed = listing("a\n", 1);
    content.get_content(&listed, OsStr::new("a")).await.unwrap();
    assert_eq!(content.accounted_bytes(), None);
}

#[tokio::test]
async fn reader_on_older_listing_does_not_restore_pruned_record() {
    let runner = FakeRunner::new();
    let content = cache(&runner, Some(1 << 20));
    let before = listing("a\nb\n", 1);
    content.retain_listed(&Arc::new(listing("b\n", 2)));

    // The older snapshot still lists a, so the read itself is served.
    let data = content.get_content(&before, OsStr::new("a")).await.unwrap();
    assert_eq!(&data[..], b"content of a");
    assert_eq!(content.known_size(&key("a")), None, "a is not kept");

    content.get_content(&before, OsStr::new("b")).await.unwrap();
    assert_eq!(content.len(), 1, "b is still listed and stays cached");
    assert_eq!(
        content.accounted_bytes(),
        Some("content of b".len() as u64)
    );
}

#[tokio::test(start_paused = true)]
async fn failed_refresh_releases_accounted_bytes() {
    let runner = FakeRunner::new();
    runner.set_content("a", &[b'a'; 80]);
    runner.set_content("b", &[b'b'; 30]);
    runner.set_content("c", &[b'c'; 20]);
    let content = cache(&runner, Some(100));
    let listed = listing("a\nb\nc\n", 1);

    content.get_content(&listed, OsStr::new("c")).await.unwrap();
    content.get_content(&listed, OsStr::new("a")).await.unwrap();
    assert_eq!(content.accounted_bytes(), Some(100));

    tokio::time::advance(Duration::from_secs(61)).await;
    runner.fail_content("a", 1);
    let err = content
        .get_content(&listed, OsStr::new("a"))
        .await
        .unwrap_err();
    assert!(matches!(err, FsError::ContentUnavailable { .. }));
    assert_eq!(content.accounted_bytes(), Some(20), "a holds no bytes now");

    // b fits beside c once the failed record stops counting.
    content.get_content(&listed, OsStr::new("b")).await.unwrap();
    assert_eq!(content.known_size(&key("b")), Some(30));
    assert_eq!(content.known_size(&key("c")), Some(20), "c was not evicted");
    assert_eq!(content.accounted_bytes(), Some(50));
}
