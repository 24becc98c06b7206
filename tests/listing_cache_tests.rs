#![allow(clippy::unwrap_used, missing_docs)]

mod common;

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;

use common::{FakeRunner, LIST};
use shell_fs::fs::FsError;
use shell_fs::listing::ListingCache;

fn cache(runner: &FakeRunner, freshness_secs: u64) -> ListingCache<FakeRunner> {
    ListingCache::new(
        Arc::new(runner.clone()),
        LIST,
        Duration::from_secs(freshness_secs),
        Duration::from_secs(5),
    )
}

#[tokio::test]
async fn nothing_runs_before_first_request() {
    let runner = FakeRunner::new().with_listing("a\n");
    let listing = cache(&runner, 1);
    assert!(listing.peek().is_none());
    assert_eq!(runner.list_calls(), 0);

    let view = listing.get_listing().await.unwrap();
    assert!(!view.is_degraded());
    assert!(view.listing.contains(OsStr::new("a")));
    assert_eq!(listing.peek().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn fresh_listing_is_served_from_cache() {
    let runner = FakeRunner::new().with_listing("a\n");
    let listing = cache(&runner, 1);

    let first = listing.get_listing().await.unwrap();
    tokio::time::advance(Duration::from_millis(900)).await;
    let second = listing.get_listing().await.unwrap();
    assert!(Arc::ptr_eq(&first.listing, &second.listing));
    assert_eq!(runner.list_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn stale_listing_is_refreshed_with_new_generation() {
    let runner = FakeRunner::new().with_listing("a\n");
    let listing = cache(&runner, 1);

    let first = listing.get_listing().await.unwrap();
    runner.set_listing("a\nb\n");
    tokio::time::advance(Duration::from_millis(1100)).await;

    let second = listing.get_listing().await.unwrap();
    assert_eq!(second.listing.len(), 2);
    assert!(second.listing.generation() > first.listing.generation());
    assert!(second.listing.obtained_at() > first.listing.obtained_at());
    assert_eq!(runner.list_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn failed_refresh_degrades_to_stale_listing() {
    let runner = FakeRunner::new().with_listing("a\nb\n");
    let listing = cache(&runner, 1);

    let good = listing.get_listing().await.unwrap();
    runner.fail_listing(9);
    tokio::time::advance(Duration::from_secs(2)).await;

    let view = listing.get_listing().await.unwrap();
    assert!(view.is_degraded());
    assert_eq!(view.degraded.as_ref().unwrap().exit_code(), Some(9));
    assert!(Arc::ptr_eq(&view.listing, &good.listing), "same stale listing");
    assert_eq!(listing.peek().unwrap().generation(), good.listing.generation());
}

#[tokio::test(start_paused = true)]
async fn failure_without_prior_listing_is_retried_after_window() {
    let runner = FakeRunner::new();
    runner.fail_listing(1);
    let listing = cache(&runner, 1);

    assert!(matches!(
        listing.get_listing().await,
        Err(FsError::ListingUnavailable(_))
    ));
    tokio::time::advance(Duration::from_secs(3)).await;
    assert!(listing.get_listing().await.is_err());
    assert_eq!(runner.list_calls(), 1, "failure window not yet elapsed");

    runner.set_listing("x\n");
    tokio::time::advance(Duration::from_secs(3)).await;
    let view = listing.get_listing().await.unwrap();
    assert!(!view.is_degraded());
    assert!(view.listing.contains(OsStr::new("x")));
    assert_eq!(runner.list_calls(), 2);
}

#[tokio::test]
async fn empty_output_is_an_empty_listing() {
    let runner = FakeRunner::new().with_listing("\n\n");
    let listing = cache(&runner, 1);
    let view = listing.get_listing().await.unwrap();
    assert!(view.listing.is_empty());
}
