// Integration tests for revalidation: retry backoff, interval ticking gated
// by visibility, focus/reconnect signals, and explicit invalidation.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use nanoquery::{CacheEntry, Key, QueryClient, QueryError, QueryOptions};
use parking_lot::Mutex;

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

async fn advance(duration: Duration) {
    tokio::time::advance(duration).await;
    settle().await;
}

fn counting_fetcher(
    count: Arc<AtomicUsize>,
) -> impl Fn(Key) -> BoxFuture<'static, Result<String, QueryError>> + Send + Sync + 'static {
    move |key| {
        let n = count.fetch_add(1, Ordering::SeqCst);
        async move { Ok(format!("{}#{n}", key.as_str())) }.boxed()
    }
}

/// Fails on the attempts listed in `failures` (1-based), succeeds otherwise.
fn flaky_fetcher(
    count: Arc<AtomicUsize>,
    failures: &'static [usize],
) -> impl Fn(Key) -> BoxFuture<'static, Result<String, QueryError>> + Send + Sync + 'static {
    move |key| {
        let attempt = count.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            if failures.contains(&attempt) {
                Err(QueryError::fetch(format!("attempt {attempt}")))
            } else {
                Ok(format!("{}#{attempt}", key.as_str()))
            }
        }
        .boxed()
    }
}

#[tokio::test(start_paused = true)]
async fn test_retry_backoff_and_counter_reset() {
    let client = QueryClient::new();
    let count = Arc::new(AtomicUsize::new(0));
    let retries_seen = Arc::new(Mutex::new(Vec::new()));

    let store = {
        let retries_seen = retries_seen.clone();
        client.fetcher_with_options::<String, _>(
            "/flaky",
            QueryOptions::new()
                .fetcher(flaky_fetcher(count.clone(), &[1, 2, 4]))
                .on_error_retry(move |event| {
                    retries_seen.lock().push(event.retry_count);
                    Some(ms(u64::from(event.retry_count) * 1000))
                }),
        )
    };

    let sub = store.subscribe();
    settle().await;

    // First failure: error published, retry scheduled at +1s.
    assert_eq!(count.load(Ordering::SeqCst), 1);
    let state = sub.current();
    assert!(!state.loading);
    assert!(state.error.is_some());

    advance(ms(999)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);

    advance(ms(1)).await;
    // Second failure, next retry at +2s.
    assert_eq!(count.load(Ordering::SeqCst), 2);
    assert!(sub.current().error.is_some());

    advance(ms(1999)).await;
    assert_eq!(count.load(Ordering::SeqCst), 2);
    advance(ms(1)).await;

    // Third attempt succeeds; the retry counter resets.
    assert_eq!(count.load(Ordering::SeqCst), 3);
    let state = sub.current();
    assert!(state.error.is_none());
    assert_eq!(state.data.as_deref().map(String::as_str), Some("/flaky#3"));

    // A later failure restarts the backoff at one second.
    store.revalidate();
    settle().await;
    assert_eq!(count.load(Ordering::SeqCst), 4);
    assert!(sub.current().error.is_some());

    advance(ms(999)).await;
    assert_eq!(count.load(Ordering::SeqCst), 4);
    advance(ms(1)).await;
    assert_eq!(count.load(Ordering::SeqCst), 5);
    assert_eq!(sub.current().data.as_deref().map(String::as_str), Some("/flaky#5"));

    assert_eq!(*retries_seen.lock(), vec![1, 2, 1]);
}

#[tokio::test(start_paused = true)]
async fn test_zero_retry_delay_stops_retrying() {
    let client = QueryClient::new();
    let count = Arc::new(AtomicUsize::new(0));

    let store = {
        let count = count.clone();
        client.fetcher_with_options::<String, _>(
            "/down",
            QueryOptions::new()
                .fetcher(move |_key: Key| {
                    count.fetch_add(1, Ordering::SeqCst);
                    async move { Err::<String, _>(QueryError::fetch("down")) }.boxed()
                })
                .on_error_retry(|_event| Some(Duration::ZERO)),
        )
    };

    let sub = store.subscribe();
    settle().await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert!(sub.current().error.is_some());

    // A zero delay stops retrying just like `None`.
    advance(Duration::from_secs(10)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_interval_revalidation_gated_by_visibility() {
    let client = QueryClient::new();
    let count = Arc::new(AtomicUsize::new(0));

    let store = client.fetcher_with_options::<String, _>(
        "/ticking",
        QueryOptions::new()
            .dedupe_time(ms(0))
            .revalidate_interval(ms(5))
            .fetcher(counting_fetcher(count.clone())),
    );

    let _sub = store.subscribe();
    settle().await;
    assert_eq!(count.load(Ordering::SeqCst), 1);

    advance(ms(5)).await;
    advance(ms(5)).await;
    assert_eq!(count.load(Ordering::SeqCst), 3);

    // Hidden: the interval does not tick.
    client.set_visible(false);
    settle().await;
    advance(ms(5)).await;
    advance(ms(5)).await;
    advance(ms(5)).await;
    assert_eq!(count.load(Ordering::SeqCst), 3);

    // Visible again: ticking resumes.
    client.set_visible(true);
    settle().await;
    advance(ms(5)).await;
    advance(ms(5)).await;
    advance(ms(5)).await;
    assert_eq!(count.load(Ordering::SeqCst), 6);
}

#[tokio::test(start_paused = true)]
async fn test_interval_revalidation_observes_dedupe_window() {
    let client = QueryClient::new();
    let count = Arc::new(AtomicUsize::new(0));

    let store = client.fetcher_with_options::<String, _>(
        "/deduped-ticks",
        QueryOptions::new()
            .dedupe_time(Duration::from_secs(3600))
            .revalidate_interval(ms(5))
            .fetcher(counting_fetcher(count.clone())),
    );

    let _sub = store.subscribe();
    settle().await;
    advance(ms(5)).await;
    advance(ms(5)).await;
    advance(ms(5)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_focus_revalidates_only_flagged_stores() {
    let client = QueryClient::new();
    let flagged = Arc::new(AtomicUsize::new(0));
    let unflagged = Arc::new(AtomicUsize::new(0));
    let deduped = Arc::new(AtomicUsize::new(0));

    let on_focus = client.fetcher_with_options::<String, _>(
        "/a",
        QueryOptions::new()
            .dedupe_time(ms(0))
            .revalidate_on_focus(true)
            .fetcher(counting_fetcher(flagged.clone())),
    );
    let plain = client.fetcher_with_options::<String, _>(
        "/b",
        QueryOptions::new()
            .dedupe_time(ms(0))
            .fetcher(counting_fetcher(unflagged.clone())),
    );
    let within_dedupe = client.fetcher_with_options::<String, _>(
        "/c",
        QueryOptions::new()
            .dedupe_time(Duration::from_secs(3600))
            .revalidate_on_focus(true)
            .fetcher(counting_fetcher(deduped.clone())),
    );

    let _a = on_focus.subscribe();
    let _b = plain.subscribe();
    let _c = within_dedupe.subscribe();
    settle().await;

    client.notify_focus();
    settle().await;

    assert_eq!(flagged.load(Ordering::SeqCst), 2);
    assert_eq!(unflagged.load(Ordering::SeqCst), 1);
    // Focus-driven refreshes still honor the dedupe window.
    assert_eq!(deduped.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_revalidates_flagged_stores() {
    let client = QueryClient::new();
    let count = Arc::new(AtomicUsize::new(0));

    let store = client.fetcher_with_options::<String, _>(
        "/online",
        QueryOptions::new()
            .dedupe_time(ms(0))
            .revalidate_on_reconnect(true)
            .fetcher(counting_fetcher(count.clone())),
    );

    let _sub = store.subscribe();
    settle().await;
    assert_eq!(count.load(Ordering::SeqCst), 1);

    client.notify_reconnect();
    settle().await;
    assert_eq!(count.load(Ordering::SeqCst), 2);

    // Focus means nothing to a reconnect-only store.
    client.notify_focus();
    settle().await;
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_invalidate_clears_data_revalidate_keeps_it() {
    let client = QueryClient::new();
    let count = Arc::new(AtomicUsize::new(0));

    let store = {
        let count = count.clone();
        client.fetcher("/resource", move |key| {
            let n = count.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(ms(10)).await;
                Ok::<_, QueryError>(format!("{}#{n}", key.as_str()))
            }
            .boxed()
        })
    };

    let sub = store.subscribe();
    advance(ms(10)).await;
    assert_eq!(
        sub.current().data.as_deref().map(String::as_str),
        Some("/resource#0")
    );

    // Revalidation is stale-while-revalidate: data stays on display.
    store.revalidate();
    settle().await;
    let state = sub.current();
    assert!(state.loading);
    assert_eq!(state.data.as_deref().map(String::as_str), Some("/resource#0"));
    advance(ms(10)).await;
    assert_eq!(
        sub.current().data.as_deref().map(String::as_str),
        Some("/resource#1")
    );

    // Invalidation clears published data while refetching.
    store.invalidate();
    settle().await;
    let state = sub.current();
    assert!(state.loading);
    assert!(state.data.is_none());
    advance(ms(10)).await;
    assert_eq!(
        sub.current().data.as_deref().map(String::as_str),
        Some("/resource#2")
    );
}

#[tokio::test(start_paused = true)]
async fn test_invalidate_without_subscribers_forces_next_mount_to_fetch() {
    let client = QueryClient::new();
    let count = Arc::new(AtomicUsize::new(0));

    let store = client.fetcher_with_options::<String, _>(
        "/idle",
        QueryOptions::new()
            .dedupe_time(Duration::from_secs(3600))
            .fetcher(counting_fetcher(count.clone())),
    );

    let sub = store.subscribe();
    settle().await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
    drop(sub);

    // With no subscribers the entry is removed, so the next subscription
    // refetches despite the huge dedupe window.
    client.invalidate_keys("/idle");
    let _sub = store.subscribe();
    settle().await;
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_overrule_settings_applies_to_subsequent_decisions() {
    let client = QueryClient::new();
    let count = Arc::new(AtomicUsize::new(0));

    let store = client.fetcher_with_options::<String, _>(
        "/tuned",
        QueryOptions::new()
            .dedupe_time(Duration::from_secs(3600))
            .fetcher(counting_fetcher(count.clone())),
    );

    let sub = store.subscribe();
    settle().await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
    drop(sub);

    let sub = store.subscribe();
    settle().await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
    drop(sub);

    client.overrule_settings(QueryOptions::new().dedupe_time(ms(0)));
    let _sub = store.subscribe();
    settle().await;
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_hydrated_entry_suppresses_initial_fetch() {
    let count = Arc::new(AtomicUsize::new(0));
    let client = QueryClient::with_options(QueryOptions::new().cache([(
        "/seeded".to_string(),
        CacheEntry::new("from-seed".to_string(), Duration::from_secs(60)),
    )]));

    let store = client.fetcher_with_options::<String, _>(
        "/seeded",
        QueryOptions::new()
            .dedupe_time(Duration::from_secs(60))
            .fetcher(counting_fetcher(count.clone())),
    );

    let sub = store.subscribe();
    settle().await;

    assert_eq!(count.load(Ordering::SeqCst), 0);
    assert_eq!(
        sub.current().data.as_deref().map(String::as_str),
        Some("from-seed")
    );
}

#[tokio::test(start_paused = true)]
async fn test_on_error_hook_local_supersedes_global() {
    let global_hits = Arc::new(Mutex::new(Vec::new()));
    let local_hits = Arc::new(Mutex::new(Vec::new()));

    let client = {
        let global_hits = global_hits.clone();
        QueryClient::with_options(QueryOptions::new().on_error(move |_error, key| {
            global_hits.lock().push(key.to_string());
        }))
    };

    let failing = |_key: Key| async move { Err::<String, _>(QueryError::fetch("down")) }.boxed();

    let with_local = {
        let local_hits = local_hits.clone();
        client.fetcher_with_options::<String, _>(
            "/local",
            QueryOptions::new().fetcher(failing).on_error(move |_error, key| {
                local_hits.lock().push(key.to_string());
            }),
        )
    };
    let with_global = client.fetcher_with_options::<String, _>(
        "/global",
        QueryOptions::new()
            .fetcher(|_key: Key| async move { Err::<String, _>(QueryError::fetch("down")) }.boxed()),
    );

    let _a = with_local.subscribe();
    let _b = with_global.subscribe();
    settle().await;

    assert_eq!(*local_hits.lock(), vec!["/local".to_string()]);
    assert_eq!(*global_hits.lock(), vec!["/global".to_string()]);
}
