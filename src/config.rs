//! Configuration for fetcher and mutator behavior.
//!
//! Settings are layered: built-in defaults ← client options ← per-store
//! options ← test override. The layering is re-resolved at every engine
//! decision, so an override installed mid-test affects all subsequent
//! behavior.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::cache::{AnyValue, CacheEntry};
use crate::error::QueryError;
use crate::key::Key;

/// Minimum wall-clock interval between fetch invocations for one key.
pub const DEFAULT_DEDUPE_TIME: Duration = Duration::from_secs(4);

/// How long a cached entry remains eligible for display.
pub const DEFAULT_CACHE_LIFETIME: Duration = Duration::from_secs(8);

/// Invoked on every fetch or mutation failure. The second argument is the
/// canonical key ("" for mutations, which have none).
pub type ErrorHandler = Arc<dyn Fn(&QueryError, &str) + Send + Sync>;

/// Context handed to a retry policy after a failed fetch.
#[derive(Debug, Clone)]
pub struct RetryEvent {
    /// 1 for the first consecutive failure, incrementing per failure.
    pub retry_count: u32,
    pub error: QueryError,
    pub key: String,
}

/// Returns the delay before the next retry, or `None` to stop retrying.
pub type RetryPolicy = Arc<dyn Fn(&RetryEvent) -> Option<Duration> + Send + Sync>;

/// Fetcher with its result type erased, so a client-wide default fetcher can
/// serve stores of different value types.
pub(crate) type ErasedFetcher =
    Arc<dyn Fn(Key) -> BoxFuture<'static, Result<AnyValue, QueryError>> + Send + Sync>;

/// Options for a [`QueryClient`](crate::QueryClient), a fetcher store, or a
/// mutator store. Unset fields fall through to the next layer.
#[derive(Clone, Default)]
pub struct QueryOptions {
    pub(crate) fetcher: Option<ErasedFetcher>,
    pub(crate) dedupe_time: Option<Duration>,
    pub(crate) cache_lifetime: Option<Duration>,
    pub(crate) revalidate_interval: Option<Duration>,
    pub(crate) revalidate_on_focus: Option<bool>,
    pub(crate) revalidate_on_reconnect: Option<bool>,
    pub(crate) throttle_calls: Option<bool>,
    pub(crate) on_error: Option<ErrorHandler>,
    pub(crate) on_error_retry: Option<RetryPolicy>,
    pub(crate) cache_seed: Vec<(String, CacheEntry)>,
}

impl QueryOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the fetch function. The typed result is stored type-erased so the
    /// same cache can serve every store.
    #[must_use]
    pub fn fetcher<T, F>(mut self, fetch: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(Key) -> BoxFuture<'static, Result<T, QueryError>> + Send + Sync + 'static,
    {
        let fetch = Arc::new(fetch);
        self.fetcher = Some(Arc::new(move |key: Key| {
            let fut = fetch(key);
            async move { fut.await.map(|value| Arc::new(value) as AnyValue) }.boxed()
        }));
        self
    }

    /// Minimum interval between fetch invocations for one key.
    #[must_use]
    pub fn dedupe_time(mut self, dedupe_time: Duration) -> Self {
        self.dedupe_time = Some(dedupe_time);
        self
    }

    /// How long cached entries stay eligible for display.
    #[must_use]
    pub fn cache_lifetime(mut self, cache_lifetime: Duration) -> Self {
        self.cache_lifetime = Some(cache_lifetime);
        self
    }

    /// Enables periodic revalidation while the store has subscribers.
    #[must_use]
    pub fn revalidate_interval(mut self, interval: Duration) -> Self {
        self.revalidate_interval = Some(interval);
        self
    }

    /// Revalidate on focus events (and hidden → visible transitions).
    #[must_use]
    pub fn revalidate_on_focus(mut self, enabled: bool) -> Self {
        self.revalidate_on_focus = Some(enabled);
        self
    }

    /// Revalidate on reconnect events.
    #[must_use]
    pub fn revalidate_on_reconnect(mut self, enabled: bool) -> Self {
        self.revalidate_on_reconnect = Some(enabled);
        self
    }

    /// Whether a mutator returns the in-flight mutation instead of starting a
    /// second one. Defaults to true.
    #[must_use]
    pub fn throttle_calls(mut self, enabled: bool) -> Self {
        self.throttle_calls = Some(enabled);
        self
    }

    /// Failure hook. A per-store hook fully supersedes the client-wide one.
    #[must_use]
    pub fn on_error(mut self, handler: impl Fn(&QueryError, &str) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(handler));
        self
    }

    /// Retry policy consulted after each consecutive failure.
    #[must_use]
    pub fn on_error_retry(
        mut self,
        policy: impl Fn(&RetryEvent) -> Option<Duration> + Send + Sync + 'static,
    ) -> Self {
        self.on_error_retry = Some(Arc::new(policy));
        self
    }

    /// Pre-seeds the cache. Only consulted when constructing a
    /// [`QueryClient`](crate::QueryClient); ignored on stores.
    #[must_use]
    pub fn cache(mut self, entries: impl IntoIterator<Item = (String, CacheEntry)>) -> Self {
        self.cache_seed.extend(entries);
        self
    }

    /// Returns `self` with every field set in `overlay` replaced.
    pub(crate) fn merged_with(&self, overlay: &QueryOptions) -> QueryOptions {
        QueryOptions {
            fetcher: overlay.fetcher.clone().or_else(|| self.fetcher.clone()),
            dedupe_time: overlay.dedupe_time.or(self.dedupe_time),
            cache_lifetime: overlay.cache_lifetime.or(self.cache_lifetime),
            revalidate_interval: overlay.revalidate_interval.or(self.revalidate_interval),
            revalidate_on_focus: overlay.revalidate_on_focus.or(self.revalidate_on_focus),
            revalidate_on_reconnect: overlay
                .revalidate_on_reconnect
                .or(self.revalidate_on_reconnect),
            throttle_calls: overlay.throttle_calls.or(self.throttle_calls),
            on_error: overlay.on_error.clone().or_else(|| self.on_error.clone()),
            on_error_retry: overlay
                .on_error_retry
                .clone()
                .or_else(|| self.on_error_retry.clone()),
            cache_seed: Vec::new(),
        }
    }
}

/// Fully layered settings, resolved at each engine decision.
#[derive(Clone)]
pub(crate) struct Settings {
    pub fetcher: Option<ErasedFetcher>,
    pub dedupe_time: Duration,
    pub cache_lifetime: Duration,
    pub revalidate_interval: Option<Duration>,
    pub revalidate_on_focus: bool,
    pub revalidate_on_reconnect: bool,
    pub throttle_calls: bool,
    pub on_error: Option<ErrorHandler>,
    pub on_error_retry: Option<RetryPolicy>,
}

impl From<QueryOptions> for Settings {
    fn from(options: QueryOptions) -> Self {
        Self {
            fetcher: options.fetcher,
            dedupe_time: options.dedupe_time.unwrap_or(DEFAULT_DEDUPE_TIME),
            cache_lifetime: options.cache_lifetime.unwrap_or(DEFAULT_CACHE_LIFETIME),
            revalidate_interval: options.revalidate_interval.filter(|i| !i.is_zero()),
            revalidate_on_focus: options.revalidate_on_focus.unwrap_or(false),
            revalidate_on_reconnect: options.revalidate_on_reconnect.unwrap_or(false),
            throttle_calls: options.throttle_calls.unwrap_or(true),
            on_error: options.on_error,
            on_error_retry: options.on_error_retry,
        }
    }
}
