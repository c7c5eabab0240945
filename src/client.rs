//! The per-instance container: cache, defaults, in-flight table, registry of
//! active keys, and the process-wide event channel.
//!
//! A [`QueryClient`] is the factory for fetcher and mutator stores. Clients
//! are cheap to clone and fully independent of each other: two clients never
//! share cache entries, dedupe state, or revalidation events.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

use crate::cache::{Cache, CacheEntry};
use crate::config::{QueryOptions, Settings};
use crate::error::QueryError;
use crate::fetcher::FetcherStore;
use crate::key::{Key, KeySelector, KeySpec};
use crate::mutator::{MutationContext, MutatorStore};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Coordination events fanned out to every active store engine.
#[derive(Clone, Debug)]
pub(crate) enum Event {
    /// Force a refetch of the key, clearing published data.
    Invalidate { key: String },
    /// Force a refetch of the key, keeping published data.
    Revalidate { key: String },
    /// A fetch for the key reached a terminal outcome.
    Settled { key: String, ok: bool },
    /// The cache entry for the key was rewritten outside a fetch. When
    /// `revalidating` a confirming refetch is still pending.
    Written { key: String, revalidating: bool },
    /// The environment reported focus (or became visible again).
    Focus,
    /// The environment reported network connectivity returning.
    Reconnect,
}

/// An in-flight fetch for one canonical key.
pub(crate) struct Inflight {
    pub started: Instant,
}

pub(crate) struct Shared {
    pub cache: Cache,
    pub inflight: DashMap<String, Inflight>,
    pub events: broadcast::Sender<Event>,
    pub visibility: watch::Sender<bool>,
    defaults: QueryOptions,
    overrule: RwLock<Option<QueryOptions>>,
    registry: DashMap<String, usize>,
}

impl Shared {
    fn new(defaults: QueryOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (visibility, _) = watch::channel(true);
        Self {
            cache: Cache::new(),
            inflight: DashMap::new(),
            events,
            visibility,
            defaults,
            overrule: RwLock::new(None),
            registry: DashMap::new(),
        }
    }

    /// Layers built-ins ← client defaults ← per-store options ← override.
    pub fn settings(&self, per_store: &QueryOptions) -> Settings {
        let mut options = self.defaults.merged_with(per_store);
        if let Some(patch) = &*self.overrule.read() {
            options = options.merged_with(patch);
        }
        Settings::from(options)
    }

    pub fn register_key(&self, key: &str) {
        *self.registry.entry(key.to_string()).or_insert(0) += 1;
    }

    pub fn unregister_key(&self, key: &str) {
        if let Some(mut count) = self.registry.get_mut(key) {
            *count = count.saturating_sub(1);
        }
        self.registry.remove_if(key, |_, count| *count == 0);
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.registry.get(key).is_some_and(|count| *count > 0)
    }

    /// Keys present in the cache or carried by an active store.
    fn known_keys(&self, selector: &KeySelector) -> Vec<String> {
        let mut keys: HashSet<String> = self.cache.matching(selector).into_iter().collect();
        keys.extend(
            self.registry
                .iter()
                .filter(|e| selector.matches(e.key()))
                .map(|e| e.key().clone()),
        );
        keys.into_iter().collect()
    }

    /// Refetch now with published data cleared, or drop the cache entry when
    /// nobody subscribes to the key.
    pub fn invalidate_key(&self, key: &str) {
        tracing::debug!(key, "invalidate");
        if self.is_active(key) {
            let _ = self.events.send(Event::Invalidate {
                key: key.to_string(),
            });
        } else {
            self.cache.delete(key);
        }
    }

    /// Refetch now keeping published data, or drop the cache entry when
    /// nobody subscribes to the key.
    pub fn revalidate_key(&self, key: &str) {
        tracing::debug!(key, "revalidate");
        if self.is_active(key) {
            let _ = self.events.send(Event::Revalidate {
                key: key.to_string(),
            });
        } else {
            self.cache.delete(key);
        }
    }

    /// Refetch confirmation after an optimistic write. Keys with subscribers
    /// refetch keeping their published data; for the rest the written entry
    /// stands, so the next subscription still sees the optimistic value.
    pub fn confirm_key(&self, key: &str) {
        tracing::debug!(key, "confirm");
        if self.is_active(key) {
            let _ = self.events.send(Event::Revalidate {
                key: key.to_string(),
            });
        }
    }

    pub fn invalidate_matching(&self, selector: &KeySelector) {
        for key in self.known_keys(selector) {
            self.invalidate_key(&key);
        }
    }
}

/// A reactive keyed fetch cache instance.
///
/// Construct one per logical data domain; make fetcher stores for reads and
/// mutator stores for writes. All stores of one client share its cache, its
/// request deduplication, and its revalidation events.
///
/// # Example
///
/// ```no_run
/// use futures::FutureExt;
/// use nanoquery::{keys, Atom, QueryClient, QueryError};
///
/// # async fn demo() {
/// let client = QueryClient::new();
/// let user_id = Atom::new(Some(1u32));
///
/// let user = client.fetcher(keys!["/api/user/", &user_id], |key| {
///     async move { Ok::<_, QueryError>(format!("user at {key}")) }.boxed()
/// });
///
/// let mut sub = user.subscribe();
/// let state = sub.next_change().await;
/// assert!(state.loading);
/// # }
/// ```
#[derive(Clone)]
pub struct QueryClient {
    shared: Arc<Shared>,
}

impl QueryClient {
    /// Creates a client with default options.
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(QueryOptions::default())
    }

    /// Creates a client with the given defaults; any pre-seeded cache entries
    /// in the options are consulted exactly like engine-written entries.
    #[must_use]
    pub fn with_options(options: QueryOptions) -> Self {
        let shared = Shared::new(QueryOptions {
            cache_seed: Vec::new(),
            ..options.clone()
        });
        for (key, entry) in options.cache_seed {
            shared.cache.set(key, entry);
        }
        Self {
            shared: Arc::new(shared),
        }
    }

    /// Creates a fetcher store for the given key specification and fetch
    /// function.
    pub fn fetcher<T, K, F>(&self, keys: K, fetch: F) -> FetcherStore<T>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
        K: Into<KeySpec>,
        F: Fn(Key) -> BoxFuture<'static, Result<T, QueryError>> + Send + Sync + 'static,
    {
        self.fetcher_with_options(keys, QueryOptions::new().fetcher(fetch))
    }

    /// Creates a fetcher store with per-store options. The fetch function may
    /// come from the options or fall through to the client-wide default.
    pub fn fetcher_with_options<T, K>(&self, keys: K, options: QueryOptions) -> FetcherStore<T>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
        K: Into<KeySpec>,
    {
        FetcherStore::new(self.shared.clone(), keys.into(), options)
    }

    /// Creates a mutator store around the given mutation function.
    pub fn mutator<D, T, F>(&self, run: F) -> MutatorStore<D, T>
    where
        D: Send + 'static,
        T: Send + Sync + 'static,
        F: Fn(D, MutationContext) -> BoxFuture<'static, Result<T, QueryError>>
            + Send
            + Sync
            + 'static,
    {
        self.mutator_with_options(run, QueryOptions::new())
    }

    /// Creates a mutator store with per-store options.
    pub fn mutator_with_options<D, T, F>(&self, run: F, options: QueryOptions) -> MutatorStore<D, T>
    where
        D: Send + 'static,
        T: Send + Sync + 'static,
        F: Fn(D, MutationContext) -> BoxFuture<'static, Result<T, QueryError>>
            + Send
            + Sync
            + 'static,
    {
        MutatorStore::new(self.shared.clone(), Arc::new(run), options)
    }

    /// Invalidates every key, cached or actively subscribed, accepted by the
    /// selector. Active keys refetch immediately with their published data
    /// cleared; inactive keys lose their cache entry so the next subscription
    /// refetches.
    pub fn invalidate_keys(&self, selector: impl Into<KeySelector>) {
        self.shared.invalidate_matching(&selector.into());
    }

    /// Writes `Some(value)` into (or with `None` deletes) every matching
    /// cache entry, republishing to active stores on those keys.
    pub fn mutate_cache<V: Send + Sync + 'static>(
        &self,
        selector: impl Into<KeySelector>,
        value: Option<V>,
    ) {
        let selector = selector.into();
        let lifetime = self.shared.settings(&QueryOptions::default()).cache_lifetime;
        let value = value.map(|v| Arc::new(v) as crate::cache::AnyValue);
        for key in self.shared.known_keys(&selector) {
            match &value {
                Some(raw) => self
                    .shared
                    .cache
                    .set(key.clone(), CacheEntry::from_raw(raw.clone(), lifetime)),
                None => self.shared.cache.delete(&key),
            }
            let _ = self.shared.events.send(Event::Written {
                key,
                revalidating: false,
            });
        }
    }

    /// Test hook: replaces the resolved defaults used by all subsequent
    /// engine decisions.
    pub fn overrule_settings(&self, patch: QueryOptions) {
        *self.shared.overrule.write() = Some(patch);
    }

    /// Environment signal: document visibility. Interval revalidation only
    /// ticks while visible; a hidden → visible transition counts as focus.
    pub fn set_visible(&self, visible: bool) {
        let was_visible = *self.shared.visibility.borrow();
        self.shared.visibility.send_replace(visible);
        if visible && !was_visible {
            let _ = self.shared.events.send(Event::Focus);
        }
    }

    /// Environment signal: window focus. Revalidates every active store with
    /// `revalidate_on_focus`.
    pub fn notify_focus(&self) {
        let _ = self.shared.events.send(Event::Focus);
    }

    /// Environment signal: network reconnect. Revalidates every active store
    /// with `revalidate_on_reconnect`.
    pub fn notify_reconnect(&self) {
        let _ = self.shared.events.send(Event::Reconnect);
    }
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_registry_counts_active_keys() {
        let shared = Shared::new(QueryOptions::default());
        assert!(!shared.is_active("/a"));

        shared.register_key("/a");
        shared.register_key("/a");
        assert!(shared.is_active("/a"));

        shared.unregister_key("/a");
        assert!(shared.is_active("/a"));
        shared.unregister_key("/a");
        assert!(!shared.is_active("/a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_without_subscribers_drops_cache_entry() {
        let shared = Shared::new(QueryOptions::default());
        shared
            .cache
            .set("/a", CacheEntry::new(1u32, Duration::from_secs(10)));

        shared.invalidate_key("/a");
        assert!(shared.cache.get("/a").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_known_keys_unions_cache_and_registry() {
        let shared = Shared::new(QueryOptions::default());
        shared
            .cache
            .set("/cached", CacheEntry::new(1u32, Duration::from_secs(10)));
        shared.register_key("/active");

        let mut keys = shared.known_keys(&KeySelector::predicate(|_| true));
        keys.sort();
        assert_eq!(keys, vec!["/active".to_string(), "/cached".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clients_do_not_share_state() {
        let a = QueryClient::new();
        let b = QueryClient::new();
        a.shared
            .cache
            .set("/k", CacheEntry::new(1u32, Duration::from_secs(10)));
        assert!(b.shared.cache.get("/k").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hydrated_cache_is_consulted() {
        let client = QueryClient::with_options(QueryOptions::new().cache([(
            "/seeded".to_string(),
            CacheEntry::new("hello".to_string(), Duration::from_secs(10)),
        )]));
        let entry = client.shared.cache.get("/seeded").expect("seed present");
        assert_eq!(
            entry.data::<String>().as_deref().map(String::as_str),
            Some("hello")
        );
    }
}
