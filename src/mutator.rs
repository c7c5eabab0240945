//! Mutator stores: coordinated writes with optimistic cache updates.
//!
//! A [`MutatorStore`] runs a user-supplied mutation at most once at a time
//! and publishes `{loading, data, error}` around it. The mutation receives a
//! [`MutationContext`] through which it can invalidate keys and optimistically
//! rewrite cache entries, with an automatic confirming refetch once the
//! mutation settles.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::cache::CacheEntry;
use crate::client::{Event, Shared as ClientShared};
use crate::config::{QueryOptions, Settings};
use crate::error::QueryError;
use crate::key::KeySelector;

/// The published value of a [`MutatorStore`].
///
/// This is a one-shot result surface, not a cache: it resets to idle when the
/// last subscriber detaches.
#[derive(Debug)]
pub struct MutatorState<T> {
    pub loading: bool,
    pub data: Option<Arc<T>>,
    pub error: Option<QueryError>,
}

impl<T> Clone for MutatorState<T> {
    fn clone(&self) -> Self {
        Self {
            loading: self.loading,
            data: self.data.clone(),
            error: self.error.clone(),
        }
    }
}

impl<T> MutatorState<T> {
    fn idle() -> Self {
        Self {
            loading: false,
            data: None,
            error: None,
        }
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }
}

impl<T> Default for MutatorState<T> {
    fn default() -> Self {
        Self::idle()
    }
}

/// The shared future of one mutation run; every throttled caller awaits the
/// same one.
pub type MutationFuture<T> = Shared<BoxFuture<'static, Result<Arc<T>, QueryError>>>;

pub(crate) type MutateFn<D, T> =
    Arc<dyn Fn(D, MutationContext) -> BoxFuture<'static, Result<T, QueryError>> + Send + Sync>;

/// Capabilities handed to a mutation: invalidate keys and rewrite cache
/// entries while the mutation runs.
#[derive(Clone)]
pub struct MutationContext {
    shared: Arc<ClientShared>,
    cache_lifetime: Duration,
    queued: Arc<Mutex<Vec<String>>>,
}

impl MutationContext {
    fn new(shared: Arc<ClientShared>, cache_lifetime: Duration) -> Self {
        Self {
            shared,
            cache_lifetime,
            queued: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Invalidates keys immediately; the selector is a key, a list of keys,
    /// or a predicate.
    pub fn invalidate(&self, selector: impl Into<KeySelector>) {
        self.shared.invalidate_matching(&selector.into());
    }

    /// Returns an updater for the entry under `key`. With `auto_invalidate`,
    /// a revalidation of that key is enqueued to run after the mutation
    /// settles successfully, so the optimistic value is confirmed by a
    /// refetch; without it the optimistic value stands until otherwise
    /// overwritten.
    ///
    /// For a key with no cache entry the updater's `previous()` is `None`;
    /// its setter still writes.
    pub fn cache_updater<V: Send + Sync + 'static>(
        &self,
        key: impl Into<String>,
        auto_invalidate: bool,
    ) -> CacheUpdater<V> {
        let key = key.into();
        if auto_invalidate {
            self.queued.lock().push(key.clone());
        }
        let previous = self.shared.cache.get(&key).and_then(|entry| entry.data::<V>());
        CacheUpdater {
            shared: self.shared.clone(),
            key,
            previous,
            revalidating: auto_invalidate,
            lifetime: self.cache_lifetime,
        }
    }
}

/// Rewrites one cache entry and republishes it to active fetcher stores.
pub struct CacheUpdater<V> {
    shared: Arc<ClientShared>,
    key: String,
    previous: Option<Arc<V>>,
    revalidating: bool,
    lifetime: Duration,
}

impl<V: Send + Sync + 'static> CacheUpdater<V> {
    /// The cached value before the mutation, if any.
    pub fn previous(&self) -> Option<Arc<V>> {
        self.previous.clone()
    }

    /// Writes the value into the cache and publishes it to every active
    /// fetcher store on this key. While a confirming refetch is pending the
    /// stores publish the value with `loading: true`.
    pub fn set(&self, value: V) {
        tracing::debug!(key = self.key.as_str(), "optimistic cache write");
        self.shared
            .cache
            .set(self.key.clone(), CacheEntry::new(value, self.lifetime));
        let _ = self.shared.events.send(Event::Written {
            key: self.key.clone(),
            revalidating: self.revalidating,
        });
    }
}

struct MutatorInner<D, T> {
    shared: Arc<ClientShared>,
    options: QueryOptions,
    run: MutateFn<D, T>,
    state: watch::Sender<MutatorState<T>>,
    subscribers: Mutex<usize>,
    inflight: Mutex<Option<MutationFuture<T>>>,
}

impl<D, T> MutatorInner<D, T> {
    fn publish(&self, state: MutatorState<T>) {
        self.state.send_replace(state);
    }

    fn settings(&self) -> Settings {
        self.shared.settings(&self.options)
    }
}

/// A reactive store around one mutation function.
///
/// Create stores through [`QueryClient::mutator`](crate::QueryClient::mutator).
pub struct MutatorStore<D, T> {
    inner: Arc<MutatorInner<D, T>>,
}

impl<D, T> Clone for MutatorStore<D, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D, T> MutatorStore<D, T>
where
    D: Send + 'static,
    T: Send + Sync + 'static,
{
    pub(crate) fn new(
        shared: Arc<ClientShared>,
        run: MutateFn<D, T>,
        options: QueryOptions,
    ) -> Self {
        let (state, _) = watch::channel(MutatorState::idle());
        Self {
            inner: Arc::new(MutatorInner {
                shared,
                options,
                run,
                state,
                subscribers: Mutex::new(0),
                inflight: Mutex::new(None),
            }),
        }
    }

    /// Runs the mutation. With `throttle_calls` (the default) a call while a
    /// mutation is in flight returns the in-flight future instead of starting
    /// a second run.
    ///
    /// Must be called within a tokio runtime; the mutation makes progress
    /// even when the returned future is dropped.
    pub fn mutate(&self, data: D) -> MutationFuture<T> {
        let settings = self.inner.settings();
        let mut inflight = self.inner.inflight.lock();
        if settings.throttle_calls {
            if let Some(pending) = inflight.as_ref() {
                if pending.peek().is_none() {
                    tracing::trace!("mutation already in flight");
                    return pending.clone();
                }
            }
        }

        self.inner.publish(MutatorState {
            loading: true,
            data: None,
            error: None,
        });

        let context = MutationContext::new(self.inner.shared.clone(), settings.cache_lifetime);
        let queued = context.queued.clone();
        let mutation = (self.inner.run)(data, context);
        let inner = self.inner.clone();
        let future: MutationFuture<T> = async move {
            match mutation.await {
                Ok(value) => {
                    let value = Arc::new(value);
                    inner.publish(MutatorState {
                        loading: false,
                        data: Some(value.clone()),
                        error: None,
                    });
                    let keys: Vec<String> = queued.lock().drain(..).collect();
                    for key in keys {
                        inner.shared.confirm_key(&key);
                    }
                    Ok(value)
                }
                Err(error) => {
                    inner.publish(MutatorState {
                        loading: false,
                        data: None,
                        error: Some(error.clone()),
                    });
                    if let Some(handler) = &inner.settings().on_error {
                        // Mutations have no canonical key.
                        handler(&error, "");
                    }
                    Err(error)
                }
            }
        }
        .boxed()
        .shared();

        *inflight = Some(future.clone());
        drop(inflight);

        // Drive eagerly so the mutation runs even if nobody awaits it.
        tokio::spawn(future.clone().map(|_| ()));
        future
    }

    /// Attaches a subscriber. When the last one detaches the published state
    /// resets to idle.
    pub fn subscribe(&self) -> MutatorSubscription<D, T> {
        *self.inner.subscribers.lock() += 1;
        MutatorSubscription {
            rx: self.inner.state.subscribe(),
            inner: self.inner.clone(),
        }
    }

    /// The last published state.
    pub fn get(&self) -> MutatorState<T> {
        self.inner.state.borrow().clone()
    }
}

/// RAII subscription to a [`MutatorStore`].
pub struct MutatorSubscription<D, T> {
    rx: watch::Receiver<MutatorState<T>>,
    inner: Arc<MutatorInner<D, T>>,
}

impl<D, T: Clone> MutatorSubscription<D, T> {
    pub fn current(&self) -> MutatorState<T> {
        self.rx.borrow().clone()
    }

    pub async fn next_change(&mut self) -> MutatorState<T> {
        let _ = self.rx.changed().await;
        self.rx.borrow_and_update().clone()
    }
}

impl<D, T> Drop for MutatorSubscription<D, T> {
    fn drop(&mut self) {
        let mut subscribers = self.inner.subscribers.lock();
        *subscribers -= 1;
        if *subscribers == 0 {
            drop(subscribers);
            self.inner.publish(MutatorState::idle());
        }
    }
}
