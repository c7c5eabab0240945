//! Fetcher stores and the per-store coordination engine.
//!
//! A [`FetcherStore`] publishes `{data, error, loading}` for the value behind
//! its current composite key. The engine behind it runs only while the store
//! has subscribers: it resolves the key, consults the shared cache, enforces
//! the dedupe window, keeps at most one fetch in flight per key across every
//! store of the client, schedules retries, and revalidates on interval,
//! focus, and reconnect events.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use futures::stream::{self, BoxStream};
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::cache::CacheEntry;
use crate::client::{Event, Inflight, Shared};
use crate::config::{QueryOptions, RetryEvent, Settings};
use crate::error::QueryError;
use crate::key::{Key, KeyPart, KeyResolver, KeySource, KeySpec};

/// The published value of a [`FetcherStore`].
///
/// `data` and `error` can coexist transiently: after a failed refresh the
/// previously shown data is kept alongside the error
/// (stale-while-revalidate).
#[derive(Clone, Debug, PartialEq)]
pub struct FetcherState<T> {
    pub data: Option<Arc<T>>,
    pub error: Option<QueryError>,
    pub loading: bool,
}

impl<T> FetcherState<T> {
    pub(crate) fn idle() -> Self {
        Self {
            data: None,
            error: None,
            loading: false,
        }
    }

    /// Returns `true` while a fetch for the current key is in flight.
    pub fn is_loading(&self) -> bool {
        self.loading
    }
}

impl<T> Default for FetcherState<T> {
    fn default() -> Self {
        Self::idle()
    }
}

/// What caused a state resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Trigger {
    Mount,
    KeyChange,
    Invalidate,
    Revalidate,
    Refresh,
    Retry,
}

impl Trigger {
    /// Explicit invalidation, revalidation and retries skip the dedupe
    /// window; everything else honors it.
    fn bypasses_dedupe(self) -> bool {
        matches!(self, Self::Invalidate | Self::Revalidate | Self::Retry)
    }

    fn clears_data(self) -> bool {
        matches!(self, Self::Invalidate)
    }
}

#[derive(Default)]
struct Lifecycle {
    subscribers: usize,
    engine: Option<JoinHandle<()>>,
    engine_key: Option<String>,
}

pub(crate) struct FetcherInner<T> {
    shared: Arc<Shared>,
    options: QueryOptions,
    resolver: KeyResolver,
    state: watch::Sender<FetcherState<T>>,
    lifecycle: Mutex<Lifecycle>,
}

impl<T> FetcherInner<T> {
    fn release(&self) {
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.subscribers -= 1;
        if lifecycle.subscribers > 0 {
            return;
        }
        if let Some(engine) = lifecycle.engine.take() {
            engine.abort();
        }
        if let Some(key) = lifecycle.engine_key.take() {
            self.shared.unregister_key(&key);
        }
        tracing::trace!("fetcher engine stopped");
    }

    fn set_engine_key(&self, key: Option<String>) {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.engine_key == key {
            return;
        }
        if let Some(old) = lifecycle.engine_key.take() {
            self.shared.unregister_key(&old);
        }
        if let Some(new) = &key {
            self.shared.register_key(new);
        }
        lifecycle.engine_key = key;
    }
}

impl<T> FetcherInner<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn settings(&self) -> Settings {
        self.shared.settings(&self.options)
    }

    /// Publishes without notifying when nothing changed, so subscribers that
    /// react to store identity never see a spurious update.
    fn publish(&self, next: FetcherState<T>) {
        self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    /// The state resolution procedure. Decides between idle, cache hit,
    /// joining an in-flight fetch, and starting a fetch.
    fn apply(&self, key: Option<&Key>, trigger: Trigger) {
        let settings = self.settings();
        let Some(key) = key else {
            self.publish(FetcherState::idle());
            return;
        };
        let now = Instant::now();
        let entry = self.shared.cache.get(key.as_str());
        let stale = if trigger.clears_data() {
            None
        } else {
            entry.as_ref().and_then(|e| e.data::<T>())
        };

        if self.shared.inflight.contains_key(key.as_str()) {
            self.publish(FetcherState {
                data: stale,
                error: None,
                loading: true,
            });
            return;
        }

        if let Some(entry) = &entry {
            if !trigger.bypasses_dedupe() && now < entry.created() + settings.dedupe_time {
                self.publish(FetcherState {
                    data: entry.data::<T>(),
                    error: entry.error_value().cloned(),
                    loading: false,
                });
                return;
            }
        }

        let Some(fetch) = settings.fetcher.clone() else {
            self.publish(FetcherState {
                data: None,
                error: Some(QueryError::Fetch("no fetcher configured".to_string())),
                loading: false,
            });
            return;
        };

        match self.shared.inflight.entry(key.canonical()) {
            Entry::Occupied(inflight) => {
                tracing::trace!(
                    key = key.as_str(),
                    started = ?inflight.get().started,
                    "joining in-flight fetch"
                );
                self.publish(FetcherState {
                    data: stale,
                    error: None,
                    loading: true,
                });
                return;
            }
            Entry::Vacant(slot) => {
                slot.insert(Inflight { started: now });
            }
        }

        self.publish(FetcherState {
            data: stale,
            error: None,
            loading: true,
        });

        // The fetch is detached from the engine: an unmounting store never
        // aborts user I/O, and the terminal outcome still lands in the cache
        // under its own key. Only engines whose current key matches publish
        // the settle.
        let shared = self.shared.clone();
        let key = key.clone();
        let lifetime = settings.cache_lifetime;
        let on_error = settings.on_error.clone();
        tokio::spawn(async move {
            tracing::debug!(key = key.as_str(), ?trigger, "fetch started");
            let outcome = fetch(key.clone()).await;
            let ok = outcome.is_ok();
            match outcome {
                Ok(value) => {
                    shared
                        .cache
                        .set(key.as_str(), CacheEntry::from_raw(value, lifetime));
                }
                Err(error) => {
                    shared
                        .cache
                        .set(key.as_str(), CacheEntry::error(error.clone(), lifetime));
                    if let Some(handler) = &on_error {
                        handler(&error, key.as_str());
                    }
                }
            }
            shared.inflight.remove(key.as_str());
            tracing::debug!(key = key.as_str(), ok, "fetch settled");
            let _ = shared.events.send(Event::Settled {
                key: key.canonical(),
                ok,
            });
        });
    }

    fn publish_settled_ok(&self, key: &str) {
        match self.shared.cache.get(key) {
            Some(entry) => self.publish(FetcherState {
                data: entry.data::<T>(),
                error: entry.error_value().cloned(),
                loading: false,
            }),
            None => self.publish(FetcherState::idle()),
        }
    }

    /// Publishes the failure, keeping whatever data was on display, and
    /// returns the deadline of the next retry if the policy schedules one.
    fn publish_settled_err(&self, key: &str, retry_count: u32) -> Option<Instant> {
        let error = self
            .shared
            .cache
            .get(key)
            .and_then(|entry| entry.error_value().cloned());
        let stale = self.state.borrow().data.clone();
        self.publish(FetcherState {
            data: stale,
            error: error.clone(),
            loading: false,
        });

        let settings = self.settings();
        let (Some(policy), Some(error)) = (settings.on_error_retry, error) else {
            return None;
        };
        // Only a positive delay schedules a retry; zero stops like `None`.
        let delay = policy(&RetryEvent {
            retry_count,
            error,
            key: key.to_string(),
        })
        .filter(|delay| !delay.is_zero())?;
        tracing::debug!(key, retry_count, ?delay, "retry scheduled");
        Some(Instant::now() + delay)
    }

    /// Republishes after an out-of-band cache write (optimistic update or
    /// bulk cache mutation).
    fn publish_written(&self, key: &str, revalidating: bool) {
        match self.shared.cache.get(key) {
            Some(entry) => self.publish(FetcherState {
                data: entry.data::<T>(),
                error: entry.error_value().cloned(),
                loading: revalidating,
            }),
            None => self.publish(FetcherState::idle()),
        }
    }

    /// Deadline of the next interval revalidation, absent while hidden or
    /// when no interval is configured.
    fn next_tick(&self) -> Option<Instant> {
        let interval = self.settings().revalidate_interval?;
        if *self.shared.visibility.borrow() {
            Some(Instant::now() + interval)
        } else {
            None
        }
    }
}

/// The engine task: owns the store's published state while subscribers
/// exist. One `select!` loop over key changes, client events, the retry
/// deadline, the interval deadline, and the visibility signal.
async fn run_engine<T>(inner: Arc<FetcherInner<T>>)
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    let mut events = inner.shared.events.subscribe();
    let mut visibility = inner.shared.visibility.subscribe();
    let mut changes = inner.resolver.changes();
    let mut changes_done = false;

    let mut key = inner.resolver.resolve();
    inner.set_engine_key(key.as_ref().map(Key::canonical));
    inner.apply(key.as_ref(), Trigger::Mount);

    let mut retry_count: u32 = 0;
    let mut retry_at: Option<Instant> = None;
    let mut next_tick = inner.next_tick();

    loop {
        tokio::select! {
            change = changes.next(), if !changes_done => {
                match change {
                    Some(()) => {
                        // Drain everything already pending so that multiple
                        // synchronous key-part writes re-evaluate once.
                        while changes.next().now_or_never().flatten().is_some() {}
                        let resolved = inner.resolver.resolve();
                        if resolved != key {
                            key = resolved;
                            retry_count = 0;
                            retry_at = None;
                            inner.set_engine_key(key.as_ref().map(Key::canonical));
                            inner.apply(key.as_ref(), Trigger::KeyChange);
                            next_tick = inner.next_tick();
                        }
                    }
                    None => changes_done = true,
                }
            }
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let current = key.as_ref().map(Key::as_str);
                match event {
                    Event::Invalidate { key: k } if current == Some(k.as_str()) => {
                        retry_count = 0;
                        retry_at = None;
                        inner.apply(key.as_ref(), Trigger::Invalidate);
                    }
                    Event::Revalidate { key: k } if current == Some(k.as_str()) => {
                        retry_at = None;
                        inner.apply(key.as_ref(), Trigger::Revalidate);
                    }
                    // Settles for other keys are ignored on purpose: a late
                    // result for a key no longer in force is written to the
                    // cache but never published here.
                    Event::Settled { key: k, ok } if current == Some(k.as_str()) => {
                        if ok {
                            retry_count = 0;
                            inner.publish_settled_ok(&k);
                        } else {
                            retry_count += 1;
                            retry_at = inner.publish_settled_err(&k, retry_count);
                        }
                    }
                    Event::Written { key: k, revalidating } if current == Some(k.as_str()) => {
                        inner.publish_written(&k, revalidating);
                    }
                    Event::Focus => {
                        if inner.settings().revalidate_on_focus {
                            inner.apply(key.as_ref(), Trigger::Refresh);
                        }
                    }
                    Event::Reconnect => {
                        if inner.settings().revalidate_on_reconnect {
                            inner.apply(key.as_ref(), Trigger::Refresh);
                        }
                    }
                    _ => {}
                }
            }
            _ = async move { tokio::time::sleep_until(retry_at.unwrap()).await }, if retry_at.is_some() => {
                retry_at = None;
                inner.apply(key.as_ref(), Trigger::Retry);
            }
            _ = async move { tokio::time::sleep_until(next_tick.unwrap()).await }, if next_tick.is_some() => {
                inner.apply(key.as_ref(), Trigger::Refresh);
                next_tick = inner.next_tick();
            }
            changed = visibility.changed() => {
                if changed.is_err() {
                    break;
                }
                next_tick = inner.next_tick();
            }
        }
    }
}

/// A reactive store for one fetched resource.
///
/// Clones share state; the engine runs from the first subscription to the
/// last. Create stores through
/// [`QueryClient::fetcher`](crate::QueryClient::fetcher).
pub struct FetcherStore<T> {
    inner: Arc<FetcherInner<T>>,
}

impl<T> Clone for FetcherStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> FetcherStore<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    pub(crate) fn new(shared: Arc<Shared>, spec: KeySpec, options: QueryOptions) -> Self {
        let (state, _) = watch::channel(FetcherState::idle());
        Self {
            inner: Arc::new(FetcherInner {
                shared,
                options,
                resolver: KeyResolver::new(spec),
                state,
                lifecycle: Mutex::new(Lifecycle::default()),
            }),
        }
    }

    /// Attaches a subscriber. The first subscription activates the engine;
    /// dropping the last one deactivates it.
    ///
    /// Must be called within a tokio runtime.
    pub fn subscribe(&self) -> FetcherSubscription<T> {
        let rx = self.inner.state.subscribe();
        {
            let mut lifecycle = self.inner.lifecycle.lock();
            lifecycle.subscribers += 1;
            if lifecycle.subscribers == 1 {
                lifecycle.engine = Some(tokio::spawn(run_engine(self.inner.clone())));
                tracing::trace!("fetcher engine started");
            }
        }
        FetcherSubscription {
            rx,
            inner: self.inner.clone(),
        }
    }

    /// The last published state.
    pub fn get(&self) -> FetcherState<T> {
        self.inner.state.borrow().clone()
    }

    /// The current canonical key, or `None` while the key is disabled.
    pub fn key(&self) -> Option<String> {
        self.inner.resolver.resolve().map(|key| key.canonical())
    }

    /// Forces a refetch of the current key, clearing published data. With no
    /// subscribers the cache entry is removed instead, so the next
    /// subscription refetches.
    pub fn invalidate(&self) {
        if let Some(key) = self.key() {
            self.inner.shared.invalidate_key(&key);
        }
    }

    /// Forces a refetch of the current key, keeping published data on
    /// display while the fetch is in flight.
    pub fn revalidate(&self) {
        if let Some(key) = self.key() {
            self.inner.shared.revalidate_key(&key);
        }
    }
}

/// A fetcher store contributes its canonical key, never its data, when used
/// as a key part of another store; the dependent store keeps a stable
/// identity as long as the upstream key is stable. Participating as a key
/// part mounts the upstream store for the lifetime of the dependent engine.
impl<T> KeySource for FetcherStore<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn current(&self) -> Option<String> {
        self.key()
    }

    fn changes(&self) -> BoxStream<'static, ()> {
        let guard = self.subscribe();
        let changes = self.inner.resolver.changes();
        stream::unfold((changes, guard), |(mut changes, guard)| async move {
            match changes.next().await {
                Some(()) => Some(((), (changes, guard))),
                // Keep the upstream mounted even when it has no reactive
                // parts left to report on.
                None => futures::future::pending().await,
            }
        })
        .boxed()
    }
}

impl<T> From<&FetcherStore<T>> for KeyPart
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn from(store: &FetcherStore<T>) -> Self {
        KeyPart::source(store.clone())
    }
}

/// RAII subscription to a [`FetcherStore`]. Dropping it detaches the
/// subscriber.
pub struct FetcherSubscription<T> {
    rx: watch::Receiver<FetcherState<T>>,
    inner: Arc<FetcherInner<T>>,
}

impl<T: Clone> FetcherSubscription<T> {
    /// The state as of now.
    pub fn current(&self) -> FetcherState<T> {
        self.rx.borrow().clone()
    }

    /// Waits for the next published change and returns the new state.
    pub async fn next_change(&mut self) -> FetcherState<T> {
        // The sender lives inside the store we hold, so the channel cannot
        // close while this subscription exists.
        let _ = self.rx.changed().await;
        self.rx.borrow_and_update().clone()
    }

    /// Whether a change was published since the last read.
    pub fn has_changed(&self) -> bool {
        self.rx.has_changed().unwrap_or(false)
    }
}

impl<T> Drop for FetcherSubscription<T> {
    fn drop(&mut self) {
        self.inner.release();
    }
}
