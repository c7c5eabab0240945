//! # Nanoquery - Reactive Keyed Fetch Cache
//!
//! Nanoquery coordinates data fetching behind reactive stores, similar to SWR
//! or TanStack Query. You declare a *fetcher store* from a composite key and
//! an async fetch function; the client guarantees that:
//!
//! 1. **One flight per key**: concurrent subscribers to the same logical key
//!    share a single in-flight request
//! 2. **Time-bounded caching**: results are shared through a cache with a
//!    dedupe window (no refetch storms) and a display lifetime (stale data
//!    stays on screen while a refresh runs)
//! 3. **Reactive keys**: keys are built from [`Atom`]s and other fetcher
//!    stores; when any part changes, the store re-evaluates and refetches
//! 4. **Coordinated mutation**: *mutator stores* run writes one at a time and
//!    can optimistically rewrite cached entries, confirmed by a refetch
//! 5. **Revalidation**: interval timers (gated by visibility), focus, and
//!    reconnect signals refresh stale data without disturbing unchanged views
//!
//! ## Core Components
//!
//! - [`QueryClient`]: per-instance container and factory for stores
//! - [`FetcherStore`]: subscription-based read path with caching
//! - [`MutatorStore`]: one-at-a-time write path with optimistic updates
//! - [`Atom`]: minimal reactive cell usable as a key part
//! - [`keys!`]: builds a key specification from heterogeneous parts
//!
//! ## Example
//!
//! ```rust,no_run
//! use futures::FutureExt;
//! use nanoquery::{keys, Atom, QueryClient, QueryError};
//!
//! # async fn demo() {
//! let client = QueryClient::new();
//! let post_id: Atom<Option<u32>> = Atom::new(None);
//!
//! // Disabled while `post_id` is None; fetches once it resolves.
//! let post = client.fetcher(keys!["/api/post/", &post_id], |key| {
//!     async move {
//!         // Any transport works; errors become `QueryError`.
//!         Ok::<_, QueryError>(format!("post at {key}"))
//!     }
//!     .boxed()
//! });
//!
//! let mut sub = post.subscribe();
//! post_id.set(Some(42));
//!
//! let state = sub.next_change().await;
//! if let Some(data) = &state.data {
//!     println!("{data}");
//! }
//! # }
//! ```

pub mod atom;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod key;
pub mod mutator;
pub mod prelude;

// Re-export commonly used types
pub use atom::Atom;
pub use cache::CacheEntry;
pub use client::QueryClient;
pub use config::{QueryOptions, RetryEvent};
pub use error::QueryError;
pub use fetcher::{FetcherState, FetcherStore, FetcherSubscription};
pub use key::{Key, KeyPart, KeySelector, KeySource, KeySpec, KeyToken};
pub use mutator::{
    CacheUpdater, MutationContext, MutationFuture, MutatorState, MutatorStore, MutatorSubscription,
};
