//! Minimal reactive cell used as a fetcher key part.
//!
//! [`Atom`] is a cloneable write/read/subscribe cell backed by a watch
//! channel. It is deliberately small: anything implementing
//! [`KeySource`](crate::key::KeySource) participates in key resolution the
//! same way.

use std::sync::Arc;

use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::key::{KeySource, KeyToken};

/// A shared reactive value.
///
/// Clones share the same underlying channel, so a clone kept by application
/// state and a clone embedded in a key specification observe the same writes.
///
/// # Example
///
/// ```
/// use nanoquery::Atom;
///
/// let id = Atom::new(Some(7u32));
/// assert_eq!(id.get(), Some(7));
/// id.set(None);
/// assert_eq!(id.get(), None);
/// ```
pub struct Atom<T> {
    tx: Arc<watch::Sender<T>>,
}

impl<T> Clone for Atom<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Atom<T> {
    /// Creates an atom holding the given value.
    pub fn new(value: T) -> Self {
        let (tx, _rx) = watch::channel(value);
        Self { tx: Arc::new(tx) }
    }

    /// Returns a clone of the current value.
    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Replaces the value, notifying every subscriber.
    pub fn set(&self, value: T) {
        self.tx.send_replace(value);
    }

    /// Subscribes to value changes.
    pub fn watch(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }
}

impl<T: KeyToken + Clone + Send + Sync + 'static> KeyToken for Atom<T> {
    fn token(&self) -> Option<String> {
        self.tx.borrow().token()
    }
}

impl<T: KeyToken + Clone + Send + Sync + 'static> KeySource for Atom<T> {
    fn current(&self) -> Option<String> {
        self.tx.borrow().token()
    }

    fn changes(&self) -> BoxStream<'static, ()> {
        WatchStream::from_changes(self.tx.subscribe())
            .map(|_| ())
            .boxed()
    }
}
