//! Time-bounded cache shared by every store of a [`QueryClient`](crate::QueryClient).
//!
//! Entries are type-erased so that stores of different value types can share
//! one map; each entry holds either the last successful value or the last
//! error, together with the moment it was written and the moment it stops
//! being eligible for display. Replacement is purely time-based.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::error::QueryError;
use crate::key::KeySelector;

pub(crate) type AnyValue = Arc<dyn Any + Send + Sync>;

/// A cached terminal outcome for one canonical key.
///
/// An entry holds *either* data *or* an error; the most recent terminal
/// result wins and erases the other side.
#[derive(Clone)]
pub struct CacheEntry {
    data: Option<AnyValue>,
    error: Option<QueryError>,
    created: Instant,
    expires: Instant,
}

impl CacheEntry {
    /// Creates a data entry written now and eligible for the given lifetime.
    pub fn new<T: Send + Sync + 'static>(value: T, lifetime: Duration) -> Self {
        Self::from_raw(Arc::new(value), lifetime)
    }

    /// Creates an error entry written now and eligible for the given lifetime.
    pub fn error(error: QueryError, lifetime: Duration) -> Self {
        let created = Instant::now();
        Self {
            data: None,
            error: Some(error),
            created,
            expires: created + lifetime,
        }
    }

    pub(crate) fn from_raw(value: AnyValue, lifetime: Duration) -> Self {
        let created = Instant::now();
        Self {
            data: Some(value),
            error: None,
            created,
            expires: created + lifetime,
        }
    }

    /// Overrides the creation timestamp (hydration of externally aged entries).
    #[must_use]
    pub fn created_at(mut self, created: Instant) -> Self {
        self.created = created;
        self
    }

    /// Overrides the expiry timestamp (hydration of externally aged entries).
    #[must_use]
    pub fn expires_at(mut self, expires: Instant) -> Self {
        self.expires = expires;
        self
    }

    /// Returns the cached value downcast to `T`, if this is a data entry of
    /// that type.
    pub fn data<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.data.clone().and_then(|v| v.downcast::<T>().ok())
    }

    /// Returns the cached error, if this is an error entry.
    pub fn error_value(&self) -> Option<&QueryError> {
        self.error.as_ref()
    }

    /// The moment this entry was written.
    pub fn created(&self) -> Instant {
        self.created
    }

    /// The moment this entry stops being eligible for display.
    pub fn expires(&self) -> Instant {
        self.expires
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("has_data", &self.data.is_some())
            .field("error", &self.error)
            .field("created", &self.created)
            .field("expires", &self.expires)
            .finish()
    }
}

/// Canonical key → entry map with time-based eviction.
#[derive(Default)]
pub(crate) struct Cache {
    entries: DashMap<String, CacheEntry>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a key; an expired entry is treated as absent and evicted.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return Some(entry.clone()),
            Some(_) => {}
            None => return None,
        }
        self.entries.remove(key);
        None
    }

    pub fn set(&self, key: impl Into<String>, entry: CacheEntry) {
        self.entries.insert(key.into(), entry);
    }

    pub fn delete(&self, key: &str) {
        self.entries.remove(key);
    }

    /// All non-expired keys accepted by the selector.
    pub fn matching(&self, selector: &KeySelector) -> Vec<String> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|e| !e.is_expired(now) && selector.matches(e.key()))
            .map(|e| e.key().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_entry_holds_data_or_error() {
        let entry = CacheEntry::new(42u32, Duration::from_secs(5));
        assert_eq!(entry.data::<u32>().as_deref(), Some(&42));
        assert!(entry.error_value().is_none());

        let entry = CacheEntry::error(QueryError::fetch("boom"), Duration::from_secs(5));
        assert!(entry.data::<u32>().is_none());
        assert_eq!(entry.error_value(), Some(&QueryError::fetch("boom")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_downcast_requires_matching_type() {
        let entry = CacheEntry::new("hello".to_string(), Duration::from_secs(5));
        assert!(entry.data::<u32>().is_none());
        assert_eq!(entry.data::<String>().as_deref().map(String::as_str), Some("hello"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_evicts_expired_entries() {
        let cache = Cache::new();
        cache.set("key", CacheEntry::new(1u32, Duration::from_millis(10)));
        assert!(cache.get("key").is_some());

        tokio::time::advance(Duration::from_millis(11)).await;
        assert!(cache.get("key").is_none());
        assert!(cache.matching(&KeySelector::predicate(|_| true)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_matching_applies_selector_and_expiry() {
        let cache = Cache::new();
        cache.set("/api/a", CacheEntry::new(1u32, Duration::from_secs(10)));
        cache.set("/api/b", CacheEntry::new(2u32, Duration::from_millis(1)));
        cache.set("/other", CacheEntry::new(3u32, Duration::from_secs(10)));

        tokio::time::advance(Duration::from_millis(5)).await;

        let selector = KeySelector::predicate(|key| key.starts_with("/api"));
        let mut keys = cache.matching(&selector);
        keys.sort();
        assert_eq!(keys, vec!["/api/a".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_created_precedes_expires() {
        let entry = CacheEntry::new((), Duration::from_secs(3));
        assert!(entry.created() <= entry.expires());
    }
}
