//! Composite key resolution.
//!
//! A fetcher store's identity is a sequence of [`KeyPart`]s. Each part is
//! either fixed text or a reactive [`KeySource`] (an [`Atom`](crate::Atom),
//! another fetcher store, or anything else implementing the trait). Resolution
//! concatenates every part's current token, in order, with no separator; a
//! part with no token disables the whole key.

use std::fmt;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream::{self, BoxStream};

/// Turns a value into a key token, or `None` to disable the key.
///
/// Implemented for strings, integers, booleans, `Option` of any of those, and
/// [`Atom`](crate::Atom)s of any of those (resolved recursively).
pub trait KeyToken {
    fn token(&self) -> Option<String>;
}

impl KeyToken for String {
    fn token(&self) -> Option<String> {
        Some(self.clone())
    }
}

impl KeyToken for &str {
    fn token(&self) -> Option<String> {
        Some((*self).to_string())
    }
}

impl KeyToken for bool {
    fn token(&self) -> Option<String> {
        Some(self.to_string())
    }
}

macro_rules! impl_key_token_for_int {
    ($($ty:ty),* $(,)?) => {
        $(impl KeyToken for $ty {
            fn token(&self) -> Option<String> {
                Some(self.to_string())
            }
        })*
    };
}

impl_key_token_for_int!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize);

impl<T: KeyToken> KeyToken for Option<T> {
    fn token(&self) -> Option<String> {
        self.as_ref().and_then(KeyToken::token)
    }
}

/// A reactive contributor to a composite key.
///
/// `current` pulls the contribution on demand; `changes` yields a unit item
/// whenever the contribution may have changed. The stream must stay pending
/// (not end) while the source is still alive.
pub trait KeySource: Send + Sync {
    fn current(&self) -> Option<String>;

    fn changes(&self) -> BoxStream<'static, ()>;
}

/// One element of a key specification.
#[derive(Clone)]
pub enum KeyPart {
    /// Fixed text.
    Fixed(String),
    /// Always disables the key (a `None` literal in the specification).
    Disabled,
    /// A reactive source whose current token is the contribution.
    Source(Arc<dyn KeySource>),
}

impl KeyPart {
    /// Wraps a reactive source.
    pub fn source(source: impl KeySource + 'static) -> Self {
        Self::Source(Arc::new(source))
    }
}

impl fmt::Debug for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(s) => f.debug_tuple("Fixed").field(s).finish(),
            Self::Disabled => f.write_str("Disabled"),
            Self::Source(_) => f.write_str("Source"),
        }
    }
}

impl From<&str> for KeyPart {
    fn from(value: &str) -> Self {
        Self::Fixed(value.to_string())
    }
}

impl From<String> for KeyPart {
    fn from(value: String) -> Self {
        Self::Fixed(value)
    }
}

impl From<bool> for KeyPart {
    fn from(value: bool) -> Self {
        Self::Fixed(value.to_string())
    }
}

macro_rules! impl_key_part_from_int {
    ($($ty:ty),* $(,)?) => {
        $(impl From<$ty> for KeyPart {
            fn from(value: $ty) -> Self {
                Self::Fixed(value.to_string())
            }
        })*
    };
}

impl_key_part_from_int!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize);

impl<T: Into<KeyPart>> From<Option<T>> for KeyPart {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(part) => part.into(),
            None => Self::Disabled,
        }
    }
}

impl<T> From<&crate::Atom<T>> for KeyPart
where
    T: KeyToken + Clone + Send + Sync + 'static,
{
    fn from(atom: &crate::Atom<T>) -> Self {
        Self::source(atom.clone())
    }
}

/// An ordered key specification.
#[derive(Clone, Debug, Default)]
pub struct KeySpec {
    parts: Vec<KeyPart>,
}

impl KeySpec {
    pub fn from_parts(parts: Vec<KeyPart>) -> Self {
        Self { parts }
    }

    pub(crate) fn parts(&self) -> &[KeyPart] {
        &self.parts
    }
}

impl From<KeyPart> for KeySpec {
    fn from(part: KeyPart) -> Self {
        Self::from_parts(vec![part])
    }
}

impl From<&str> for KeySpec {
    fn from(value: &str) -> Self {
        Self::from_parts(vec![value.into()])
    }
}

impl From<String> for KeySpec {
    fn from(value: String) -> Self {
        Self::from_parts(vec![value.into()])
    }
}

impl From<Vec<KeyPart>> for KeySpec {
    fn from(parts: Vec<KeyPart>) -> Self {
        Self::from_parts(parts)
    }
}

impl<P: Into<KeyPart>, const N: usize> From<[P; N]> for KeySpec {
    fn from(parts: [P; N]) -> Self {
        Self::from_parts(parts.into_iter().map(Into::into).collect())
    }
}

/// Builds a [`KeySpec`] from heterogeneous parts.
///
/// ```
/// use nanoquery::{keys, Atom};
///
/// let id = Atom::new(Some(3u32));
/// let spec = keys!["/api/user/", &id];
/// ```
#[macro_export]
macro_rules! keys {
    ($($part:expr),* $(,)?) => {
        $crate::key::KeySpec::from_parts(vec![$($crate::key::KeyPart::from($part)),*])
    };
}

/// A fully resolved key: the canonical string plus the individual resolved
/// parts that are handed to the fetcher.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Key {
    canonical: String,
    parts: Vec<String>,
}

impl Key {
    /// The canonical key string (concatenated parts).
    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    /// The resolved parts, in specification order.
    pub fn parts(&self) -> &[String] {
        &self.parts
    }

    pub(crate) fn canonical(&self) -> String {
        self.canonical.clone()
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

/// Resolves a [`KeySpec`] on demand and exposes a merged change stream.
pub(crate) struct KeyResolver {
    spec: KeySpec,
}

impl KeyResolver {
    pub fn new(spec: KeySpec) -> Self {
        Self { spec }
    }

    /// Current canonical key, or `None` while any part is disabled.
    pub fn resolve(&self) -> Option<Key> {
        let mut canonical = String::new();
        let mut parts = Vec::with_capacity(self.spec.parts().len());
        for part in self.spec.parts() {
            let token = match part {
                KeyPart::Fixed(text) => Some(text.clone()),
                KeyPart::Disabled => None,
                KeyPart::Source(source) => source.current(),
            }?;
            canonical.push_str(&token);
            parts.push(token);
        }
        Some(Key { canonical, parts })
    }

    /// One merged stream over every reactive part. Ends once no reactive part
    /// remains alive; purely fixed specifications yield an empty stream.
    pub fn changes(&self) -> BoxStream<'static, ()> {
        let streams: Vec<_> = self
            .spec
            .parts()
            .iter()
            .filter_map(|part| match part {
                KeyPart::Source(source) => Some(source.changes()),
                _ => None,
            })
            .collect();
        stream::select_all(streams).boxed()
    }
}

/// Selects cache keys for invalidation and bulk cache mutation.
#[derive(Clone)]
pub enum KeySelector {
    /// Exactly one key.
    Key(String),
    /// Any of the listed keys.
    Keys(Vec<String>),
    /// Every key accepted by the predicate.
    Predicate(Arc<dyn Fn(&str) -> bool + Send + Sync>),
}

impl KeySelector {
    /// Builds a predicate selector.
    pub fn predicate(f: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        Self::Predicate(Arc::new(f))
    }

    pub fn matches(&self, key: &str) -> bool {
        match self {
            Self::Key(k) => k == key,
            Self::Keys(keys) => keys.iter().any(|k| k == key),
            Self::Predicate(f) => f(key),
        }
    }
}

impl fmt::Debug for KeySelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(k) => f.debug_tuple("Key").field(k).finish(),
            Self::Keys(keys) => f.debug_tuple("Keys").field(keys).finish(),
            Self::Predicate(_) => f.write_str("Predicate"),
        }
    }
}

impl From<&str> for KeySelector {
    fn from(value: &str) -> Self {
        Self::Key(value.to_string())
    }
}

impl From<String> for KeySelector {
    fn from(value: String) -> Self {
        Self::Key(value)
    }
}

impl From<Vec<String>> for KeySelector {
    fn from(keys: Vec<String>) -> Self {
        Self::Keys(keys)
    }
}

impl From<Vec<&str>> for KeySelector {
    fn from(keys: Vec<&str>) -> Self {
        Self::Keys(keys.into_iter().map(str::to_string).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Atom;

    #[test]
    fn test_fixed_parts_concatenate_without_separator() {
        let resolver = KeyResolver::new(keys!["/api", "/key"]);
        let key = resolver.resolve().expect("fixed parts always resolve");
        assert_eq!(key.as_str(), "/api/key");
        assert_eq!(key.parts(), ["/api", "/key"]);
    }

    #[test]
    fn test_scalar_parts_use_string_form() {
        let resolver = KeyResolver::new(keys!["/item/", 42u32, true]);
        let key = resolver.resolve().expect("scalars always resolve");
        assert_eq!(key.as_str(), "/item/42true");
    }

    #[test]
    fn test_none_part_disables_key() {
        let id: Atom<Option<String>> = Atom::new(None);
        let resolver = KeyResolver::new(keys!["/api/", &id]);
        assert!(resolver.resolve().is_none());

        id.set(Some("x".to_string()));
        let key = resolver.resolve().expect("set atom resolves");
        assert_eq!(key.as_str(), "/api/x");
    }

    #[test]
    fn test_disabled_literal_part() {
        let resolver = KeyResolver::new(keys!["/api", Option::<&str>::None]);
        assert!(resolver.resolve().is_none());
    }

    #[tokio::test]
    async fn test_changes_stream_merges_sources() {
        let a = Atom::new(1u32);
        let b = Atom::new(2u32);
        let resolver = KeyResolver::new(keys![&a, "/", &b]);
        let mut changes = resolver.changes();

        b.set(3);
        assert_eq!(changes.next().await, Some(()));
        a.set(4);
        assert_eq!(changes.next().await, Some(()));
        assert_eq!(resolver.resolve().expect("resolves").as_str(), "4/3");
    }

    #[test]
    fn test_selector_matching() {
        assert!(KeySelector::from("/a").matches("/a"));
        assert!(!KeySelector::from("/a").matches("/b"));
        assert!(KeySelector::from(vec!["/a", "/b"]).matches("/b"));
        assert!(KeySelector::predicate(|k| k.ends_with("/b")).matches("/a/b"));
    }
}
