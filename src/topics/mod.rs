//! Topic selectors and the shared matching cache
//!
//! A topic selector is one of:
//! - `*`, matching every topic
//! - an exact IRI, matching only itself
//! - an RFC 6570 URI template such as `https://example.com/books/{id}`
//!
//! Compiled templates and match results are cached in a sharded LRU so the
//! hot path never serializes on a single lock.

pub mod template;

pub use template::{TopicTemplate, TopicTemplateError};

use ahash::RandomState;
use lru::LruCache;
use parking_lot::Mutex;
use std::borrow::Borrow;
use std::hash::{BuildHasher, Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Selector matching every topic
pub const WILDCARD_SELECTOR: &str = "*";

pub const DEFAULT_MAX_ENTRIES_PER_SHARD: usize = 10_000;
pub const DEFAULT_SHARD_COUNT: usize = 256;

#[derive(Clone)]
enum CacheEntry {
    /// `None` records a selector that is not a valid template
    Template(Option<Arc<TopicTemplate>>),
    Match(bool),
}

/// Borrowed form of a cache key, used for lookups so a hit never allocates
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum KeyRef<'a> {
    Template(&'a str),
    Match { selector: &'a str, topic: &'a str },
}

#[derive(PartialEq, Eq)]
enum CacheKey {
    Template(Box<str>),
    Match { selector: Box<str>, topic: Box<str> },
}

trait AsKeyRef {
    fn key_ref(&self) -> KeyRef<'_>;
}

impl AsKeyRef for CacheKey {
    fn key_ref(&self) -> KeyRef<'_> {
        match self {
            Self::Template(selector) => KeyRef::Template(selector),
            Self::Match { selector, topic } => KeyRef::Match { selector, topic },
        }
    }
}

impl AsKeyRef for KeyRef<'_> {
    fn key_ref(&self) -> KeyRef<'_> {
        *self
    }
}

impl From<KeyRef<'_>> for CacheKey {
    fn from(key: KeyRef<'_>) -> Self {
        match key {
            KeyRef::Template(selector) => Self::Template(selector.into()),
            KeyRef::Match { selector, topic } => Self::Match {
                selector: selector.into(),
                topic: topic.into(),
            },
        }
    }
}

// Owned and borrowed keys must hash identically
impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key_ref().hash(state)
    }
}

impl<'a> Hash for dyn AsKeyRef + 'a {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key_ref().hash(state)
    }
}

impl<'a> PartialEq for dyn AsKeyRef + 'a {
    fn eq(&self, other: &Self) -> bool {
        self.key_ref() == other.key_ref()
    }
}

impl<'a> Eq for dyn AsKeyRef + 'a {}

impl<'a> Borrow<dyn AsKeyRef + 'a> for CacheKey {
    fn borrow(&self) -> &(dyn AsKeyRef + 'a) {
        self
    }
}

struct ShardedLru {
    shards: Vec<Mutex<LruCache<CacheKey, CacheEntry>>>,
    hasher: RandomState,
}

impl ShardedLru {
    fn new(max_entries_per_shard: NonZeroUsize, shard_count: usize) -> Self {
        let shards = (0..shard_count.max(1))
            .map(|_| Mutex::new(LruCache::new(max_entries_per_shard)))
            .collect();

        Self {
            shards,
            hasher: RandomState::new(),
        }
    }

    fn shard(&self, key: KeyRef<'_>) -> &Mutex<LruCache<CacheKey, CacheEntry>> {
        let index = self.hasher.hash_one(key) as usize % self.shards.len();
        &self.shards[index]
    }

    fn get(&self, key: KeyRef<'_>) -> Option<CacheEntry> {
        self.shard(key).lock().get(&key as &dyn AsKeyRef).cloned()
    }

    fn put(&self, key: KeyRef<'_>, entry: CacheEntry) {
        self.shard(key).lock().put(key.into(), entry);
    }

    fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }
}

/// Matches topics against selectors, caching compiled templates and results
///
/// Cache entries are idempotent: two tasks racing to fill the same key store
/// the same value, so no coordination beyond the shard lock is needed.
pub struct TopicSelectorStore {
    cache: Option<ShardedLru>,
}

impl TopicSelectorStore {
    /// Create a store with a sharded LRU cache.
    ///
    /// `max_entries_per_shard == 0` disables caching; `shard_count == 0`
    /// falls back to [`DEFAULT_SHARD_COUNT`].
    pub fn new(max_entries_per_shard: usize, shard_count: usize) -> Self {
        let cache = NonZeroUsize::new(max_entries_per_shard).map(|max| {
            let shards = if shard_count == 0 {
                DEFAULT_SHARD_COUNT
            } else {
                shard_count
            };
            ShardedLru::new(max, shards)
        });

        Self { cache }
    }

    /// A store without any cache: every call compiles and matches
    pub fn uncached() -> Self {
        Self { cache: None }
    }

    /// Check whether `topic` is admitted by `selector`
    pub fn matches(&self, topic: &str, selector: &str) -> bool {
        if selector == WILDCARD_SELECTOR || selector == topic {
            return true;
        }

        // Not a template, and the exact comparison already failed
        if !selector.contains('{') {
            return false;
        }

        let Some(cache) = &self.cache else {
            return TopicTemplate::parse(selector)
                .map(|t| t.matches(topic))
                .unwrap_or(false);
        };

        let key = KeyRef::Match { selector, topic };
        if let Some(CacheEntry::Match(result)) = cache.get(key) {
            return result;
        }

        let result = match self.template(cache, selector) {
            Some(template) => template.matches(topic),
            None => false,
        };
        cache.put(key, CacheEntry::Match(result));

        result
    }

    /// Check whether any of `topics` is admitted by any of `selectors`
    pub fn matches_any(&self, topics: &[String], selectors: &[String]) -> bool {
        topics
            .iter()
            .any(|topic| selectors.iter().any(|selector| self.matches(topic, selector)))
    }

    fn template(&self, cache: &ShardedLru, selector: &str) -> Option<Arc<TopicTemplate>> {
        let key = KeyRef::Template(selector);
        if let Some(CacheEntry::Template(template)) = cache.get(key) {
            return template;
        }

        // A malformed template is treated as a raw string that did not match
        let template = TopicTemplate::parse(selector).ok().map(Arc::new);
        cache.put(key, CacheEntry::Template(template.clone()));

        template
    }

    /// Number of cached entries across all shards
    pub fn cached_entries(&self) -> usize {
        self.cache.as_ref().map(ShardedLru::len).unwrap_or(0)
    }
}

impl Default for TopicSelectorStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES_PER_SHARD, DEFAULT_SHARD_COUNT)
    }
}

impl std::fmt::Debug for TopicSelectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicSelectorStore")
            .field("cached", &self.cache.is_some())
            .finish()
    }
}
