//! Indexed subscriber set with per-filter bloom summaries
//!
//! Subscribers get a sequence number when added. Once a `(private, topics)`
//! filter has been seen twice by [`SubscriberList::match_any`] we keep a bloom
//! filter of the sequence numbers that matched it, plus the highest sequence
//! number already checked. Older subscribers absent from the bloom are skipped
//! without running the matcher; candidates are always confirmed, so a false
//! positive costs one match and never a wrong delivery.
//!
//! Blooms are sized by the number of matches, not by the number of
//! subscribers, and the whole cache is bounded in bytes.

use super::bloom::Bloom;
use super::Subscriber;
use crate::update::Update;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;
use std::num::NonZeroUsize;
use std::sync::Arc;

const DEFAULT_FILTER_CACHE_SIZE: usize = 10_000;
const DEFAULT_FILTER_CACHE_BYTES: usize = 16 * 1024 * 1024;

/// Matches a fresh summary is sized for; it doubles when overloaded
const INITIAL_FILTER_CAPACITY: usize = 64;

struct FilterSummary {
    matched: Bloom,
    checked_up_to: u64,
}

impl FilterSummary {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            matched: Bloom::with_capacity(capacity),
            checked_up_to: 0,
        }
    }

    fn size(&self) -> usize {
        self.matched.size_in_bytes()
    }
}

struct Filters {
    summaries: LruCache<String, FilterSummary>,
    /// Filters seen once, without a summary yet
    sighted: LruCache<String, ()>,
    bytes: usize,
    max_bytes: usize,
}

impl Filters {
    /// The summary for `key`, or `None` on its first sighting
    fn summary(&mut self, key: String) -> Option<&mut FilterSummary> {
        if !self.summaries.contains(&key) {
            if self.sighted.pop(&key).is_none() {
                self.sighted.put(key, ());
                return None;
            }

            let summary = FilterSummary::with_capacity(INITIAL_FILTER_CAPACITY);
            self.bytes += summary.size();
            if let Some((_, evicted)) = self.summaries.push(key.clone(), summary) {
                self.bytes -= evicted.size();
            }
        }

        let summary = self.summaries.get_mut(&key)?;
        if summary.matched.is_overloaded() {
            let grown = FilterSummary::with_capacity(summary.matched.capacity() * 2);
            self.bytes = self.bytes + grown.size() - summary.size();
            *summary = grown;
        }

        Some(summary)
    }

    /// Evict least recently used summaries until the cache fits its budget
    fn trim(&mut self) {
        while self.bytes > self.max_bytes && self.summaries.len() > 1 {
            match self.summaries.pop_lru() {
                Some((_, evicted)) => self.bytes -= evicted.size(),
                None => break,
            }
        }
    }
}

#[derive(Default)]
struct Members {
    by_seq: BTreeMap<u64, Arc<Subscriber>>,
    seq_by_id: HashMap<String, u64>,
    next_seq: u64,
}

pub struct SubscriberList {
    members: RwLock<Members>,
    filters: Mutex<Filters>,
}

impl SubscriberList {
    /// `filter_cache_size` bounds the number of distinct filters remembered
    pub fn new(filter_cache_size: usize) -> Self {
        Self::with_memory_limit(filter_cache_size, DEFAULT_FILTER_CACHE_BYTES)
    }

    /// Like [`SubscriberList::new`], also bounding the bytes held by summaries
    pub fn with_memory_limit(filter_cache_size: usize, max_bytes: usize) -> Self {
        let size = NonZeroUsize::new(filter_cache_size)
            .or(NonZeroUsize::new(DEFAULT_FILTER_CACHE_SIZE))
            .unwrap_or(NonZeroUsize::MIN);

        Self {
            members: RwLock::new(Members::default()),
            filters: Mutex::new(Filters {
                summaries: LruCache::new(size),
                sighted: LruCache::new(size),
                bytes: 0,
                max_bytes,
            }),
        }
    }

    pub fn add(&self, subscriber: Arc<Subscriber>) {
        let mut members = self.members.write();
        if members.seq_by_id.contains_key(&subscriber.id) {
            return;
        }

        members.next_seq += 1;
        let seq = members.next_seq;
        members.seq_by_id.insert(subscriber.id.clone(), seq);
        members.by_seq.insert(seq, subscriber);
    }

    pub fn remove(&self, subscriber: &Subscriber) {
        let mut members = self.members.write();
        if let Some(seq) = members.seq_by_id.remove(&subscriber.id) {
            members.by_seq.remove(&seq);
        }
    }

    pub fn len(&self) -> usize {
        self.members.read().by_seq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every subscriber admitting `update`, in insertion order
    pub fn match_any(&self, update: &Update) -> Vec<Arc<Subscriber>> {
        let key = filter_key(&update.topics, update.private);

        // Hold the read lock for the whole scan so the snapshot is consistent
        let members = self.members.read();
        let Some(newest) = members.by_seq.keys().next_back().copied() else {
            return Vec::new();
        };

        let mut filters = self.filters.lock();
        let Some(summary) = filters.summary(key) else {
            return members
                .by_seq
                .values()
                .filter(|s| s.matches(update))
                .cloned()
                .collect();
        };

        let mut matched = Vec::new();
        for (seq, subscriber) in members.by_seq.iter() {
            if *seq <= summary.checked_up_to {
                if summary.matched.contains(*seq) && subscriber.matches(update) {
                    matched.push(subscriber.clone());
                }
                continue;
            }

            if subscriber.matches(update) {
                summary.matched.insert(*seq);
                matched.push(subscriber.clone());
            }
        }
        summary.checked_up_to = newest;
        filters.trim();

        matched
    }

    /// Bytes currently held by filter summaries
    pub fn filter_cache_bytes(&self) -> usize {
        self.filters.lock().bytes
    }

    /// Visit subscribers with a sequence number of at least `start`.
    ///
    /// Stops early when `f` returns `false` and returns the sequence number to
    /// resume from.
    pub fn walk<F>(&self, start: u64, mut f: F) -> u64
    where
        F: FnMut(&Arc<Subscriber>) -> bool,
    {
        let members = self.members.read();
        for (seq, subscriber) in members.by_seq.range(start..) {
            if !f(subscriber) {
                return *seq + 1;
            }
        }

        members.next_seq + 1
    }

    /// Snapshot of all subscribers
    pub fn subscribers(&self) -> Vec<Arc<Subscriber>> {
        self.members.read().by_seq.values().cloned().collect()
    }
}

impl Default for SubscriberList {
    fn default() -> Self {
        Self::new(DEFAULT_FILTER_CACHE_SIZE)
    }
}

/// `p`/`u` followed by the sorted topics, each prefixed with its byte length
fn filter_key(topics: &[String], private: bool) -> String {
    let mut sorted: Vec<&str> = topics.iter().map(String::as_str).collect();
    sorted.sort_unstable();

    let mut key = String::with_capacity(1 + sorted.iter().map(|t| t.len() + 4).sum::<usize>());
    key.push(if private { 'p' } else { 'u' });
    for topic in sorted {
        let _ = write!(key, "{}:{}", topic.len(), topic);
    }

    key
}
