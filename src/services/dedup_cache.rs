//! Bounded memoization of "does an entity matching these keys exist" lookups.
//!
//! Owned by a single import run and dropped with it. When the cache is full
//! the oldest half of the entries is evicted in insertion order; this is a
//! coarse FIFO trim, not LRU.

use std::collections::{HashMap, VecDeque};

use crate::defaults::DEFAULT_DEDUP_CACHE_MAX;

const KEY_SEPARATOR: char = '\u{1f}';

/// Result of a memoized lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedLookup<V> {
    Found(V),
    /// The lookup ran and nothing matched
    Absent,
}

impl<V> CachedLookup<V> {
    pub fn found(&self) -> Option<&V> {
        match self {
            CachedLookup::Found(value) => Some(value),
            CachedLookup::Absent => None,
        }
    }
}

pub struct DedupCache<V> {
    capacity: usize,
    entries: HashMap<String, CachedLookup<V>>,
    order: VecDeque<String>,
}

impl<V> DedupCache<V> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Previously stored result for `(module, key_parts...)`, if any
    pub fn lookup(&self, module: &str, key_parts: &[&str]) -> Option<&CachedLookup<V>> {
        self.entries.get(&cache_key(module, key_parts))
    }

    /// Remember a lookup result. `None` is kept as a confirmed absence so the
    /// same lookup is not repeated.
    pub fn store(&mut self, value: Option<V>, module: &str, key_parts: &[&str]) {
        let key = cache_key(module, key_parts);
        let entry = match value {
            Some(value) => CachedLookup::Found(value),
            None => CachedLookup::Absent,
        };

        if let Some(existing) = self.entries.get_mut(&key) {
            *existing = entry;
            return;
        }

        if self.entries.len() >= self.capacity {
            self.evict_oldest_half();
        }
        self.order.push_back(key.clone());
        self.entries.insert(key, entry);
    }

    fn evict_oldest_half(&mut self) {
        let evict = (self.capacity / 2).max(1);
        for _ in 0..evict {
            match self.order.pop_front() {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }
}

impl<V> Default for DedupCache<V> {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CACHE_MAX)
    }
}

/// Join the module and key parts into one unambiguous key.
///
/// The separator is escaped inside parts, so distinct part lists never
/// produce the same key.
fn cache_key(module: &str, key_parts: &[&str]) -> String {
    let mut key = String::with_capacity(module.len() + key_parts.iter().map(|p| p.len() + 1).sum::<usize>());
    push_escaped(&mut key, module);
    for part in key_parts {
        key.push(KEY_SEPARATOR);
        push_escaped(&mut key, part);
    }
    key
}

fn push_escaped(key: &mut String, part: &str) {
    for c in part.chars() {
        match c {
            '\\' => key.push_str("\\\\"),
            KEY_SEPARATOR => key.push_str("\\u"),
            c => key.push(c),
        }
    }
}
