//! In memory values store.

use std::num::NonZeroUsize;

use bytes::Bytes;
use lru::LruCache;
use rand::{seq::IteratorRandom, thread_rng};

use crate::common::Id;

#[derive(Debug)]
/// An LRU cache of values per key, each value stored once.
pub struct ValueStore {
    keys: LruCache<Id, LruCache<Id, Bytes>>,
    max_values: NonZeroUsize,
}

impl ValueStore {
    pub fn new(max_keys: NonZeroUsize, max_values: NonZeroUsize) -> Self {
        Self {
            keys: LruCache::new(max_keys),
            max_values,
        }
    }

    /// Store `value` under `key`, refreshing it if it is already there.
    pub fn insert(&mut self, key: Id, value: Bytes) {
        let hash = Id::from_hash(&value);

        if let Some(values) = self.keys.get_mut(&key) {
            values.put(hash, value);
        } else {
            let mut values = LruCache::new(self.max_values);
            values.put(hash, value);
            self.keys.put(key, values);
        }
    }

    /// Up to `num` values of `key` picked at random, all of them if `num` is 0.
    pub fn get(&mut self, key: &Id, num: usize) -> Vec<Bytes> {
        let Some(values) = self.keys.get(key) else {
            return Vec::new();
        };

        if num == 0 || num >= values.len() {
            return values.iter().map(|(_, value)| value.clone()).collect();
        }

        values
            .iter()
            .map(|(_, value)| value.clone())
            .choose_multiple(&mut thread_rng(), num)
    }

    /// Number of values stored under `key`.
    pub fn count(&self, key: &Id) -> usize {
        self.keys.peek(key).map(LruCache::len).unwrap_or(0)
    }
}
