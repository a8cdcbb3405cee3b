//! In-process hot store: the mutable, key-ordered collaborator holding
//! writes that have not been collated into segments yet.
//!
//! Two table shapes cover everything the engine needs: a plain ordered
//! key/value table and a duplicate-sort table (many sorted values per key),
//! both backed by lock-free skip lists. Dup entries are stored as one
//! composite key `len(key) || key || dup`, which keeps duplicates of one
//! key adjacent and sorted.

use byteorder::{BigEndian, ByteOrder};
use crossbeam_skiplist::SkipMap;
use std::ops::Bound;

fn composite(key: &[u8], dup: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + key.len() + dup.len());
    out.extend_from_slice(&(key.len() as u32).to_be_bytes());
    out.extend_from_slice(key);
    out.extend_from_slice(dup);
    out
}

fn split(entry: &[u8]) -> (&[u8], &[u8]) {
    let klen = BigEndian::read_u32(&entry[0..4]) as usize;
    (&entry[4..4 + klen], &entry[4 + klen..])
}

/// Ordered key/value table with overwrite semantics.
#[derive(Default)]
pub struct PlainTable {
    map: SkipMap<Vec<u8>, Vec<u8>>,
}

impl PlainTable {
    pub fn new() -> Self {
        Self { map: SkipMap::new() }
    }

    pub fn put(&self, key: &[u8], value: &[u8]) {
        self.map.insert(key.to_vec(), value.to_vec());
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.map.get(key).map(|e| e.value().clone())
    }

    pub fn remove(&self, key: &[u8]) {
        self.map.remove(key);
    }

    /// First entry at or after `start`.
    pub fn seek(&self, start: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        self.map
            .range((Bound::Included(start.to_vec()), Bound::Unbounded))
            .next()
            .map(|e| (e.key().clone(), e.value().clone()))
    }

    pub fn scan_all(&self, mut f: impl FnMut(&[u8], &[u8])) {
        for entry in self.map.iter() {
            f(entry.key(), entry.value());
        }
    }

    /// Remove every entry the predicate matches, returning how many.
    pub fn remove_if(&self, mut pred: impl FnMut(&[u8], &[u8]) -> bool) -> usize {
        let doomed: Vec<Vec<u8>> = self
            .map
            .iter()
            .filter(|e| pred(e.key(), e.value()))
            .map(|e| e.key().clone())
            .collect();
        let removed = doomed.len();
        for key in doomed {
            self.map.remove(&key);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Duplicate-sort table: per key, a sorted set of values.
#[derive(Default)]
pub struct DupTable {
    map: SkipMap<Vec<u8>, ()>,
}

impl DupTable {
    pub fn new() -> Self {
        Self { map: SkipMap::new() }
    }

    pub fn insert(&self, key: &[u8], dup: &[u8]) {
        self.map.insert(composite(key, dup), ());
    }

    /// All values stored under `key`, in sorted order.
    pub fn dups(&self, key: &[u8]) -> Vec<Vec<u8>> {
        let start = composite(key, &[]);
        let mut out = Vec::new();
        for entry in self
            .map
            .range((Bound::Included(start), Bound::Unbounded))
        {
            let (entry_key, dup) = split(entry.key());
            if entry_key != key {
                break;
            }
            out.push(dup.to_vec());
        }
        out
    }

    pub fn scan_all(&self, mut f: impl FnMut(&[u8], &[u8])) {
        for entry in self.map.iter() {
            let (key, dup) = split(entry.key());
            f(key, dup);
        }
    }

    /// Remove all dups for keys in `[key_from, key_to)`. Keys in one table
    /// share a fixed width, so the composite order matches the key order.
    pub fn remove_key_range(&self, key_from: &[u8], key_to: &[u8]) -> usize {
        debug_assert_eq!(key_from.len(), key_to.len());
        let doomed: Vec<Vec<u8>> = self
            .map
            .range((
                Bound::Included(composite(key_from, &[])),
                Bound::Excluded(composite(key_to, &[])),
            ))
            .map(|e| e.key().clone())
            .collect();
        let removed = doomed.len();
        for key in doomed {
            self.map.remove(&key);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
