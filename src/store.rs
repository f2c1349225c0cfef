// Copyright 2020-2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The concurrent storage table (C1). Reads never block; writes are expected
//! to be externally serialized per key by the lock manager, but the table
//! itself is safe under unsynchronized concurrent access from different keys
//! because it is backed by a sharded concurrent map rather than one
//! table-wide lock.

use dashmap::DashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Storage mode, mirroring ETS table types: `Set` holds one value per key,
/// `Bag` holds unique `(key, value)` pairs, `DuplicateBag` holds values in
/// insertion order with duplicates allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    Set,
    Bag,
    DuplicateBag,
}

impl StoreMode {
    pub(crate) fn is_multi_value(self) -> bool {
        matches!(self, StoreMode::Bag | StoreMode::DuplicateBag)
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Slot<V> {
    Single(V),
    Multi(Vec<V>),
}

/// One key's worth of state: its value(s), the wheel bucket it is currently
/// scheduled in (if any), and the TTL duration that currently governs it
/// (remembered so `touch`/`touch_on_read` can reschedule without the caller
/// repeating the duration).
#[derive(Debug, Clone)]
pub(crate) struct Entry<V> {
    pub(crate) slot: Slot<V>,
    pub(crate) bucket: Option<usize>,
    pub(crate) ttl: Option<Duration>,
}

/// What a lookup against the Store returns.
#[derive(Debug, Clone)]
pub enum Lookup<V> {
    Single(V),
    Many(Vec<V>),
}

impl<V> Lookup<V> {
    /// Convenience accessor for `Set`-mode callers, who know there is at
    /// most one value.
    pub fn into_single(self) -> Option<V> {
        match self {
            Lookup::Single(v) => Some(v),
            Lookup::Many(mut vs) => vs.pop(),
        }
    }

    pub fn into_many(self) -> Vec<V> {
        match self {
            Lookup::Single(v) => vec![v],
            Lookup::Many(vs) => vs,
        }
    }
}

pub(crate) struct Store<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    mode: StoreMode,
    map: DashMap<K, Entry<V>>,
    // Entries are kept in the map itself; this counter tracks the number of
    // *values* stored (not unique keys), matching the spec's `size/0`
    // contract for bag modes.
    value_count: AtomicUsize,
}

impl<K, V> Store<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub(crate) fn new(mode: StoreMode) -> Self {
        Self { mode, map: DashMap::new(), value_count: AtomicUsize::new(0) }
    }

    pub(crate) fn mode(&self) -> StoreMode {
        self.mode
    }

    /// Never blocks on a per-key lock; only contends with the Store's own
    /// sharded internal locking, which is held for the duration of one clone.
    pub(crate) fn lookup(&self, key: &K) -> Option<Lookup<V>> {
        self.map.get(key).map(|entry| match &entry.slot {
            Slot::Single(v) => Lookup::Single(v.clone()),
            Slot::Multi(vs) => Lookup::Many(vs.clone()),
        })
    }

    pub(crate) fn bucket_of(&self, key: &K) -> Option<Option<usize>> {
        self.map.get(key).map(|entry| entry.bucket)
    }

    pub(crate) fn ttl_of(&self, key: &K) -> Option<Option<Duration>> {
        self.map.get(key).map(|entry| entry.ttl)
    }

    pub(crate) fn exists(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    /// Set-mode replace, bag-mode append. Returns the previous bucket, if
    /// any, so the caller can unschedule the old wheel slot.
    pub(crate) fn put(&self, key: K, value: V, bucket: Option<usize>, ttl: Option<Duration>) -> Option<usize> {
        match self.mode {
            StoreMode::Set => {
                let prev = self.map.insert(key, Entry { slot: Slot::Single(value), bucket, ttl });
                match prev {
                    Some(prev) => {
                        // value_count unchanged: one value replaced another
                        prev.bucket
                    }
                    None => {
                        self.value_count.fetch_add(1, Ordering::Relaxed);
                        None
                    }
                }
            }
            StoreMode::Bag | StoreMode::DuplicateBag => {
                self.value_count.fetch_add(1, Ordering::Relaxed);
                let mut guard = self.map.entry(key).or_insert_with(|| Entry { slot: Slot::Multi(Vec::new()), bucket, ttl });
                guard.bucket = bucket;
                guard.ttl = ttl;
                match &mut guard.slot {
                    Slot::Multi(vs) => vs.push(value),
                    Slot::Single(_) => unreachable!("bag-mode store never holds a Single slot"),
                }
                None
            }
        }
    }

    /// Inserts only if the key (any value, for bag modes) does not already
    /// exist. Returns `true` on success.
    pub(crate) fn put_new(&self, key: K, value: V, bucket: Option<usize>, ttl: Option<Duration>) -> bool {
        use dashmap::mapref::entry::Entry as DEntry;
        match self.map.entry(key) {
            DEntry::Occupied(_) => false,
            DEntry::Vacant(vacant) => {
                let slot = match self.mode {
                    StoreMode::Set => Slot::Single(value),
                    StoreMode::Bag | StoreMode::DuplicateBag => Slot::Multi(vec![value]),
                };
                vacant.insert(Entry { slot, bucket, ttl });
                self.value_count.fetch_add(1, Ordering::Relaxed);
                true
            }
        }
    }

    /// Updates the bucket/ttl bookkeeping for a key without touching its
    /// value(s). Returns the previous bucket if the key existed.
    pub(crate) fn reschedule(&self, key: &K, bucket: Option<usize>, ttl: Option<Duration>) -> Option<Option<usize>> {
        self.map.get_mut(key).map(|mut entry| {
            let prev = entry.bucket;
            entry.bucket = bucket;
            entry.ttl = ttl;
            prev
        })
    }

    /// Removes all entries (every value) for a key. Returns the bucket it
    /// was scheduled in, if it existed at all.
    pub(crate) fn delete(&self, key: &K) -> Option<Option<usize>> {
        self.map.remove(key).map(|(_, entry)| {
            let n = match &entry.slot {
                Slot::Single(_) => 1,
                Slot::Multi(vs) => vs.len(),
            };
            self.value_count.fetch_sub(n, Ordering::Relaxed);
            entry.bucket
        })
    }

    /// Count of stored values, not unique keys (bag modes may hold several
    /// values per key).
    pub(crate) fn size(&self) -> usize {
        self.value_count.load(Ordering::Relaxed)
    }
}
