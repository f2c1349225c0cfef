// Copyright 2020-2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The bucketed time wheel (C3). Generalizes the periodic full-table scan in
//! `engine/store`'s `Cache::try_remove_expired_items` (O(n) per scan) into a
//! true time wheel: each tick only touches the one bucket the cursor has
//! just reached, giving O(1) amortized work per tick regardless of how many
//! keys are live.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

struct Bucket<K> {
    // key -> remaining full revolutions before it actually expires.
    items: Mutex<HashMap<K, u32>>,
}

impl<K> Bucket<K> {
    fn new() -> Self {
        Self { items: Mutex::new(HashMap::new()) }
    }
}

pub(crate) struct TimeWheel<K>
where
    K: Hash + Eq + Clone,
{
    buckets: Vec<Bucket<K>>,
    cursor: AtomicUsize,
    tick: Duration,
    size: usize,
}

impl<K> TimeWheel<K>
where
    K: Hash + Eq + Clone,
{
    pub(crate) fn new(size: usize, tick: Duration) -> Self {
        assert!(size >= 1, "time_size must be at least 1");
        let buckets = (0..size).map(|_| Bucket::new()).collect();
        Self { buckets, cursor: AtomicUsize::new(0), tick, size }
    }

    pub(crate) fn tick_period(&self) -> Duration {
        self.tick
    }

    /// Computes the bucket a TTL of `ttl` would land in if scheduled right
    /// now, and how many additional full revolutions must pass first.
    fn ticks_from_now(&self, ttl: Duration) -> (usize, u32) {
        let tick_nanos = self.tick.as_nanos().max(1);
        let ttl_nanos = ttl.as_nanos();
        let ticks_total = (((ttl_nanos + tick_nanos - 1) / tick_nanos).max(1)) as u64;
        let m = ticks_total - 1;
        let n = self.size as u64;
        let offset = m % n;
        let revolutions = (m / n) as u32;
        let cursor = self.cursor.load(Ordering::Acquire) as u64;
        let bucket = ((cursor + offset + 1) % n) as usize;
        (bucket, revolutions)
    }

    /// Schedules `key` to expire after `ttl`, removing it from any bucket it
    /// was previously scheduled in. Returns the new bucket index.
    pub(crate) fn schedule(&self, key: K, ttl: Duration, previous_bucket: Option<usize>) -> usize {
        if let Some(prev) = previous_bucket {
            self.buckets[prev].items.lock().remove(&key);
        }
        let (bucket, revolutions) = self.ticks_from_now(ttl);
        self.buckets[bucket].items.lock().insert(key, revolutions);
        log::trace!(
            "concache: scheduled a key for bucket {} ({} revolution(s) out) after {:?}, previously in {:?}",
            bucket,
            revolutions,
            ttl,
            previous_bucket
        );
        bucket
    }

    /// Removes `key` from the wheel entirely (used by `delete`).
    pub(crate) fn unschedule(&self, key: &K, bucket: usize) {
        self.buckets[bucket].items.lock().remove(key);
        log::trace!("concache: unscheduled a key from bucket {bucket}");
    }

    /// Advances the cursor by one bucket and returns `(bucket_index, keys)`
    /// where `keys` are the ones whose revolution counter has just reached
    /// zero — candidates for expiry. Keys still counting down are
    /// decremented in place and left in the bucket.
    pub(crate) fn tick(&self) -> (usize, Vec<K>) {
        let bucket = (self.cursor.fetch_add(1, Ordering::AcqRel) + 1) % self.size;
        let mut expired = Vec::new();
        let mut items = self.buckets[bucket].items.lock();
        let remaining_before = items.len();
        items.retain(|key, revolutions| {
            if *revolutions == 0 {
                expired.push(key.clone());
                false
            } else {
                *revolutions -= 1;
                true
            }
        });
        drop(items);
        log::trace!(
            "concache: wheel tick advanced to bucket {}, {} of {} pending key(s) reached zero revolutions",
            bucket,
            expired.len(),
            remaining_before
        );
        (bucket, expired)
    }
}
