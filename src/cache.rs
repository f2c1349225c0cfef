// Copyright 2020-2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The public cache facade (C4). Composes the Store (C1), Lock Manager (C2),
//! Time Wheel (C3) and Callback Dispatcher (C5) into the operation set of
//! the crate's docs, the way `engine/store`'s `storage::Cache` composes a
//! `HashMap` and a periodic scan into `get`/`insert`/`remove`/`get_or_insert`
//! — generalized here to per-key locking, a real time wheel, bag/duplicate
//! bag modes, and asynchronous callback delivery.

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::callback::{CacheEvent, CallbackDispatcher, DispatchHandle};
use crate::error::{CacheError, UpdateError};
use crate::item::{Stored, Ttl};
use crate::lock_manager::{AcquirePolicy, LockManager};
use crate::service::ServiceHandle;
use crate::store::{Lookup, Store, StoreMode};
use crate::wheel::TimeWheel;

static NEXT_CACHE_ID: AtomicU64 = AtomicU64::new(1);

/// What to do with a key's expiry slot when a write happens, after folding
/// together the per-call [`Ttl`] (if any) with the cache's `global_ttl`.
enum Schedule {
    /// Leave the existing bucket/duration exactly as they are.
    Keep,
    /// Unschedule: the key never expires.
    Infinite,
    /// (Re)schedule to expire after this duration from now.
    After(Duration),
}

/// A concurrent, TTL-aware key-value cache.
///
/// Constructed through [`crate::CacheBuilder`]. `build()` hands back an
/// `Arc<Cache<K, V>>`; dropping the last handle stops the background ticker
/// and callback-dispatcher threads.
pub struct Cache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    id: u64,
    name: Option<String>,
    store: Arc<Store<K, V>>,
    locks: Arc<LockManager<K>>,
    wheel: Option<Arc<TimeWheel<K>>>,
    dispatcher: Option<Arc<CallbackDispatcher<K, V>>>,
    global_ttl: Option<Ttl>,
    touch_on_read: bool,
    // Shared with any `ServiceHandle` handed out via `service_handle`, so
    // either side can trigger shutdown / join the threads without the two
    // racing each other.
    shutdown: Arc<AtomicBool>,
    ticker_shutdown: Option<Sender<()>>,
    ticker_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl<K, V> Cache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        mode: StoreMode,
        ttl_plan: Option<(Duration, Ttl)>,
        time_size: usize,
        touch_on_read: bool,
        callback: Option<Box<dyn Fn(CacheEvent<K, V>) + Send + 'static>>,
        name: Option<String>,
    ) -> Self {
        let id = NEXT_CACHE_ID.fetch_add(1, Ordering::Relaxed);
        let store = Arc::new(Store::new(mode));
        let locks = Arc::new(LockManager::new());
        let dispatcher = callback.map(CallbackDispatcher::spawn).map(Arc::new);
        let shutdown = Arc::new(AtomicBool::new(false));

        let (wheel, global_ttl, ticker_shutdown, ticker_handle) = match ttl_plan {
            Some((period, global)) => {
                let wheel = Arc::new(TimeWheel::new(time_size, period));
                let dispatch_handle = dispatcher.as_ref().map(|d| d.handle());
                let (tx, handle) = Self::spawn_ticker(id, wheel.clone(), store.clone(), locks.clone(), dispatch_handle);
                (Some(wheel), Some(global), Some(tx), Arc::new(Mutex::new(Some(handle))))
            }
            None => (None, None, None, Arc::new(Mutex::new(None))),
        };

        Self {
            id,
            name,
            store,
            locks,
            wheel,
            dispatcher,
            global_ttl,
            touch_on_read,
            shutdown,
            ticker_shutdown,
            ticker_handle,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Spawns the background thread that drives the time wheel: sleeps for
    /// one tick period at a time (via a shutdown channel's `recv_timeout`,
    /// so shutdown wakes it immediately rather than waiting out the last
    /// tick), then for every key whose revolution counter reached zero,
    /// re-validates under that key's lock that it is still scheduled in the
    /// bucket just drained (I2: a bucket reference may be a stale tombstone
    /// if the key was rescheduled mid-race) before deleting it.
    fn spawn_ticker(
        id: u64,
        wheel: Arc<TimeWheel<K>>,
        store: Arc<Store<K, V>>,
        locks: Arc<LockManager<K>>,
        events: Option<DispatchHandle<K, V>>,
    ) -> (Sender<()>, JoinHandle<()>) {
        let (tx, rx) = bounded::<()>(1);
        let handle = std::thread::Builder::new()
            .name("concache-ticker".into())
            .spawn(move || loop {
                match rx.recv_timeout(wheel.tick_period()) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {
                        let (bucket, candidates) = wheel.tick();
                        if candidates.is_empty() {
                            continue;
                        }
                        log::debug!(
                            "concache[{}]: ticker drained bucket {} with {} expiry candidate(s)",
                            id,
                            bucket,
                            candidates.len()
                        );
                        for key in candidates {
                            let _ = locks.with_lock(&key, AcquirePolicy::Block, || {
                                let still_current = matches!(store.bucket_of(&key), Some(Some(b)) if b == bucket);
                                if !still_current {
                                    return;
                                }
                                if store.delete(&key).is_some() {
                                    if let Some(events) = &events {
                                        events.dispatch(CacheEvent::Delete { cache_id: id, key: key.clone() });
                                    }
                                }
                            });
                        }
                    }
                }
            })
            .expect("failed to spawn concache ticker thread");
        (tx, handle)
    }

    fn dispatch_update(&self, key: &K, value: &V) {
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.dispatch(CacheEvent::Update { cache_id: self.id, key: key.clone(), value: value.clone() });
        }
    }

    fn dispatch_delete(&self, key: &K) {
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.dispatch(CacheEvent::Delete { cache_id: self.id, key: key.clone() });
        }
    }

    fn require_set_mode(&self, op: &str) {
        if self.store.mode().is_multi_value() {
            panic!("concache: {op} is not supported for bag/duplicate_bag tables");
        }
    }

    /// Resolves an explicit per-call [`Ttl`] (or its absence) against this
    /// cache's `global_ttl` default.
    fn resolve(&self, explicit: Option<Ttl>) -> Schedule {
        match explicit {
            Some(Ttl::NoUpdate) => Schedule::Keep,
            Some(Ttl::Infinity) => Schedule::Infinite,
            Some(Ttl::After(d)) => Schedule::After(d),
            None => match self.global_ttl {
                None => Schedule::Keep,
                Some(Ttl::Infinity) => Schedule::Infinite,
                Some(Ttl::After(d)) => Schedule::After(d),
                Some(Ttl::NoUpdate) => unreachable!("global_ttl is never NoUpdate"),
            },
        }
    }

    /// Applies a [`Schedule`] decision against a key's previous bucket,
    /// returning the `(bucket, ttl)` pair to persist on the Store entry.
    fn apply_schedule(
        &self,
        key: &K,
        schedule: Schedule,
        prev_bucket: Option<usize>,
        prev_ttl: Option<Duration>,
    ) -> (Option<usize>, Option<Duration>) {
        match schedule {
            Schedule::Keep => (prev_bucket, prev_ttl),
            Schedule::Infinite => {
                if let (Some(wheel), Some(bucket)) = (&self.wheel, prev_bucket) {
                    wheel.unschedule(key, bucket);
                }
                (None, None)
            }
            Schedule::After(d) => match &self.wheel {
                Some(wheel) => {
                    let bucket = wheel.schedule(key.clone(), d, prev_bucket);
                    (Some(bucket), Some(d))
                }
                // TTL engine disabled entirely: durations are accepted but
                // never actually expire anything.
                None => (None, Some(d)),
            },
        }
    }

    fn write_locked(&self, key: &K, value: V, explicit_ttl: Option<Ttl>) {
        let prev_bucket = self.store.bucket_of(key).flatten();
        let prev_ttl = self.store.ttl_of(key).flatten();
        let schedule = self.resolve(explicit_ttl);
        let (bucket, ttl) = self.apply_schedule(key, schedule, prev_bucket, prev_ttl);
        self.store.put(key.clone(), value, bucket, ttl);
    }

    fn delete_locked(&self, key: &K) {
        match self.store.delete(key) {
            Some(Some(bucket)) => {
                if let Some(wheel) = &self.wheel {
                    wheel.unschedule(key, bucket);
                }
                self.dispatch_delete(key);
            }
            Some(None) => self.dispatch_delete(key),
            None => {}
        }
    }

    /// Lock-free read. Never blocks, never fails. Returns a single value in
    /// `Set` mode, all stored values (in insertion order) in `Bag`/
    /// `DuplicateBag` mode.
    pub fn get(&self, key: &K) -> Option<Lookup<V>> {
        let found = self.store.lookup(key);
        if found.is_some() && self.touch_on_read {
            if let (Some(wheel), Some(Some(d))) = (&self.wheel, self.store.ttl_of(key)) {
                let prev_bucket = self.store.bucket_of(key).flatten();
                let bucket = wheel.schedule(key.clone(), d, prev_bucket);
                self.store.reschedule(key, Some(bucket), Some(d));
            }
        }
        found
    }

    /// Stores a value under `key`. In `Set` mode this replaces any existing
    /// value; in `Bag`/`DuplicateBag` mode it appends. Accepts either a raw
    /// `V` (takes `global_ttl`) or an [`crate::Item<V>`]/[`Stored<V>`]
    /// carrying an explicit TTL policy.
    pub fn put(&self, key: K, value: impl Into<Stored<V>>) {
        let (value, explicit_ttl) = value.into().into_parts();
        let _ = self.locks.with_lock(&key, AcquirePolicy::Block, || {
            self.write_locked(&key, value.clone(), explicit_ttl);
            self.dispatch_update(&key, &value);
        });
    }

    /// Like [`Cache::put`] but refuses to overwrite an existing key (any
    /// value, in bag modes).
    pub fn insert_new(&self, key: K, value: impl Into<Stored<V>>) -> Result<(), CacheError> {
        let (value, explicit_ttl) = value.into().into_parts();
        self.locks
            .with_lock(&key, AcquirePolicy::Block, || self.insert_new_locked(&key, value, explicit_ttl))
            .expect("blocking acquire never fails")
    }

    /// Lock-free variant of [`Cache::insert_new`].
    pub fn dirty_insert_new(&self, key: K, value: impl Into<Stored<V>>) -> Result<(), CacheError> {
        let (value, explicit_ttl) = value.into().into_parts();
        self.insert_new_locked(&key, value, explicit_ttl)
    }

    fn insert_new_locked(&self, key: &K, value: V, explicit_ttl: Option<Ttl>) -> Result<(), CacheError> {
        if self.store.exists(key) {
            return Err(CacheError::AlreadyExists);
        }
        let schedule = self.resolve(explicit_ttl);
        let (bucket, ttl) = self.apply_schedule(key, schedule, None, None);
        self.store.put_new(key.clone(), value.clone(), bucket, ttl);
        self.dispatch_update(key, &value);
        Ok(())
    }

    /// Read-modify-write under the per-key lock. `Set` mode only (bag modes
    /// panic, see the crate docs). `f` receives the current value (or
    /// `None`) and must return the new [`Stored<V>`] to persist, or an error
    /// which is surfaced verbatim without mutating anything.
    pub fn update<F, E>(&self, key: K, f: F) -> Result<(), UpdateError<E>>
    where
        F: FnOnce(Option<&V>) -> Result<Stored<V>, E>,
        E: std::fmt::Debug,
    {
        self.require_set_mode("update");
        self.locks
            .with_lock(&key, AcquirePolicy::Block, || self.update_locked(&key, f))
            .expect("blocking acquire never fails")
    }

    /// Lock-free variant of [`Cache::update`]. Still `Set` mode only.
    pub fn dirty_update<F, E>(&self, key: K, f: F) -> Result<(), UpdateError<E>>
    where
        F: FnOnce(Option<&V>) -> Result<Stored<V>, E>,
        E: std::fmt::Debug,
    {
        self.require_set_mode("dirty_update");
        self.update_locked(&key, f)
    }

    fn update_locked<F, E>(&self, key: &K, f: F) -> Result<(), UpdateError<E>>
    where
        F: FnOnce(Option<&V>) -> Result<Stored<V>, E>,
        E: std::fmt::Debug,
    {
        let current = self.store.lookup(key).and_then(Lookup::into_single);
        let stored = f(current.as_ref()).map_err(UpdateError::Rejected)?;
        let (value, explicit_ttl) = stored.into_parts();
        self.write_locked(key, value.clone(), explicit_ttl);
        self.dispatch_update(key, &value);
        Ok(())
    }

    /// Like [`Cache::update`] but returns [`UpdateError::NotExisting`]
    /// without invoking `f` when the key is absent.
    pub fn update_existing<F, E>(&self, key: K, f: F) -> Result<(), UpdateError<E>>
    where
        F: FnOnce(Option<&V>) -> Result<Stored<V>, E>,
        E: std::fmt::Debug,
    {
        self.require_set_mode("update_existing");
        self.locks
            .with_lock(&key, AcquirePolicy::Block, || self.update_existing_locked(&key, f))
            .expect("blocking acquire never fails")
    }

    /// Lock-free variant of [`Cache::update_existing`]. Still `Set` mode only.
    pub fn dirty_update_existing<F, E>(&self, key: K, f: F) -> Result<(), UpdateError<E>>
    where
        F: FnOnce(Option<&V>) -> Result<Stored<V>, E>,
        E: std::fmt::Debug,
    {
        self.require_set_mode("dirty_update_existing");
        self.update_existing_locked(&key, f)
    }

    fn update_existing_locked<F, E>(&self, key: &K, f: F) -> Result<(), UpdateError<E>>
    where
        F: FnOnce(Option<&V>) -> Result<Stored<V>, E>,
        E: std::fmt::Debug,
    {
        let current = self.store.lookup(key).and_then(Lookup::into_single);
        if current.is_none() {
            return Err(UpdateError::NotExisting);
        }
        let stored = f(current.as_ref()).map_err(UpdateError::Rejected)?;
        let (value, explicit_ttl) = stored.into_parts();
        self.write_locked(key, value.clone(), explicit_ttl);
        self.dispatch_update(key, &value);
        Ok(())
    }

    /// Removes every value stored under `key`. Idempotent: deleting an
    /// absent key still succeeds, but fires no callback (nothing changed).
    pub fn delete(&self, key: &K) {
        let _ = self.locks.with_lock(key, AcquirePolicy::Block, || self.delete_locked(key));
    }

    /// Reschedules `key`'s expiry using its currently-governing TTL, without
    /// changing its value(s). A no-op for keys with no TTL (infinite, or the
    /// TTL engine disabled) or that don't exist.
    pub fn touch(&self, key: &K) {
        let _ = self.locks.with_lock(key, AcquirePolicy::Block, || {
            if let (Some(wheel), Some(Some(d))) = (&self.wheel, self.store.ttl_of(key)) {
                let prev_bucket = self.store.bucket_of(key).flatten();
                let bucket = wheel.schedule(key.clone(), d, prev_bucket);
                self.store.reschedule(key, Some(bucket), Some(d));
            }
        });
    }

    /// `Set` mode only. Fast path: a lock-free `get`. Slow path (on miss):
    /// acquires the lock, re-checks, and on a confirmed miss calls
    /// `produce()`, stores its result under `global_ttl`, and returns it.
    pub fn get_or_store(&self, key: K, produce: impl FnOnce() -> V) -> V {
        self.require_set_mode("get_or_store");
        if let Some(v) = self.get(&key).and_then(Lookup::into_single) {
            return v;
        }
        self.locks
            .with_lock(&key, AcquirePolicy::Block, || self.get_or_store_locked(&key, produce))
            .expect("blocking acquire never fails")
    }

    /// Lock-free variant of [`Cache::get_or_store`]. Skips the re-check
    /// against a racing writer, so `produce()` may run (and its result be
    /// discarded by a concurrent overwrite) more than once under contention.
    pub fn dirty_get_or_store(&self, key: K, produce: impl FnOnce() -> V) -> V {
        self.require_set_mode("dirty_get_or_store");
        self.get_or_store_locked(&key, produce)
    }

    fn get_or_store_locked(&self, key: &K, produce: impl FnOnce() -> V) -> V {
        if let Some(v) = self.store.lookup(key).and_then(Lookup::into_single) {
            return v;
        }
        let value = produce();
        self.write_locked(key, value.clone(), None);
        self.dispatch_update(key, &value);
        value
    }

    /// Runs `f` under `key`'s lock, blocking indefinitely if it is held by
    /// another owner. Reentrant from the same thread.
    pub fn isolated<R>(&self, key: &K, f: impl FnOnce() -> R) -> R {
        self.locks.with_lock(key, AcquirePolicy::Block, f).expect("blocking acquire never fails")
    }

    /// Like [`Cache::isolated`] but fails with [`CacheError::Timeout`]
    /// instead of blocking past `timeout`. `f` is never invoked on timeout.
    pub fn isolated_timeout<R>(&self, key: &K, timeout: Duration, f: impl FnOnce() -> R) -> Result<R, CacheError> {
        self.locks.with_lock(key, AcquirePolicy::Timed(timeout), f)
    }

    /// Like [`Cache::isolated`] but fails immediately with
    /// [`CacheError::Locked`] instead of blocking.
    pub fn try_isolated<R>(&self, key: &K, f: impl FnOnce() -> R) -> Result<R, CacheError> {
        self.locks.with_lock(key, AcquirePolicy::Try, f)
    }

    /// Count of stored values (not unique keys — a bag-mode key with 3
    /// values counts 3 times).
    pub fn size(&self) -> usize {
        self.store.size()
    }

    /// Like [`Cache::put`] but bypasses the per-key lock entirely. For
    /// callers that can prove no contention on `key`, or accept the race.
    pub fn dirty_put(&self, key: K, value: impl Into<Stored<V>>) {
        let (value, explicit_ttl) = value.into().into_parts();
        self.write_locked(&key, value.clone(), explicit_ttl);
        self.dispatch_update(&key, &value);
    }

    /// Lock-free variant of [`Cache::delete`].
    pub fn dirty_delete(&self, key: &K) {
        self.delete_locked(key);
    }

    /// Removes this cache's registry entry (if it was built with a `name`),
    /// so the name can be reused by a future cache and the registry's own
    /// `Arc` clone stops keeping this cache's background threads alive.
    /// Does not affect this or any other handle already held by the caller;
    /// call sites that also want to stop the background threads should drop
    /// every handle afterward, or use [`Cache::service_handle`] directly.
    /// A no-op if the cache was never given a `name`, or has already been
    /// unregistered.
    pub fn unregister(&self) {
        if let Some(name) = &self.name {
            crate::registry::unregister(name);
        }
    }

    /// Returns a [`ServiceHandle`] a host process can use to shut down and
    /// join this cache's background threads (the TTL ticker and, if
    /// configured, the callback dispatcher) on its own schedule, without
    /// needing to drop every `Arc<Cache<K, V>>` handle first.
    pub fn service_handle(&self) -> ServiceHandle<K, V> {
        ServiceHandle {
            id: self.id,
            name: self.name.clone(),
            shutdown: self.shutdown.clone(),
            ticker_shutdown: self.ticker_shutdown.clone(),
            ticker_handle: self.ticker_handle.clone(),
            dispatcher: self.dispatcher.clone(),
        }
    }
}

impl<K, V> Drop for Cache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(tx) = self.ticker_shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.ticker_handle.lock().take() {
            let _ = handle.join();
        }
        // The dispatcher's own `Drop` (when its last `Arc` — this one, or
        // one a `ServiceHandle` was still holding — goes away) signals its
        // worker to stop and joins it; nothing further to do here.
        if let Some(name) = &self.name {
            crate::registry::unregister(name);
        }
    }
}
