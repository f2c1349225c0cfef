// Copyright 2020-2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The per-key lock manager (C2). Generalizes the single-variable locking
//! scheme used by `rlu`/`stm` (one lock, one owner, one version) to a
//! dynamic table of keys, each with its own FIFO-fair, reentrant lock.

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crate::error::CacheError;

/// How a caller wants to acquire a key's lock.
#[derive(Debug, Clone, Copy)]
pub enum AcquirePolicy {
    Block,
    Try,
    Timed(Duration),
}

struct LockState {
    owner: Option<ThreadId>,
    depth: u32,
    // Tickets are handed out in arrival order; a waiter may proceed once it
    // is both the front of this queue and the lock is free.
    waiters: VecDeque<ThreadId>,
}

struct KeyLock {
    state: Mutex<LockState>,
    cond: Condvar,
}

impl KeyLock {
    fn new() -> Self {
        Self { state: Mutex::new(LockState { owner: None, depth: 0, waiters: VecDeque::new() }), cond: Condvar::new() }
    }
}

pub(crate) struct LockManager<K>
where
    K: Hash + Eq + Clone,
{
    table: DashMap<K, Arc<KeyLock>>,
}

/// RAII guard: releases the lock (or decrements reentrant depth) on drop,
/// including during an unwind, so a panicking critical section never leaves
/// a key permanently locked.
pub(crate) struct LockGuard<'a, K>
where
    K: Hash + Eq + Clone,
{
    manager: &'a LockManager<K>,
    lock: Arc<KeyLock>,
    key: K,
}

impl<'a, K> Drop for LockGuard<'a, K>
where
    K: Hash + Eq + Clone,
{
    fn drop(&mut self) {
        let me = thread::current().id();
        if thread::panicking() {
            // The owning thread is unwinding out of its critical section; this
            // Drop is the owner-liveness hook releasing the lock on its behalf
            // so queued waiters aren't blocked forever by a panic.
            log::warn!("concache: critical section for {me:?} panicked, releasing its lock");
        }
        let mut state = self.lock.state.lock();
        debug_assert_eq!(state.owner, Some(me));
        state.depth -= 1;
        log::trace!("concache: {me:?} released one level of its lock, depth now {}", state.depth);
        if state.depth == 0 {
            state.owner = None;
            drop(state);
            self.lock.cond.notify_all();
            // Reclaim the table entry once nobody else (no waiter, no
            // concurrent acquirer) still holds a clone of this key's lock.
            // `strong_count <= 2` is exactly "the table's own clone, plus
            // the one this guard is about to drop" — every waiter keeps its
            // own clone alive on its stack for as long as it is queued, so
            // this can only be true when the waiter queue is also empty.
            self.manager.table.remove_if(&self.key, |_, lock| Arc::strong_count(lock) <= 2);
        }
    }
}

impl<K> LockManager<K>
where
    K: Hash + Eq + Clone,
{
    pub(crate) fn new() -> Self {
        Self { table: DashMap::new() }
    }

    fn lock_for(&self, key: &K) -> Arc<KeyLock> {
        self.table.entry(key.clone()).or_insert_with(|| Arc::new(KeyLock::new())).clone()
    }

    /// Acquires the lock for `key` per `policy`, runs `critical_section`, and
    /// releases on every exit path (including panics).
    pub(crate) fn with_lock<R>(
        &self,
        key: &K,
        policy: AcquirePolicy,
        critical_section: impl FnOnce() -> R,
    ) -> Result<R, CacheError> {
        let guard = self.acquire(key, policy)?;
        let result = critical_section();
        drop(guard);
        Ok(result)
    }

    fn acquire(&self, key: &K, policy: AcquirePolicy) -> Result<LockGuard<'_, K>, CacheError> {
        let me = thread::current().id();
        let lock = self.lock_for(key);
        let mut state = lock.state.lock();

        if state.owner == Some(me) {
            state.depth += 1;
            log::trace!("concache: {me:?} reentered its own lock, depth now {}", state.depth);
            drop(state);
            return Ok(LockGuard { manager: self, lock, key: key.clone() });
        }

        match policy {
            AcquirePolicy::Try => {
                if state.owner.is_some() {
                    log::trace!("concache: {me:?} try-acquire found the lock held, returning Locked");
                    return Err(CacheError::Locked);
                }
                state.owner = Some(me);
                state.depth = 1;
                drop(state);
                log::trace!("concache: {me:?} try-acquired an uncontended lock");
                Ok(LockGuard { manager: self, lock, key: key.clone() })
            }
            AcquirePolicy::Block => {
                if state.owner.is_none() && state.waiters.is_empty() {
                    state.owner = Some(me);
                    state.depth = 1;
                    drop(state);
                    log::trace!("concache: {me:?} acquired an uncontended lock");
                    return Ok(LockGuard { manager: self, lock, key: key.clone() });
                }
                log::trace!("concache: {me:?} queued behind a held lock");
                state.waiters.push_back(me);
                loop {
                    lock.cond.wait(&mut state);
                    if state.owner.is_none() && state.waiters.front() == Some(&me) {
                        state.waiters.pop_front();
                        state.owner = Some(me);
                        state.depth = 1;
                        drop(state);
                        log::trace!("concache: {me:?} granted the lock off the waiter queue");
                        return Ok(LockGuard { manager: self, lock, key: key.clone() });
                    }
                }
            }
            AcquirePolicy::Timed(timeout) => {
                if state.owner.is_none() && state.waiters.is_empty() {
                    state.owner = Some(me);
                    state.depth = 1;
                    drop(state);
                    log::trace!("concache: {me:?} acquired an uncontended lock");
                    return Ok(LockGuard { manager: self, lock, key: key.clone() });
                }
                log::trace!("concache: {me:?} queued behind a held lock with a {timeout:?} timeout");
                state.waiters.push_back(me);
                let deadline = Instant::now() + timeout;
                loop {
                    let now = Instant::now();
                    if now >= deadline {
                        state.waiters.retain(|w| *w != me);
                        log::trace!("concache: {me:?} timed out waiting for the lock");
                        return Err(CacheError::Timeout);
                    }
                    lock.cond.wait_for(&mut state, deadline - now);
                    if state.owner.is_none() && state.waiters.front() == Some(&me) {
                        state.waiters.pop_front();
                        state.owner = Some(me);
                        state.depth = 1;
                        drop(state);
                        log::trace!("concache: {me:?} granted the lock off the waiter queue before its deadline");
                        return Ok(LockGuard { manager: self, lock, key: key.clone() });
                    }
                    if Instant::now() >= deadline {
                        state.waiters.retain(|w| *w != me);
                        log::trace!("concache: {me:?} timed out waiting for the lock");
                        return Err(CacheError::Timeout);
                    }
                }
            }
        }
    }
}
