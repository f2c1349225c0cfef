// Copyright 2020-2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The callback dispatcher (C5). Grounded on the "unbounded channel drained
//! by one dedicated worker thread" shape used throughout kaspa's `core`
//! crate (`test_consumer.rs`'s `worker`/`Instruction::Shutdown`), so that the
//! write path only ever has to enqueue an event, never run the user's hook.

use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::JoinHandle;

/// An event delivered to the cache's callback hook. `cache_id` lets one hook
/// shared across multiple caches tell them apart.
#[derive(Debug, Clone)]
pub enum CacheEvent<K, V> {
    Update { cache_id: u64, key: K, value: V },
    Delete { cache_id: u64, key: K },
}

enum Message<K, V> {
    Event(CacheEvent<K, V>),
    Shutdown,
}

/// Owns the channel and the worker thread draining it. Dropping (or calling
/// `request_shutdown`/`join`) stops accepting new events and joins the
/// worker. The join handle sits behind a `Mutex` rather than a plain field
/// so a [`crate::ServiceHandle`] sharing this dispatcher (via `Arc`) can
/// take and join it ahead of the dispatcher's own `Drop`, without the two
/// racing to join the same handle twice.
pub(crate) struct CallbackDispatcher<K, V> {
    sender: Sender<Message<K, V>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<K, V> CallbackDispatcher<K, V>
where
    K: Send + 'static,
    V: Send + 'static,
{
    pub(crate) fn spawn(callback: impl Fn(CacheEvent<K, V>) + Send + 'static) -> Self {
        let (sender, receiver) = unbounded::<Message<K, V>>();
        let worker = std::thread::Builder::new()
            .name("concache-callback".into())
            .spawn(move || {
                for message in receiver {
                    match message {
                        Message::Event(event) => {
                            // A panicking callback must not take the dispatcher thread
                            // down with it, or every subsequent event would pile up
                            // unbounded with nobody left to drain them.
                            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                                log::warn!("concache: callback panicked, continuing to dispatch further events");
                            }
                        }
                        Message::Shutdown => break,
                    }
                }
            })
            .expect("failed to spawn concache callback thread");
        Self { sender, worker: Mutex::new(Some(worker)) }
    }
}

impl<K, V> CallbackDispatcher<K, V> {
    pub(crate) fn dispatch(&self, event: CacheEvent<K, V>) {
        // Best-effort: if the worker already shut down the send fails and is
        // silently dropped, matching the spec's "fire and forget" delivery.
        let _ = self.sender.send(Message::Event(event));
    }

    /// A cheap, cloneable handle that can enqueue events from another
    /// thread (the ticker) without needing a reference to the dispatcher
    /// itself, or a say over its shutdown.
    pub(crate) fn handle(&self) -> DispatchHandle<K, V> {
        DispatchHandle(self.sender.clone())
    }

    /// Signals the worker to stop after draining whatever is already
    /// queued. Idempotent: once the worker has exited, further sends are
    /// silently dropped.
    pub(crate) fn request_shutdown(&self) {
        let _ = self.sender.send(Message::Shutdown);
    }

    /// Blocks until the worker thread exits. Safe to call more than once,
    /// or after `Drop` has already joined it (a no-op in that case).
    pub(crate) fn join(&self) {
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl<K, V> Drop for CallbackDispatcher<K, V> {
    fn drop(&mut self) {
        self.request_shutdown();
        self.join();
    }
}

/// See [`CallbackDispatcher::handle`].
pub(crate) struct DispatchHandle<K, V>(Sender<Message<K, V>>);

impl<K, V> Clone for DispatchHandle<K, V> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<K, V> DispatchHandle<K, V> {
    pub(crate) fn dispatch(&self, event: CacheEvent<K, V>) {
        let _ = self.0.send(Message::Event(event));
    }
}
