// Copyright 2020-2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The host descriptor (§6), grounded on kaspanet's `core::Core`/
//! `core::service::Service` shape: an `AtomicBool` shutdown flag plus the
//! `Vec<std::thread::JoinHandle<()>>` a supervisor starts and later joins.
//! Generalized here to the fixed pair of background threads one cache can
//! own (the TTL ticker and the callback dispatcher) instead of an arbitrary
//! service list, since a single cache never hosts more than those two.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::Sender;
use parking_lot::Mutex;

use crate::callback::CallbackDispatcher;

/// A small descriptor a host process can use to manage a cache's background
/// threads independently of the cache's own [`Drop`](crate::Cache) impl —
/// the closest analogue this crate has to an Erlang/OTP child
/// specification. Obtained via [`crate::Cache::service_handle`].
///
/// A host with no supervision tree of its own doesn't need this at all: just
/// drop the `Cache`, whose `Drop` impl signals shutdown and joins the same
/// threads.
pub struct ServiceHandle<K, V> {
    pub(crate) id: u64,
    pub(crate) name: Option<String>,
    pub(crate) shutdown: Arc<AtomicBool>,
    pub(crate) ticker_shutdown: Option<Sender<()>>,
    pub(crate) ticker_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
    pub(crate) dispatcher: Option<Arc<CallbackDispatcher<K, V>>>,
}

impl<K, V> ServiceHandle<K, V>
where
    K: Send + 'static,
    V: Send + 'static,
{
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Signals the ticker and callback-dispatcher threads to stop. Does not
    /// block; call [`ServiceHandle::join`] to wait for them to actually
    /// exit. Idempotent — a second call is a no-op.
    pub fn shutdown(&self) {
        if self.shutdown.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            return;
        }
        log::trace!("concache[{}]: service handle signaling shutdown", self.id);
        if let Some(tx) = &self.ticker_shutdown {
            let _ = tx.send(());
        }
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.request_shutdown();
        }
    }

    /// Blocks until the ticker and callback-dispatcher threads have exited.
    /// Safe to call without a preceding `shutdown()` (it simply blocks until
    /// whoever does signal them, including the `Cache`'s own `Drop`), and
    /// safe to call more than once or after the `Cache` has already been
    /// dropped.
    pub fn join(&self) {
        if let Some(handle) = self.ticker_handle.lock().take() {
            let _ = handle.join();
        }
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.join();
        }
    }
}
