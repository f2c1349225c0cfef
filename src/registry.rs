// Copyright 2020-2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Optional process-wide name registration (C7), so a cache built with a
//! `name` can later be resolved by callers that only have the name, not the
//! original handle — mirroring the `name` registration option of the spec
//! (bare identifier / `{global, id}` / `{via, registry, id}`), simplified to
//! a single process-wide string-keyed table since this crate has no
//! distributed registry to delegate to.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use crate::error::CacheError;

static REGISTRY: Lazy<RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>> = Lazy::new(|| RwLock::new(HashMap::new()));

pub(crate) fn register<K, V>(name: String, cache: Arc<crate::cache::Cache<K, V>>)
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    REGISTRY.write().insert(name, cache);
}

pub(crate) fn unregister(name: &str) {
    REGISTRY.write().remove(name);
}

/// Resolves a previously-registered name back to its cache handle. Fails
/// both when nothing is registered under `name` and when something is, but
/// at a different `(K, V)` type — from the caller's point of view both are
/// "no cache of this shape is registered here".
pub fn resolve<K, V>(name: &str) -> Result<Arc<crate::cache::Cache<K, V>>, CacheError>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    REGISTRY
        .read()
        .get(name)
        .and_then(|entry| entry.clone().downcast::<crate::cache::Cache<K, V>>().ok())
        .ok_or_else(|| CacheError::NoSuchProcess(name.to_string()))
}
