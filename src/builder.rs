// Copyright 2020-2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Builder & config validation (C6). Accumulates options and performs the
//! `ttl_check_interval`/`global_ttl` validation of the spec's boundary table
//! once, at `build()` time, rather than letting a half-valid cache start.

use std::sync::Arc;
use std::time::Duration;

use crate::cache::Cache;
use crate::callback::CacheEvent;
use crate::error::ConfigError;
use crate::item::{GlobalTtl, Ttl};
use crate::store::StoreMode;

/// Whether periodic expiry sweeps are configured at all, and if so how
/// often. `Unset` (the default) is distinct from `Disabled`: the former
/// means the builder was never told either way, which is itself an error
/// unless `global_ttl` is also left unset (see the validation table).
#[derive(Debug, Clone, Copy)]
enum TtlCheckInterval {
    Disabled,
    Every(Duration),
}

/// Accumulates cache configuration and validates it at `build()` time.
///
/// # Example
/// ```
/// use concache::CacheBuilder;
/// use std::time::Duration;
///
/// let cache = CacheBuilder::<String, u64>::new()
///     .ttl_check_interval(Duration::from_millis(100))
///     .global_ttl(Duration::from_secs(60))
///     .build()
///     .unwrap();
/// cache.put("a".to_string(), 1u64);
/// ```
pub struct CacheBuilder<K, V> {
    mode: StoreMode,
    ttl_check_interval: Option<TtlCheckInterval>,
    global_ttl: Option<GlobalTtl>,
    touch_on_read: bool,
    time_size: usize,
    callback: Option<Box<dyn Fn(CacheEvent<K, V>) + Send + 'static>>,
    name: Option<String>,
}

impl<K, V> Default for CacheBuilder<K, V> {
    fn default() -> Self {
        Self {
            mode: StoreMode::Set,
            ttl_check_interval: None,
            global_ttl: None,
            touch_on_read: false,
            time_size: 1,
            callback: None,
            name: None,
        }
    }
}

impl<K, V> CacheBuilder<K, V>
where
    K: std::hash::Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(mut self, mode: StoreMode) -> Self {
        self.mode = mode;
        self
    }

    /// Enables the TTL engine with the given tick period.
    pub fn ttl_check_interval(mut self, period: Duration) -> Self {
        self.ttl_check_interval = Some(TtlCheckInterval::Every(period));
        self
    }

    /// Explicitly disables the TTL engine. Conflicts with `global_ttl`.
    pub fn ttl_disabled(mut self) -> Self {
        self.ttl_check_interval = Some(TtlCheckInterval::Disabled);
        self
    }

    pub fn global_ttl(mut self, ttl: impl Into<GlobalTtl>) -> Self {
        self.global_ttl = Some(ttl.into());
        self
    }

    pub fn touch_on_read(mut self, touch_on_read: bool) -> Self {
        self.touch_on_read = touch_on_read;
        self
    }

    /// Number of buckets in the time wheel. Must be at least 1; the default
    /// of 1 is valid (every expiring key shares a single bucket, each tick
    /// draining everything due that round).
    pub fn time_size(mut self, time_size: usize) -> Self {
        self.time_size = time_size;
        self
    }

    pub fn callback(mut self, callback: impl Fn(CacheEvent<K, V>) + Send + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Registers the built cache under `name` in the process-wide registry
    /// (see [`crate::registry`]), in addition to returning the direct handle.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn build(self) -> Result<Arc<Cache<K, V>>, ConfigError> {
        let ttl_plan = match (self.ttl_check_interval, self.global_ttl) {
            (None, _) => return Err(ConfigError::MissingTtlCheckInterval),
            (Some(TtlCheckInterval::Every(_)), None) => return Err(ConfigError::MissingGlobalTtl),
            (Some(TtlCheckInterval::Disabled), Some(_)) => return Err(ConfigError::ConflictingTtlConfig),
            (Some(TtlCheckInterval::Disabled), None) => None,
            (Some(TtlCheckInterval::Every(period)), Some(global)) => Some((period, Ttl::from(global))),
        };

        if self.time_size == 0 {
            log::warn!("concache: time_size must be at least 1, clamping up from 0");
        }
        let time_size = self.time_size.max(1);

        let cache = Cache::new(self.mode, ttl_plan, time_size, self.touch_on_read, self.callback, self.name.clone());
        let cache = Arc::new(cache);
        if let Some(name) = self.name {
            crate::registry::register(name, cache.clone());
        }
        Ok(cache)
    }
}
