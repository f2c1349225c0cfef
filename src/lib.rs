// Copyright 2020-2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! An in-process, concurrent key-value cache.
//!
//! Reads against [`Cache::get`] are lock-free. Writes and user-supplied
//! read-modify-write callbacks ([`Cache::update`], [`Cache::isolated`], ...)
//! are serialized per key by an internal lock manager, so contention on one
//! key never blocks work on another. An optional TTL engine, a bucketed time
//! wheel, expires keys in amortized O(1) work per tick regardless of how
//! many keys are live.
//!
//! Build a cache through [`CacheBuilder`]:
//!
//! ```
//! use concache::{CacheBuilder, Item};
//! use std::time::Duration;
//!
//! let cache = CacheBuilder::<&'static str, i32>::new()
//!     .ttl_check_interval(Duration::from_millis(10))
//!     .global_ttl(Duration::from_millis(50))
//!     .build()
//!     .unwrap();
//!
//! cache.put("a", 1);
//! assert_eq!(cache.get(&"a").and_then(|v| v.into_single()), Some(1));
//!
//! cache.put("b", Item::infinite(2));
//! assert_eq!(cache.get(&"b").and_then(|v| v.into_single()), Some(2));
//! ```

#![allow(clippy::type_complexity)]

mod builder;
mod cache;
mod callback;
mod error;
mod item;
mod lock_manager;
mod registry;
mod service;
mod store;
mod wheel;

pub use builder::CacheBuilder;
pub use cache::Cache;
pub use callback::CacheEvent;
pub use error::{CacheError, ConfigError, UpdateError};
pub use item::{GlobalTtl, Item, Stored, Ttl};
pub use lock_manager::AcquirePolicy;
pub use registry::resolve;
pub use service::ServiceHandle;
pub use store::{Lookup, StoreMode};
