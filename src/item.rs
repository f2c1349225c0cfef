// Copyright 2020-2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// The TTL policy attached to a single write.
///
/// `Infinity` means the key is never scheduled for expiry.
/// `NoUpdate` means "leave whatever deadline the key already has alone" —
/// if the key had no deadline, it stays unscheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    After(Duration),
    Infinity,
    NoUpdate,
}

impl From<Duration> for Ttl {
    fn from(d: Duration) -> Self {
        Ttl::After(d)
    }
}

/// A value paired with an explicit TTL policy, for callers that want
/// per-call control instead of the cache's `global_ttl` default.
#[derive(Debug, Clone)]
pub struct Item<V> {
    pub value: V,
    pub ttl: Ttl,
}

impl<V> Item<V> {
    pub fn new(value: V, ttl: Ttl) -> Self {
        Self { value, ttl }
    }

    pub fn infinite(value: V) -> Self {
        Self { value, ttl: Ttl::Infinity }
    }
}

/// A value as handed to a write operation: either a raw value (which takes
/// the cache's `global_ttl`) or an [`Item`] carrying its own policy.
#[derive(Debug, Clone)]
pub enum Stored<V> {
    Raw(V),
    Tagged(Item<V>),
}

impl<V> Stored<V> {
    /// Splits into the value and its TTL policy. `None` means "no explicit
    /// policy was given" — the caller should fall back to `global_ttl`.
    pub(crate) fn into_parts(self) -> (V, Option<Ttl>) {
        match self {
            Stored::Raw(v) => (v, None),
            Stored::Tagged(Item { value, ttl }) => (value, Some(ttl)),
        }
    }
}

impl<V> From<V> for Stored<V> {
    fn from(value: V) -> Self {
        Stored::Raw(value)
    }
}

impl<V> From<Item<V>> for Stored<V> {
    fn from(item: Item<V>) -> Self {
        Stored::Tagged(item)
    }
}

/// The cache-wide default TTL, configured on the builder. Unlike a per-call
/// [`Ttl`], there is no `NoUpdate` lane here: a cache either has no default
/// (TTL support disabled entirely) or a concrete one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalTtl {
    After(Duration),
    Infinity,
}

impl From<Duration> for GlobalTtl {
    fn from(d: Duration) -> Self {
        GlobalTtl::After(d)
    }
}

impl From<GlobalTtl> for Ttl {
    fn from(g: GlobalTtl) -> Self {
        match g {
            GlobalTtl::After(d) => Ttl::After(d),
            GlobalTtl::Infinity => Ttl::Infinity,
        }
    }
}
