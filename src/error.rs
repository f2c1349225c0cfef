// Copyright 2020-2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::fmt::Debug;
use thiserror::Error as DeriveError;

/// Errors raised while building a [`crate::Cache`], before it has started
/// running. These all stem from an inconsistent `ttl_check_interval` /
/// `global_ttl` pairing and are caught once, at `build()` time.
#[derive(Debug, DeriveError)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("ttl_check_interval must be supplied")]
    MissingTtlCheckInterval,

    #[error("global_ttl must be supplied")]
    MissingGlobalTtl,

    #[error("either remove your global_ttl or set ttl_check_interval to a time")]
    ConflictingTtlConfig,
}

/// Errors surfaced by a running [`crate::Cache`].
///
/// These are the "logical absence" results the spec calls out: none of them
/// indicate a programming error (those panic instead, see the crate docs on
/// bag/duplicate_bag restrictions).
#[derive(Debug, DeriveError)]
#[non_exhaustive]
pub enum CacheError {
    #[error("key already exists")]
    AlreadyExists,

    #[error("key does not exist")]
    NotExisting,

    #[error("key is locked by another owner")]
    Locked,

    #[error("timed out waiting for the per-key lock")]
    Timeout,

    #[error("no cache registered under name {0:?}")]
    NoSuchProcess(String),
}

/// The result of `update`/`update_existing`: either the user closure's error
/// `E` propagated verbatim, or the key was absent and the caller used
/// `update_existing`.
#[derive(Debug, DeriveError)]
pub enum UpdateError<E: Debug> {
    #[error("key does not exist")]
    NotExisting,

    #[error("update rejected: {0:?}")]
    Rejected(E),
}
