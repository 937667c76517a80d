// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The expiring key-value store seam used for dedup markers. The
//! lifecycle manager only needs small set operations with TTLs, so
//! the interface is a trait with an in-memory implementation; an
//! external store adapter implements the same trait. [`CacheFront`]
//! wraps any implementation with bounded retries and a fail-open
//! posture: dedup suppression degrades, classification never stops.

use crate::error::Error;
use crate::log::hijack_log;
use hd_common::lock;
use slog::Logger;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Small set-valued keys with expiry. Every call is expected to be
/// time-bounded by the implementation.
pub trait DedupCache: Send + Sync {
    fn set_add(&self, key: &str, member: &str) -> Result<(), Error>;
    fn set_remove(&self, key: &str, member: &str) -> Result<(), Error>;
    fn set_members(&self, key: &str) -> Result<Vec<String>, Error>;
    fn exists(&self, key: &str) -> Result<bool, Error>;
    fn expire_in(&self, key: &str, ttl: Duration) -> Result<(), Error>;
    fn remove(&self, key: &str) -> Result<(), Error>;
}

#[derive(Debug)]
struct Entry {
    members: BTreeSet<String>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        match self.expires_at {
            Some(at) => Instant::now() >= at,
            None => false,
        }
    }
}

/// In-memory implementation. Expired keys are purged lazily on
/// access.
#[derive(Debug, Default)]
pub struct MemCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DedupCache for MemCache {
    fn set_add(&self, key: &str, member: &str) -> Result<(), Error> {
        let mut entries = lock!(self.entries);
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            members: BTreeSet::new(),
            expires_at: None,
        });
        if entry.expired() {
            entry.members.clear();
            entry.expires_at = None;
        }
        entry.members.insert(member.to_string());
        Ok(())
    }

    fn set_remove(&self, key: &str, member: &str) -> Result<(), Error> {
        let mut entries = lock!(self.entries);
        if let Some(entry) = entries.get_mut(key) {
            entry.members.remove(member);
            if entry.members.is_empty() {
                entries.remove(key);
            }
        }
        Ok(())
    }

    fn set_members(&self, key: &str) -> Result<Vec<String>, Error> {
        let mut entries = lock!(self.entries);
        match entries.get(key) {
            Some(entry) if entry.expired() => {
                entries.remove(key);
                Ok(vec![])
            }
            Some(entry) => Ok(entry.members.iter().cloned().collect()),
            None => Ok(vec![]),
        }
    }

    fn exists(&self, key: &str) -> Result<bool, Error> {
        let mut entries = lock!(self.entries);
        match entries.get(key) {
            Some(entry) if entry.expired() => {
                entries.remove(key);
                Ok(false)
            }
            Some(_) => Ok(true),
            None => Ok(false),
        }
    }

    fn expire_in(&self, key: &str, ttl: Duration) -> Result<(), Error> {
        let mut entries = lock!(self.entries);
        if let Some(entry) = entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), Error> {
        lock!(self.entries).remove(key);
        Ok(())
    }
}

/// How long a cache operation may keep retrying before the front
/// gives up and degrades.
const RETRY_BUDGET: Duration = Duration::from_secs(2);

/// Fail-open front over a [`DedupCache`]. Errors are retried with
/// exponential backoff inside a small time budget; past that the call
/// returns a neutral default and bumps the failure counter that the
/// operational layer watches.
pub struct CacheFront<C: DedupCache> {
    cache: C,
    failures: AtomicU64,
    log: Logger,
}

impl<C: DedupCache> CacheFront<C> {
    pub fn new(cache: C, log: Logger) -> Self {
        Self {
            cache,
            failures: AtomicU64::new(0),
            log,
        }
    }

    /// Cumulative count of operations that exhausted their retry
    /// budget. A steadily climbing value is the health signal for a
    /// degraded cache.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    fn run<T, F>(&self, what: &str, default: T, op: F) -> T
    where
        F: Fn() -> Result<T, Error>,
    {
        let policy = backoff::ExponentialBackoffBuilder::new()
            .with_max_elapsed_time(Some(RETRY_BUDGET))
            .build();
        match backoff::retry(policy, || {
            op().map_err(backoff::Error::transient)
        }) {
            Ok(value) => value,
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                hijack_log!(
                    self.log,
                    warn,
                    crate::MOD_CACHE,
                    "cache {} failed, continuing without dedup: {}",
                    what,
                    e
                );
                default
            }
        }
    }

    pub fn set_add(&self, key: &str, member: &str) {
        self.run("set_add", (), || self.cache.set_add(key, member));
    }

    pub fn set_remove(&self, key: &str, member: &str) {
        self.run("set_remove", (), || self.cache.set_remove(key, member));
    }

    pub fn set_members(&self, key: &str) -> Vec<String> {
        self.run("set_members", vec![], || self.cache.set_members(key))
    }

    pub fn exists(&self, key: &str) -> bool {
        self.run("exists", false, || self.cache.exists(key))
    }

    pub fn expire_in(&self, key: &str, ttl: Duration) {
        self.run("expire_in", (), || self.cache.expire_in(key, ttl));
    }

    pub fn remove(&self, key: &str) {
        self.run("remove", (), || self.cache.remove(key));
    }
}
