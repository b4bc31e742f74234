//! Advisory lease locks.
//!
//! A lock is a persisted record keyed by a namespaced string. Acquisition is
//! a single find-and-modify that matches only when the record is unlocked or
//! its lease has run out, so an abandoned lease is reclaimed by the next
//! caller after its TTL. Nothing outside the reconciler honors these locks;
//! repairs re-verify their preconditions after acquiring one.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;

use crate::core::{
    AppId, CoreError, DistrictId, InvalidId, OwnerId, SystemClock, WallClock, WallClockSource,
};
use crate::error::Transience;
use crate::store::{DocumentStore, LockRecord, StoreError};

const NAMESPACES: [&str; 3] = ["owner", "app", "district"];

/// Namespaced lock key: `owner:<id>`, `app:<id>` or `district:<id>`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LockKey(String);

impl LockKey {
    pub fn owner(id: &OwnerId) -> Self {
        Self(format!("owner:{id}"))
    }

    /// The application's operation lock.
    pub fn application(id: &AppId) -> Self {
        Self(format!("app:{id}"))
    }

    pub fn district(id: &DistrictId) -> Self {
        Self(format!("district:{id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for LockKey {
    type Err = CoreError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| InvalidId::LockKey {
            raw: raw.to_string(),
            reason: reason.to_string(),
        };
        let (namespace, id) = raw
            .split_once(':')
            .ok_or_else(|| invalid("missing namespace"))?;
        if !NAMESPACES.contains(&namespace) {
            return Err(invalid("unknown namespace").into());
        }
        if id.is_empty() {
            return Err(invalid("empty id").into());
        }
        Ok(Self(raw.to_string()))
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LockError {
    #[error("lock store error: {0}")]
    Store(#[from] StoreError),
}

impl LockError {
    pub fn transience(&self) -> Transience {
        match self {
            LockError::Store(e) => e.transience(),
        }
    }
}

#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn WallClockSource>,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn DocumentStore>, clock: Arc<dyn WallClockSource>) -> Self {
        Self { store, clock }
    }

    /// Take the lock for `ttl_secs`. False if another unexpired lease holds it.
    pub fn acquire(&self, key: &LockKey, ttl_secs: u64) -> Result<bool, LockError> {
        let now = self.clock.now();
        let acquired = self
            .store
            .try_lock(key.as_str(), now, now.plus_secs(ttl_secs))?;
        tracing::trace!(lock = %key, acquired, ttl_secs, "lock acquire");
        Ok(acquired)
    }

    /// Clear the lock. Safe to call whether or not it is held.
    pub fn release(&self, key: &LockKey) -> Result<(), LockError> {
        self.store.unlock(key.as_str())?;
        tracing::trace!(lock = %key, "lock released");
        Ok(())
    }

    /// Acquire and wrap in a guard that releases on drop.
    pub fn lease(&self, key: LockKey, ttl_secs: u64) -> Result<Option<LockLease<'_>>, LockError> {
        if !self.acquire(&key, ttl_secs)? {
            return Ok(None);
        }
        Ok(Some(LockLease {
            lock: self,
            key,
            released: false,
        }))
    }

    pub fn inspect(&self, key: &LockKey) -> Result<Option<LockRecord>, LockError> {
        Ok(self.store.find_lock(key.as_str())?)
    }

    pub fn now(&self) -> WallClock {
        self.clock.now()
    }
}

/// A held lease. Dropping it releases the lock.
pub struct LockLease<'a> {
    lock: &'a DistributedLock,
    key: LockKey,
    released: bool,
}

impl LockLease<'_> {
    pub fn key(&self) -> &LockKey {
        &self.key
    }

    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        self.lock.release(&self.key)
    }
}

impl Drop for LockLease<'_> {
    fn drop(&mut self) {
        if !self.released
            && let Err(err) = self.lock.release(&self.key)
        {
            tracing::warn!(lock = %self.key, error = %err, "failed to release lock lease");
        }
    }
}
