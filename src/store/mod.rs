//! Credential store — the single owner of every [`Key`].
//!
//! Keys live in memory, one `RwLock` slot per key, so snapshot readers
//! never block each other and a mutation only locks the key it touches.
//! Every mutation is written through to a durable [`Backend`] before it
//! becomes visible; if the write fails the in-memory key is left as it was.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use crate::error::PoolError;
use crate::key::{Key, KeyStatus, Secret};
use crate::outcome::AttemptRecord;

pub mod sqlite;

pub use sqlite::SqliteBackend;

// ── Backend ─────────────────────────────────────────────────────────

/// Rolling aggregates over persisted attempt records for one key.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AttemptStats {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub mean_latency_ms: f64,
}

/// Durable medium behind the store.
pub trait Backend: Send + Sync {
    /// Every attached key.
    fn load_keys(&self) -> Result<Vec<Key>, PoolError>;

    /// Encrypt a secret for storage. May be slow; callers hold no locks.
    fn seal_secret(&self, secret: &Secret) -> Result<Vec<u8>, PoolError>;

    /// Insert a key with its sealed secret, or re-attach a previously
    /// removed one with fresh state.
    fn insert_key(&self, key: &Key, sealed: &[u8]) -> Result<(), PoolError>;

    /// Persist a key's mutable state together with the attempt that caused it.
    /// Returns `NotFound` if the key is unknown or detached.
    fn save_key(&self, key: &Key, attempt: Option<&AttemptRecord>) -> Result<(), PoolError>;

    /// Detach a key from the pool while keeping its attempt history.
    fn detach_key(&self, id: &str, at: DateTime<Utc>) -> Result<bool, PoolError>;

    /// Most recent attempts, newest first.
    fn recent_attempts(
        &self,
        key_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<AttemptRecord>, PoolError>;

    /// Per-key aggregates over attempts recorded at or after `since`.
    fn attempt_stats_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<HashMap<String, AttemptStats>, PoolError>;
}

// ── Pool ────────────────────────────────────────────────────────────

/// Point-in-time copy of every key, ordered by identifier.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Pool {
    keys: Vec<Key>,
}

impl Pool {
    pub fn from_keys(mut keys: Vec<Key>) -> Self {
        keys.sort_by(|a, b| a.id.cmp(&b.id));
        Self { keys }
    }

    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    pub fn get(&self, id: &str) -> Option<&Key> {
        self.keys.iter().find(|k| k.id == id)
    }

    /// Keys whose status is `Active`.
    pub fn active(&self) -> impl Iterator<Item = &Key> {
        self.keys.iter().filter(|k| k.status.is_active())
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn count_where(&self, pred: impl Fn(&KeyStatus) -> bool) -> usize {
        self.keys.iter().filter(|k| pred(&k.status)).count()
    }
}

// ── Store ───────────────────────────────────────────────────────────

type Slot = Arc<RwLock<Key>>;

pub struct CredentialStore {
    slots: RwLock<BTreeMap<String, Slot>>,
    backend: Box<dyn Backend>,
}

impl CredentialStore {
    /// Open the store and load every attached key from `backend`.
    pub fn open(backend: Box<dyn Backend>) -> Result<Self, PoolError> {
        let keys = backend.load_keys()?;
        let slots = keys
            .into_iter()
            .map(|k| (k.id.clone(), Arc::new(RwLock::new(k))))
            .collect();
        Ok(Self {
            slots: RwLock::new(slots),
            backend,
        })
    }

    fn slot(&self, id: &str) -> Result<Slot, PoolError> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        slots
            .get(id)
            .cloned()
            .ok_or_else(|| PoolError::NotFound(id.to_string()))
    }

    /// Consistent copy of every key. Each key is read under its own lock,
    /// so a half-applied transition is never observed.
    pub fn snapshot(&self) -> Pool {
        let slots: Vec<Slot> = {
            let map = self.slots.read().unwrap_or_else(|e| e.into_inner());
            map.values().cloned().collect()
        };
        let keys = slots
            .iter()
            .map(|slot| slot.read().unwrap_or_else(|e| e.into_inner()).clone())
            .collect();
        Pool { keys }
    }

    pub fn get(&self, id: &str) -> Result<Key, PoolError> {
        let slot = self.slot(id)?;
        let key = slot.read().unwrap_or_else(|e| e.into_inner()).clone();
        Ok(key)
    }

    /// Atomically run `transition` against one key and persist the result.
    ///
    /// The key's slot is write-locked for the whole read-modify-persist
    /// cycle; other keys stay available. On a persistence failure the
    /// mutation is discarded and `StoreUnavailable` is returned.
    pub fn apply<F>(
        &self,
        id: &str,
        attempt: Option<&AttemptRecord>,
        transition: F,
    ) -> Result<Key, PoolError>
    where
        F: FnOnce(&mut Key),
    {
        let slot = self.slot(id)?;
        let mut current = slot.write().unwrap_or_else(|e| e.into_inner());
        let mut next = current.clone();
        transition(&mut next);
        self.backend.save_key(&next, attempt)?;
        *current = next.clone();
        Ok(next)
    }

    /// Add a key. Importing a key that is already in the pool is a no-op
    /// and returns the existing state.
    ///
    /// The secret is sealed before the pool lock is taken.
    pub fn insert(&self, key: Key) -> Result<Key, PoolError> {
        if let Ok(existing) = self.get(&key.id) {
            return Ok(existing);
        }
        let sealed = self.backend.seal_secret(&key.secret)?;

        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        // Another import of the same secret may have landed while sealing.
        if let Some(existing) = slots.get(&key.id) {
            return Ok(existing.read().unwrap_or_else(|e| e.into_inner()).clone());
        }
        self.backend.insert_key(&key, &sealed)?;
        tracing::info!(key_id = %key.id, secret = %key.secret.redacted(), "Key added to pool");
        slots.insert(key.id.clone(), Arc::new(RwLock::new(key.clone())));
        Ok(key)
    }

    /// Detach a key from the pool. Its attempt history is retained.
    pub fn remove(&self, id: &str, at: DateTime<Utc>) -> Result<(), PoolError> {
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        if !slots.contains_key(id) {
            return Err(PoolError::NotFound(id.to_string()));
        }
        self.backend.detach_key(id, at)?;
        slots.remove(id);
        tracing::info!(key_id = %id, "Key detached from pool");
        Ok(())
    }

    pub fn recent_attempts(
        &self,
        key_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<AttemptRecord>, PoolError> {
        self.backend.recent_attempts(key_id, limit)
    }

    pub fn attempt_stats_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<HashMap<String, AttemptStats>, PoolError> {
        self.backend.attempt_stats_since(since)
    }
}
