// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Process-level locks held around a whole retry loop.
//!
//! Both are owned by the caller and handed to the engine; nothing here is a
//! global.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{
    Mutex as AsyncMutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock,
};

/// Process-wide lock an operation may ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoarseLock {
    #[default]
    None,
    Read,
    Write,
}

/// Coarse read/write lock excluding all other activity of this server,
/// e.g. during startup or shutdown.
#[derive(Debug, Clone, Default)]
pub struct NamesystemLock {
    inner: Arc<RwLock<()>>,
}

/// Held coarse lock; released on drop.
#[derive(Debug)]
pub enum NamesystemGuard {
    Unlocked,
    Read(OwnedRwLockReadGuard<()>),
    Write(OwnedRwLockWriteGuard<()>),
}

impl NamesystemLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, mode: CoarseLock) -> NamesystemGuard {
        match mode {
            CoarseLock::None => NamesystemGuard::Unlocked,
            CoarseLock::Read => NamesystemGuard::Read(self.inner.clone().read_owned().await),
            CoarseLock::Write => NamesystemGuard::Write(self.inner.clone().write_owned().await),
        }
    }

    /// Non-blocking write attempt, used to check for exclusivity.
    pub fn try_write(&self) -> Option<NamesystemGuard> {
        self.inner
            .clone()
            .try_write_owned()
            .ok()
            .map(NamesystemGuard::Write)
    }
}

/// Exclusive locks keyed by storage (datanode) id, serializing work such as
/// processing reports from one storage.
#[derive(Debug, Default)]
pub struct StorageLockRegistry {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl StorageLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, storage_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks
            .entry(storage_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Locks `storage_id`, registering it on first use.
    pub async fn lock(&self, storage_id: &str) -> OwnedMutexGuard<()> {
        self.entry(storage_id).lock_owned().await
    }

    /// Forgets a storage that left the cluster. Holders keep their guard.
    pub fn remove(&self, storage_id: &str) -> bool {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.remove(storage_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
