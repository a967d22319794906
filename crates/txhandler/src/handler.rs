// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Retrying transaction engine.
//!
//! Every attempt begins a fresh storage transaction, acquires the unit's
//! locks from scratch, seals the context, runs the unit and commits.
//! Transient store failures are rolled back and retried up to the configured
//! ceiling; everything else is rolled back and surfaced.

use crate::config::TransactionConfig;
use crate::error::{Disposition, TxError};
use crate::hook::{AttemptOutcome, AttemptReport, PostTransactionHook};
use crate::locks::{CoarseLock, NamesystemLock, StorageLockRegistry};
use async_trait::async_trait;
use diagnostics::*;
use nslock::{
    LockAcquirer, LockRequestSet, MetadataStore, ResolvedLocks, TransactionContext,
};
use std::sync::Arc;
use std::time::Instant;

/// A unit of work run inside the retry loop.
#[async_trait]
pub trait TransactionalOperation: Send {
    type Output: Send;

    /// Operation name used in log correlation ids.
    fn name(&self) -> &'static str;

    fn coarse_lock(&self) -> CoarseLock {
        CoarseLock::None
    }

    /// Storage whose exclusive lock is held around the whole retry loop.
    fn storage_lock(&self) -> Option<String> {
        None
    }

    /// Runs at the start of every attempt, before the transaction begins.
    async fn set_up(&mut self) -> Result<(), TxError> {
        Ok(())
    }

    fn acquire_lock(&self) -> nslock::Result<LockRequestSet>;

    async fn perform_task(
        &mut self,
        ctx: &mut TransactionContext,
        locks: &ResolvedLocks,
    ) -> Result<Self::Output, TxError>;
}

enum AttemptError {
    Retry(nslock::Error),
    Abort(TxError),
}

impl AttemptError {
    /// Failure while declaring or acquiring locks.
    fn from_locking(err: nslock::Error) -> Self {
        if err.is_transient() {
            AttemptError::Retry(err)
        } else if err.is_contract_violation() {
            AttemptError::Abort(TxError::Store(err))
        } else {
            AttemptError::Abort(TxError::LockAcquire(err))
        }
    }

    /// Failure at commit: retried unless it breaks the lock contract.
    fn from_commit(err: nslock::Error) -> Self {
        if err.is_contract_violation() {
            AttemptError::Abort(TxError::Store(err))
        } else {
            AttemptError::Retry(err)
        }
    }

    fn from_task(err: TxError) -> Self {
        match (err.disposition(), err) {
            (Disposition::Retry, TxError::Store(err)) => AttemptError::Retry(err),
            (_, err) => AttemptError::Abort(err),
        }
    }
}

pub struct TransactionHandler {
    store: Arc<dyn MetadataStore>,
    config: TransactionConfig,
    namesystem_lock: NamesystemLock,
    storage_locks: Arc<StorageLockRegistry>,
    hook: Option<Arc<dyn PostTransactionHook>>,
}

impl TransactionHandler {
    pub fn new(store: Arc<dyn MetadataStore>, config: TransactionConfig) -> Self {
        Self {
            store,
            config,
            namesystem_lock: NamesystemLock::new(),
            storage_locks: Arc::new(StorageLockRegistry::new()),
            hook: None,
        }
    }

    pub fn with_namesystem_lock(mut self, lock: NamesystemLock) -> Self {
        self.namesystem_lock = lock;
        self
    }

    pub fn with_storage_locks(mut self, registry: Arc<StorageLockRegistry>) -> Self {
        self.storage_locks = registry;
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn PostTransactionHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    pub fn namesystem_lock(&self) -> &NamesystemLock {
        &self.namesystem_lock
    }

    fn correlation(&self, operation: &str) -> String {
        match self.config.server_id {
            Some(id) => format!("NN ({id}) {operation}"),
            None => operation.to_string(),
        }
    }

    /// Runs `op` until it commits, fails permanently or runs out of retries.
    pub async fn execute<O: TransactionalOperation>(&self, op: &mut O) -> Result<O::Output, TxError> {
        let operation = op.name();
        let correlation = self.correlation(operation);
        let correlation = correlation.as_str();

        let _storage_guard = match op.storage_lock() {
            Some(storage_id) => Some(self.storage_locks.lock(&storage_id).await),
            None => None,
        };
        let coarse = if self.config.coarse_lock {
            op.coarse_lock()
        } else {
            CoarseLock::None
        };
        let _coarse_guard = self.namesystem_lock.acquire(coarse).await;

        let retries = self.config.retry_count.max(1);
        let mut last_failure = None;

        for attempt in 1..=retries {
            let started = Instant::now();
            // Events logged anywhere below the attempt carry the id.
            let result = emit::Frame::push(emit::ctxt(), ("correlation", correlation))
                .in_future(self.attempt(op, correlation))
                .await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            let outcome = match &result {
                Ok(_) => AttemptOutcome::Committed,
                Err(AttemptError::Retry(_)) => AttemptOutcome::RolledBack { retryable: true },
                Err(AttemptError::Abort(_)) => AttemptOutcome::RolledBack { retryable: false },
            };
            if let Some(hook) = &self.hook {
                hook.after_attempt(&AttemptReport {
                    operation,
                    attempt,
                    outcome,
                });
            }

            match result {
                Ok(value) => {
                    debug!("{correlation} committed on attempt {attempt} in {elapsed_ms} ms");
                    return Ok(value);
                }
                Err(AttemptError::Abort(err)) => {
                    let error = err.to_string();
                    warn!("{correlation} aborted on attempt {attempt}: {error}");
                    return Err(err);
                }
                Err(AttemptError::Retry(err)) => {
                    let error = err.to_string();
                    warn!("{correlation} attempt {attempt} of {retries} failed, retrying: {error}");
                    last_failure = Some(err);
                }
            }
        }

        let last = last_failure
            .unwrap_or_else(|| nslock::Error::unavailable("no attempt completed"));
        let error = last.to_string();
        error!("{correlation} giving up after {retries} attempts: {error}");
        Err(TxError::RetriesExhausted {
            attempts: retries,
            last,
        })
    }

    async fn attempt<O: TransactionalOperation>(
        &self,
        op: &mut O,
        correlation: &str,
    ) -> Result<O::Output, AttemptError> {
        op.set_up().await.map_err(AttemptError::from_task)?;

        let tx = self
            .store
            .begin()
            .await
            .map_err(AttemptError::from_locking)?;
        let mut ctx = TransactionContext::new(tx);
        debug!("{correlation} tx started");

        let value = match self.run(op, &mut ctx, correlation).await {
            Ok(value) => value,
            Err(err) => {
                self.rollback(&mut ctx, correlation).await;
                return Err(err);
            }
        };

        match ctx.commit().await {
            Ok(()) => Ok(value),
            Err(err) => {
                self.rollback(&mut ctx, correlation).await;
                Err(AttemptError::from_commit(err))
            }
        }
    }

    async fn run<O: TransactionalOperation>(
        &self,
        op: &mut O,
        ctx: &mut TransactionContext,
        correlation: &str,
    ) -> Result<O::Output, AttemptError> {
        let resolved = if self.config.row_level_lock {
            let requests = op.acquire_lock().map_err(AttemptError::from_locking)?;
            let started = Instant::now();
            let resolved = LockAcquirer::new(ctx)
                .acquire(&requests)
                .await
                .map_err(AttemptError::from_locking)?;
            let elapsed_ms = started.elapsed().as_millis() as u64;
            let locks = ctx.lock_set().len();
            debug!("{correlation} all {locks} locks acquired in {elapsed_ms} ms");
            ctx.prevent_storage_call();
            resolved
        } else {
            ResolvedLocks::default()
        };

        op.perform_task(ctx, &resolved)
            .await
            .map_err(AttemptError::from_task)
    }

    async fn rollback(&self, ctx: &mut TransactionContext, correlation: &str) {
        if let Err(err) = ctx.rollback().await {
            let error = err.to_string();
            warn!("{correlation} rollback failed: {error}");
        }
    }
}
