// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Retryable metadata transactions.
//!
//! A [`TransactionalOperation`] is run by the [`TransactionHandler`], which
//! acquires its entity locks through `nslock`, runs it against the locked
//! rows and retries the whole attempt on transient store failures.

pub mod config;
pub mod error;
pub mod handler;
pub mod hook;
pub mod locks;
pub mod namespace;

pub use config::{TransactionConfig, load_config, validate_config};
pub use error::{Disposition, OperationError, TxError};
pub use handler::{TransactionHandler, TransactionalOperation};
pub use hook::{AttemptOutcome, AttemptReport, PostTransactionHook};
pub use locks::{CoarseLock, NamesystemGuard, NamesystemLock, StorageLockRegistry};
pub use namespace::{AddBlock, CreateFile, Delete, GetFileInfo, ListDirectory, Mkdir, Rename};
