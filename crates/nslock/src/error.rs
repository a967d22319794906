// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use crate::lock::LockCategory;
use crate::node::EntityKey;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures raised by the metadata store and the locking layer.
///
/// Variants fall into three classes: transient store conflicts that a
/// fresh attempt may resolve, outright lock failures, and contract
/// violations where the caller asked for something that can never succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("optimistic concurrency conflict: {0}")]
    Conflict(String),

    #[error("deadlock detected: {0}")]
    Deadlock(String),

    #[error("metadata store unavailable: {0}")]
    Unavailable(String),

    #[error("lock acquisition failed: {0}")]
    LockFailed(String),

    #[error("storage access after lock phase: {0}")]
    StorageCallPrevented(String),

    #[error("{key} modified without a write lock (held: {held})")]
    LockUpgrade { key: EntityKey, held: String },

    #[error("lock category {0} requested twice")]
    DuplicateLock(LockCategory),

    #[error("lock category {0} was not requested")]
    LockNotAdded(LockCategory),

    #[error("invalid lock request: {0}")]
    InvalidRequest(String),
}

impl Error {
    pub fn conflict<S: Into<String>>(msg: S) -> Self {
        Error::Conflict(msg.into())
    }

    pub fn deadlock<S: Into<String>>(msg: S) -> Self {
        Error::Deadlock(msg.into())
    }

    pub fn unavailable<S: Into<String>>(msg: S) -> Self {
        Error::Unavailable(msg.into())
    }

    pub fn lock_failed<S: Into<String>>(msg: S) -> Self {
        Error::LockFailed(msg.into())
    }

    pub fn invalid_request<S: Into<String>>(msg: S) -> Self {
        Error::InvalidRequest(msg.into())
    }

    /// Contention detected by the store; a new attempt may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Conflict(_) | Error::Deadlock(_) | Error::Unavailable(_)
        )
    }

    /// The request can never be satisfied as written.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Error::StorageCallPrevented(_)
                | Error::LockUpgrade { .. }
                | Error::DuplicateLock(_)
                | Error::LockNotAdded(_)
                | Error::InvalidRequest(_)
        )
    }
}
