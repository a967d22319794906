// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

/// Failures raised by a unit of work's own logic.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("not a file: {0}")]
    NotAFile(String),

    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum TxError {
    #[error("metadata store error: {0}")]
    Store(#[from] nslock::Error),

    #[error("lock acquisition failed: {0}")]
    LockAcquire(#[source] nslock::Error),

    #[error(transparent)]
    Operation(#[from] OperationError),

    #[error("transaction failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: nslock::Error,
    },
}

/// What the retry loop does with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Retry,
    Abort,
}

impl TxError {
    /// Only transient store conflicts are retried. Contract violations,
    /// outright lock failures and the unit's own failures (I/O included)
    /// surface immediately.
    pub fn disposition(&self) -> Disposition {
        match self {
            TxError::Store(err) if err.is_transient() => Disposition::Retry,
            _ => Disposition::Abort,
        }
    }

    pub fn is_contract_violation(&self) -> bool {
        matches!(self, TxError::Store(err) if err.is_contract_violation())
    }
}

impl From<std::io::Error> for TxError {
    fn from(err: std::io::Error) -> Self {
        TxError::Operation(OperationError::Io(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disposition() {
        assert_eq!(
            TxError::from(nslock::Error::conflict("row moved")).disposition(),
            Disposition::Retry
        );
        assert_eq!(
            TxError::from(nslock::Error::invalid_request("bad")).disposition(),
            Disposition::Abort
        );
        assert_eq!(
            TxError::LockAcquire(nslock::Error::lock_failed("timeout")).disposition(),
            Disposition::Abort
        );
        let io = std::io::Error::other("disk");
        assert_eq!(TxError::from(io).disposition(), Disposition::Abort);
        assert_eq!(
            TxError::from(OperationError::NotFound("/x".to_string())).disposition(),
            Disposition::Abort
        );
    }

    #[test]
    fn test_display() {
        let err = TxError::RetriesExhausted {
            attempts: 3,
            last: nslock::Error::deadlock("cycle"),
        };
        assert_eq!(
            err.to_string(),
            "transaction failed after 3 attempts: deadlock detected: cycle"
        );
        let err = TxError::from(OperationError::AlreadyExists("/a".to_string()));
        assert_eq!(err.to_string(), "already exists: /a");
    }
}
