// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Committed,
    RolledBack { retryable: bool },
}

/// Summary of one transaction attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptReport {
    pub operation: &'static str,
    pub attempt: u32,
    pub outcome: AttemptOutcome,
}

/// Runs once after every attempt, whatever its outcome. Used for deferred
/// bookkeeping such as safe-mode transitions.
pub trait PostTransactionHook: Send + Sync {
    fn after_attempt(&self, report: &AttemptReport);
}

impl<F> PostTransactionHook for F
where
    F: Fn(&AttemptReport) + Send + Sync,
{
    fn after_attempt(&self, report: &AttemptReport) {
        self(report)
    }
}
