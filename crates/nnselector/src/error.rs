// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

pub type Result<T> = std::result::Result<T, SelectorError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectorError {
    /// No server is currently selectable. A refresh has been requested;
    /// callers retry after a backoff.
    #[error("no alive namenode: {0}")]
    NoAliveServer(String),

    #[error("failed to connect to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("active namenode list unavailable: {0}")]
    Membership(String),

    #[error("invalid selector configuration: {0}")]
    Config(String),
}

impl SelectorError {
    pub fn connect<E: Into<String>, R: Into<String>>(endpoint: E, reason: R) -> Self {
        SelectorError::Connect {
            endpoint: endpoint.into(),
            reason: reason.into(),
        }
    }

    pub fn is_no_alive_server(&self) -> bool {
        matches!(self, SelectorError::NoAliveServer(_))
    }
}
