// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Settings of the transaction engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Attempts per operation before giving up.
    pub retry_count: u32,
    /// Acquire entity locks before running each unit of work.
    pub row_level_lock: bool,
    /// Honour the process-wide lock an operation asks for.
    pub coarse_lock: bool,
    /// Server id used in log correlation ids.
    pub server_id: Option<u64>,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            retry_count: 5,
            row_level_lock: true,
            coarse_lock: false,
            server_id: None,
        }
    }
}

/// Load configuration from YAML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<TransactionConfig> {
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

    let config: TransactionConfig = serde_yaml_ng::from_str(&content)
        .with_context(|| "Failed to parse transaction configuration")?;

    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(config: &TransactionConfig) -> Result<()> {
    if config.retry_count == 0 {
        anyhow::bail!("retry_count must be greater than 0");
    }
    Ok(())
}
