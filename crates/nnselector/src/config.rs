// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use anyhow::{Context, Result};
use diagnostics::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// How `next()` picks among the connected servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Policy {
    #[default]
    RoundRobin,
    Random,
}

impl From<String> for Policy {
    fn from(name: String) -> Self {
        match name.to_ascii_lowercase().replace('_', "-").as_str() {
            "round-robin" => Policy::RoundRobin,
            "random" => Policy::Random,
            _ => {
                warn!("unknown selection policy {name}, using round-robin");
                Policy::RoundRobin
            }
        }
    }
}

impl From<Policy> for String {
    fn from(policy: Policy) -> Self {
        policy.to_string()
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Policy::RoundRobin => write!(f, "round-robin"),
            Policy::Random => write!(f, "random"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    /// Period of the background refresh.
    pub refresh_period_ms: u64,
    pub policy: Policy,
    /// Well-known endpoint asked first when bootstrapping.
    pub primary: Option<String>,
    /// Static endpoints tried in order when the primary fails.
    pub candidates: Vec<String>,
    /// Seeds the random policy.
    pub random_seed: Option<u64>,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            refresh_period_ms: 60_000,
            policy: Policy::RoundRobin,
            primary: None,
            candidates: Vec::new(),
            random_seed: None,
        }
    }
}

impl SelectorConfig {
    pub fn refresh_period(&self) -> Duration {
        Duration::from_millis(self.refresh_period_ms)
    }

    /// Bootstrap endpoints in the order they are tried.
    pub fn bootstrap_endpoints(&self) -> impl Iterator<Item = &str> {
        self.primary
            .iter()
            .chain(self.candidates.iter())
            .map(String::as_str)
    }
}

/// Load configuration from YAML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<SelectorConfig> {
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

    let config: SelectorConfig = serde_yaml_ng::from_str(&content)
        .with_context(|| "Failed to parse selector configuration")?;

    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(config: &SelectorConfig) -> Result<()> {
    if config.refresh_period_ms == 0 {
        anyhow::bail!("refresh_period_ms must be greater than 0");
    }

    if config.bootstrap_endpoints().next().is_none() {
        anyhow::bail!("A primary endpoint or at least one candidate must be configured");
    }

    if config.bootstrap_endpoints().any(str::is_empty) {
        anyhow::bail!("Bootstrap endpoints cannot be empty");
    }

    Ok(())
}
