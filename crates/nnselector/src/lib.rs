// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Client-side namenode selection.
//!
//! A [`NamenodeSelector`] keeps one connection per active server, hands out
//! servers by round-robin or random policy, skips blacklisted ones and
//! refreshes the membership in the background.

pub mod client;
pub mod config;
pub mod error;
pub mod handle;
pub mod selector;
pub mod server;
pub mod testing;

pub use client::{Connector, MembershipClient};
pub use config::{Policy, SelectorConfig, load_config, validate_config};
pub use error::{Result, SelectorError};
pub use handle::ServerHandle;
pub use selector::NamenodeSelector;
pub use server::{ActiveServer, ActiveServerList};
