// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Seams to the cluster membership RPC.

use crate::error::Result;
use crate::server::ActiveServerList;
use async_trait::async_trait;

/// An open RPC connection to one server.
#[async_trait]
pub trait MembershipClient: Send + Sync + 'static {
    /// Asks the server for the current active-server list.
    async fn active_servers(&self) -> Result<ActiveServerList>;

    /// Releases the connection. Called exactly once per client.
    fn close(&self);
}

/// Opens connections to endpoints of the form `host:port`.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Client: MembershipClient;

    async fn connect(&self, endpoint: &str) -> Result<Self::Client>;
}
