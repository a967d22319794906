// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use crate::client::MembershipClient;
use crate::server::ActiveServer;
use diagnostics::*;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

struct Connection<C: MembershipClient> {
    address: SocketAddr,
    client: C,
}

impl<C: MembershipClient> Drop for Connection<C> {
    fn drop(&mut self) {
        self.client.close();
        let address = self.address.to_string();
        debug!("closed connection to {address}");
    }
}

/// A connected server, shared between the selector and its callers.
///
/// The descriptor of an issued handle never changes. When a refresh reports
/// a known address under a new id or hostname, the selector issues a new
/// handle over the same connection. The connection closes when the last
/// handle is dropped, so removing a server from the selector does not
/// disturb a caller still using it.
pub struct ServerHandle<C: MembershipClient> {
    server: ActiveServer,
    connection: Arc<Connection<C>>,
}

impl<C: MembershipClient> ServerHandle<C> {
    pub fn new(server: ActiveServer, client: C) -> Self {
        let connection = Arc::new(Connection {
            address: server.address(),
            client,
        });
        Self { server, connection }
    }

    /// A handle describing `server` over this handle's connection.
    pub(crate) fn redescribed(&self, server: ActiveServer) -> Self {
        Self {
            server,
            connection: Arc::clone(&self.connection),
        }
    }

    pub fn server(&self) -> &ActiveServer {
        &self.server
    }

    pub fn client(&self) -> &C {
        &self.connection.client
    }

    pub fn id(&self) -> u64 {
        self.server.id
    }

    pub fn address(&self) -> SocketAddr {
        self.server.address()
    }

    /// Whether both handles share one connection.
    pub fn same_connection(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.connection, &other.connection)
    }
}

impl<C: MembershipClient> Clone for ServerHandle<C> {
    fn clone(&self) -> Self {
        Self {
            server: self.server.clone(),
            connection: Arc::clone(&self.connection),
        }
    }
}

impl<C: MembershipClient> PartialEq for ServerHandle<C> {
    fn eq(&self, other: &Self) -> bool {
        self.server == other.server
    }
}

impl<C: MembershipClient> Eq for ServerHandle<C> {}

impl<C: MembershipClient> fmt::Debug for ServerHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandle")
            .field("server", &self.server)
            .finish()
    }
}

impl<C: MembershipClient> fmt::Display for ServerHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[RPC handle connected to {}]", self.server.address())
    }
}
