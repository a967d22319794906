// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! In-process cluster double for exercising the selector.
//!
//! Every endpoint answers the membership RPC with the cluster's current
//! member list unless it is marked down. Connections and closes are counted
//! per endpoint.

use crate::client::{Connector, MembershipClient};
use crate::error::{Result, SelectorError};
use crate::server::{ActiveServer, ActiveServerList};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct ClusterState {
    members: Vec<ActiveServer>,
    down: HashSet<String>,
    connects: HashMap<String, usize>,
    closes: HashMap<String, usize>,
}

#[derive(Clone, Default)]
pub struct MockCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl MockCluster {
    /// Endpoint that is not a member but answers membership queries.
    pub const BOOTSTRAP: &'static str = "bootstrap.cluster:8020";

    /// Server `id` listening on `127.0.0.1:(8020 + id)`.
    pub fn server(id: u64) -> ActiveServer {
        let port = u16::try_from(8020 + id).unwrap_or(u16::MAX);
        ActiveServer::new(id, format!("nn{id}"), IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    pub fn new(members: Vec<ActiveServer>) -> Self {
        let cluster = Self::default();
        cluster.set_members(members);
        cluster
    }

    /// A cluster of servers with ids `1..=count`.
    pub fn with_servers(count: u64) -> Self {
        Self::new((1..=count).map(Self::server).collect())
    }

    fn state(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_members(&self, members: Vec<ActiveServer>) {
        self.state().members = members;
    }

    /// Makes `endpoint` refuse connections and membership queries.
    pub fn set_down(&self, endpoint: &str, down: bool) {
        let mut state = self.state();
        if down {
            _ = state.down.insert(endpoint.to_string());
        } else {
            _ = state.down.remove(endpoint);
        }
    }

    pub fn connects(&self, endpoint: &str) -> usize {
        self.state().connects.get(endpoint).copied().unwrap_or(0)
    }

    pub fn closes(&self, endpoint: &str) -> usize {
        self.state().closes.get(endpoint).copied().unwrap_or(0)
    }

    /// Connections opened and not yet closed, over all endpoints.
    pub fn open_connections(&self) -> usize {
        let state = self.state();
        let opened: usize = state.connects.values().sum();
        let closed: usize = state.closes.values().sum();
        opened.saturating_sub(closed)
    }

    pub fn connector(&self) -> MockConnector {
        MockConnector {
            cluster: self.clone(),
        }
    }
}

pub struct MockConnector {
    cluster: MockCluster,
}

#[async_trait]
impl Connector for MockConnector {
    type Client = MockClient;

    async fn connect(&self, endpoint: &str) -> Result<MockClient> {
        let mut state = self.cluster.state();
        if state.down.contains(endpoint) {
            return Err(SelectorError::connect(endpoint, "connection refused"));
        }
        *state.connects.entry(endpoint.to_string()).or_insert(0) += 1;
        Ok(MockClient {
            endpoint: endpoint.to_string(),
            cluster: self.cluster.clone(),
        })
    }
}

pub struct MockClient {
    endpoint: String,
    cluster: MockCluster,
}

impl MockClient {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl MembershipClient for MockClient {
    async fn active_servers(&self) -> Result<ActiveServerList> {
        let state = self.cluster.state();
        if state.down.contains(&self.endpoint) {
            return Err(SelectorError::Membership(format!(
                "{} is unreachable",
                self.endpoint
            )));
        }
        Ok(ActiveServerList::new(state.members.clone()))
    }

    fn close(&self) {
        *self
            .cluster
            .state()
            .closes
            .entry(self.endpoint.clone())
            .or_insert(0) += 1;
    }
}
