// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};

/// A metadata server currently eligible to serve clients.
///
/// Two descriptors are the same server when they share an RPC address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveServer {
    pub id: u64,
    pub hostname: String,
    pub ip: IpAddr,
    pub port: u16,
}

impl ActiveServer {
    pub fn new<S: Into<String>>(id: u64, hostname: S, ip: IpAddr, port: u16) -> Self {
        Self {
            id,
            hostname: hostname.into(),
            ip,
            port,
        }
    }

    pub fn address(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Endpoint string handed to the connector.
    pub fn endpoint(&self) -> String {
        self.address().to_string()
    }
}

impl PartialEq for ActiveServer {
    fn eq(&self, other: &Self) -> bool {
        self.address() == other.address()
    }
}

impl Eq for ActiveServer {}

impl Hash for ActiveServer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address().hash(state);
    }
}

impl fmt::Display for ActiveServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{} ({})", self.hostname, self.id, self.address())
    }
}

/// Cluster membership as reported by any active server, ordered by id.
/// The lowest id is the leader.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<ActiveServer>", into = "Vec<ActiveServer>")]
pub struct ActiveServerList {
    servers: Vec<ActiveServer>,
}

impl ActiveServerList {
    pub fn new(mut servers: Vec<ActiveServer>) -> Self {
        let mut seen = HashSet::new();
        servers.retain(|server| seen.insert(server.address()));
        servers.sort_by_key(|server| server.id);
        Self { servers }
    }

    pub fn servers(&self) -> &[ActiveServer] {
        &self.servers
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ActiveServer> {
        self.servers.iter()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn leader(&self) -> Option<&ActiveServer> {
        self.servers.first()
    }

    pub fn find(&self, address: SocketAddr) -> Option<&ActiveServer> {
        self.servers.iter().find(|server| server.address() == address)
    }

    pub fn contains(&self, address: SocketAddr) -> bool {
        self.find(address).is_some()
    }
}

impl From<Vec<ActiveServer>> for ActiveServerList {
    fn from(servers: Vec<ActiveServer>) -> Self {
        Self::new(servers)
    }
}

impl From<ActiveServerList> for Vec<ActiveServer> {
    fn from(list: ActiveServerList) -> Self {
        list.servers
    }
}

impl<'a> IntoIterator for &'a ActiveServerList {
    type Item = &'a ActiveServer;
    type IntoIter = std::slice::Iter<'a, ActiveServer>;

    fn into_iter(self) -> Self::IntoIter {
        self.servers.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn server(id: u64, port: u16) -> ActiveServer {
        ActiveServer::new(id, format!("nn{id}"), IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[test]
    fn test_list_is_sorted_by_id() {
        let list = ActiveServerList::new(vec![server(3, 8023), server(1, 8021), server(2, 8022)]);
        let ids: Vec<u64> = list.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(list.leader().map(|s| s.id), Some(1));
    }

    #[test]
    fn test_identity_is_the_address() {
        let mut renumbered = server(9, 8021);
        renumbered.hostname = "other".to_string();
        assert_eq!(renumbered, server(1, 8021));
        assert_ne!(server(1, 8021), server(1, 8022));

        let list = ActiveServerList::new(vec![server(1, 8021)]);
        assert!(list.contains(renumbered.address()));
        assert_eq!(server(1, 8021).endpoint(), "127.0.0.1:8021");
    }

    #[test]
    fn test_decode_membership_response() {
        let json = r#"[
            {"id": 2, "hostname": "nn2", "ip": "10.0.0.2", "port": 8020},
            {"id": 1, "hostname": "nn1", "ip": "10.0.0.1", "port": 8020}
        ]"#;
        let list: ActiveServerList = serde_json::from_str(json).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list.leader().map(|s| s.hostname.as_str()), Some("nn1"));
        assert_eq!(list.find("10.0.0.2:8020".parse().unwrap()).map(|s| s.id), Some(2));
    }
}
