// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Boundary to the backing metadata store.

use crate::error::Result;
use crate::lockset::LockSet;
use crate::node::{BlockId, Entity, EntityKey, NodeId, Variable};
use async_trait::async_trait;
use std::fmt;

/// How a row (or list of rows) is looked up.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Finder {
    NodeById(NodeId),
    NodeByNameAndParent { parent: NodeId, name: String },
    ChildrenOf(NodeId),
    BlockById(BlockId),
    BlocksByNode(NodeId),
    LeaseByHolder(String),
    ReplicasByBlock(BlockId),
    ReplicasUnderConstructionByBlock(BlockId),
    Variable(Variable),
}

impl Finder {
    /// Key of the single row this finder addresses, when known up front.
    pub fn entity_key(&self) -> Option<EntityKey> {
        match self {
            Finder::NodeById(id) => Some(EntityKey::Node(*id)),
            Finder::BlockById(id) => Some(EntityKey::Block(*id)),
            Finder::LeaseByHolder(holder) => Some(EntityKey::Lease(holder.clone())),
            Finder::Variable(var) => Some(EntityKey::Variable(*var)),
            Finder::NodeByNameAndParent { .. }
            | Finder::ChildrenOf(_)
            | Finder::BlocksByNode(_)
            | Finder::ReplicasByBlock(_)
            | Finder::ReplicasUnderConstructionByBlock(_) => None,
        }
    }
}

impl fmt::Display for Finder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Finder::NodeById(id) => write!(f, "node by id {id}"),
            Finder::NodeByNameAndParent { parent, name } => {
                write!(f, "node '{name}' under {parent}")
            }
            Finder::ChildrenOf(id) => write!(f, "children of node {id}"),
            Finder::BlockById(id) => write!(f, "block {id}"),
            Finder::BlocksByNode(id) => write!(f, "blocks of node {id}"),
            Finder::LeaseByHolder(holder) => write!(f, "lease of {holder}"),
            Finder::ReplicasByBlock(id) => write!(f, "replicas of {id}"),
            Finder::ReplicasUnderConstructionByBlock(id) => {
                write!(f, "under-construction replicas of {id}")
            }
            Finder::Variable(var) => write!(f, "variable {var}"),
        }
    }
}

/// A buffered modification applied at commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Upsert(Entity),
    Remove(EntityKey),
}

impl Change {
    pub fn key(&self) -> EntityKey {
        match self {
            Change::Upsert(entity) => entity.key(),
            Change::Remove(key) => key.clone(),
        }
    }
}

/// Opens storage transactions.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>>;
}

/// One storage transaction.
///
/// The `acquire_*` calls set the lock kind used by subsequent finds; the
/// store maps them onto its own concurrency control.
#[async_trait]
pub trait StoreTransaction: Send {
    fn acquire_read_committed(&mut self);

    fn acquire_read(&mut self);

    fn acquire_write(&mut self);

    async fn find(&mut self, finder: &Finder) -> Result<Option<Entity>>;

    async fn find_list(&mut self, finder: &Finder) -> Result<Vec<Entity>>;

    /// Snapshot lookup that takes no lock and is not part of the lock order.
    async fn probe(&mut self, finder: &Finder) -> Result<Option<Entity>>;

    async fn commit(&mut self, locks: &LockSet, changes: Vec<Change>) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;
}
