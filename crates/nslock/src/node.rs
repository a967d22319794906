// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Metadata entities as seen by the locking layer.
//!
//! Only the fields the lock acquirer and the reference operations need are
//! modelled here; the backing store may keep richer rows.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

pub const ROOT_ID: NodeId = NodeId(0);

/// Identifier of a namespace node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(u64);

impl NodeId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn is_root(self) -> bool {
        self == ROOT_ID
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(u64);

impl BlockId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "blk_{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Directory,
    File,
    Symlink,
}

/// A directory-tree entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    /// Parent id; the root is its own parent.
    pub parent_id: NodeId,
    pub name: String,
    pub kind: NodeKind,
    /// Block references, in file order. Always empty for directories.
    pub blocks: Vec<BlockId>,
}

impl Node {
    pub fn root() -> Self {
        Self::directory(ROOT_ID, ROOT_ID, "")
    }

    pub fn directory<S: Into<String>>(id: NodeId, parent_id: NodeId, name: S) -> Self {
        Self {
            id,
            parent_id,
            name: name.into(),
            kind: NodeKind::Directory,
            blocks: Vec::new(),
        }
    }

    pub fn file<S: Into<String>>(id: NodeId, parent_id: NodeId, name: S) -> Self {
        Self {
            id,
            parent_id,
            name: name.into(),
            kind: NodeKind::File,
            blocks: Vec::new(),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == NodeKind::File
    }
}

/// Block metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    pub owner: NodeId,
    pub generation_stamp: u64,
    pub num_bytes: u64,
    /// Stand-in for a requested block the store does not know.
    pub placeholder: bool,
}

impl Block {
    pub fn new(id: BlockId, owner: NodeId, generation_stamp: u64) -> Self {
        Self {
            id,
            owner,
            generation_stamp,
            num_bytes: 0,
            placeholder: false,
        }
    }

    pub fn placeholder(id: BlockId, owner: NodeId) -> Self {
        Self {
            id,
            owner,
            generation_stamp: 0,
            num_bytes: 0,
            placeholder: true,
        }
    }
}

/// A client's write lease over a set of open files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub holder: String,
    pub paths: BTreeSet<String>,
}

impl Lease {
    pub fn new<S: Into<String>>(holder: S) -> Self {
        Self {
            holder: holder.into(),
            paths: BTreeSet::new(),
        }
    }
}

/// A block copy on one storage, finalized or still being written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replica {
    pub block: BlockId,
    pub storage_id: String,
    pub under_construction: bool,
}

/// Cluster-wide counters and keys kept as single rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Variable {
    GenerationStamp,
    InodeIdCounter,
    BlockIdCounter,
    BlockTokenKey(u32),
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variable::GenerationStamp => write!(f, "generation-stamp"),
            Variable::InodeIdCounter => write!(f, "inode-id-counter"),
            Variable::BlockIdCounter => write!(f, "block-id-counter"),
            Variable::BlockTokenKey(id) => write!(f, "block-token-key-{id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableValue {
    pub variable: Variable,
    pub value: u64,
}

/// Any row the locking layer can fetch or write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Entity {
    Node(Node),
    Block(Block),
    Lease(Lease),
    Replica(Replica),
    Variable(VariableValue),
}

impl Entity {
    pub fn key(&self) -> EntityKey {
        match self {
            Entity::Node(node) => EntityKey::Node(node.id),
            Entity::Block(block) => EntityKey::Block(block.id),
            Entity::Lease(lease) => EntityKey::Lease(lease.holder.clone()),
            Entity::Replica(replica) if replica.under_construction => {
                EntityKey::ReplicaUnderConstruction(replica.block, replica.storage_id.clone())
            }
            Entity::Replica(replica) => EntityKey::Replica(replica.block, replica.storage_id.clone()),
            Entity::Variable(var) => EntityKey::Variable(var.variable),
        }
    }

    /// The entity whose write lock protects creating this one.
    ///
    /// `None` for rows that exist independently (leases, variables).
    pub fn owner_key(&self) -> Option<EntityKey> {
        match self {
            Entity::Node(node) if node.id.is_root() => None,
            Entity::Node(node) => Some(EntityKey::Node(node.parent_id)),
            Entity::Block(block) => Some(EntityKey::Node(block.owner)),
            Entity::Replica(replica) => Some(EntityKey::Block(replica.block)),
            Entity::Lease(_) | Entity::Variable(_) => None,
        }
    }

    pub fn as_node(&self) -> Option<&Node> {
        match self {
            Entity::Node(node) => Some(node),
            _ => None,
        }
    }

    pub fn into_node(self) -> Option<Node> {
        match self {
            Entity::Node(node) => Some(node),
            _ => None,
        }
    }

    pub fn into_block(self) -> Option<Block> {
        match self {
            Entity::Block(block) => Some(block),
            _ => None,
        }
    }

    pub fn into_lease(self) -> Option<Lease> {
        match self {
            Entity::Lease(lease) => Some(lease),
            _ => None,
        }
    }

    pub fn into_replica(self) -> Option<Replica> {
        match self {
            Entity::Replica(replica) => Some(replica),
            _ => None,
        }
    }

    pub fn into_variable(self) -> Option<VariableValue> {
        match self {
            Entity::Variable(var) => Some(var),
            _ => None,
        }
    }
}

/// Identity of a lockable row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityKey {
    Node(NodeId),
    Block(BlockId),
    Lease(String),
    Replica(BlockId, String),
    ReplicaUnderConstruction(BlockId, String),
    Variable(Variable),
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKey::Node(id) => write!(f, "node {id}"),
            EntityKey::Block(id) => write!(f, "block {id}"),
            EntityKey::Lease(holder) => write!(f, "lease {holder}"),
            EntityKey::Replica(block, storage) => write!(f, "replica {block}@{storage}"),
            EntityKey::ReplicaUnderConstruction(block, storage) => {
                write!(f, "replica-uc {block}@{storage}")
            }
            EntityKey::Variable(var) => write!(f, "variable {var}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_keys() {
        let file = Entity::Node(Node::file(NodeId::new(4), NodeId::new(2), "f"));
        assert_eq!(file.key(), EntityKey::Node(NodeId::new(4)));
        assert_eq!(file.owner_key(), Some(EntityKey::Node(NodeId::new(2))));

        let root = Entity::Node(Node::root());
        assert_eq!(root.owner_key(), None);

        let uc = Entity::Replica(Replica {
            block: BlockId::new(9),
            storage_id: "ds-1".to_string(),
            under_construction: true,
        });
        assert_eq!(
            uc.key(),
            EntityKey::ReplicaUnderConstruction(BlockId::new(9), "ds-1".to_string())
        );
        assert_eq!(uc.owner_key(), Some(EntityKey::Block(BlockId::new(9))));
    }

    #[test]
    fn test_display() {
        assert_eq!(EntityKey::Block(BlockId::new(3)).to_string(), "block blk_3");
        assert_eq!(
            EntityKey::Variable(Variable::BlockTokenKey(2)).to_string(),
            "variable block-token-key-2"
        );
    }
}
