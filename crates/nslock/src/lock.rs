// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Lock kinds, entity categories and the requests a unit of work declares.

use crate::error::{Error, Result};
use crate::node::{BlockId, Node, NodeId, Variable};
use std::collections::BTreeMap;
use std::fmt;

/// Strength of a held lock. Ordered weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockKind {
    /// Snapshot read; never blocks and is never blocked.
    ReadCommitted,
    Read,
    Write,
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKind::ReadCommitted => write!(f, "read-committed"),
            LockKind::Read => write!(f, "read"),
            LockKind::Write => write!(f, "write"),
        }
    }
}

/// How a namespace path is locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeLockMode {
    ReadCommitted,
    Read,
    Write,
    /// Exclusive lock on the parent directory protecting a structural
    /// change of the leaf.
    WriteOnParent,
}

impl NodeLockMode {
    /// Kind taken when the locked node is the only one in the chain.
    pub fn requested_kind(self) -> LockKind {
        match self {
            NodeLockMode::ReadCommitted => LockKind::ReadCommitted,
            NodeLockMode::Read => LockKind::Read,
            NodeLockMode::Write | NodeLockMode::WriteOnParent => LockKind::Write,
        }
    }

    /// Kind for the node at `level` of a chain `levels` long (root is 0).
    ///
    /// Shared by the path walk and the id-chain walk so both take the same
    /// kinds in the same order.
    pub fn kind_at(self, level: usize, levels: usize, leaf_is_dir: bool) -> LockKind {
        let last = levels.saturating_sub(1);
        if level == last {
            if level == 0 {
                return self.requested_kind();
            }
            return match self {
                NodeLockMode::ReadCommitted => LockKind::ReadCommitted,
                NodeLockMode::Read => LockKind::Read,
                NodeLockMode::Write => LockKind::Write,
                NodeLockMode::WriteOnParent if leaf_is_dir => LockKind::Read,
                NodeLockMode::WriteOnParent => LockKind::Write,
            };
        }
        if self == NodeLockMode::WriteOnParent && level + 1 == last {
            return LockKind::Write;
        }
        LockKind::ReadCommitted
    }
}

/// Entity category. The declaration order is the canonical acquisition
/// order across all transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockCategory {
    Node,
    Block,
    Lease,
    Replica,
    ReplicaUnderConstruction,
    Variable,
}

impl fmt::Display for LockCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockCategory::Node => "node",
            LockCategory::Block => "block",
            LockCategory::Lease => "lease",
            LockCategory::Replica => "replica",
            LockCategory::ReplicaUnderConstruction => "replica-uc",
            LockCategory::Variable => "variable",
        };
        write!(f, "{name}")
    }
}

/// How far below each resolved target a node request reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeResolve {
    #[default]
    Path,
    /// Also lock the immediate children of targets that are directories,
    /// with the kind held on the directory.
    PathAndImmediateChildren,
}

/// Which namespace nodes a node request covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeTarget {
    /// Absolute paths, each walked from the root.
    Paths(Vec<String>),
    /// A chain already resolved elsewhere (root first), re-locked by id.
    Chain(Vec<Node>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockTarget {
    ById { block: BlockId, owner: NodeId },
    /// Every block of the files resolved by the node request.
    OfResolvedFiles,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockRequest {
    Nodes {
        mode: NodeLockMode,
        target: NodeTarget,
        resolve: NodeResolve,
    },
    Blocks { kind: LockKind, target: BlockTarget },
    Lease { kind: LockKind, holder: String },
    /// Finalized replicas of every resolved block.
    Replicas { kind: LockKind },
    /// Under-construction replicas of every resolved block.
    ReplicasUnderConstruction { kind: LockKind },
    Variables { kind: LockKind, variables: Vec<Variable> },
}

impl LockRequest {
    pub fn path<S: Into<String>>(mode: NodeLockMode, path: S) -> Self {
        Self::paths(mode, [path])
    }

    pub fn paths<I, S>(mode: NodeLockMode, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        LockRequest::Nodes {
            mode,
            target: NodeTarget::Paths(paths.into_iter().map(Into::into).collect()),
            resolve: NodeResolve::Path,
        }
    }

    /// A single path whose target, if a directory, has its children locked too.
    pub fn path_and_children<S: Into<String>>(mode: NodeLockMode, path: S) -> Self {
        LockRequest::Nodes {
            mode,
            target: NodeTarget::Paths(vec![path.into()]),
            resolve: NodeResolve::PathAndImmediateChildren,
        }
    }

    pub fn chain(mode: NodeLockMode, chain: Vec<Node>) -> Self {
        LockRequest::Nodes {
            mode,
            target: NodeTarget::Chain(chain),
            resolve: NodeResolve::Path,
        }
    }

    pub fn block(kind: LockKind, block: BlockId, owner: NodeId) -> Self {
        LockRequest::Blocks {
            kind,
            target: BlockTarget::ById { block, owner },
        }
    }

    pub fn blocks_of_files(kind: LockKind) -> Self {
        LockRequest::Blocks {
            kind,
            target: BlockTarget::OfResolvedFiles,
        }
    }

    pub fn lease<S: Into<String>>(kind: LockKind, holder: S) -> Self {
        LockRequest::Lease {
            kind,
            holder: holder.into(),
        }
    }

    pub fn variables<I: IntoIterator<Item = Variable>>(kind: LockKind, variables: I) -> Self {
        LockRequest::Variables {
            kind,
            variables: variables.into_iter().collect(),
        }
    }

    pub fn category(&self) -> LockCategory {
        match self {
            LockRequest::Nodes { .. } => LockCategory::Node,
            LockRequest::Blocks { .. } => LockCategory::Block,
            LockRequest::Lease { .. } => LockCategory::Lease,
            LockRequest::Replicas { .. } => LockCategory::Replica,
            LockRequest::ReplicasUnderConstruction { .. } => LockCategory::ReplicaUnderConstruction,
            LockRequest::Variables { .. } => LockCategory::Variable,
        }
    }
}

/// The locks a unit of work needs, at most one request per category.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockRequestSet {
    requests: BTreeMap<LockCategory, LockRequest>,
}

impl LockRequestSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, request: LockRequest) -> Result<()> {
        let category = request.category();
        if self.requests.contains_key(&category) {
            return Err(Error::DuplicateLock(category));
        }
        _ = self.requests.insert(category, request);
        Ok(())
    }

    /// Builder form of [`LockRequestSet::add`].
    pub fn with(mut self, request: LockRequest) -> Result<Self> {
        self.add(request)?;
        Ok(self)
    }

    pub fn get(&self, category: LockCategory) -> Result<&LockRequest> {
        self.requests
            .get(&category)
            .ok_or(Error::LockNotAdded(category))
    }

    pub fn contains(&self, category: LockCategory) -> bool {
        self.requests.contains_key(&category)
    }

    /// Requests in canonical acquisition order.
    pub fn iter(&self) -> impl Iterator<Item = &LockRequest> {
        self.requests.values()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Rejects combinations that can never be resolved.
    pub fn validate(&self) -> Result<()> {
        if let Some(LockRequest::Blocks {
            target: BlockTarget::OfResolvedFiles,
            ..
        }) = self.requests.get(&LockCategory::Block)
        {
            if !self.contains(LockCategory::Node) {
                return Err(Error::invalid_request(
                    "blocks of resolved files requested without a node lock",
                ));
            }
        }
        for dependent in [LockCategory::Replica, LockCategory::ReplicaUnderConstruction] {
            if self.contains(dependent) && !self.contains(LockCategory::Block) {
                return Err(Error::LockNotAdded(LockCategory::Block));
            }
        }
        if let Some(LockRequest::Nodes {
            target: NodeTarget::Chain(chain),
            ..
        }) = self.requests.get(&LockCategory::Node)
        {
            if chain.first().is_some_and(|node| !node.id.is_root()) {
                return Err(Error::invalid_request("resolved chain does not start at the root"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(mode: NodeLockMode, levels: usize, leaf_is_dir: bool) -> Vec<LockKind> {
        (0..levels)
            .map(|level| mode.kind_at(level, levels, leaf_is_dir))
            .collect()
    }

    #[test]
    fn test_lock_kind_order() {
        assert!(LockKind::ReadCommitted < LockKind::Read);
        assert!(LockKind::Read < LockKind::Write);
    }

    #[test]
    fn test_kind_at_plain_modes() {
        use LockKind::*;
        assert_eq!(kinds(NodeLockMode::Read, 4, false), vec![ReadCommitted, ReadCommitted, ReadCommitted, Read]);
        assert_eq!(kinds(NodeLockMode::Write, 3, true), vec![ReadCommitted, ReadCommitted, Write]);
        assert_eq!(
            kinds(NodeLockMode::ReadCommitted, 3, false),
            vec![ReadCommitted, ReadCommitted, ReadCommitted]
        );
    }

    #[test]
    fn test_kind_at_write_on_parent() {
        use LockKind::*;
        assert_eq!(
            kinds(NodeLockMode::WriteOnParent, 4, false),
            vec![ReadCommitted, ReadCommitted, Write, Write]
        );
        assert_eq!(
            kinds(NodeLockMode::WriteOnParent, 4, true),
            vec![ReadCommitted, ReadCommitted, Write, Read]
        );
        // Root is the designated parent.
        assert_eq!(kinds(NodeLockMode::WriteOnParent, 2, false), vec![Write, Write]);
    }

    #[test]
    fn test_kind_at_root_only() {
        assert_eq!(NodeLockMode::Read.kind_at(0, 1, true), LockKind::Read);
        assert_eq!(NodeLockMode::WriteOnParent.kind_at(0, 1, true), LockKind::Write);
        assert_eq!(
            NodeLockMode::ReadCommitted.kind_at(0, 1, true),
            LockKind::ReadCommitted
        );
    }

    #[test]
    fn test_duplicate_category_rejected() {
        let mut set = LockRequestSet::new();
        set.add(LockRequest::path(NodeLockMode::Read, "/a")).unwrap();
        let err = set
            .add(LockRequest::path(NodeLockMode::Write, "/b"))
            .unwrap_err();
        assert_eq!(err, Error::DuplicateLock(LockCategory::Node));
        assert!(err.is_contract_violation());
    }

    #[test]
    fn test_canonical_order() {
        let set = LockRequestSet::new()
            .with(LockRequest::variables(LockKind::Write, [Variable::GenerationStamp]))
            .unwrap()
            .with(LockRequest::lease(LockKind::Write, "client-1"))
            .unwrap()
            .with(LockRequest::path(NodeLockMode::Write, "/f"))
            .unwrap();
        let order: Vec<_> = set.iter().map(LockRequest::category).collect();
        assert_eq!(
            order,
            vec![LockCategory::Node, LockCategory::Lease, LockCategory::Variable]
        );
        assert_eq!(
            set.get(LockCategory::Block).unwrap_err(),
            Error::LockNotAdded(LockCategory::Block)
        );
    }

    #[test]
    fn test_validate() {
        let orphan_blocks = LockRequestSet::new()
            .with(LockRequest::blocks_of_files(LockKind::Write))
            .unwrap();
        assert!(orphan_blocks.validate().unwrap_err().is_contract_violation());

        let orphan_replicas = LockRequestSet::new()
            .with(LockRequest::Replicas {
                kind: LockKind::Read,
            })
            .unwrap();
        assert_eq!(
            orphan_replicas.validate().unwrap_err(),
            Error::LockNotAdded(LockCategory::Block)
        );

        let ok = LockRequestSet::new()
            .with(LockRequest::path(NodeLockMode::Read, "/f"))
            .unwrap()
            .with(LockRequest::blocks_of_files(LockKind::Read))
            .unwrap()
            .with(LockRequest::Replicas {
                kind: LockKind::Read,
            })
            .unwrap();
        assert!(ok.validate().is_ok());
    }
}
