// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Hierarchical lock acquisition.
//!
//! Requests are taken in category order, and namespace nodes strictly from
//! the root towards the leaf, so concurrent transactions on different
//! servers acquire conflicting locks in one global order.

use crate::context::TransactionContext;
use crate::error::Result;
use crate::lock::{
    BlockTarget, LockKind, LockRequest, LockRequestSet, NodeLockMode, NodeResolve, NodeTarget,
};
use crate::node::{
    Block, BlockId, Entity, EntityKey, Lease, Node, NodeId, ROOT_ID, Replica, Variable,
    VariableValue,
};
use crate::path;
use crate::store::Finder;
use diagnostics::*;
use std::collections::{BTreeMap, HashMap};

/// Everything materialised while acquiring a [`LockRequestSet`].
#[derive(Debug, Clone, Default)]
pub struct ResolvedLocks {
    paths: BTreeMap<String, Vec<Node>>,
    chain: Vec<Node>,
    children: BTreeMap<NodeId, Vec<Node>>,
    pub blocks: Vec<Block>,
    pub leases: Vec<Lease>,
    pub replicas: Vec<Replica>,
    pub replicas_under_construction: Vec<Replica>,
    pub variables: Vec<VariableValue>,
}

impl ResolvedLocks {
    /// Nodes resolved for `path`, root first. Shorter than the path's depth
    /// when a component is missing.
    pub fn path_chain(&self, path: &str) -> Option<&[Node]> {
        self.paths.get(path).map(Vec::as_slice)
    }

    /// Nodes re-locked from a pre-resolved chain.
    pub fn id_chain(&self) -> &[Node] {
        &self.chain
    }

    pub fn is_fully_resolved(&self, path: &str) -> bool {
        match (self.paths.get(path), path::depth(path)) {
            (Some(chain), Ok(depth)) => chain.len() == depth,
            _ => false,
        }
    }

    /// The node `path` names, if every component resolved.
    pub fn target(&self, path: &str) -> Option<&Node> {
        if self.is_fully_resolved(path) {
            self.paths.get(path).and_then(|chain| chain.last())
        } else {
            None
        }
    }

    /// The parent directory of `path`, if resolution reached it.
    pub fn parent(&self, path: &str) -> Option<&Node> {
        let depth = path::depth(path).ok()?;
        if depth < 2 {
            return None;
        }
        self.paths.get(path)?.get(depth - 2)
    }

    /// Children locked under a directory target, when requested.
    pub fn children_of(&self, dir: NodeId) -> Option<&[Node]> {
        self.children.get(&dir).map(Vec::as_slice)
    }

    pub fn variable(&self, variable: Variable) -> Option<u64> {
        self.variables
            .iter()
            .find(|v| v.variable == variable)
            .map(|v| v.value)
    }

    /// Ids of fully resolved leaves that are files, in ascending order.
    fn resolved_files(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .paths
            .iter()
            .filter_map(|(path, _)| self.target(path))
            .chain(self.chain.last())
            .filter(|node| node.is_file())
            .map(|node| node.id)
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

/// Positions named by a multi-path request, with the strongest kind any of
/// the paths wants at each one.
#[derive(Debug, Default)]
struct PathTree {
    kind: Option<LockKind>,
    /// Leaf of a write-on-parent path; its kind depends on the node type.
    typed_leaf: bool,
    children: BTreeMap<String, PathTree>,
}

impl PathTree {
    fn insert(&mut self, mode: NodeLockMode, names: &[String]) {
        let levels = names.len() + 1;
        let mut position = self;
        position.want(mode.kind_at(0, levels, false));
        for (offset, name) in names.iter().enumerate() {
            let level = offset + 1;
            position = position.children.entry(name.clone()).or_default();
            if level + 1 == levels && mode == NodeLockMode::WriteOnParent {
                position.typed_leaf = true;
            } else {
                position.want(mode.kind_at(level, levels, false));
            }
        }
    }

    fn want(&mut self, kind: LockKind) {
        self.kind = self.kind.max(Some(kind));
    }
}

pub struct LockAcquirer<'a> {
    ctx: &'a mut TransactionContext,
}

impl<'a> LockAcquirer<'a> {
    pub fn new(ctx: &'a mut TransactionContext) -> Self {
        Self { ctx }
    }

    /// Acquires every request in canonical category order.
    pub async fn acquire(&mut self, requests: &LockRequestSet) -> Result<ResolvedLocks> {
        requests.validate()?;
        let mut resolved = ResolvedLocks::default();

        for request in requests.iter() {
            match request {
                LockRequest::Nodes {
                    mode,
                    target: NodeTarget::Paths(paths),
                    resolve,
                } => {
                    let chains = self.lock_paths(*mode, paths).await?;
                    resolved.paths.extend(chains);
                    if *resolve == NodeResolve::PathAndImmediateChildren {
                        self.lock_children(&mut resolved).await?;
                    }
                }
                LockRequest::Nodes {
                    mode,
                    target: NodeTarget::Chain(chain),
                    ..
                } => {
                    resolved.chain = self.lock_chain(*mode, chain).await?;
                }
                LockRequest::Blocks { kind, target } => {
                    resolved.blocks = self.lock_blocks(*kind, target, &resolved).await?;
                }
                LockRequest::Lease { kind, holder } => {
                    let finder = Finder::LeaseByHolder(holder.clone());
                    if let Some(lease) = self
                        .ctx
                        .lock_find(*kind, &finder)
                        .await?
                        .and_then(Entity::into_lease)
                    {
                        resolved.leases.push(lease);
                    }
                }
                LockRequest::Replicas { kind } => {
                    resolved.replicas = self
                        .lock_replicas(*kind, &resolved.blocks, Finder::ReplicasByBlock)
                        .await?;
                }
                LockRequest::ReplicasUnderConstruction { kind } => {
                    resolved.replicas_under_construction = self
                        .lock_replicas(
                            *kind,
                            &resolved.blocks,
                            Finder::ReplicasUnderConstructionByBlock,
                        )
                        .await?;
                }
                LockRequest::Variables { kind, variables } => {
                    let mut sorted = variables.clone();
                    sorted.sort();
                    sorted.dedup();
                    for variable in sorted {
                        if let Some(value) = self
                            .ctx
                            .lock_find(*kind, &Finder::Variable(variable))
                            .await?
                            .and_then(Entity::into_variable)
                        {
                            resolved.variables.push(value);
                        }
                    }
                }
            }
        }
        Ok(resolved)
    }

    /// Walks `path` from the root, locking each component.
    ///
    /// Returns the nodes that exist, root first; a missing component ends
    /// the walk without error.
    pub async fn lock_path(&mut self, mode: NodeLockMode, path: &str) -> Result<Vec<Node>> {
        let mut chains = self.lock_paths(mode, &[path.to_string()]).await?;
        Ok(chains.remove(path).unwrap_or_default())
    }

    /// Locks several paths as one tree walk.
    ///
    /// The strongest kind any path wants at a position is settled before
    /// the first storage call, then the merged tree is walked depth first
    /// in name order. Every node is locked once and always after its
    /// parent, so no ancestor is upgraded once a descendant is held.
    pub async fn lock_paths(
        &mut self,
        mode: NodeLockMode,
        paths: &[String],
    ) -> Result<BTreeMap<String, Vec<Node>>> {
        let mut tree = PathTree::default();
        let mut parsed = Vec::with_capacity(paths.len());
        for path in paths {
            let names = path::components(path)?;
            tree.insert(mode, &names);
            parsed.push((path.as_str(), names));
        }

        let mut locked: HashMap<Vec<String>, Node> = HashMap::new();
        let mut pending: Vec<(Vec<String>, &PathTree)> = vec![(Vec::new(), &tree)];
        while let Some((prefix, position)) = pending.pop() {
            let finder = match prefix.split_last() {
                None => Finder::NodeById(ROOT_ID),
                Some((name, parent)) => {
                    let Some(parent) = locked.get(parent) else {
                        continue;
                    };
                    Finder::NodeByNameAndParent {
                        parent: parent.id,
                        name: name.clone(),
                    }
                }
            };

            let mut kind = position.kind;
            if position.typed_leaf && kind < Some(LockKind::Write) {
                // The parent is write locked, so the leaf cannot appear,
                // vanish or change type before it is locked below.
                let Some(leaf) = self.ctx.probe(&finder).await?.and_then(Entity::into_node) else {
                    continue;
                };
                let level = prefix.len();
                kind = kind.max(Some(mode.kind_at(level, level + 1, leaf.is_dir())));
            }
            let Some(kind) = kind else {
                continue;
            };
            let Some(node) = self.ctx.lock_node(kind, &finder).await? else {
                continue;
            };

            if node.is_dir() {
                for (name, child) in position.children.iter().rev() {
                    let mut below = prefix.clone();
                    below.push(name.clone());
                    pending.push((below, child));
                }
            } else if let Some(component) = position.children.keys().next() {
                let id = node.id.as_u64();
                let component = component.as_str();
                debug!("resolution stops before {component}: node {id} is not a directory");
            }
            _ = locked.insert(prefix, node);
        }

        let mut chains = BTreeMap::new();
        for (path, names) in parsed {
            let levels = names.len() + 1;
            let mut chain: Vec<Node> = Vec::with_capacity(levels);
            for len in 0..levels {
                match locked.get(&names[..len]) {
                    Some(node) => chain.push(node.clone()),
                    None => break,
                }
            }
            let resolved = chain.len();
            debug!("resolved {resolved} of {levels} levels for {path}");
            _ = chains.insert(path.to_string(), chain);
        }
        Ok(chains)
    }

    /// Re-locks a chain resolved elsewhere, by id, with the same kinds the
    /// path walk would take. Stops at the first node that vanished or moved.
    pub async fn lock_chain(&mut self, mode: NodeLockMode, expected: &[Node]) -> Result<Vec<Node>> {
        let levels = expected.len();
        let leaf_is_dir = expected.last().is_some_and(Node::is_dir);
        let mut chain: Vec<Node> = Vec::with_capacity(levels);

        for (level, wanted) in expected.iter().enumerate() {
            let kind = mode.kind_at(level, levels, leaf_is_dir);
            let Some(node) = self.ctx.lock_node(kind, &Finder::NodeById(wanted.id)).await? else {
                let id = wanted.id.as_u64();
                debug!("cached node {id} no longer exists");
                break;
            };
            let moved = match chain.last() {
                Some(parent) => node.parent_id != parent.id || node.name != wanted.name,
                None => !node.id.is_root(),
            };
            if moved {
                let id = node.id.as_u64();
                debug!("cached node {id} moved since it was resolved");
                break;
            }
            chain.push(node);
        }
        Ok(chain)
    }

    /// Locks the children of every fully resolved directory target with the
    /// kind held on that directory.
    async fn lock_children(&mut self, resolved: &mut ResolvedLocks) -> Result<()> {
        let mut dirs: Vec<NodeId> = resolved
            .paths
            .keys()
            .filter_map(|path| resolved.target(path))
            .filter(|node| node.is_dir())
            .map(|node| node.id)
            .collect();
        dirs.sort();
        dirs.dedup();

        for dir in dirs {
            let kind = self
                .ctx
                .lock_set()
                .kind_of(&EntityKey::Node(dir))
                .unwrap_or(LockKind::ReadCommitted);
            let children = self
                .ctx
                .lock_find_list(kind, &Finder::ChildrenOf(dir))
                .await?
                .into_iter()
                .filter_map(Entity::into_node)
                .collect();
            _ = resolved.children.insert(dir, children);
        }
        Ok(())
    }

    async fn lock_blocks(
        &mut self,
        kind: LockKind,
        target: &BlockTarget,
        resolved: &ResolvedLocks,
    ) -> Result<Vec<Block>> {
        match target {
            BlockTarget::ById { block, owner } => {
                let found = self
                    .ctx
                    .lock_find(kind, &Finder::BlockById(*block))
                    .await?
                    .and_then(Entity::into_block);
                Ok(vec![found.unwrap_or_else(|| Block::placeholder(*block, *owner))])
            }
            BlockTarget::OfResolvedFiles => {
                let mut blocks = Vec::new();
                for file in resolved.resolved_files() {
                    let found = self
                        .ctx
                        .lock_find_list(kind, &Finder::BlocksByNode(file))
                        .await?;
                    blocks.extend(found.into_iter().filter_map(Entity::into_block));
                }
                Ok(blocks)
            }
        }
    }

    async fn lock_replicas(
        &mut self,
        kind: LockKind,
        blocks: &[Block],
        finder: fn(BlockId) -> Finder,
    ) -> Result<Vec<Replica>> {
        let mut ids: Vec<_> = blocks
            .iter()
            .filter(|block| !block.placeholder)
            .map(|block| block.id)
            .collect();
        ids.sort();
        ids.dedup();

        let mut replicas = Vec::new();
        for id in ids {
            let found = self.ctx.lock_find_list(kind, &finder(id)).await?;
            replicas.extend(found.into_iter().filter_map(Entity::into_replica));
        }
        Ok(replicas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockCategory;
    use crate::memory::MemoryStore;
    use crate::store::MetadataStore;
    use crate::testing::{add_block, tree};

    async fn context(store: &MemoryStore) -> TransactionContext {
        TransactionContext::new(store.begin().await.unwrap())
    }

    #[tokio::test]
    async fn test_missing_component_returns_partial_chain() {
        let store = tree(&["/a/b/"]).await;
        let mut ctx = context(&store).await;
        let requests = LockRequestSet::new()
            .with(LockRequest::path(NodeLockMode::Read, "/a/b/c/d"))
            .unwrap();

        let resolved = LockAcquirer::new(&mut ctx).acquire(&requests).await.unwrap();
        let chain = resolved.path_chain("/a/b/c/d").unwrap();
        assert_eq!(chain.len(), 3);
        assert!(!resolved.is_fully_resolved("/a/b/c/d"));
        assert!(resolved.target("/a/b/c/d").is_none());
    }

    #[tokio::test]
    async fn test_write_on_parent_for_new_leaf() {
        let store = tree(&["/a/"]).await;
        let mut ctx = context(&store).await;
        let chain = LockAcquirer::new(&mut ctx)
            .lock_path(NodeLockMode::WriteOnParent, "/a/new")
            .await
            .unwrap();

        assert_eq!(chain.len(), 2);
        let a = store.node_at("/a").await.unwrap();
        assert_eq!(
            ctx.lock_set().kind_of(&EntityKey::Node(a.id)),
            Some(LockKind::Write)
        );
        let kinds: Vec<_> = store.acquisitions().await.into_iter().map(|(k, _)| k).collect();
        assert_eq!(kinds, vec![LockKind::ReadCommitted, LockKind::Write]);
    }

    #[tokio::test]
    async fn test_root_as_final_component() {
        let store = MemoryStore::new();
        let mut ctx = context(&store).await;
        let chain = LockAcquirer::new(&mut ctx)
            .lock_path(NodeLockMode::Write, "/")
            .await
            .unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(
            store.acquisitions().await,
            vec![(LockKind::Write, Finder::NodeById(ROOT_ID))]
        );
    }

    #[tokio::test]
    async fn test_file_in_the_middle_stops_walk() {
        let store = tree(&["/a/f"]).await;
        let mut ctx = context(&store).await;
        let chain = LockAcquirer::new(&mut ctx)
            .lock_path(NodeLockMode::Read, "/a/f/g")
            .await
            .unwrap();
        assert_eq!(chain.len(), 3);
        assert_eq!(store.acquisitions().await.len(), 3);
    }

    #[tokio::test]
    async fn test_missing_block_yields_placeholder() {
        let store = tree(&["/f"]).await;
        let f = store.node_at("/f").await.unwrap();
        let mut ctx = context(&store).await;
        let requests = LockRequestSet::new()
            .with(LockRequest::path(NodeLockMode::Write, "/f"))
            .unwrap()
            .with(LockRequest::block(LockKind::Write, BlockId::new(99), f.id))
            .unwrap();

        let resolved = LockAcquirer::new(&mut ctx).acquire(&requests).await.unwrap();
        assert_eq!(resolved.blocks.len(), 1);
        assert!(resolved.blocks[0].placeholder);
        assert_eq!(resolved.blocks[0].owner, f.id);
    }

    #[tokio::test]
    async fn test_blocks_and_replicas_of_resolved_files() {
        let store = tree(&["/f"]).await;
        let b1 = add_block(&store, "/f", 1).await.unwrap();
        _ = add_block(&store, "/f", 2).await.unwrap();
        store
            .insert(Entity::Replica(Replica {
                block: b1.id,
                storage_id: "ds-1".to_string(),
                under_construction: false,
            }))
            .await;
        store
            .insert(Entity::Replica(Replica {
                block: b1.id,
                storage_id: "ds-2".to_string(),
                under_construction: true,
            }))
            .await;

        let mut ctx = context(&store).await;
        let requests = LockRequestSet::new()
            .with(LockRequest::path(NodeLockMode::Read, "/f"))
            .unwrap()
            .with(LockRequest::blocks_of_files(LockKind::Write))
            .unwrap()
            .with(LockRequest::Replicas {
                kind: LockKind::Read,
            })
            .unwrap()
            .with(LockRequest::ReplicasUnderConstruction {
                kind: LockKind::Read,
            })
            .unwrap();

        let resolved = LockAcquirer::new(&mut ctx).acquire(&requests).await.unwrap();
        assert_eq!(resolved.blocks.len(), 2);
        assert_eq!(resolved.replicas.len(), 1);
        assert_eq!(resolved.replicas[0].storage_id, "ds-1");
        assert_eq!(resolved.replicas_under_construction.len(), 1);
        assert_eq!(
            ctx.lock_set().kind_of(&EntityKey::Block(b1.id)),
            Some(LockKind::Write)
        );
    }

    #[tokio::test]
    async fn test_invalid_combination_is_contract_failure() {
        let store = MemoryStore::new();
        let mut ctx = context(&store).await;
        let requests = LockRequestSet::new()
            .with(LockRequest::Replicas {
                kind: LockKind::Read,
            })
            .unwrap();
        let err = LockAcquirer::new(&mut ctx)
            .acquire(&requests)
            .await
            .unwrap_err();
        assert_eq!(err, crate::Error::LockNotAdded(LockCategory::Block));
        assert!(store.acquisitions().await.is_empty());
    }

    #[tokio::test]
    async fn test_children_locked_with_directory_kind() {
        let store = tree(&["/d/x", "/d/y/", "/e"]).await;
        let d = store.node_at("/d").await.unwrap();
        let mut ctx = context(&store).await;
        let requests = LockRequestSet::new()
            .with(LockRequest::path_and_children(NodeLockMode::Write, "/d"))
            .unwrap();

        let resolved = LockAcquirer::new(&mut ctx).acquire(&requests).await.unwrap();
        let names: Vec<_> = resolved
            .children_of(d.id)
            .unwrap()
            .iter()
            .map(|n| n.name.clone())
            .collect();
        assert_eq!(names, vec!["x", "y"]);
        let (kind, finder) = store.acquisitions().await.pop().unwrap();
        assert_eq!(kind, LockKind::Write);
        assert_eq!(finder, Finder::ChildrenOf(d.id));
    }

    #[tokio::test]
    async fn test_variables_and_lease() {
        let store = MemoryStore::new();
        let mut lease = Lease::new("client-7");
        _ = lease.paths.insert("/f".to_string());
        store.insert(Entity::Lease(lease)).await;

        let mut ctx = context(&store).await;
        let requests = LockRequestSet::new()
            .with(LockRequest::lease(LockKind::Write, "client-7"))
            .unwrap()
            .with(LockRequest::variables(
                LockKind::Write,
                [Variable::GenerationStamp, Variable::BlockIdCounter],
            ))
            .unwrap();
        let resolved = LockAcquirer::new(&mut ctx).acquire(&requests).await.unwrap();

        assert_eq!(resolved.leases.len(), 1);
        assert_eq!(resolved.variable(Variable::GenerationStamp), Some(1000));
        assert_eq!(resolved.variable(Variable::BlockIdCounter), Some(0));
        // Variables follow their declaration order, not request order.
        let finders: Vec<_> = store.acquisitions().await.into_iter().map(|(_, f)| f).collect();
        assert_eq!(
            finders,
            vec![
                Finder::LeaseByHolder("client-7".to_string()),
                Finder::Variable(Variable::GenerationStamp),
                Finder::Variable(Variable::BlockIdCounter),
            ]
        );
    }
}
