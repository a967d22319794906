// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Namespace operations expressed as transactional units.
//!
//! Each operation declares its locks up front and then works only on rows
//! the lock phase materialised. With row-level locking disabled the same
//! code falls back to read-committed lookups.

use crate::error::{OperationError, TxError};
use crate::handler::TransactionalOperation;
use async_trait::async_trait;
use diagnostics::*;
use nslock::path;
use nslock::{
    Block, BlockId, Entity, EntityKey, Finder, Lease, LockKind, LockRequest, LockRequestSet, Node,
    NodeId, NodeLockMode, ROOT_ID, ResolvedLocks, TransactionContext, Variable, VariableValue,
};

/// Nodes of `path` from the root, shorter than the path when a component
/// is missing.
async fn chain_of(
    ctx: &mut TransactionContext,
    locks: &ResolvedLocks,
    path: &str,
) -> Result<Vec<Node>, TxError> {
    if let Some(chain) = locks.path_chain(path) {
        return Ok(chain.to_vec());
    }

    let names = path::components(path)?;
    let mut chain = Vec::with_capacity(names.len() + 1);
    match ctx.find_node(&Finder::NodeById(ROOT_ID)).await? {
        Some(root) => chain.push(root),
        None => return Ok(chain),
    }
    for name in names {
        let parent = match chain.last() {
            Some(parent) if parent.is_dir() => parent.id,
            _ => break,
        };
        match ctx
            .find_node(&Finder::NodeByNameAndParent { parent, name })
            .await?
        {
            Some(node) => chain.push(node),
            None => break,
        }
    }
    Ok(chain)
}

/// Where a path landed in the current namespace.
struct Resolution {
    target: Option<Node>,
    parent: Option<Node>,
}

async fn resolve(
    ctx: &mut TransactionContext,
    locks: &ResolvedLocks,
    path: &str,
) -> Result<Resolution, TxError> {
    let depth = path::depth(path)?;
    let chain = chain_of(ctx, locks, path).await?;
    let target = (chain.len() == depth).then(|| chain[depth - 1].clone());
    let parent = if depth >= 2 {
        chain.get(depth - 2).cloned()
    } else {
        None
    };
    Ok(Resolution { target, parent })
}

/// Resolves the directory a new entry named by `path` goes into.
fn parent_dir(path: &str, resolution: &Resolution) -> Result<Node, TxError> {
    match &resolution.parent {
        Some(parent) if parent.is_dir() => Ok(parent.clone()),
        Some(parent) => Err(OperationError::NotADirectory(parent.name.clone()).into()),
        None => {
            let parent = path::dirname(path).unwrap_or_else(|| "/".to_string());
            Err(OperationError::NotFound(parent).into())
        }
    }
}

fn leaf_name(path: &str) -> Result<String, TxError> {
    path::basename(path)
        .ok_or_else(|| OperationError::InvalidArgument(format!("{path} has no final component")).into())
}

async fn variable(ctx: &mut TransactionContext, variable: Variable) -> Result<u64, TxError> {
    ctx.find(&Finder::Variable(variable))
        .await?
        .and_then(Entity::into_variable)
        .map(|v| v.value)
        .ok_or_else(|| {
            nslock::Error::invalid_request(format!("variable {variable} is not initialised")).into()
        })
}

/// Reads a counter, stores its successor and returns the successor.
async fn next_value(ctx: &mut TransactionContext, counter: Variable) -> Result<u64, TxError> {
    let value = variable(ctx, counter).await? + 1;
    ctx.update(Entity::Variable(VariableValue {
        variable: counter,
        value,
    }));
    Ok(value)
}

async fn children(ctx: &mut TransactionContext, dir: NodeId) -> Result<Vec<Node>, TxError> {
    Ok(ctx
        .find_list(&Finder::ChildrenOf(dir))
        .await?
        .into_iter()
        .filter_map(Entity::into_node)
        .collect())
}

/// Creates a directory; its parent must exist.
#[derive(Debug, Clone)]
pub struct Mkdir {
    pub path: String,
}

impl Mkdir {
    pub fn new<S: Into<String>>(path: S) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TransactionalOperation for Mkdir {
    type Output = NodeId;

    fn name(&self) -> &'static str {
        "mkdir"
    }

    fn acquire_lock(&self) -> nslock::Result<LockRequestSet> {
        LockRequestSet::new()
            .with(LockRequest::path(NodeLockMode::WriteOnParent, &self.path))?
            .with(LockRequest::variables(
                LockKind::Write,
                [Variable::InodeIdCounter],
            ))
    }

    async fn perform_task(
        &mut self,
        ctx: &mut TransactionContext,
        locks: &ResolvedLocks,
    ) -> Result<NodeId, TxError> {
        let resolution = resolve(ctx, locks, &self.path).await?;
        if resolution.target.is_some() {
            return Err(OperationError::AlreadyExists(self.path.clone()).into());
        }
        let parent = parent_dir(&self.path, &resolution)?;
        let name = leaf_name(&self.path)?;

        let id = NodeId::new(next_value(ctx, Variable::InodeIdCounter).await?);
        ctx.add(Entity::Node(Node::directory(id, parent.id, name)));
        let path = self.path.as_str();
        let node = id.as_u64();
        debug!("mkdir {path} as node {node}");
        Ok(id)
    }
}

/// Creates an empty file and registers it under the holder's lease.
#[derive(Debug, Clone)]
pub struct CreateFile {
    pub path: String,
    pub holder: String,
}

impl CreateFile {
    pub fn new<P: Into<String>, H: Into<String>>(path: P, holder: H) -> Self {
        Self {
            path: path.into(),
            holder: holder.into(),
        }
    }
}

#[async_trait]
impl TransactionalOperation for CreateFile {
    type Output = NodeId;

    fn name(&self) -> &'static str {
        "create"
    }

    fn acquire_lock(&self) -> nslock::Result<LockRequestSet> {
        LockRequestSet::new()
            .with(LockRequest::path(NodeLockMode::WriteOnParent, &self.path))?
            .with(LockRequest::lease(LockKind::Write, &self.holder))?
            .with(LockRequest::variables(
                LockKind::Write,
                [Variable::InodeIdCounter],
            ))
    }

    async fn perform_task(
        &mut self,
        ctx: &mut TransactionContext,
        locks: &ResolvedLocks,
    ) -> Result<NodeId, TxError> {
        let resolution = resolve(ctx, locks, &self.path).await?;
        if resolution.target.is_some() {
            return Err(OperationError::AlreadyExists(self.path.clone()).into());
        }
        let parent = parent_dir(&self.path, &resolution)?;
        let name = leaf_name(&self.path)?;

        let id = NodeId::new(next_value(ctx, Variable::InodeIdCounter).await?);
        ctx.add(Entity::Node(Node::file(id, parent.id, name)));

        let mut lease = ctx
            .find(&Finder::LeaseByHolder(self.holder.clone()))
            .await?
            .and_then(Entity::into_lease)
            .unwrap_or_else(|| Lease::new(self.holder.clone()));
        _ = lease.paths.insert(self.path.clone());
        ctx.update(Entity::Lease(lease));

        let path = self.path.as_str();
        let holder = self.holder.as_str();
        debug!("created {path} for {holder}");
        Ok(id)
    }
}

/// Removes a file or an empty directory together with its blocks.
///
/// Returns `false` when nothing exists at the path.
#[derive(Debug, Clone)]
pub struct Delete {
    pub path: String,
}

impl Delete {
    pub fn new<S: Into<String>>(path: S) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TransactionalOperation for Delete {
    type Output = bool;

    fn name(&self) -> &'static str {
        "delete"
    }

    fn acquire_lock(&self) -> nslock::Result<LockRequestSet> {
        LockRequestSet::new()
            .with(LockRequest::path_and_children(
                NodeLockMode::WriteOnParent,
                &self.path,
            ))?
            .with(LockRequest::blocks_of_files(LockKind::Write))
    }

    async fn perform_task(
        &mut self,
        ctx: &mut TransactionContext,
        locks: &ResolvedLocks,
    ) -> Result<bool, TxError> {
        let resolution = resolve(ctx, locks, &self.path).await?;
        let Some(target) = resolution.target else {
            return Ok(false);
        };
        if target.id.is_root() {
            return Err(OperationError::InvalidArgument("cannot delete the root".to_string()).into());
        }

        if target.is_dir() {
            if !children(ctx, target.id).await?.is_empty() {
                return Err(OperationError::DirectoryNotEmpty(self.path.clone()).into());
            }
        } else {
            let blocks: Vec<Block> = ctx
                .find_list(&Finder::BlocksByNode(target.id))
                .await?
                .into_iter()
                .filter_map(Entity::into_block)
                .collect();
            for block in blocks {
                ctx.remove(EntityKey::Block(block.id));
            }
        }
        ctx.remove(EntityKey::Node(target.id));

        let path = self.path.as_str();
        debug!("deleted {path}");
        Ok(true)
    }
}

/// Moves a node to a new parent and name.
#[derive(Debug, Clone)]
pub struct Rename {
    pub src: String,
    pub dst: String,
}

impl Rename {
    pub fn new<S: Into<String>, D: Into<String>>(src: S, dst: D) -> Self {
        Self {
            src: src.into(),
            dst: dst.into(),
        }
    }
}

#[async_trait]
impl TransactionalOperation for Rename {
    type Output = ();

    fn name(&self) -> &'static str {
        "rename"
    }

    fn acquire_lock(&self) -> nslock::Result<LockRequestSet> {
        LockRequestSet::new().with(LockRequest::paths(
            NodeLockMode::WriteOnParent,
            [self.src.clone(), self.dst.clone()],
        ))
    }

    async fn perform_task(
        &mut self,
        ctx: &mut TransactionContext,
        locks: &ResolvedLocks,
    ) -> Result<(), TxError> {
        let src_parts = path::components(&self.src)?;
        let dst_parts = path::components(&self.dst)?;
        if src_parts.is_empty() || dst_parts.is_empty() {
            return Err(OperationError::InvalidArgument("cannot rename the root".to_string()).into());
        }
        if dst_parts.len() > src_parts.len() && dst_parts.starts_with(&src_parts) {
            return Err(OperationError::InvalidArgument(format!(
                "{} is inside {}",
                self.dst, self.src
            ))
            .into());
        }

        let source = resolve(ctx, locks, &self.src).await?;
        let Some(mut node) = source.target else {
            return Err(OperationError::NotFound(self.src.clone()).into());
        };
        if src_parts == dst_parts {
            return Ok(());
        }

        let destination = resolve(ctx, locks, &self.dst).await?;
        if destination.target.is_some() {
            return Err(OperationError::AlreadyExists(self.dst.clone()).into());
        }
        let parent = parent_dir(&self.dst, &destination)?;

        node.parent_id = parent.id;
        node.name = leaf_name(&self.dst)?;
        ctx.update(Entity::Node(node));

        let src = self.src.as_str();
        let dst = self.dst.as_str();
        debug!("renamed {src} to {dst}");
        Ok(())
    }
}

/// Appends a new block to a file the holder has open.
#[derive(Debug, Clone)]
pub struct AddBlock {
    pub path: String,
    pub holder: String,
}

impl AddBlock {
    pub fn new<P: Into<String>, H: Into<String>>(path: P, holder: H) -> Self {
        Self {
            path: path.into(),
            holder: holder.into(),
        }
    }
}

#[async_trait]
impl TransactionalOperation for AddBlock {
    type Output = Block;

    fn name(&self) -> &'static str {
        "add-block"
    }

    fn acquire_lock(&self) -> nslock::Result<LockRequestSet> {
        LockRequestSet::new()
            .with(LockRequest::path(NodeLockMode::Write, &self.path))?
            .with(LockRequest::lease(LockKind::Read, &self.holder))?
            .with(LockRequest::variables(
                LockKind::Write,
                [Variable::BlockIdCounter, Variable::GenerationStamp],
            ))
    }

    async fn perform_task(
        &mut self,
        ctx: &mut TransactionContext,
        locks: &ResolvedLocks,
    ) -> Result<Block, TxError> {
        let resolution = resolve(ctx, locks, &self.path).await?;
        let Some(mut file) = resolution.target else {
            return Err(OperationError::NotFound(self.path.clone()).into());
        };
        if !file.is_file() {
            return Err(OperationError::NotAFile(self.path.clone()).into());
        }

        let leased = ctx
            .find(&Finder::LeaseByHolder(self.holder.clone()))
            .await?
            .and_then(Entity::into_lease)
            .is_some_and(|lease| lease.paths.contains(&self.path));
        if !leased {
            return Err(OperationError::InvalidArgument(format!(
                "{} holds no lease on {}",
                self.holder, self.path
            ))
            .into());
        }

        let id = BlockId::new(next_value(ctx, Variable::BlockIdCounter).await?);
        let stamp = next_value(ctx, Variable::GenerationStamp).await?;
        let block = Block::new(id, file.id, stamp);

        file.blocks.push(id);
        ctx.update(Entity::Node(file));
        ctx.add(Entity::Block(block.clone()));

        let what = id.to_string();
        let path = self.path.as_str();
        debug!("allocated {what} with stamp {stamp} for {path}");
        Ok(block)
    }
}

/// Reads a node without modifying anything.
#[derive(Debug, Clone)]
pub struct GetFileInfo {
    pub path: String,
}

impl GetFileInfo {
    pub fn new<S: Into<String>>(path: S) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TransactionalOperation for GetFileInfo {
    type Output = Option<Node>;

    fn name(&self) -> &'static str {
        "get-file-info"
    }

    fn acquire_lock(&self) -> nslock::Result<LockRequestSet> {
        LockRequestSet::new().with(LockRequest::path(NodeLockMode::Read, &self.path))
    }

    async fn perform_task(
        &mut self,
        ctx: &mut TransactionContext,
        locks: &ResolvedLocks,
    ) -> Result<Option<Node>, TxError> {
        Ok(resolve(ctx, locks, &self.path).await?.target)
    }
}

/// Names of a directory's children, sorted.
#[derive(Debug, Clone)]
pub struct ListDirectory {
    pub path: String,
}

impl ListDirectory {
    pub fn new<S: Into<String>>(path: S) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TransactionalOperation for ListDirectory {
    type Output = Vec<String>;

    fn name(&self) -> &'static str {
        "list"
    }

    fn acquire_lock(&self) -> nslock::Result<LockRequestSet> {
        LockRequestSet::new().with(LockRequest::path_and_children(
            NodeLockMode::Read,
            &self.path,
        ))
    }

    async fn perform_task(
        &mut self,
        ctx: &mut TransactionContext,
        locks: &ResolvedLocks,
    ) -> Result<Vec<String>, TxError> {
        let Some(dir) = resolve(ctx, locks, &self.path).await?.target else {
            return Err(OperationError::NotFound(self.path.clone()).into());
        };
        if !dir.is_dir() {
            return Err(OperationError::NotADirectory(self.path.clone()).into());
        }
        let mut names: Vec<String> = children(ctx, dir.id)
            .await?
            .into_iter()
            .map(|child| child.name)
            .collect();
        names.sort();
        Ok(names)
    }
}
