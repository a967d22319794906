// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! In-memory metadata store.
//!
//! Keeps committed rows in a single map, validates optimistic versions of
//! every row read under a read or write lock at commit, and records every
//! storage call so tests can inspect lock order. Faults can be scripted per
//! operation.

use crate::error::{Error, Result};
use crate::lock::LockKind;
use crate::lockset::LockSet;
use crate::node::{Entity, EntityKey, Node, NodeId, ROOT_ID, Variable, VariableValue};
use crate::store::{Change, Finder, MetadataStore, StoreTransaction};
use async_trait::async_trait;
use diagnostics::*;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;

/// A storage call observed by the memory store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Begin { tx: u64 },
    Acquire { tx: u64, kind: LockKind, finder: Finder },
    AcquireList { tx: u64, kind: LockKind, finder: Finder },
    Probe { tx: u64, finder: Finder },
    Commit { tx: u64, changes: usize },
    Rollback { tx: u64 },
}

/// Store operation a scripted fault is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Begin,
    Find,
    Commit,
    Rollback,
}

#[derive(Default)]
struct MemoryState {
    rows: BTreeMap<EntityKey, Entity>,
    versions: HashMap<EntityKey, u64>,
    events: Vec<StoreEvent>,
    faults: HashMap<StoreOp, VecDeque<Error>>,
    next_tx: u64,
}

impl MemoryState {
    fn take_fault(&mut self, op: StoreOp) -> Result<()> {
        match self.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn version(&self, key: &EntityKey) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    fn bump(&mut self, key: EntityKey) {
        *self.versions.entry(key).or_insert(0) += 1;
    }

    fn lookup(&self, finder: &Finder) -> Option<Entity> {
        match finder {
            Finder::NodeByNameAndParent { parent, name } => self
                .rows
                .values()
                .find(|entity| match entity {
                    Entity::Node(node) => {
                        !node.id.is_root() && node.parent_id == *parent && &node.name == name
                    }
                    _ => false,
                })
                .cloned(),
            other => other
                .entity_key()
                .and_then(|key| self.rows.get(&key).cloned()),
        }
    }

    fn lookup_list(&self, finder: &Finder) -> Vec<Entity> {
        self.rows
            .values()
            .filter(|entity| match (finder, entity) {
                (Finder::ChildrenOf(parent), Entity::Node(node)) => {
                    !node.id.is_root() && node.parent_id == *parent
                }
                (Finder::BlocksByNode(owner), Entity::Block(block)) => block.owner == *owner,
                (Finder::ReplicasByBlock(id), Entity::Replica(replica)) => {
                    replica.block == *id && !replica.under_construction
                }
                (Finder::ReplicasUnderConstructionByBlock(id), Entity::Replica(replica)) => {
                    replica.block == *id && replica.under_construction
                }
                _ => false,
            })
            .cloned()
            .collect()
    }
}

#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// A store holding only the root directory and zeroed counters.
    pub fn new() -> Self {
        let mut state = MemoryState::default();
        let mut seed = |entity: Entity| {
            _ = state.rows.insert(entity.key(), entity);
        };
        seed(Entity::Node(Node::root()));
        for (variable, value) in [
            (Variable::InodeIdCounter, ROOT_ID.as_u64()),
            (Variable::BlockIdCounter, 0),
            (Variable::GenerationStamp, 1000),
        ] {
            seed(Entity::Variable(VariableValue { variable, value }));
        }
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Writes a row directly, outside any transaction.
    pub async fn insert(&self, entity: Entity) {
        let mut state = self.state.lock().await;
        let key = entity.key();
        state.bump(key.clone());
        _ = state.rows.insert(key, entity);
    }

    pub async fn get(&self, key: &EntityKey) -> Option<Entity> {
        self.state.lock().await.rows.get(key).cloned()
    }

    /// Returns the next free node id and advances the counter.
    pub async fn allocate_node_id(&self) -> NodeId {
        let mut state = self.state.lock().await;
        let key = EntityKey::Variable(Variable::InodeIdCounter);
        let next = match state.rows.get(&key) {
            Some(Entity::Variable(var)) => var.value + 1,
            _ => ROOT_ID.as_u64() + 1,
        };
        _ = state.rows.insert(
            key,
            Entity::Variable(VariableValue {
                variable: Variable::InodeIdCounter,
                value: next,
            }),
        );
        NodeId::new(next)
    }

    /// Resolves an absolute path against committed rows, without locking.
    pub async fn node_at(&self, path: &str) -> Option<Node> {
        let names = crate::path::components(path).ok()?;
        let state = self.state.lock().await;
        let mut current = match state.rows.get(&EntityKey::Node(ROOT_ID)) {
            Some(Entity::Node(node)) => node.clone(),
            _ => return None,
        };
        for name in names {
            current = state
                .lookup(&Finder::NodeByNameAndParent {
                    parent: current.id,
                    name,
                })?
                .into_node()?;
        }
        Some(current)
    }

    /// Queues `error` to be returned by the next call of `op`.
    pub async fn inject_fault(&self, op: StoreOp, error: Error) {
        self.state
            .lock()
            .await
            .faults
            .entry(op)
            .or_default()
            .push_back(error);
    }

    pub async fn events(&self) -> Vec<StoreEvent> {
        self.state.lock().await.events.clone()
    }

    pub async fn clear_events(&self) {
        self.state.lock().await.events.clear();
    }

    /// Lock-mediated finds in call order.
    pub async fn acquisitions(&self) -> Vec<(LockKind, Finder)> {
        self.events()
            .await
            .into_iter()
            .filter_map(|event| match event {
                StoreEvent::Acquire { kind, finder, .. }
                | StoreEvent::AcquireList { kind, finder, .. } => Some((kind, finder)),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        let mut state = self.state.lock().await;
        state.take_fault(StoreOp::Begin)?;
        state.next_tx += 1;
        let tx = state.next_tx;
        state.events.push(StoreEvent::Begin { tx });
        Ok(Box::new(MemoryTransaction {
            state: self.state.clone(),
            tx,
            kind: LockKind::ReadCommitted,
            observed: HashMap::new(),
        }))
    }
}

struct MemoryTransaction {
    state: Arc<Mutex<MemoryState>>,
    tx: u64,
    kind: LockKind,
    observed: HashMap<EntityKey, u64>,
}

impl MemoryTransaction {
    fn observe(&mut self, state: &MemoryState, key: EntityKey) {
        if self.kind >= LockKind::Read {
            let version = state.version(&key);
            _ = self.observed.entry(key).or_insert(version);
        }
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    fn acquire_read_committed(&mut self) {
        self.kind = LockKind::ReadCommitted;
    }

    fn acquire_read(&mut self) {
        self.kind = LockKind::Read;
    }

    fn acquire_write(&mut self) {
        self.kind = LockKind::Write;
    }

    async fn find(&mut self, finder: &Finder) -> Result<Option<Entity>> {
        let state_handle = self.state.clone();
        let mut state = state_handle.lock().await;
        state.take_fault(StoreOp::Find)?;
        state.events.push(StoreEvent::Acquire {
            tx: self.tx,
            kind: self.kind,
            finder: finder.clone(),
        });
        let found = state.lookup(finder);
        match (&found, finder.entity_key()) {
            (Some(entity), _) => self.observe(&state, entity.key()),
            (None, Some(key)) => self.observe(&state, key),
            (None, None) => {}
        }
        Ok(found)
    }

    async fn find_list(&mut self, finder: &Finder) -> Result<Vec<Entity>> {
        let state_handle = self.state.clone();
        let mut state = state_handle.lock().await;
        state.take_fault(StoreOp::Find)?;
        state.events.push(StoreEvent::AcquireList {
            tx: self.tx,
            kind: self.kind,
            finder: finder.clone(),
        });
        let found = state.lookup_list(finder);
        for entity in &found {
            self.observe(&state, entity.key());
        }
        Ok(found)
    }

    async fn probe(&mut self, finder: &Finder) -> Result<Option<Entity>> {
        let mut state = self.state.lock().await;
        state.events.push(StoreEvent::Probe {
            tx: self.tx,
            finder: finder.clone(),
        });
        Ok(state.lookup(finder))
    }

    async fn commit(&mut self, locks: &LockSet, changes: Vec<Change>) -> Result<()> {
        let mut state = self.state.lock().await;
        state.take_fault(StoreOp::Commit)?;

        for (key, version) in &self.observed {
            if state.version(key) != *version {
                let tx = self.tx;
                let what = key.to_string();
                debug!("tx {tx} conflict on {what}");
                return Err(Error::conflict(format!("{key} changed since it was read")));
            }
        }

        let count = changes.len();
        for change in changes {
            match change {
                Change::Upsert(entity) => {
                    let key = entity.key();
                    if let Some(owner) = entity.owner_key() {
                        state.bump(owner);
                    }
                    state.bump(key.clone());
                    _ = state.rows.insert(key, entity);
                }
                Change::Remove(key) => {
                    if let Some(owner) = state.rows.remove(&key).and_then(|old| old.owner_key()) {
                        state.bump(owner);
                    }
                    state.bump(key);
                }
            }
        }

        let tx = self.tx;
        let held = locks.len();
        debug!("tx {tx} committed {count} changes holding {held} locks");
        state.events.push(StoreEvent::Commit { tx, changes: count });
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.take_fault(StoreOp::Rollback)?;
        state.events.push(StoreEvent::Rollback { tx: self.tx });
        Ok(())
    }
}
