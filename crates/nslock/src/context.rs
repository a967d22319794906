// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Transaction-scoped entity cache in front of a [`StoreTransaction`].
//!
//! The lock acquirer fills the cache through lock-mediated finds. Once the
//! lock phase is sealed with [`TransactionContext::prevent_storage_call`],
//! the unit of work can only see rows that were materialised by locking,
//! and every change it buffers must be covered by a write lock at commit:
//! on the row itself, or on its owner (old and new owner for a move).

use crate::error::{Error, Result};
use crate::lock::LockKind;
use crate::lockset::LockSet;
use crate::node::{Entity, EntityKey, Node};
use crate::store::{Change, Finder, StoreTransaction};
use diagnostics::*;
use std::collections::HashMap;

pub struct TransactionContext {
    tx: Box<dyn StoreTransaction>,
    locks: LockSet,
    rows: HashMap<EntityKey, Entity>,
    singles: HashMap<Finder, Option<EntityKey>>,
    lists: HashMap<Finder, Vec<EntityKey>>,
    /// Owner of every row as first read from the store.
    origins: HashMap<EntityKey, Option<EntityKey>>,
    changes: Vec<Change>,
    sealed: bool,
}

impl TransactionContext {
    pub fn new(tx: Box<dyn StoreTransaction>) -> Self {
        Self {
            tx,
            locks: LockSet::new(),
            rows: HashMap::new(),
            singles: HashMap::new(),
            lists: HashMap::new(),
            origins: HashMap::new(),
            changes: Vec::new(),
            sealed: false,
        }
    }

    pub fn lock_set(&self) -> &LockSet {
        &self.locks
    }

    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Ends the lock phase. Later cache misses are contract violations.
    pub fn prevent_storage_call(&mut self) {
        self.sealed = true;
    }

    fn remember(&mut self, entity: &Entity) -> EntityKey {
        let key = entity.key();
        _ = self
            .origins
            .entry(key.clone())
            .or_insert_with(|| entity.owner_key());
        for finder in finders_of(entity) {
            _ = self.singles.entry(finder).or_insert_with(|| Some(key.clone()));
        }
        _ = self.rows.insert(key.clone(), entity.clone());
        key
    }

    fn apply_kind(&mut self, kind: LockKind) {
        match kind {
            LockKind::ReadCommitted => self.tx.acquire_read_committed(),
            LockKind::Read => self.tx.acquire_read(),
            LockKind::Write => self.tx.acquire_write(),
        }
    }

    fn ensure_open(&self, finder: &Finder) -> Result<()> {
        if self.sealed {
            return Err(Error::StorageCallPrevented(finder.to_string()));
        }
        Ok(())
    }

    /// Locks and fetches one row, reusing the cached row when it is
    /// already held at `kind` or stronger, whichever finder locked it.
    pub async fn lock_find(&mut self, kind: LockKind, finder: &Finder) -> Result<Option<Entity>> {
        if let Some(Some(key)) = self.singles.get(finder) {
            if self.locks.holds(key, kind) {
                return Ok(self.rows.get(key).cloned());
            }
        }
        if let Some(key) = finder.entity_key() {
            if self.locks.holds(&key, kind) {
                if let Some(row) = self.rows.get(&key) {
                    return Ok(Some(row.clone()));
                }
            }
        }
        self.ensure_open(finder)?;

        self.apply_kind(kind);
        let found = self.tx.find(finder).await?;
        let what = finder.to_string();
        let lock = kind.to_string();
        debug!("locked {what} as {lock}");

        match &found {
            Some(entity) => {
                let key = self.remember(entity);
                _ = self.locks.record(key.clone(), kind);
                _ = self.singles.insert(finder.clone(), Some(key));
            }
            None => {
                // A lock on an absent row still guards its creation.
                if let Some(key) = finder.entity_key() {
                    _ = self.locks.record(key, kind);
                }
                _ = self.singles.insert(finder.clone(), None);
            }
        }
        Ok(found)
    }

    /// Locks and fetches every row a list finder returns.
    pub async fn lock_find_list(&mut self, kind: LockKind, finder: &Finder) -> Result<Vec<Entity>> {
        if let Some(keys) = self.lists.get(finder) {
            if keys.iter().all(|key| self.locks.holds(key, kind)) {
                return Ok(keys.iter().filter_map(|key| self.rows.get(key).cloned()).collect());
            }
        }
        self.ensure_open(finder)?;

        self.apply_kind(kind);
        let found = self.tx.find_list(finder).await?;
        let what = finder.to_string();
        let lock = kind.to_string();
        let count = found.len();
        debug!("locked {count} rows for {what} as {lock}");

        let mut keys = Vec::with_capacity(found.len());
        for entity in &found {
            let key = self.remember(entity);
            _ = self.locks.record(key.clone(), kind);
            keys.push(key);
        }
        _ = self.lists.insert(finder.clone(), keys);
        Ok(found)
    }

    /// Convenience over [`TransactionContext::lock_find`] for namespace nodes.
    pub async fn lock_node(&mut self, kind: LockKind, finder: &Finder) -> Result<Option<Node>> {
        Ok(self.lock_find(kind, finder).await?.and_then(Entity::into_node))
    }

    /// Unlocked lookup used to decide which lock to take next.
    pub async fn probe(&mut self, finder: &Finder) -> Result<Option<Entity>> {
        if let Some(cached) = self.singles.get(finder) {
            return Ok(cached.as_ref().and_then(|key| self.rows.get(key).cloned()));
        }
        self.ensure_open(finder)?;
        self.tx.probe(finder).await
    }

    /// Reads a row for the unit of work.
    ///
    /// Served from the cache; before the lock phase is sealed a miss falls
    /// through to a read-committed fetch.
    pub async fn find(&mut self, finder: &Finder) -> Result<Option<Entity>> {
        if let Some(cached) = self.singles.get(finder) {
            return Ok(cached.as_ref().and_then(|key| self.rows.get(key).cloned()));
        }
        if let Some(key) = finder.entity_key() {
            if let Some(row) = self.rows.get(&key) {
                return Ok(Some(row.clone()));
            }
        }
        self.ensure_open(finder)?;

        self.apply_kind(LockKind::ReadCommitted);
        let found = self.tx.find(finder).await?;
        _ = self
            .singles
            .insert(finder.clone(), found.as_ref().map(Entity::key));
        if let Some(entity) = &found {
            _ = self.remember(entity);
        }
        Ok(found)
    }

    pub async fn find_list(&mut self, finder: &Finder) -> Result<Vec<Entity>> {
        if let Some(keys) = self.lists.get(finder) {
            return Ok(keys.iter().filter_map(|key| self.rows.get(key).cloned()).collect());
        }
        self.ensure_open(finder)?;

        self.apply_kind(LockKind::ReadCommitted);
        let found = self.tx.find_list(finder).await?;
        let keys = found.iter().map(|entity| self.remember(entity)).collect();
        _ = self.lists.insert(finder.clone(), keys);
        Ok(found)
    }

    pub async fn find_node(&mut self, finder: &Finder) -> Result<Option<Node>> {
        Ok(self.find(finder).await?.and_then(Entity::into_node))
    }

    /// Buffers a new row.
    pub fn add(&mut self, entity: Entity) {
        self.upsert(entity);
    }

    /// Buffers a modified row.
    pub fn update(&mut self, entity: Entity) {
        self.upsert(entity);
    }

    /// Buffers the removal of a row.
    pub fn remove(&mut self, key: EntityKey) {
        if let Some(old) = self.rows.remove(&key) {
            for finder in finders_of(&old) {
                _ = self.singles.insert(finder, None);
            }
        }
        for keys in self.lists.values_mut() {
            keys.retain(|k| k != &key);
        }
        self.changes.push(Change::Remove(key));
    }

    fn upsert(&mut self, entity: Entity) {
        let key = entity.key();
        if let Some(old) = self.rows.get(&key) {
            for finder in finders_of(old) {
                _ = self.singles.insert(finder, None);
            }
            if let Some(list) = list_of(old) {
                if let Some(keys) = self.lists.get_mut(&list) {
                    keys.retain(|k| k != &key);
                }
            }
        }
        for finder in finders_of(&entity) {
            _ = self.singles.insert(finder, Some(key.clone()));
        }
        if let Some(list) = list_of(&entity) {
            if let Some(keys) = self.lists.get_mut(&list) {
                keys.push(key.clone());
            }
        }
        _ = self.rows.insert(key, entity.clone());
        self.changes.push(Change::Upsert(entity));
    }

    fn write_locked(&self, key: &EntityKey) -> bool {
        self.locks.kind_of(key) == Some(LockKind::Write)
    }

    fn check_write_locks(&self) -> Result<()> {
        for change in &self.changes {
            let key = change.key();
            if self.write_locked(&key) {
                continue;
            }

            let old_owner = self.origins.get(&key).cloned().flatten();
            let new_owner = match change {
                Change::Upsert(entity) => entity.owner_key(),
                Change::Remove(_) => None,
            };
            let mut guards: Vec<EntityKey> = old_owner.into_iter().chain(new_owner).collect();
            guards.dedup();

            let uncovered = match guards.iter().find(|guard| !self.write_locked(guard)) {
                Some(guard) => Some(guard.clone()),
                None if guards.is_empty() => Some(key.clone()),
                None => None,
            };
            if let Some(guard) = uncovered {
                let held = self
                    .locks
                    .kind_of(&guard)
                    .map_or_else(|| "none".to_string(), |kind| kind.to_string());
                return Err(Error::LockUpgrade { key, held });
            }
        }
        Ok(())
    }

    /// Commits the buffered changes. Write-lock coverage is only enforced
    /// when a lock phase was sealed.
    pub async fn commit(&mut self) -> Result<()> {
        if self.sealed {
            self.check_write_locks()?;
        }
        let changes = std::mem::take(&mut self.changes);
        let count = changes.len();
        let locks = self.locks.len();
        debug!("committing {count} changes under {locks} locks");
        self.tx.commit(&self.locks, changes).await
    }

    pub async fn rollback(&mut self) -> Result<()> {
        self.changes.clear();
        self.tx.rollback().await
    }
}

fn finders_of(entity: &Entity) -> Vec<Finder> {
    match entity {
        Entity::Node(node) if node.id.is_root() => vec![Finder::NodeById(node.id)],
        Entity::Node(node) => vec![
            Finder::NodeById(node.id),
            Finder::NodeByNameAndParent {
                parent: node.parent_id,
                name: node.name.clone(),
            },
        ],
        Entity::Block(block) => vec![Finder::BlockById(block.id)],
        Entity::Lease(lease) => vec![Finder::LeaseByHolder(lease.holder.clone())],
        Entity::Replica(_) => Vec::new(),
        Entity::Variable(var) => vec![Finder::Variable(var.variable)],
    }
}

fn list_of(entity: &Entity) -> Option<Finder> {
    match entity {
        Entity::Block(block) => Some(Finder::BlocksByNode(block.owner)),
        Entity::Replica(replica) if replica.under_construction => {
            Some(Finder::ReplicasUnderConstructionByBlock(replica.block))
        }
        Entity::Replica(replica) => Some(Finder::ReplicasByBlock(replica.block)),
        Entity::Node(node) if node.id.is_root() => None,
        Entity::Node(node) => Some(Finder::ChildrenOf(node.parent_id)),
        Entity::Lease(_) | Entity::Variable(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryStore, StoreEvent};
    use crate::node::{NodeId, ROOT_ID, Variable, VariableValue};
    use crate::store::MetadataStore;
    use crate::testing::tree;

    #[tokio::test]
    async fn test_weaker_request_reuses_lock() {
        let store = tree(&["/a/"]).await;
        let mut ctx = TransactionContext::new(store.begin().await.unwrap());

        let root = Finder::NodeById(ROOT_ID);
        _ = ctx.lock_find(LockKind::Write, &root).await.unwrap();
        _ = ctx.lock_find(LockKind::Read, &root).await.unwrap();
        _ = ctx.lock_find(LockKind::ReadCommitted, &root).await.unwrap();

        assert_eq!(ctx.lock_set().kind_of(&EntityKey::Node(ROOT_ID)), Some(LockKind::Write));
        assert_eq!(store.acquisitions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_held_row_is_reused_across_finders() {
        let store = tree(&["/a/"]).await;
        let a = store.node_at("/a").await.unwrap();
        let mut ctx = TransactionContext::new(store.begin().await.unwrap());

        let by_name = Finder::NodeByNameAndParent {
            parent: ROOT_ID,
            name: "a".to_string(),
        };
        _ = ctx.lock_find(LockKind::Write, &by_name).await.unwrap();
        let by_id = ctx
            .lock_node(LockKind::Read, &Finder::NodeById(a.id))
            .await
            .unwrap();

        assert_eq!(by_id.map(|n| n.id), Some(a.id));
        assert_eq!(store.acquisitions().await, vec![(LockKind::Write, by_name)]);
    }

    #[tokio::test]
    async fn test_stronger_request_upgrades() {
        let store = tree(&["/a/"]).await;
        let mut ctx = TransactionContext::new(store.begin().await.unwrap());

        let root = Finder::NodeById(ROOT_ID);
        _ = ctx.lock_find(LockKind::ReadCommitted, &root).await.unwrap();
        _ = ctx.lock_find(LockKind::Write, &root).await.unwrap();

        assert_eq!(ctx.lock_set().kind_of(&EntityKey::Node(ROOT_ID)), Some(LockKind::Write));
        let kinds: Vec<_> = store.acquisitions().await.into_iter().map(|(kind, _)| kind).collect();
        assert_eq!(kinds, vec![LockKind::ReadCommitted, LockKind::Write]);
    }

    #[tokio::test]
    async fn test_sealed_context_rejects_cache_miss() {
        let store = tree(&["/a/", "/b/"]).await;
        let mut ctx = TransactionContext::new(store.begin().await.unwrap());
        _ = ctx
            .lock_find(LockKind::Read, &Finder::NodeById(ROOT_ID))
            .await
            .unwrap();
        ctx.prevent_storage_call();

        assert!(ctx.find(&Finder::NodeById(ROOT_ID)).await.unwrap().is_some());
        let err = ctx
            .find(&Finder::NodeByNameAndParent {
                parent: ROOT_ID,
                name: "b".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StorageCallPrevented(_)));
    }

    #[tokio::test]
    async fn test_commit_requires_write_lock() {
        let store = tree(&["/a/"]).await;
        let mut ctx = TransactionContext::new(store.begin().await.unwrap());
        let root = ctx
            .lock_node(LockKind::Read, &Finder::NodeById(ROOT_ID))
            .await
            .unwrap()
            .unwrap();
        ctx.prevent_storage_call();

        ctx.add(Entity::Node(Node::directory(NodeId::new(50), root.id, "new")));
        let err = ctx.commit().await.unwrap_err();
        assert_eq!(
            err,
            Error::LockUpgrade {
                key: EntityKey::Node(NodeId::new(50)),
                held: "read".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_move_needs_both_parents() {
        let store = tree(&["/a/", "/b/", "/a/d/"]).await;
        let a = store.node_at("/a").await.unwrap();
        let b = store.node_at("/b").await.unwrap();
        let mut ctx = TransactionContext::new(store.begin().await.unwrap());
        _ = ctx.lock_find(LockKind::Write, &Finder::NodeById(a.id)).await.unwrap();
        _ = ctx.lock_find(LockKind::Read, &Finder::NodeById(b.id)).await.unwrap();
        let mut d = ctx
            .lock_node(
                LockKind::Read,
                &Finder::NodeByNameAndParent {
                    parent: a.id,
                    name: "d".to_string(),
                },
            )
            .await
            .unwrap()
            .unwrap();
        ctx.prevent_storage_call();

        d.parent_id = b.id;
        ctx.update(Entity::Node(d.clone()));
        let err = ctx.commit().await.unwrap_err();
        assert_eq!(
            err,
            Error::LockUpgrade {
                key: EntityKey::Node(d.id),
                held: "read".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_remove_covered_by_parent() {
        let store = tree(&["/a/d/"]).await;
        let a = store.node_at("/a").await.unwrap();
        let mut ctx = TransactionContext::new(store.begin().await.unwrap());
        _ = ctx.lock_find(LockKind::Write, &Finder::NodeById(a.id)).await.unwrap();
        let d = ctx
            .lock_node(
                LockKind::Read,
                &Finder::NodeByNameAndParent {
                    parent: a.id,
                    name: "d".to_string(),
                },
            )
            .await
            .unwrap()
            .unwrap();
        ctx.prevent_storage_call();

        ctx.remove(EntityKey::Node(d.id));
        ctx.commit().await.unwrap();
        assert!(store.node_at("/a/d").await.is_none());
    }

    #[tokio::test]
    async fn test_commit_with_parent_write_lock() {
        let store = tree(&["/a/"]).await;
        let mut ctx = TransactionContext::new(store.begin().await.unwrap());
        _ = ctx
            .lock_find(LockKind::Write, &Finder::NodeById(ROOT_ID))
            .await
            .unwrap();
        let counter = ctx
            .lock_find(LockKind::Write, &Finder::Variable(Variable::InodeIdCounter))
            .await
            .unwrap()
            .and_then(Entity::into_variable)
            .unwrap();
        ctx.prevent_storage_call();

        let id = NodeId::new(counter.value + 1);
        ctx.update(Entity::Variable(VariableValue {
            variable: Variable::InodeIdCounter,
            value: counter.value + 1,
        }));
        ctx.add(Entity::Node(Node::directory(id, ROOT_ID, "b")));

        // Local changes are visible to later reads.
        let child = ctx
            .find_node(&Finder::NodeByNameAndParent {
                parent: ROOT_ID,
                name: "b".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(child.map(|n| n.id), Some(id));

        ctx.commit().await.unwrap();
        assert!(matches!(store.events().await.last(), Some(StoreEvent::Commit { changes: 2, .. })));
        assert!(store.node_at("/b").await.is_some());
    }
}
