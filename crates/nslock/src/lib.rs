// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Entity locking for the shared metadata store.
//!
//! A unit of work declares a [`LockRequestSet`]; the [`LockAcquirer`]
//! resolves it inside a [`TransactionContext`], which then serves the
//! locked rows and buffers changes until commit.

pub mod acquirer;
pub mod context;
pub mod error;
pub mod lock;
pub mod lockset;
pub mod memory;
pub mod node;
pub mod path;
pub mod store;
pub mod testing;

pub use acquirer::{LockAcquirer, ResolvedLocks};
pub use context::TransactionContext;
pub use error::{Error, Result};
pub use lock::{
    BlockTarget, LockCategory, LockKind, LockRequest, LockRequestSet, NodeLockMode, NodeResolve,
    NodeTarget,
};
pub use lockset::LockSet;
pub use memory::{MemoryStore, StoreEvent, StoreOp};
pub use node::{
    Block, BlockId, Entity, EntityKey, Lease, Node, NodeId, NodeKind, ROOT_ID, Replica, Variable,
    VariableValue,
};
pub use store::{Change, Finder, MetadataStore, StoreTransaction};
