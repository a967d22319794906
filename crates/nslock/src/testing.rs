// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Fixtures for building namespaces in a [`MemoryStore`].

use crate::memory::MemoryStore;
use crate::node::{Block, BlockId, Entity, Node, NodeKind};

/// Builds a store containing `paths`.
///
/// Entries ending in `/` are directories, others are files; missing
/// ancestors are created as directories.
pub async fn tree(paths: &[&str]) -> MemoryStore {
    let store = MemoryStore::new();
    for path in paths {
        let kind = if path.ends_with('/') {
            NodeKind::Directory
        } else {
            NodeKind::File
        };
        _ = ensure_path(&store, path, kind).await;
    }
    store
}

/// Creates `path` and any missing ancestors, returning the final node.
pub async fn ensure_path(store: &MemoryStore, path: &str, kind: NodeKind) -> Option<Node> {
    let names = crate::path::components(path).ok()?;
    let mut current = store.node_at("/").await?;
    let mut walked = String::new();
    let last = names.len().saturating_sub(1);

    for (index, name) in names.iter().enumerate() {
        walked.push('/');
        walked.push_str(name);
        if let Some(existing) = store.node_at(&walked).await {
            current = existing;
            continue;
        }
        let id = store.allocate_node_id().await;
        let node = Node {
            id,
            parent_id: current.id,
            name: name.clone(),
            kind: if index == last { kind } else { NodeKind::Directory },
            blocks: Vec::new(),
        };
        store.insert(Entity::Node(node.clone())).await;
        current = node;
    }
    Some(current)
}

/// Attaches a finalized block to the file at `path`.
pub async fn add_block(store: &MemoryStore, path: &str, block: u64) -> Option<Block> {
    let mut file = store.node_at(path).await?;
    let block = Block::new(BlockId::new(block), file.id, 1000 + block);
    file.blocks.push(block.id);
    store.insert(Entity::Node(file)).await;
    store.insert(Entity::Block(block.clone())).await;
    Some(block)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tree_builds_ancestors() {
        let store = tree(&["/a/b/c", "/a/d/"]).await;
        assert!(store.node_at("/a").await.unwrap().is_dir());
        assert!(store.node_at("/a/b").await.unwrap().is_dir());
        assert!(store.node_at("/a/b/c").await.unwrap().is_file());
        assert!(store.node_at("/a/d").await.unwrap().is_dir());
    }

    #[tokio::test]
    async fn test_add_block() {
        let store = tree(&["/f"]).await;
        let block = add_block(&store, "/f", 7).await.unwrap();
        let file = store.node_at("/f").await.unwrap();
        assert_eq!(file.blocks, vec![block.id]);
        assert_eq!(block.owner, file.id);
    }
}
