// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use nslock::testing::tree;
use nslock::{
    BlockId, Entity, EntityKey, Finder, LockKind, MemoryStore, ROOT_ID, Variable,
};
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};
use txhandler::{
    AddBlock, CreateFile, Delete, GetFileInfo, ListDirectory, Mkdir, OperationError, Rename,
    TransactionConfig, TransactionHandler, TxError,
};

fn handler(store: &MemoryStore) -> TransactionHandler {
    TransactionHandler::new(Arc::new(store.clone()), TransactionConfig::default())
}

#[tokio::test]
async fn test_create_and_allocate_blocks() {
    let store = MemoryStore::new();
    let handler = handler(&store);

    _ = assert_ok!(handler.execute(&mut Mkdir::new("/logs")).await);
    let file = assert_ok!(
        handler
            .execute(&mut CreateFile::new("/logs/today", "client-7"))
            .await
    );

    let first = assert_ok!(
        handler
            .execute(&mut AddBlock::new("/logs/today", "client-7"))
            .await
    );
    let second = assert_ok!(
        handler
            .execute(&mut AddBlock::new("/logs/today", "client-7"))
            .await
    );
    assert_eq!(first.id, BlockId::new(1));
    assert_eq!(second.id, BlockId::new(2));
    assert_eq!(first.generation_stamp, 1001);
    assert_eq!(second.generation_stamp, 1002);
    assert_eq!(second.owner, file);

    let info = assert_ok!(handler.execute(&mut GetFileInfo::new("/logs/today")).await);
    let info = info.unwrap();
    assert!(info.is_file());
    assert_eq!(info.blocks, vec![first.id, second.id]);

    let lease = store
        .get(&EntityKey::Lease("client-7".to_string()))
        .await
        .and_then(Entity::into_lease)
        .unwrap();
    assert!(lease.paths.contains("/logs/today"));
}

#[tokio::test]
async fn test_other_holder_cannot_add_block() {
    let store = MemoryStore::new();
    let handler = handler(&store);
    _ = assert_ok!(handler.execute(&mut CreateFile::new("/f", "client-1")).await);

    let err = assert_err!(handler.execute(&mut AddBlock::new("/f", "client-2")).await);
    assert!(matches!(err, TxError::Operation(OperationError::InvalidArgument(_))));

    let err = assert_err!(handler.execute(&mut AddBlock::new("/", "client-1")).await);
    assert!(matches!(err, TxError::Operation(OperationError::NotAFile(_))));
}

#[tokio::test]
async fn test_mkdir_lock_order() {
    let store = tree(&["/a/"]).await;
    let a = store.node_at("/a").await.unwrap();
    store.clear_events().await;

    _ = assert_ok!(handler(&store).execute(&mut Mkdir::new("/a/b")).await);

    assert_eq!(
        store.acquisitions().await,
        vec![
            (LockKind::ReadCommitted, Finder::NodeById(ROOT_ID)),
            (
                LockKind::Write,
                Finder::NodeByNameAndParent {
                    parent: ROOT_ID,
                    name: "a".to_string(),
                }
            ),
            (LockKind::Write, Finder::Variable(Variable::InodeIdCounter)),
        ]
    );
    assert_eq!(store.node_at("/a/b").await.unwrap().parent_id, a.id);
}

#[tokio::test]
async fn test_rename_directory_across_parents() {
    let store = tree(&["/src/dir/child", "/dst/"]).await;
    let handler = handler(&store);
    let moved = store.node_at("/src/dir").await.unwrap();

    assert_ok!(handler.execute(&mut Rename::new("/src/dir", "/dst/renamed")).await);

    let node = store.node_at("/dst/renamed").await.unwrap();
    assert_eq!(node.id, moved.id);
    assert!(store.node_at("/dst/renamed/child").await.is_some());
    assert!(store.node_at("/src/dir").await.is_none());

    let names = assert_ok!(handler.execute(&mut ListDirectory::new("/dst")).await);
    assert_eq!(names, vec!["renamed"]);
}

#[tokio::test]
async fn test_rename_errors() {
    let store = tree(&["/a", "/b", "/d/"]).await;
    let handler = handler(&store);

    let err = assert_err!(handler.execute(&mut Rename::new("/a", "/b")).await);
    assert!(matches!(err, TxError::Operation(OperationError::AlreadyExists(_))));

    let err = assert_err!(handler.execute(&mut Rename::new("/missing", "/c")).await);
    assert!(matches!(err, TxError::Operation(OperationError::NotFound(_))));

    let err = assert_err!(handler.execute(&mut Rename::new("/a", "/nowhere/a")).await);
    assert!(matches!(err, TxError::Operation(OperationError::NotFound(_))));

    let err = assert_err!(handler.execute(&mut Rename::new("/a", "/b/a")).await);
    assert!(matches!(err, TxError::Operation(OperationError::NotADirectory(_))));

    assert_ok!(handler.execute(&mut Rename::new("/a", "/d/a")).await);
    assert!(store.node_at("/d/a").await.unwrap().is_file());
}

#[tokio::test]
async fn test_list_directory() {
    let store = tree(&["/d/b", "/d/a/", "/d/c"]).await;
    let handler = handler(&store);

    let names = assert_ok!(handler.execute(&mut ListDirectory::new("/d")).await);
    assert_eq!(names, vec!["a", "b", "c"]);

    let err = assert_err!(handler.execute(&mut ListDirectory::new("/d/b")).await);
    assert!(matches!(err, TxError::Operation(OperationError::NotADirectory(_))));

    let err = assert_err!(handler.execute(&mut ListDirectory::new("/e")).await);
    assert!(matches!(err, TxError::Operation(OperationError::NotFound(_))));
}

#[tokio::test]
async fn test_delete_directory_holds_parent_write_lock() {
    let store = tree(&["/p/empty/"]).await;
    let p = store.node_at("/p").await.unwrap();
    let empty = store.node_at("/p/empty").await.unwrap();
    store.clear_events().await;

    assert!(assert_ok!(handler(&store).execute(&mut Delete::new("/p/empty")).await));

    let acquisitions = store.acquisitions().await;
    assert!(acquisitions.contains(&(
        LockKind::Write,
        Finder::NodeByNameAndParent {
            parent: ROOT_ID,
            name: "p".to_string(),
        }
    )));
    assert!(acquisitions.contains(&(
        LockKind::Read,
        Finder::NodeByNameAndParent {
            parent: p.id,
            name: "empty".to_string(),
        }
    )));
    assert!(store.get(&EntityKey::Node(empty.id)).await.is_none());
}

#[tokio::test]
async fn test_relative_path_is_rejected() {
    let store = MemoryStore::new();
    let err = assert_err!(handler(&store).execute(&mut Mkdir::new("relative/dir")).await);
    assert!(err.is_contract_violation());
    assert!(matches!(err, TxError::Store(nslock::Error::InvalidRequest(_))));
}
