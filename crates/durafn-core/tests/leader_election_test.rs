// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Contract tests for epoch-fenced leader election across store backends.

use std::sync::Arc;

use durafn_core::storage::{
    CasOutcome, FunctionId, FunctionStore, InMemoryFunctionStore, Payload, SqliteFunctionStore,
    Status,
};

async fn sqlite_store() -> Arc<dyn FunctionStore> {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("functions.db");
    let store = SqliteFunctionStore::from_path(&path).await.unwrap();
    std::mem::forget(dir);
    Arc::new(store)
}

async fn assert_single_winner(store: Arc<dyn FunctionStore>, contenders: usize) {
    let id = FunctionId::new("t", "contended");
    store
        .create_function(
            &id,
            &Payload::new("\"hello\"", "json"),
            None,
            Status::Executing,
            0,
            0,
        )
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..contenders {
        let store = store.clone();
        let id = id.clone();
        handles.push(tokio::spawn(async move {
            store
                .try_to_become_leader(&id, Status::Executing, 0, 1)
                .await
                .unwrap()
        }));
    }

    let mut winners = 0;
    let mut losers = 0;
    for handle in handles {
        match handle.await.unwrap() {
            CasOutcome::Applied => winners += 1,
            CasOutcome::Stale => losers += 1,
            CasOutcome::NotFound => panic!("instance vanished mid-election"),
        }
    }

    assert_eq!(winners, 1, "exactly one contender may win epoch 0");
    assert_eq!(losers, contenders - 1);

    let snapshot = store.get_function(&id).await.unwrap().unwrap();
    assert_eq!(snapshot.epoch, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_memory_store_single_winner_among_many() {
    assert_single_winner(Arc::new(InMemoryFunctionStore::new()), 32).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sqlite_store_single_winner_among_many() {
    assert_single_winner(sqlite_store().await, 32).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_leadership_transfers_form_a_total_order() {
    let store: Arc<dyn FunctionStore> = Arc::new(InMemoryFunctionStore::new());
    let id = FunctionId::new("t", "i");
    store
        .create_function(
            &id,
            &Payload::new("\"hello\"", "json"),
            None,
            Status::Executing,
            0,
            0,
        )
        .await
        .unwrap();

    // Sequential transfers: each epoch can be claimed once and only from its
    // immediate predecessor.
    for epoch in 0..5 {
        assert_eq!(
            store
                .try_to_become_leader(&id, Status::Executing, epoch, epoch + 1)
                .await
                .unwrap(),
            CasOutcome::Applied
        );
        // The now-stale epoch cannot be claimed again.
        assert_eq!(
            store
                .try_to_become_leader(&id, Status::Executing, epoch, epoch + 1)
                .await
                .unwrap(),
            CasOutcome::Stale
        );
    }

    assert_eq!(store.get_function(&id).await.unwrap().unwrap().epoch, 5);
}
