mod helpers;

use helpers::{block, temp_store, test_embedding};
use tessera::memory::types::{BlockType, NewBlock, NewTask};
use tessera::MemoryError;

#[test]
fn stored_block_is_returned_by_task_lookup() {
    let (_tmp, store) = temp_store();
    store
        .create_task(NewTask {
            id: Some("auth".into()),
            title: "Add OAuth login".into(),
            ..Default::default()
        })
        .unwrap();

    let stored = store
        .store_block(
            NewBlock::new("s1", "Tokens are refreshed by the gateway, not the client")
                .task("auth")
                .block_type(BlockType::Architectural)
                .importance(0.8),
        )
        .unwrap();

    let blocks = store.get_blocks_by_task("auth", 1).unwrap();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0], stored);
}

#[test]
fn task_lookup_orders_by_importance_then_recency() {
    let (_tmp, store) = temp_store();
    store
        .create_task(NewTask {
            id: Some("t".into()),
            title: "ordering".into(),
            ..Default::default()
        })
        .unwrap();
    for (id, importance) in [("low", 0.1), ("high", 0.9), ("mid", 0.5)] {
        store
            .store_block(block(id, "s1", id).task("t").importance(importance))
            .unwrap();
    }

    let ids: Vec<String> = store
        .get_blocks_by_task("t", 10)
        .unwrap()
        .into_iter()
        .map(|b| b.id)
        .collect();
    assert_eq!(ids, vec!["high", "mid", "low"]);
}

#[test]
fn unknown_task_is_not_found() {
    let (_tmp, store) = temp_store();
    let err = store
        .store_block(NewBlock::new("s1", "orphan").task("nope"))
        .unwrap_err();
    assert!(matches!(err, MemoryError::NotFound { kind: "task", .. }));
}

#[test]
fn lexical_search_is_bounded_and_sorted() {
    let (_tmp, store) = temp_store();
    for i in 0..8 {
        store
            .store_block(NewBlock::new(
                "s1",
                format!("retry policy number {i} {}", "retry ".repeat(i)),
            ))
            .unwrap();
    }
    store
        .store_block(NewBlock::new("s1", "unrelated gardening notes"))
        .unwrap();

    let results = store.lexical_search("retry", 5).unwrap();
    assert_eq!(results.len(), 5);
    assert!(results.iter().all(|(_, score)| *score >= 0.0));
    assert!(results.windows(2).all(|w| w[0].1 >= w[1].1));
    assert!(results.iter().all(|(b, _)| b.content.contains("retry")));
}

#[test]
fn upserting_twice_keeps_latest_vector() {
    let (_tmp, store) = temp_store();
    store.store_block(block("b1", "s1", "vectors")).unwrap();

    let v1 = test_embedding(1, 16);
    let v2 = test_embedding(2, 16);
    store.upsert_embedding("b1", "spike-16", &v1).unwrap();
    store.upsert_embedding("b1", "spike-16", &v2).unwrap();

    let embeddings = store.get_embeddings("b1").unwrap();
    assert_eq!(embeddings.len(), 1);
    assert_eq!(embeddings[0].vector, v2);
    assert_eq!(store.get_block("b1").unwrap().embedding_model_id.as_deref(), Some("spike-16"));
}

#[test]
fn model_dimensionality_is_enforced() {
    let (_tmp, store) = temp_store();
    store.store_block(block("b1", "s1", "first")).unwrap();
    store.store_block(block("b2", "s1", "second")).unwrap();

    store.upsert_embedding("b1", "m", &test_embedding(0, 8)).unwrap();
    let err = store
        .upsert_embedding("b2", "m", &test_embedding(0, 16))
        .unwrap_err();
    assert!(matches!(err, MemoryError::Validation(_)));

    // a different model may use a different size
    store.upsert_embedding("b2", "other", &test_embedding(0, 16)).unwrap();
}

#[test]
fn vector_search_ranks_by_cosine() {
    let (_tmp, store) = temp_store();
    for (id, seed) in [("a", 0), ("b", 5), ("c", 9)] {
        store.store_block(block(id, "s1", id)).unwrap();
        store.upsert_embedding(id, "spike", &test_embedding(seed, 16)).unwrap();
    }

    let results = store.vector_search(&test_embedding(5, 16), "spike", 10).unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].0.id, "b");
    assert!((results[0].1 - 1.0).abs() < 1e-6);
    assert!(results[1].1.abs() < 1e-6);

    assert!(store.vector_search(&test_embedding(5, 16), "unknown", 10).unwrap().is_empty());
}

#[test]
fn delete_removes_block_and_indices() {
    let (_tmp, store) = temp_store();
    store.store_block(block("gone", "s1", "ephemeral canary phrase")).unwrap();
    store.upsert_embedding("gone", "spike", &test_embedding(3, 8)).unwrap();

    store.delete_block("gone").unwrap();

    assert!(matches!(store.get_block("gone"), Err(MemoryError::NotFound { .. })));
    assert!(store.lexical_search("canary", 10).unwrap().is_empty());
    assert!(store.vector_search(&test_embedding(3, 8), "spike", 10).unwrap().is_empty());
    assert!(matches!(store.delete_block("gone"), Err(MemoryError::NotFound { .. })));
}

#[test]
fn references_resolve_lazily_and_boost_importance() {
    let (_tmp, store) = temp_store();
    store.store_block(block("target", "s1", "the decision").importance(0.5)).unwrap();
    store
        .store_block(block("citing", "s1", "follows the decision").references(["target", "missing"]))
        .unwrap();

    let resolved = store.resolve_relationships("citing").unwrap();
    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved[0].id, "target");
    assert!((resolved[0].importance - 0.55).abs() < 1e-9);

    store.delete_block("citing").unwrap();
    let target = store.get_block("target").unwrap();
    assert!((target.importance - 0.5).abs() < 1e-9);
}

#[test]
fn invalid_input_is_rejected() {
    let (_tmp, store) = temp_store();
    assert!(matches!(
        store.store_block(NewBlock::new("s1", "   ")),
        Err(MemoryError::Validation(_))
    ));
    assert!(matches!(
        store.store_block(NewBlock::new("s1", "x").importance(1.5)),
        Err(MemoryError::Validation(_))
    ));
    store.store_block(block("dup", "s1", "once")).unwrap();
    assert!(matches!(
        store.store_block(block("dup", "s1", "twice")),
        Err(MemoryError::Validation(_))
    ));
}

#[test]
fn mutations_are_audited() {
    let (tmp, store) = temp_store();
    store.store_block(block("b1", "s1", "audited")).unwrap();
    store.upsert_embedding("b1", "spike", &test_embedding(1, 8)).unwrap();
    store.delete_block("b1").unwrap();

    let conn = rusqlite::Connection::open(tmp.path().join("memory.db")).unwrap();
    let ops: Vec<String> = conn
        .prepare("SELECT operation FROM block_log WHERE block_id = 'b1' ORDER BY id")
        .unwrap()
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<rusqlite::Result<_>>()
        .unwrap();
    assert_eq!(ops, vec!["create", "embed", "delete"]);
}
