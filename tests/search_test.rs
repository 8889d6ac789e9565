mod helpers;

use std::sync::Arc;

use helpers::{block, embedder, hash_embedder, temp_service, FailingProvider, StalledProvider};
use tessera::memory::search::{SearchOptions, Signal};

async fn seed(service: &tessera::MemoryService) {
    let docs = [
        ("wal", "SQLite WAL mode lets readers run beside a single writer"),
        ("fts", "FTS5 ranks keyword matches with BM25"),
        ("deploy", "Deploys go out through a blue green rollout every Friday"),
    ];
    for (id, content) in docs {
        service.store_block(block(id, "s1", content)).await.unwrap();
    }
}

#[tokio::test]
async fn nothing_matches_returns_empty_list() {
    let (_tmp, service) = temp_service(Some(hash_embedder(64)));
    seed(&service).await;

    let options = SearchOptions {
        min_score_threshold: Some(0.9),
        ..Default::default()
    };
    let response = service.search("kubernetes helm chart", &options).await.unwrap();
    assert!(response.results.is_empty());
    assert!(response.degraded.is_empty());
}

#[tokio::test]
async fn lexical_only_without_embedder() {
    let (_tmp, service) = temp_service(None);
    seed(&service).await;

    let response = service
        .search("BM25 keyword", &SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(response.results[0].block.id, "fts");
    assert!(response.results[0].semantic_score.is_none());
    assert!(response.degraded.is_empty());
}

#[tokio::test]
async fn hybrid_results_carry_both_components() {
    let (_tmp, service) = temp_service(Some(hash_embedder(64)));
    seed(&service).await;

    let response = service
        .search("single writer readers", &SearchOptions::default())
        .await
        .unwrap();
    assert!(response.degraded.is_empty());
    let top = &response.results[0];
    assert_eq!(top.block.id, "wal");
    assert!(top.lexical_score.unwrap() > 0.0);
    assert!(top.semantic_score.unwrap() > 0.5);
    assert!(response.results.windows(2).all(|w| w[0].score >= w[1].score));
}

#[tokio::test]
async fn failing_provider_degrades_to_lexical() {
    let (_tmp, service) = temp_service(Some(embedder(Arc::new(FailingProvider), 500)));
    // blocks still store; only the vector is missing
    seed(&service).await;
    assert!(service.store().get_embeddings("wal").unwrap().is_empty());

    let response = service
        .search("rollout Friday", &SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(response.degraded, vec![Signal::Semantic]);
    assert_eq!(response.results[0].block.id, "deploy");
}

#[tokio::test]
async fn timed_out_provider_degrades_to_lexical() {
    let (_tmp, service) = temp_service(None);
    seed(&service).await;

    // same store, now fronted by a provider that always times out
    let stalled = tessera::MemoryService::new(
        Arc::clone(service.store()),
        Some(embedder(Arc::new(StalledProvider), 50)),
        &tessera::config::TesseraConfig::default(),
    );
    let response = stalled
        .search("WAL writer", &SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(response.degraded, vec![Signal::Semantic]);
    assert_eq!(response.results[0].block.id, "wal");
}

#[tokio::test]
async fn search_records_access() {
    let (_tmp, service) = temp_service(None);
    seed(&service).await;

    for _ in 0..2 {
        service
            .search("rollout", &SearchOptions::default())
            .await
            .unwrap();
    }
    let block = service.get_block("deploy").await.unwrap();
    assert_eq!(block.access_count, 2);
    assert!(block.last_accessed.is_some());

    let untouched = service.get_block("fts").await.unwrap();
    assert_eq!(untouched.access_count, 0);
}

#[tokio::test]
async fn task_scope_survives_many_outranking_blocks() {
    let (_tmp, service) = temp_service(Some(hash_embedder(32)));
    service
        .create_task(tessera::memory::types::NewTask {
            id: Some("t1".into()),
            title: "cache layer".into(),
            ..Default::default()
        })
        .await
        .unwrap();

    // more distractors than either signal fetches as candidates
    let distractors = tessera::config::SearchConfig::default().max_candidates_per_signal + 10;
    for i in 0..distractors {
        service
            .store_block(block(&format!("noise-{i}"), "s1", "cache cache cache cache"))
            .await
            .unwrap();
    }
    service
        .store_block(block("scoped", "s1", "eviction policy for the cache layer").task("t1"))
        .await
        .unwrap();

    let options = SearchOptions {
        task_id: Some("t1".into()),
        ..Default::default()
    };
    let response = service.search("cache", &options).await.unwrap();
    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].block.id, "scoped");
    assert!(response.results[0].lexical_score.is_some());
    assert!(response.results[0].semantic_score.is_some());
}
