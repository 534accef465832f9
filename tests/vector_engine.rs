//! Vector engine behavior over a temp directory with the hash embedder:
//! lifecycle, upsert-by-parent semantics, collapse on search, and hot
//! backup/restore.

use std::sync::Arc;
use std::time::Duration;

use intelhub::vector::VectorEngine;
use intelhub::vector::embedder::HashEmbedder;

async fn ready_engine() -> (tempfile::TempDir, Arc<VectorEngine>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = VectorEngine::start_with_embedder(dir.path(), Arc::new(HashEmbedder::default()));
    assert!(engine.wait_until_ready(Duration::from_secs(10)).await);
    (dir, engine)
}

#[tokio::test]
async fn lifecycle_reaches_ready_and_reports_status() {
    let (_dir, engine) = ready_engine().await;
    let report = engine.status_report();
    assert_eq!(report.status, "ready");
    assert!(report.error.is_none());
}

#[tokio::test]
async fn not_ready_engine_yields_service_unavailable() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = VectorEngine::start_with_embedder(dir.path(), Arc::new(HashEmbedder::default()));
    // Race against the background initializer: if it has not settled yet,
    // the strict lookup must answer with the distinguished outcome
    match engine.get_repository("anything") {
        Err(intelhub::Error::ServiceUnavailable(_)) | Err(intelhub::Error::NotFound(_)) => {}
        other => panic!("unexpected outcome: {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn shrinking_document_leaves_no_orphan_chunks() {
    let (_dir, engine) = ready_engine().await;
    engine
        .ensure_repository("docs", 64, 8)
        .await
        .expect("collection");

    // ~1000 chars across many sentences: several chunks
    let long_text = "The observed convoy moved along the northern corridor overnight. "
        .repeat(16);
    let first = engine
        .upsert("docs", "c", &long_text, Default::default())
        .await
        .expect("first upsert");
    assert!(first.len() >= 3, "long text must split into several chunks");

    let second = engine
        .upsert("docs", "c", "One short update.", Default::default())
        .await
        .expect("second upsert");
    assert_eq!(second.len(), 1);

    // Exactly one chunk remains under the parent id
    assert_eq!(engine.stats("docs").expect("stats"), 1);
    let repo = engine.get_repository("docs").expect("repo");
    assert!(repo.exists("c").expect("exists"));
}

#[tokio::test]
async fn search_collapses_multi_chunk_parents() {
    let (_dir, engine) = ready_engine().await;
    engine
        .ensure_repository("docs", 32, 4)
        .await
        .expect("collection");

    // Every chunk of this document matches the query tokens
    let text = "satellite launch window. satellite launch pad. \
                satellite launch vehicle. satellite launch crew.";
    let ids = engine
        .upsert("docs", "d", text, Default::default())
        .await
        .expect("upsert");
    assert!(ids.len() >= 2);

    let hits = engine
        .search("docs", "satellite launch", 5, 0.0, Vec::new())
        .await
        .expect("search");
    let d_hits: Vec<_> = hits.iter().filter(|h| h.doc_id == "d").collect();
    assert_eq!(d_hits.len(), 1, "parent must appear at most once");

    // Results sorted by descending score
    for pair in hits.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
}

#[tokio::test]
async fn backup_and_restore_round_trip() {
    let (_dir, engine) = ready_engine().await;
    engine
        .ensure_repository("docs", 128, 16)
        .await
        .expect("collection");
    engine
        .upsert("docs", "keep-me", "Content worth keeping around.", Default::default())
        .await
        .expect("upsert");

    let archive = engine.backup().await.expect("backup");
    assert!(archive.exists());

    // Wipe by adding more data, then restore the snapshot
    engine
        .upsert("docs", "extra", "Post-backup content.", Default::default())
        .await
        .expect("upsert");
    engine.restore(&archive).await.expect("restore");

    // Repository handles were dropped by restore; re-create and verify
    engine
        .ensure_repository("docs", 128, 16)
        .await
        .expect("collection after restore");
    let repo = engine.get_repository("docs").expect("repo");
    assert!(repo.exists("keep-me").expect("exists"));
    assert!(!repo.exists("extra").expect("exists"));

    let _ = std::fs::remove_file(archive);
}

#[tokio::test]
async fn metadata_filter_applies_before_scoring() {
    let (_dir, engine) = ready_engine().await;
    engine
        .ensure_repository("docs", 128, 16)
        .await
        .expect("collection");

    let mut military = serde_json::Map::new();
    military.insert("max_rate_class".into(), "MILITARY".into());
    military.insert("max_rate_score".into(), 8.0.into());
    engine
        .upsert("docs", "m", "joint exercise near the strait", military)
        .await
        .expect("upsert");

    let mut economy = serde_json::Map::new();
    economy.insert("max_rate_class".into(), "ECONOMY".into());
    economy.insert("max_rate_score".into(), 5.0.into());
    engine
        .upsert("docs", "e", "joint venture near the strait", economy)
        .await
        .expect("upsert");

    let filter = intelhub::vector::metadata::SearchFilter {
        rate_class: Some("MILITARY".to_string()),
        ..Default::default()
    };
    let hits = engine
        .search("docs", "joint", 10, 0.0, filter.to_clauses())
        .await
        .expect("search");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].doc_id, "m");
}
