//! Ingestion orchestrator integration tests over in-memory collaborators and
//! a sled hash store: dual-write consistency, idempotent re-runs, partial
//! write surfacing, and the deletion sweep.

mod helpers;

use std::sync::Arc;

use helpers::{FixedEmbedder, MemoryCluster, MemoryVectorStore};
use ragserver::config::IngestConfig;
use ragserver::document::{Document, SourceType};
use ragserver::hashstore::HashStore;
use ragserver::ingest::{IngestEvent, Orchestrator, RunState};

fn doc(id: &str, path: &str, content: &str) -> Document {
    let mut d = Document::new(id, format!("title {id}"), content, SourceType::Markdown);
    d.file_path = path.to_string();
    d.reference = format!("https://example.com/{id}");
    d
}

struct Fixture {
    _dir: tempfile::TempDir,
    cluster: Arc<MemoryCluster>,
    vectors: Arc<MemoryVectorStore>,
    embedder: Arc<FixedEmbedder>,
    hash_store: Arc<HashStore>,
    orchestrator: Orchestrator,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let cluster = Arc::new(MemoryCluster::new());
    let vectors = Arc::new(MemoryVectorStore::new());
    let embedder = Arc::new(FixedEmbedder::new(384));
    let hash_store = Arc::new(HashStore::open(&dir.path().join("hashes")).unwrap());
    let orchestrator = Orchestrator::new(
        IngestConfig { concurrency: 4, ..Default::default() },
        "docs".to_string(),
        cluster.clone(),
        vectors.clone(),
        embedder.clone(),
        hash_store.clone(),
    );
    Fixture { _dir: dir, cluster, vectors, embedder, hash_store, orchestrator }
}

#[tokio::test]
async fn full_run_writes_both_stores_and_commits_hashes() {
    let f = fixture();
    let batch = vec![(
        SourceType::Markdown,
        vec![
            doc("m1", "a.md", "first markdown body"),
            doc("m2", "b.md", "second markdown body"),
        ],
    )];

    let stats = f.orchestrator.run(batch, false).await.unwrap();
    assert_eq!(stats.processed, 2);
    assert_eq!(stats.succeeded, 2);
    assert_eq!(stats.failed, 0);

    // No orphans: every indexed id exists in both stores.
    assert_eq!(f.cluster.indexed_ids(), vec!["m1", "m2"]);
    assert_eq!(f.vectors.ids(), vec!["m1", "m2"]);
    // Hash record present for each file.
    assert!(f.hash_store.get(SourceType::Markdown, "a.md").unwrap().is_some());
    assert!(f.hash_store.get(SourceType::Markdown, "b.md").unwrap().is_some());
    assert_eq!(f.orchestrator.state(), RunState::Idle);
}

#[tokio::test]
async fn unchanged_rerun_is_a_no_op() {
    let f = fixture();
    let batch = || {
        vec![(
            SourceType::Markdown,
            vec![doc("m1", "a.md", "stable body")],
        )]
    };

    f.orchestrator.run(batch(), false).await.unwrap();
    let first_calls = f.embedder.call_count();
    assert_eq!(first_calls, 1);

    let stats = f.orchestrator.run(batch(), false).await.unwrap();
    assert_eq!(stats.processed, 0);
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.failed, 0);
    // No new embeddings and no store churn.
    assert_eq!(f.embedder.call_count(), first_calls);
    assert_eq!(f.cluster.indexed_ids(), vec!["m1"]);
}

#[tokio::test]
async fn modified_file_is_reprocessed() {
    let f = fixture();
    f.orchestrator
        .run(vec![(SourceType::Markdown, vec![doc("m1", "a.md", "old body")])], false)
        .await
        .unwrap();

    let stats = f
        .orchestrator
        .run(vec![(SourceType::Markdown, vec![doc("m1", "a.md", "new body")])], false)
        .await
        .unwrap();
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.succeeded, 1);
}

#[tokio::test]
async fn partial_write_is_surfaced_not_masked() {
    let f = fixture();
    f.cluster.fail_id("m2");

    let batch = vec![(
        SourceType::Markdown,
        vec![doc("m1", "a.md", "fine body"), doc("m2", "b.md", "doomed body")],
    )];
    let stats = f.orchestrator.run(batch, false).await.unwrap();

    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.failed, 1);
    assert!(stats.errors.iter().any(|e| e.kind == "partial_write"));

    // The failed file gets no hash commit; the good one does.
    assert!(f.hash_store.get(SourceType::Markdown, "a.md").unwrap().is_some());
    assert!(f.hash_store.get(SourceType::Markdown, "b.md").unwrap().is_none());
}

#[tokio::test]
async fn embedding_failure_recorded_and_run_continues() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = Arc::new(MemoryCluster::new());
    let vectors = Arc::new(MemoryVectorStore::new());
    let embedder = Arc::new(FixedEmbedder::failing(384));
    let hash_store = Arc::new(HashStore::open(&dir.path().join("hashes")).unwrap());
    let orchestrator = Orchestrator::new(
        IngestConfig::default(),
        "docs".to_string(),
        cluster.clone(),
        vectors.clone(),
        embedder,
        hash_store.clone(),
    );

    let stats = orchestrator
        .run(vec![(SourceType::Markdown, vec![doc("m1", "a.md", "body")])], false)
        .await
        .unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.succeeded, 0);
    assert!(stats.errors.iter().any(|e| e.kind == "embedding_generation"));
    assert!(cluster.indexed_ids().is_empty());
    assert!(hash_store.is_empty());
}

#[tokio::test]
async fn deletion_sweep_removes_vanished_files_everywhere() {
    let f = fixture();
    f.orchestrator
        .run(vec![(SourceType::Markdown, vec![doc("m1", "a.md", "body one")])], false)
        .await
        .unwrap();
    assert_eq!(f.cluster.indexed_ids(), vec!["m1"]);

    // Next run enumerates no files for this source: a.md has vanished.
    let stats = f.orchestrator.run(vec![(SourceType::Markdown, Vec::new())], false).await.unwrap();
    assert_eq!(stats.deleted, 1);
    assert!(f.cluster.indexed_ids().is_empty());
    assert!(f.vectors.ids().is_empty());
    assert!(f.hash_store.get(SourceType::Markdown, "a.md").unwrap().is_none());
}

#[tokio::test]
async fn dry_run_touches_nothing() {
    let f = fixture();
    let stats = f
        .orchestrator
        .run(vec![(SourceType::Markdown, vec![doc("m1", "a.md", "body")])], true)
        .await
        .unwrap();
    assert_eq!(stats.processed, 1);
    assert_eq!(f.embedder.call_count(), 0);
    assert!(f.cluster.indexed_ids().is_empty());
    assert!(f.vectors.ids().is_empty());
    assert!(f.hash_store.is_empty());
}

#[tokio::test]
async fn excluded_categories_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let cluster = Arc::new(MemoryCluster::new());
    let vectors = Arc::new(MemoryVectorStore::new());
    let embedder = Arc::new(FixedEmbedder::new(384));
    let hash_store = Arc::new(HashStore::open(&dir.path().join("hashes")).unwrap());
    let orchestrator = Orchestrator::new(
        IngestConfig { excluded_categories: vec!["secret".to_string()], ..Default::default() },
        "docs".to_string(),
        cluster.clone(),
        vectors,
        embedder,
        hash_store,
    );

    let mut hidden = doc("m1", "a.md", "body");
    hidden.category = "secret".to_string();
    let stats = orchestrator
        .run(vec![(SourceType::Markdown, vec![hidden, doc("m2", "b.md", "body")])], false)
        .await
        .unwrap();
    assert_eq!(stats.skipped, 1);
    assert_eq!(cluster.indexed_ids(), vec!["m2"]);
}

#[tokio::test]
async fn progress_events_are_emitted_in_order() {
    let f = fixture();
    let mut rx = f.orchestrator.subscribe();

    f.orchestrator
        .run(vec![(SourceType::Markdown, vec![doc("m1", "a.md", "body")])], false)
        .await
        .unwrap();

    let mut saw_started = false;
    let mut saw_file_ok = false;
    let mut saw_completed = false;
    while let Ok(ev) = rx.try_recv() {
        match ev {
            IngestEvent::Started { total } => {
                assert!(!saw_file_ok && !saw_completed);
                assert_eq!(total, 1);
                saw_started = true;
            }
            IngestEvent::FileOk { ref path } => {
                assert!(saw_started);
                assert_eq!(path, "a.md");
                saw_file_ok = true;
            }
            IngestEvent::Completed { ref stats } => {
                assert!(saw_file_ok);
                assert_eq!(stats.succeeded, 1);
                saw_completed = true;
            }
            _ => {}
        }
    }
    assert!(saw_started && saw_file_ok && saw_completed);
}

#[tokio::test]
async fn concurrent_run_rejected_while_running() {
    // A second run while the first is active must be refused; after the first
    // completes the orchestrator is reusable.
    let f = fixture();
    f.orchestrator
        .run(vec![(SourceType::Markdown, vec![doc("m1", "a.md", "body")])], false)
        .await
        .unwrap();
    assert_eq!(f.orchestrator.state(), RunState::Idle);
    // Reusable after completion.
    f.orchestrator.run(vec![(SourceType::Markdown, Vec::new())], false).await.unwrap();
}
