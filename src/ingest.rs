//! Ingestion orchestrator: hash-gated enumeration, bounded-parallel
//! embedding, dual writes to the vector store and the search cluster, and a
//! deletion sweep for vanished sources.
//!
//! Progress flows out through a broadcast channel; the SSE layer subscribes
//! to it, the orchestrator never talks to the SSE layer directly.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex, Semaphore};

use crate::cluster::SearchCluster;
use crate::config::IngestConfig;
use crate::document::{Document, SourceType};
use crate::embedder::Embedder;
use crate::error::{Error, Result};
use crate::hashstore::HashStore;
use crate::retry::RetryPolicy;
use crate::sse;

/// Progress cadence: one `progress` event per this many documents.
const PROGRESS_EVERY: usize = 10;

/// Cap on the per-run error list.
const MAX_ERRORS: usize = 100;

// ---------------------------------------------------------------------------
// Vector store capability
// ---------------------------------------------------------------------------

/// Write side of the external vector store. The cluster does the searching;
/// this store is the durable vector artifact the ingest run maintains.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn put(&self, doc: &Document) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Events and stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum IngestEvent {
    Started { total: usize },
    Progress { processed: usize, total: usize },
    FileOk { path: String },
    FileErr { path: String, kind: &'static str, message: String },
    Completed { stats: IngestStats },
    Failed { message: String },
}

impl IngestEvent {
    pub fn to_sse(&self) -> sse::Event {
        match self {
            IngestEvent::Started { total } => {
                sse::Event::new("vectorize_started", serde_json::json!({ "total": total }))
            }
            IngestEvent::Progress { processed, total } => sse::Event::new(
                "vectorize_progress",
                serde_json::json!({ "processed": processed, "total": total }),
            ),
            IngestEvent::FileOk { path } => {
                sse::Event::new("file_processed", serde_json::json!({ "path": path }))
            }
            IngestEvent::FileErr { path, kind, message } => sse::Event::new(
                "file_error",
                serde_json::json!({ "path": path, "kind": kind, "message": message }),
            ),
            IngestEvent::Completed { stats } => {
                sse::Event::new("vectorize_completed", serde_json::json!(stats))
            }
            IngestEvent::Failed { message } => {
                sse::Event::new("vectorize_failed", serde_json::json!({ "message": message }))
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestStats {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub retries: usize,
    pub deleted: usize,
    pub errors: Vec<IngestError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestError {
    pub path: String,
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Stopping,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    cfg: IngestConfig,
    index_name: String,
    cluster: Arc<dyn SearchCluster>,
    vector_store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    hash_store: Arc<HashStore>,
    events: broadcast::Sender<IngestEvent>,
    state: std::sync::Mutex<RunState>,
    stop_tx: watch::Sender<bool>,
}

impl Orchestrator {
    pub fn new(
        cfg: IngestConfig,
        index_name: String,
        cluster: Arc<dyn SearchCluster>,
        vector_store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        hash_store: Arc<HashStore>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        let (stop_tx, _) = watch::channel(false);
        Self {
            cfg,
            index_name,
            cluster,
            vector_store,
            embedder,
            hash_store,
            events,
            state: std::sync::Mutex::new(RunState::Idle),
            stop_tx,
        }
    }

    /// Subscribe to the progress event feed.
    pub fn subscribe(&self) -> broadcast::Receiver<IngestEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> RunState {
        *self.state.lock().unwrap()
    }

    /// Request cancellation: stop enqueueing, drain in-flight work. Idempotent.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == RunState::Running {
            *state = RunState::Stopping;
            let _ = self.stop_tx.send(true);
        }
    }

    fn emit(&self, ev: IngestEvent) {
        let _ = self.events.send(ev);
    }

    /// Run one ingestion pass over already-read documents, grouped by source
    /// type. Returns per-run stats; individual document failures are recorded
    /// and do not abort the run.
    pub async fn run(
        &self,
        batches: Vec<(SourceType, Vec<Document>)>,
        dry_run: bool,
    ) -> Result<IngestStats> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != RunState::Idle {
                return Err(Error::Internal("ingestion already running".into()));
            }
            *state = RunState::Running;
        }
        let _ = self.stop_tx.send(false);

        let result = self.run_inner(batches, dry_run).await;

        *self.state.lock().unwrap() = RunState::Idle;
        match &result {
            Ok(stats) => self.emit(IngestEvent::Completed { stats: stats.clone() }),
            Err(e) => self.emit(IngestEvent::Failed { message: e.to_string() }),
        }
        result
    }

    async fn run_inner(
        &self,
        batches: Vec<(SourceType, Vec<Document>)>,
        dry_run: bool,
    ) -> Result<IngestStats> {
        let stats = Arc::new(Mutex::new(IngestStats::default()));

        // Enumerate: (path, hash) per file, then let the hash store classify.
        let mut to_embed: Vec<Document> = Vec::new();
        let mut deleted_paths: Vec<(SourceType, String)> = Vec::new();

        for (source, all_docs) in &batches {
            // Category exclusions apply before any hashing or writes.
            let docs: Vec<&Document> = all_docs
                .iter()
                .filter(|d| !self.cfg.excluded_categories.contains(&d.category))
                .collect();
            let excluded = all_docs.len() - docs.len();
            if excluded > 0 {
                stats.lock().await.skipped += excluded;
            }

            // File-level hash: digest over the per-document content hashes,
            // stable across runs for unchanged files.
            let mut by_file: BTreeMap<String, Vec<&Document>> = BTreeMap::new();
            for d in docs {
                by_file.entry(d.file_path.clone()).or_default().push(d);
            }
            let current: Vec<(String, String, u64)> = by_file
                .iter()
                .map(|(path, docs)| {
                    let mut joined = String::new();
                    for d in docs.iter() {
                        joined.push_str(&d.content_hash());
                    }
                    let size: u64 = docs.iter().map(|d| d.content.len() as u64).sum();
                    (path.clone(), format!("{:x}", md5::compute(joined.as_bytes())), size)
                })
                .collect();

            let classification = self.hash_store.classify(*source, &current)?;
            {
                let mut s = stats.lock().await;
                s.skipped += classification
                    .unchanged
                    .iter()
                    .map(|p| by_file.get(p).map(|v| v.len()).unwrap_or(0))
                    .sum::<usize>();
            }
            for pending in &classification.to_process {
                if let Some(docs) = by_file.get(&pending.path) {
                    to_embed.extend(docs.iter().map(|d| (*d).clone()));
                }
            }
            for path in classification.deleted {
                deleted_paths.push((*source, path));
            }
        }

        let total = to_embed.len();
        self.emit(IngestEvent::Started { total });
        tracing::info!(total = total, deleted = deleted_paths.len(), dry_run, "ingest run started");

        if dry_run {
            let mut s = stats.lock().await;
            s.processed = total;
            return Ok(s.clone());
        }

        // Embed + vector write, bounded parallel.
        let semaphore = Arc::new(Semaphore::new(self.cfg.concurrency.max(1)));
        let policy = RetryPolicy::new(self.cfg.retry_attempts, self.cfg.retry_delay());
        let mut handles = Vec::new();
        let mut stop_rx = self.stop_tx.subscribe();

        for doc in to_embed {
            if *stop_rx.borrow_and_update() {
                tracing::info!("cancellation requested, draining in-flight work");
                break;
            }
            let permit = semaphore.clone().acquire_owned().await.map_err(|_| Error::Canceled)?;
            let embedder = Arc::clone(&self.embedder);
            let vector_store = Arc::clone(&self.vector_store);
            let stats = Arc::clone(&stats);
            let events = self.events.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let path = doc.file_path.clone();
                let outcome = embed_and_store(&*embedder, &*vector_store, doc, &policy).await;
                let mut s = stats.lock().await;
                s.processed += 1;
                if s.processed % PROGRESS_EVERY == 0 {
                    let _ = events.send(IngestEvent::Progress { processed: s.processed, total });
                }
                match outcome {
                    Ok((doc, retries)) => {
                        s.retries += retries;
                        Some(doc)
                    }
                    Err(e) => {
                        s.failed += 1;
                        if s.errors.len() < MAX_ERRORS {
                            s.errors.push(IngestError {
                                path: path.clone(),
                                kind: e.kind().to_string(),
                                message: e.to_string(),
                            });
                        }
                        let _ = events.send(IngestEvent::FileErr {
                            path,
                            kind: e.kind(),
                            message: e.to_string(),
                        });
                        None
                    }
                }
            }));
        }

        let mut embedded: Vec<Document> = Vec::new();
        for h in handles {
            if let Ok(Some(doc)) = h.await {
                embedded.push(doc);
            }
        }

        // Bulk index to the search cluster, then reconcile per document.
        let mut failed_ids: HashMap<String, String> = HashMap::new();
        for chunk in embedded.chunks(self.cfg.bulk_batch_size.max(1)) {
            match self.cluster.bulk_index(&self.index_name, chunk).await {
                Ok(summary) => {
                    for (id, reason) in summary.failed {
                        failed_ids.insert(id, reason);
                    }
                }
                Err(e) => {
                    // Whole batch failed after the vector writes succeeded:
                    // every document in it is a partial write.
                    for doc in chunk {
                        failed_ids.insert(doc.id.clone(), e.to_string());
                    }
                }
            }
        }

        // Commit hashes per file, only when every document of the file made
        // it into both stores. Anything else surfaces as partial_write.
        let mut file_docs: BTreeMap<(SourceType, String), Vec<&Document>> = BTreeMap::new();
        for doc in &embedded {
            file_docs.entry((doc.source, doc.file_path.clone())).or_default().push(doc);
        }
        for ((source, path), docs) in file_docs {
            let bad: Vec<&&Document> =
                docs.iter().filter(|d| failed_ids.contains_key(&d.id)).collect();
            let mut s = stats.lock().await;
            if bad.is_empty() {
                let mut joined = String::new();
                for d in &docs {
                    joined.push_str(&d.content_hash());
                }
                let hash = format!("{:x}", md5::compute(joined.as_bytes()));
                let size: u64 = docs.iter().map(|d| d.content.len() as u64).sum();
                self.hash_store.commit(source, &path, &hash, size)?;
                s.succeeded += docs.len();
                let _ = self.events.send(IngestEvent::FileOk { path });
            } else {
                for d in bad {
                    let e = Error::PartialWrite {
                        id: d.id.clone(),
                        detail: failed_ids[&d.id].clone(),
                    };
                    s.failed += 1;
                    if s.errors.len() < MAX_ERRORS {
                        s.errors.push(IngestError {
                            path: path.clone(),
                            kind: e.kind().to_string(),
                            message: e.to_string(),
                        });
                    }
                    let _ = self.events.send(IngestEvent::FileErr {
                        path: path.clone(),
                        kind: e.kind(),
                        message: e.to_string(),
                    });
                }
            }
        }

        // Deletion sweep: search cluster first, vector store second, hash
        // record last, so a crash leaves a retriable state.
        for (source, path) in deleted_paths {
            match self.delete_path(source, &path).await {
                Ok(n) => {
                    let mut s = stats.lock().await;
                    s.deleted += n;
                }
                Err(e) => {
                    tracing::warn!(path = path.as_str(), error = %e, "deletion sweep entry failed");
                    let mut s = stats.lock().await;
                    if s.errors.len() < MAX_ERRORS {
                        s.errors.push(IngestError {
                            path,
                            kind: e.kind().to_string(),
                            message: e.to_string(),
                        });
                    }
                }
            }
        }

        let final_stats = stats.lock().await.clone();
        tracing::info!(
            processed = final_stats.processed,
            succeeded = final_stats.succeeded,
            failed = final_stats.failed,
            skipped = final_stats.skipped,
            deleted = final_stats.deleted,
            "ingest run finished"
        );
        Ok(final_stats)
    }

    async fn delete_path(&self, source: SourceType, path: &str) -> Result<usize> {
        let resp = self
            .cluster
            .term_search(&self.index_name, "file_path", &[path.to_string()])
            .await?;
        for hit in &resp.hits {
            self.cluster.delete_document(&self.index_name, &hit.id).await?;
        }
        for hit in &resp.hits {
            self.vector_store.delete(&hit.id).await?;
        }
        self.hash_store.remove(source, path)?;
        Ok(resp.hits.len())
    }
}

/// Embed one document and write it to the vector store, retrying per the
/// orchestrator's policy. Returns the enriched document and the retry count.
async fn embed_and_store(
    embedder: &dyn Embedder,
    vector_store: &dyn VectorStore,
    mut doc: Document,
    policy: &RetryPolicy,
) -> Result<(Document, usize)> {
    doc.validate()?;

    let attempts = std::sync::atomic::AtomicUsize::new(0);
    let embedding = policy
        .run(|| {
            attempts.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            embedder.embed(&doc.content)
        })
        .await
        .map_err(|e| Error::EmbeddingGeneration(e.to_string()))?;
    doc.embedding = Some(embedding);
    doc.indexed_at = chrono::Utc::now();

    vector_store
        .put(&doc)
        .await
        .map_err(|e| Error::VectorUpload(e.to_string()))?;

    let retries = attempts.load(std::sync::atomic::Ordering::Relaxed).saturating_sub(1);
    Ok((doc, retries))
}
