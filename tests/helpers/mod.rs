//! Shared stubs for integration tests: an in-memory search cluster, a canned
//! cluster for scripted branch outcomes, and a fixed-vector embedder.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use ragserver::cluster::{
    Bm25Params, BulkSummary, ClusterHealth, KnnParams, SearchCluster, SearchHit, SearchResponse,
};
use ragserver::document::Document;
use ragserver::embedder::{Embedder, ModelInfo};
use ragserver::error::{Error, Result};

// ---------------------------------------------------------------------------
// Fixed embedder
// ---------------------------------------------------------------------------

pub struct FixedEmbedder {
    pub dim: usize,
    pub fail: bool,
    pub calls: Mutex<usize>,
}

impl FixedEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim, fail: false, calls: Mutex::new(0) }
    }

    pub fn failing(dim: usize) -> Self {
        Self { dim, fail: true, calls: Mutex::new(0) }
    }

    pub fn call_count(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl Embedder for FixedEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        *self.calls.lock().unwrap() += 1;
        if self.fail {
            return Err(Error::EmbeddingGeneration("stub embedder down".into()));
        }
        Ok(vec![0.5; self.dim])
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo { name: "fixed".into(), dimension: self.dim }
    }
}

// ---------------------------------------------------------------------------
// In-memory cluster (ingest tests)
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryCluster {
    pub docs: Mutex<BTreeMap<String, serde_json::Value>>,
    /// Ids whose bulk-index action reports a failure.
    pub fail_ids: Mutex<HashSet<String>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn indexed_ids(&self) -> Vec<String> {
        self.docs.lock().unwrap().keys().cloned().collect()
    }

    pub fn fail_id(&self, id: &str) {
        self.fail_ids.lock().unwrap().insert(id.to_string());
    }

    fn scan_by_field(&self, field: &str, values: &[String]) -> Vec<SearchHit> {
        self.docs
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, src)| {
                src[field]
                    .as_str()
                    .map(|v| values.iter().any(|w| w == v))
                    .unwrap_or(false)
            })
            .map(|(id, src)| SearchHit { id: id.clone(), score: 1.0, source: src.clone() })
            .collect()
    }
}

#[async_trait]
impl SearchCluster for MemoryCluster {
    async fn bm25_search(&self, _index: &str, params: &Bm25Params) -> Result<SearchResponse> {
        let hits: Vec<SearchHit> = self
            .docs
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, src)| {
                src["content"]
                    .as_str()
                    .map(|c| c.contains(params.query.as_str()))
                    .unwrap_or(false)
            })
            .map(|(id, src)| SearchHit { id: id.clone(), score: 1.0, source: src.clone() })
            .take(params.size)
            .collect();
        let total = hits.len();
        Ok(SearchResponse { hits, total, took_ms: 1 })
    }

    async fn vector_search(&self, _index: &str, params: &KnnParams) -> Result<SearchResponse> {
        let hits: Vec<SearchHit> = self
            .docs
            .lock()
            .unwrap()
            .iter()
            .map(|(id, src)| SearchHit { id: id.clone(), score: 0.9, source: src.clone() })
            .take(params.k)
            .collect();
        let total = hits.len();
        Ok(SearchResponse { hits, total, took_ms: 1 })
    }

    async fn term_search(
        &self,
        _index: &str,
        field: &str,
        values: &[String],
    ) -> Result<SearchResponse> {
        let hits = self.scan_by_field(field, values);
        let total = hits.len();
        Ok(SearchResponse { hits, total, took_ms: 1 })
    }

    async fn bulk_index(&self, _index: &str, docs: &[Document]) -> Result<BulkSummary> {
        let mut summary = BulkSummary::default();
        let fail = self.fail_ids.lock().unwrap();
        let mut store = self.docs.lock().unwrap();
        for doc in docs {
            if fail.contains(&doc.id) {
                summary.failed.push((doc.id.clone(), "forced failure".into()));
            } else {
                store.insert(doc.id.clone(), doc.to_index_json());
                summary.indexed += 1;
            }
        }
        Ok(summary)
    }

    async fn create_index(&self, _index: &str, _dimension: usize) -> Result<()> {
        Ok(())
    }

    async fn delete_document(&self, _index: &str, id: &str) -> Result<()> {
        self.docs.lock().unwrap().remove(id);
        Ok(())
    }

    async fn health(&self) -> Result<ClusterHealth> {
        Ok(ClusterHealth { status: "green".into(), nodes: 1 })
    }
}

// ---------------------------------------------------------------------------
// Canned cluster (hybrid engine tests)
// ---------------------------------------------------------------------------

/// Scripted branch outcome. Errors are rebuilt on demand because the error
/// type is not Clone.
pub enum Canned {
    Hits(Vec<SearchHit>),
    Fail(&'static str),
}

impl Canned {
    fn to_result(&self) -> Result<SearchResponse> {
        match self {
            Canned::Hits(hits) => Ok(SearchResponse {
                hits: hits.clone(),
                total: hits.len(),
                took_ms: 1,
            }),
            Canned::Fail(msg) => Err(Error::SearchQuery((*msg).into())),
        }
    }
}

pub struct CannedCluster {
    pub bm25: Canned,
    pub vector: Canned,
    pub term: Canned,
}

impl CannedCluster {
    pub fn empty() -> Self {
        Self {
            bm25: Canned::Hits(Vec::new()),
            vector: Canned::Hits(Vec::new()),
            term: Canned::Hits(Vec::new()),
        }
    }
}

pub fn hit(id: &str, score: f64) -> SearchHit {
    SearchHit {
        id: id.to_string(),
        score,
        source: serde_json::json!({
            "id": id,
            "title": format!("title of {id}"),
            "content": format!("content of {id}"),
            "reference": format!("https://example.com/{id}"),
        }),
    }
}

#[async_trait]
impl SearchCluster for CannedCluster {
    async fn bm25_search(&self, _index: &str, _params: &Bm25Params) -> Result<SearchResponse> {
        self.bm25.to_result()
    }

    async fn vector_search(&self, _index: &str, _params: &KnnParams) -> Result<SearchResponse> {
        self.vector.to_result()
    }

    async fn term_search(
        &self,
        _index: &str,
        _field: &str,
        _values: &[String],
    ) -> Result<SearchResponse> {
        self.term.to_result()
    }

    async fn bulk_index(&self, _index: &str, _docs: &[Document]) -> Result<BulkSummary> {
        Ok(BulkSummary::default())
    }

    async fn create_index(&self, _index: &str, _dimension: usize) -> Result<()> {
        Ok(())
    }

    async fn delete_document(&self, _index: &str, _id: &str) -> Result<()> {
        Ok(())
    }

    async fn health(&self) -> Result<ClusterHealth> {
        Ok(ClusterHealth { status: "green".into(), nodes: 1 })
    }
}

// ---------------------------------------------------------------------------
// In-memory vector store
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryVectorStore {
    pub docs: Mutex<HashMap<String, Document>>,
    pub fail_puts: Mutex<bool>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.docs.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl ragserver::ingest::VectorStore for MemoryVectorStore {
    async fn put(&self, doc: &Document) -> Result<()> {
        if *self.fail_puts.lock().unwrap() {
            return Err(Error::VectorUpload("stub store down".into()));
        }
        self.docs.lock().unwrap().insert(doc.id.clone(), doc.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.docs.lock().unwrap().remove(id);
        Ok(())
    }
}
