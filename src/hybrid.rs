//! Hybrid search engine: URL exact-match shortcut, concurrent BM25 + k-NN
//! retrieval, and deterministic result fusion with graceful fallback.

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use crate::cluster::{Bm25Params, KnnParams, SearchCluster, SearchHit, SearchResponse};
use crate::embedder::Embedder;
use crate::error::{Error, Result};

/// RRF rank constant.
const RRF_K0: f64 = 60.0;

// ---------------------------------------------------------------------------
// Query / result types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FusionMethod {
    #[default]
    WeightedSum,
    Rrf,
}

#[derive(Debug, Clone)]
pub struct HybridQuery {
    pub query: String,
    pub index_name: String,
    pub size: usize,
    pub bm25_weight: f64,
    pub vector_weight: f64,
    pub fusion_method: FusionMethod,
    pub use_secondary_language_analyzer: bool,
    pub timeout: Duration,
    pub filters: BTreeMap<String, String>,
    pub min_score: f64,
    /// k-NN candidate count; defaults to `2 * size` when zero.
    pub k: usize,
}

impl Default for HybridQuery {
    fn default() -> Self {
        Self {
            query: String::new(),
            index_name: String::new(),
            size: 10,
            bm25_weight: 0.5,
            vector_weight: 0.5,
            fusion_method: FusionMethod::WeightedSum,
            use_secondary_language_analyzer: false,
            timeout: Duration::from_secs(30),
            filters: BTreeMap::new(),
            min_score: 0.0,
            k: 0,
        }
    }
}

impl HybridQuery {
    pub fn validate(&self) -> Result<()> {
        if self.query.trim().is_empty() {
            return Err(Error::Validation("query is empty".into()));
        }
        if !(0.0..=1.0).contains(&self.bm25_weight) {
            return Err(Error::Validation(format!(
                "bm25_weight {} outside [0, 1]",
                self.bm25_weight
            )));
        }
        if !(0.0..=1.0).contains(&self.vector_weight) {
            return Err(Error::Validation(format!(
                "vector_weight {} outside [0, 1]",
                self.vector_weight
            )));
        }
        if self.size == 0 {
            return Err(Error::Validation("size must be at least 1".into()));
        }
        Ok(())
    }

    fn knn_k(&self) -> usize {
        if self.k > 0 { self.k } else { self.size * 2 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMethod {
    UrlExactMatch,
    HybridSearch,
    Bm25Only,
    VectorOnly,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct FusedDoc {
    pub id: String,
    pub fused_score: f64,
    pub source: serde_json::Value,
    pub rank_bm25: Option<usize>,
    pub rank_vector: Option<usize>,
}

#[derive(Debug)]
pub struct HybridResult {
    pub fused_docs: Vec<FusedDoc>,
    pub bm25_response: Option<SearchResponse>,
    pub vector_response: Option<SearchResponse>,
    pub execution_time: Duration,
    pub search_method: SearchMethod,
    pub url_detected: bool,
    pub fallback_reason: Option<String>,
    pub total: usize,
}

// ---------------------------------------------------------------------------
// URL detection
// ---------------------------------------------------------------------------

fn url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Angle brackets are a common chat-client wrapping; exclude them from the
    // match so `<https://…>` yields the bare URL.
    RE.get_or_init(|| Regex::new(r"https?://[^\s<>]+").unwrap())
}

/// First well-formed absolute URL in the query, if any.
pub fn extract_url(query: &str) -> Option<String> {
    for m in url_re().find_iter(query) {
        let candidate = m.as_str().trim_end_matches(['.', ',', '、', '。']);
        if url::Url::parse(candidate).is_ok() {
            return Some(candidate.to_string());
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Fusion
// ---------------------------------------------------------------------------

/// Min–max normalize a branch's scores to [0, 1]. A single-candidate branch
/// (max == min) normalizes to 1.0.
fn normalize(hits: &[SearchHit]) -> Vec<f64> {
    let min = hits.iter().map(|h| h.score).fold(f64::INFINITY, f64::min);
    let max = hits.iter().map(|h| h.score).fold(f64::NEG_INFINITY, f64::max);
    hits.iter()
        .map(|h| if (max - min).abs() < f64::EPSILON { 1.0 } else { (h.score - min) / (max - min) })
        .collect()
}

struct Candidate {
    source: serde_json::Value,
    score: f64,
    rank_bm25: Option<usize>,
    rank_vector: Option<usize>,
}

/// Fuse the two ranked lists into one score-sorted list.
///
/// Deterministic given the inputs: equal scores break toward the better BM25
/// rank, then lexicographic id.
pub fn fuse(
    bm25: &[SearchHit],
    vector: &[SearchHit],
    method: FusionMethod,
    bm25_weight: f64,
    vector_weight: f64,
) -> Vec<FusedDoc> {
    let mut merged: BTreeMap<String, Candidate> = BTreeMap::new();

    match method {
        FusionMethod::WeightedSum => {
            let bm25_norm = normalize(bm25);
            for (rank, (hit, norm)) in bm25.iter().zip(bm25_norm).enumerate() {
                let c = merged.entry(hit.id.clone()).or_insert_with(|| Candidate {
                    source: hit.source.clone(),
                    score: 0.0,
                    rank_bm25: None,
                    rank_vector: None,
                });
                c.score += bm25_weight * norm;
                c.rank_bm25 = Some(rank + 1);
            }
            let vec_norm = normalize(vector);
            for (rank, (hit, norm)) in vector.iter().zip(vec_norm).enumerate() {
                let c = merged.entry(hit.id.clone()).or_insert_with(|| Candidate {
                    source: hit.source.clone(),
                    score: 0.0,
                    rank_bm25: None,
                    rank_vector: None,
                });
                c.score += vector_weight * norm;
                c.rank_vector = Some(rank + 1);
            }
        }
        FusionMethod::Rrf => {
            for (rank, hit) in bm25.iter().enumerate() {
                let c = merged.entry(hit.id.clone()).or_insert_with(|| Candidate {
                    source: hit.source.clone(),
                    score: 0.0,
                    rank_bm25: None,
                    rank_vector: None,
                });
                c.score += 1.0 / (RRF_K0 + (rank + 1) as f64);
                c.rank_bm25 = Some(rank + 1);
            }
            for (rank, hit) in vector.iter().enumerate() {
                let c = merged.entry(hit.id.clone()).or_insert_with(|| Candidate {
                    source: hit.source.clone(),
                    score: 0.0,
                    rank_bm25: None,
                    rank_vector: None,
                });
                c.score += 1.0 / (RRF_K0 + (rank + 1) as f64);
                c.rank_vector = Some(rank + 1);
            }
        }
    }

    let mut docs: Vec<FusedDoc> = merged
        .into_iter()
        .map(|(id, c)| FusedDoc {
            id,
            fused_score: c.score,
            source: c.source,
            rank_bm25: c.rank_bm25,
            rank_vector: c.rank_vector,
        })
        .collect();

    docs.sort_by(|a, b| {
        b.fused_score
            .partial_cmp(&a.fused_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                let ra = a.rank_bm25.unwrap_or(usize::MAX);
                let rb = b.rank_bm25.unwrap_or(usize::MAX);
                ra.cmp(&rb)
            })
            .then_with(|| a.id.cmp(&b.id))
    });
    docs
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct HybridEngine {
    cluster: Arc<dyn SearchCluster>,
    embedder: Arc<dyn Embedder>,
}

impl HybridEngine {
    pub fn new(cluster: Arc<dyn SearchCluster>, embedder: Arc<dyn Embedder>) -> Self {
        Self { cluster, embedder }
    }

    pub async fn search(&self, q: &HybridQuery) -> Result<HybridResult> {
        q.validate()?;
        let start = Instant::now();

        // Step 1: URL shortcut.
        let url = extract_url(&q.query);
        if let Some(ref u) = url {
            let resp = self
                .cluster
                .term_search(&q.index_name, "reference", &[u.clone()])
                .await;
            if let Ok(resp) = resp {
                if !resp.hits.is_empty() {
                    let fused_docs: Vec<FusedDoc> = resp
                        .hits
                        .iter()
                        .map(|h| FusedDoc {
                            id: h.id.clone(),
                            fused_score: h.score,
                            source: h.source.clone(),
                            rank_bm25: None,
                            rank_vector: None,
                        })
                        .collect();
                    let total = fused_docs.len();
                    return Ok(HybridResult {
                        fused_docs,
                        bm25_response: Some(resp),
                        vector_response: None,
                        execution_time: start.elapsed(),
                        search_method: SearchMethod::UrlExactMatch,
                        url_detected: true,
                        fallback_reason: None,
                        total,
                    });
                }
            }
            // No exact hit (or the lookup failed): fall through to hybrid.
        }

        // Step 2: parallel dual retrieval.
        let bm25_params = Bm25Params {
            query: q.query.clone(),
            size: q.size * 2,
            use_secondary_language_analyzer: q.use_secondary_language_analyzer,
            filters: q.filters.clone(),
            timeout: q.timeout,
        };
        let bm25_fut = self.cluster.bm25_search(&q.index_name, &bm25_params);
        let vector_fut = self.vector_branch(q);
        let (bm25_res, vector_res) = tokio::join!(bm25_fut, vector_fut);

        if let Err(ref e) = bm25_res {
            tracing::warn!(error = %e, "bm25 branch failed");
        }

        // Steps 3–4 with fallback policy.
        match (bm25_res, vector_res) {
            (Ok(bm25), Ok(vector)) => {
                let fused = fuse(
                    &bm25.hits,
                    &vector.hits,
                    q.fusion_method,
                    q.bm25_weight,
                    q.vector_weight,
                );
                Ok(self.finish(q, fused, Some(bm25), Some(vector), start, SearchMethod::HybridSearch, url.is_some(), None))
            }
            (Ok(bm25), Err(e)) => {
                let reason = if matches!(e, Error::EmbeddingGeneration(_)) {
                    "embedding_failed".to_string()
                } else {
                    e.kind().to_string()
                };
                let fused = fuse(&bm25.hits, &[], q.fusion_method, q.bm25_weight, q.vector_weight);
                Ok(self.finish(q, fused, Some(bm25), None, start, SearchMethod::Bm25Only, url.is_some(), Some(reason)))
            }
            (Err(e), Ok(vector)) => {
                let fused = fuse(&[], &vector.hits, q.fusion_method, q.bm25_weight, q.vector_weight);
                Ok(self.finish(q, fused, None, Some(vector), start, SearchMethod::VectorOnly, url.is_some(), Some(e.kind().to_string())))
            }
            (Err(b), Err(v)) => Err(Error::SearchUnavailable(format!(
                "bm25: {b}; vector: {v}"
            ))),
        }
    }

    async fn vector_branch(&self, q: &HybridQuery) -> Result<SearchResponse> {
        let embedding = self
            .embedder
            .embed(&q.query)
            .await
            .map_err(|e| Error::EmbeddingGeneration(e.to_string()))?;
        let params = KnnParams {
            embedding,
            k: q.knn_k(),
            filters: q.filters.clone(),
            timeout: q.timeout,
        };
        self.cluster.vector_search(&q.index_name, &params).await
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        q: &HybridQuery,
        mut fused: Vec<FusedDoc>,
        bm25: Option<SearchResponse>,
        vector: Option<SearchResponse>,
        start: Instant,
        method: SearchMethod,
        url_detected: bool,
        fallback_reason: Option<String>,
    ) -> HybridResult {
        fused.retain(|d| d.fused_score >= q.min_score);
        fused.truncate(q.size);
        let total = fused.len();
        HybridResult {
            fused_docs: fused,
            bm25_response: bm25,
            vector_response: vector,
            execution_time: start.elapsed(),
            search_method: method,
            url_detected,
            fallback_reason,
            total,
        }
    }
}
