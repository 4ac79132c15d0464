//! Search cluster client: BM25, k-NN, and term queries plus bulk indexing
//! against an OpenSearch-compatible REST API.
//!
//! The [`SearchCluster`] trait is the capability seam; the hybrid engine and
//! the ingest orchestrator only ever see the trait, so tests run on stubs.

use async_trait::async_trait;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ClusterConfig;
use crate::document::Document;
use crate::error::{Error, Result};
use crate::ratelimit::RateLimiter;
use crate::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: String,
    pub score: f64,
    pub source: serde_json::Value,
}

#[derive(Debug, Clone, Default)]
pub struct SearchResponse {
    pub hits: Vec<SearchHit>,
    pub total: usize,
    pub took_ms: u64,
}

/// Parameters shared by the BM25 branch of a hybrid query.
#[derive(Debug, Clone)]
pub struct Bm25Params {
    pub query: String,
    pub size: usize,
    pub use_secondary_language_analyzer: bool,
    pub filters: BTreeMap<String, String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct KnnParams {
    pub embedding: Vec<f32>,
    pub k: usize,
    pub filters: BTreeMap<String, String>,
    pub timeout: Duration,
}

#[derive(Debug, Default)]
pub struct BulkSummary {
    pub indexed: usize,
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct ClusterHealth {
    pub status: String,
    pub nodes: usize,
}

// ---------------------------------------------------------------------------
// Capability trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait SearchCluster: Send + Sync {
    async fn bm25_search(&self, index: &str, params: &Bm25Params) -> Result<SearchResponse>;

    async fn vector_search(&self, index: &str, params: &KnnParams) -> Result<SearchResponse>;

    /// Exact keyword lookup, used by the URL shortcut.
    async fn term_search(
        &self,
        index: &str,
        field: &str,
        values: &[String],
    ) -> Result<SearchResponse>;

    /// Bulk-index documents; partial failure is reported per document.
    async fn bulk_index(&self, index: &str, docs: &[Document]) -> Result<BulkSummary>;

    async fn create_index(&self, index: &str, dimension: usize) -> Result<()>;

    async fn delete_document(&self, index: &str, id: &str) -> Result<()>;

    async fn health(&self) -> Result<ClusterHealth>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

pub struct HttpSearchCluster {
    client: reqwest::Client,
    endpoint: String,
    policy: RetryPolicy,
    limiter: Arc<RateLimiter>,
}

impl HttpSearchCluster {
    pub fn new(cfg: &ClusterConfig, limiter: Arc<RateLimiter>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(cfg.connect_timeout())
            .timeout(cfg.request_timeout())
            .pool_max_idle_per_host(cfg.idle_connections)
            .pool_idle_timeout(cfg.idle_timeout())
            .build()
            .map_err(|e| Error::Internal(format!("cluster client: {e}")))?;
        Ok(Self {
            client,
            endpoint: cfg.endpoint.trim_end_matches('/').to_string(),
            policy: RetryPolicy::new(cfg.max_retries, cfg.retry_delay()),
            limiter,
        })
    }

    async fn post_json(
        &self,
        path: &str,
        body: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value> {
        self.limiter.acquire("cluster").await;
        let url = format!("{}{path}", self.endpoint);
        self.policy
            .run(|| {
                // Request builders are single-use; rebuild per attempt.
                let mut req = self.client.post(&url).json(&body);
                if let Some(t) = timeout {
                    req = req.timeout(t);
                }
                async move {
                    let resp = req.send().await?;
                    let status = resp.status();
                    if !status.is_success() {
                        let retry_after = resp
                            .headers()
                            .get("retry-after")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|s| s.parse::<u64>().ok())
                            .map(Duration::from_secs);
                        return Err(Error::from_status(status.as_u16(), path, retry_after));
                    }
                    resp.json().await.map_err(|e| Error::SearchQuery(format!("{path}: {e}")))
                }
            })
            .await
    }

    fn parse_search_response(body: &serde_json::Value) -> SearchResponse {
        let took_ms = body["took"].as_u64().unwrap_or(0);
        let total = body["hits"]["total"]["value"].as_u64().unwrap_or(0) as usize;
        let hits = body["hits"]["hits"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .map(|h| SearchHit {
                        id: h["_id"].as_str().unwrap_or_default().to_string(),
                        score: h["_score"].as_f64().unwrap_or(0.0),
                        source: h["_source"].clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        SearchResponse { hits, total, took_ms }
    }

    fn filter_clauses(filters: &BTreeMap<String, String>) -> Vec<serde_json::Value> {
        filters
            .iter()
            .map(|(k, v)| {
                let mut term = serde_json::Map::new();
                term.insert(k.clone(), serde_json::Value::String(v.clone()));
                json!({ "term": term })
            })
            .collect()
    }
}

#[async_trait]
impl SearchCluster for HttpSearchCluster {
    async fn bm25_search(&self, index: &str, params: &Bm25Params) -> Result<SearchResponse> {
        // Secondary-language analyzer, when requested, takes over the content
        // field; title stays on the default analyzer.
        let fields = if params.use_secondary_language_analyzer {
            json!(["title^2", "content_secondary", "content"])
        } else {
            json!(["title^2", "content"])
        };
        let body = json!({
            "size": params.size,
            "query": {
                "bool": {
                    "must": [{ "multi_match": { "query": params.query, "fields": fields } }],
                    "filter": Self::filter_clauses(&params.filters),
                }
            }
        });
        let resp = self
            .post_json(&format!("/{index}/_search"), body, Some(params.timeout))
            .await?;
        Ok(Self::parse_search_response(&resp))
    }

    async fn vector_search(&self, index: &str, params: &KnnParams) -> Result<SearchResponse> {
        let mut knn = json!({ "vector": params.embedding, "k": params.k });
        if !params.filters.is_empty() {
            knn["filter"] = json!({ "bool": { "filter": Self::filter_clauses(&params.filters) } });
        }
        let body = json!({
            "size": params.k,
            "query": { "knn": { "embedding": knn } }
        });
        let resp = self
            .post_json(&format!("/{index}/_search"), body, Some(params.timeout))
            .await?;
        Ok(Self::parse_search_response(&resp))
    }

    async fn term_search(
        &self,
        index: &str,
        field: &str,
        values: &[String],
    ) -> Result<SearchResponse> {
        let mut terms = serde_json::Map::new();
        terms.insert(field.to_string(), json!(values));
        let body = json!({ "query": { "terms": terms } });
        let resp = self.post_json(&format!("/{index}/_search"), body, None).await?;
        Ok(Self::parse_search_response(&resp))
    }

    async fn bulk_index(&self, index: &str, docs: &[Document]) -> Result<BulkSummary> {
        if docs.is_empty() {
            return Ok(BulkSummary::default());
        }

        // Newline-delimited action/document pairs.
        let mut ndjson = String::new();
        for doc in docs {
            ndjson.push_str(&serde_json::to_string(&json!({
                "index": { "_index": index, "_id": doc.id }
            }))?);
            ndjson.push('\n');
            ndjson.push_str(&serde_json::to_string(&doc.to_index_json())?);
            ndjson.push('\n');
        }

        self.limiter.acquire("cluster").await;
        let total = docs.len();
        let resp = self
            .policy
            .run(|| {
                let req = self
                    .client
                    .post(format!("{}/_bulk", self.endpoint))
                    .header("content-type", "application/x-ndjson")
                    .body(ndjson.clone());
                async move {
                    let resp = req.send().await?;
                    let status = resp.status();
                    if !status.is_success() {
                        return Err(Error::from_status(status.as_u16(), "_bulk", None));
                    }
                    resp.json::<serde_json::Value>().await.map_err(|e| Error::SearchBulkIndex {
                        failed: total,
                        total,
                        reasons: vec![e.to_string()],
                    })
                }
            })
            .await?;

        // Partial batch success is accepted; failures are reported per doc.
        let mut summary = BulkSummary::default();
        if let Some(items) = resp["items"].as_array() {
            for item in items {
                let action = &item["index"];
                let id = action["_id"].as_str().unwrap_or_default().to_string();
                if let Some(err) = action.get("error") {
                    summary.failed.push((id, err["reason"].as_str().unwrap_or("?").to_string()));
                } else {
                    summary.indexed += 1;
                }
            }
        } else {
            summary.indexed = docs.len();
        }
        Ok(summary)
    }

    async fn create_index(&self, index: &str, dimension: usize) -> Result<()> {
        let body = json!({
            "settings": { "index": { "knn": true } },
            "mappings": {
                "properties": {
                    "id": { "type": "keyword" },
                    "title": { "type": "text" },
                    "content": { "type": "text" },
                    "content_secondary": { "type": "text", "analyzer": "kuromoji" },
                    "category": { "type": "keyword" },
                    "tags": { "type": "keyword" },
                    "source": { "type": "keyword" },
                    "author": { "type": "keyword" },
                    "reference": { "type": "keyword" },
                    "file_path": { "type": "keyword" },
                    "created_at": { "type": "date" },
                    "updated_at": { "type": "date" },
                    "indexed_at": { "type": "date" },
                    "word_count": { "type": "integer" },
                    "chunk_index": { "type": "integer" },
                    "total_chunks": { "type": "integer" },
                    "custom_fields": { "type": "object", "enabled": false },
                    "embedding": {
                        "type": "knn_vector",
                        "dimension": dimension,
                        "method": {
                            "name": "hnsw",
                            "space_type": "cosinesimil",
                            "engine": "lucene"
                        }
                    }
                }
            }
        });

        self.limiter.acquire("cluster").await;
        self.policy
            .run(|| {
                let req = self.client.put(format!("{}/{index}", self.endpoint)).json(&body);
                async move {
                    let resp = req.send().await?;
                    let status = resp.status();
                    // 400 resource_already_exists is fine for an idempotent create.
                    if status.as_u16() == 400 {
                        let body: serde_json::Value = resp.json().await.unwrap_or_default();
                        let t = body["error"]["type"].as_str().unwrap_or("");
                        if t == "resource_already_exists_exception" {
                            return Ok(());
                        }
                        return Err(Error::SearchMapping(format!("create {index}: {t}")));
                    }
                    if !status.is_success() {
                        return Err(Error::from_status(status.as_u16(), "create_index", None));
                    }
                    Ok(())
                }
            })
            .await
    }

    async fn delete_document(&self, index: &str, id: &str) -> Result<()> {
        self.limiter.acquire("cluster").await;
        self.policy
            .run(|| {
                let req = self.client.delete(format!("{}/{index}/_doc/{id}", self.endpoint));
                async move {
                    let resp = req.send().await?;
                    let status = resp.status();
                    // A missing document is already deleted.
                    if status.as_u16() == 404 || status.is_success() {
                        return Ok(());
                    }
                    Err(Error::from_status(status.as_u16(), "delete", None))
                }
            })
            .await
    }

    async fn health(&self) -> Result<ClusterHealth> {
        self.limiter.acquire("cluster").await;
        let resp = self
            .client
            .get(format!("{}/_cluster/health", self.endpoint))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Error::from_status(resp.status().as_u16(), "health", None));
        }
        let body: serde_json::Value =
            resp.json().await.map_err(|e| Error::SearchConnection(e.to_string()))?;
        Ok(ClusterHealth {
            status: body["status"].as_str().unwrap_or("unknown").to_string(),
            nodes: body["number_of_nodes"].as_u64().unwrap_or(0) as usize,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_search_response_shapes() {
        let body = json!({
            "took": 12,
            "hits": {
                "total": { "value": 2 },
                "hits": [
                    { "_id": "a", "_score": 3.2, "_source": { "title": "A" } },
                    { "_id": "b", "_score": 1.1, "_source": { "title": "B" } }
                ]
            }
        });
        let resp = HttpSearchCluster::parse_search_response(&body);
        assert_eq!(resp.total, 2);
        assert_eq!(resp.took_ms, 12);
        assert_eq!(resp.hits[0].id, "a");
        assert!((resp.hits[0].score - 3.2).abs() < 1e-9);
    }

    #[test]
    fn parse_empty_response() {
        let resp = HttpSearchCluster::parse_search_response(&json!({}));
        assert_eq!(resp.total, 0);
        assert!(resp.hits.is_empty());
    }

    #[test]
    fn filters_become_term_clauses() {
        let mut filters = BTreeMap::new();
        filters.insert("category".to_string(), "ops".to_string());
        let clauses = HttpSearchCluster::filter_clauses(&filters);
        assert_eq!(clauses, vec![json!({ "term": { "category": "ops" } })]);
    }
}
