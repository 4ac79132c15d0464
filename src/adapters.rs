//! Query-time adapters: thin wrappers that turn chat prompts, bot mentions,
//! and tool calls into hybrid queries and format the results.

use async_trait::async_trait;
use regex::Regex;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::hybrid::{FusionMethod, HybridEngine, HybridQuery, HybridResult};
use crate::registry::{ToolDefinition, ToolHandler};

// ---------------------------------------------------------------------------
// Chat adapter
// ---------------------------------------------------------------------------

/// Chat completion seam; the model integration itself lives outside this
/// crate.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// Generic HTTP chat completion client: `{model, prompt}` in, `{completion}`
/// out. Provider-specific wiring stays outside the crate.
pub struct HttpChatModel {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    limiter: Arc<crate::ratelimit::RateLimiter>,
}

impl HttpChatModel {
    pub fn new(
        endpoint: String,
        model: String,
        timeout: Duration,
        limiter: Arc<crate::ratelimit::RateLimiter>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("chat client: {e}")))?;
        Ok(Self { client, endpoint, model, limiter })
    }
}

#[async_trait]
impl ChatModel for HttpChatModel {
    async fn complete(&self, prompt: &str) -> Result<String> {
        self.limiter.acquire("chat").await;
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "model": self.model, "prompt": prompt }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Error::from_status(resp.status().as_u16(), "chat completion", None));
        }
        let body: serde_json::Value =
            resp.json().await.map_err(|e| Error::Internal(format!("chat response: {e}")))?;
        body["completion"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::Internal("chat response missing completion".into()))
    }
}

pub struct ChatAdapter {
    engine: Arc<HybridEngine>,
    model: Arc<dyn ChatModel>,
    index_name: String,
}

impl ChatAdapter {
    pub fn new(engine: Arc<HybridEngine>, model: Arc<dyn ChatModel>, index_name: String) -> Self {
        Self { engine, model, index_name }
    }

    /// Retrieve context for the prompt, prepend it to the user message, and
    /// append a `title: url` reference list to the model's answer.
    pub async fn ask(&self, prompt: &str) -> Result<String> {
        let query = HybridQuery {
            query: prompt.to_string(),
            index_name: self.index_name.clone(),
            size: 5,
            ..Default::default()
        };
        let result = self.engine.search(&query).await?;

        let augmented = build_augmented_prompt(prompt, &result);
        let answer = self.model.complete(&augmented).await?;

        let refs = reference_lines(&result);
        if refs.is_empty() {
            Ok(answer)
        } else {
            Ok(format!("{answer}\n\nReferences:\n{refs}"))
        }
    }
}

fn doc_field<'a>(doc: &'a serde_json::Value, field: &str) -> &'a str {
    doc[field].as_str().unwrap_or("")
}

fn build_augmented_prompt(prompt: &str, result: &HybridResult) -> String {
    let mut context = String::new();
    for (i, doc) in result.fused_docs.iter().enumerate() {
        let title = doc_field(&doc.source, "title");
        let content = doc_field(&doc.source, "content");
        let snippet: String = content.chars().take(1500).collect();
        context.push_str(&format!("[{}] {title}\n{snippet}\n\n", i + 1));
    }
    if context.is_empty() {
        prompt.to_string()
    } else {
        format!("Use the following retrieved documents to answer.\n\n{context}---\n\n{prompt}")
    }
}

fn reference_lines(result: &HybridResult) -> String {
    result
        .fused_docs
        .iter()
        .filter_map(|d| {
            let title = doc_field(&d.source, "title");
            let url = doc_field(&d.source, "reference");
            if url.is_empty() {
                None
            } else {
                Some(format!("{title}: {url}"))
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ---------------------------------------------------------------------------
// Mention adapter
// ---------------------------------------------------------------------------

fn mention_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<@[A-Za-z0-9_]+>").unwrap())
}

pub struct MentionAdapter {
    engine: Arc<HybridEngine>,
    bot_id: String,
    index_name: String,
}

impl MentionAdapter {
    pub fn new(engine: Arc<HybridEngine>, bot_id: String, index_name: String) -> Self {
        Self { engine, bot_id, index_name }
    }

    /// Extract the query from a message that mentions the bot. Returns None
    /// when the bot is not addressed.
    pub fn extract_query(&self, text: &str) -> Option<String> {
        let tag = format!("<@{}>", self.bot_id);
        if !text.contains(&tag) {
            return None;
        }
        let stripped = mention_re().replace_all(text, "");
        let query = stripped.trim().to_string();
        if query.is_empty() {
            None
        } else {
            Some(query)
        }
    }

    /// Handle a channel message; replies with per-result blocks and a footer
    /// recording the search method used.
    pub async fn handle(&self, text: &str) -> Result<Option<String>> {
        let Some(query_text) = self.extract_query(text) else {
            return Ok(None);
        };
        let query = HybridQuery {
            query: query_text,
            index_name: self.index_name.clone(),
            size: 5,
            ..Default::default()
        };
        let result = self.engine.search(&query).await?;

        let mut reply = String::new();
        if result.fused_docs.is_empty() {
            reply.push_str("No matching documents found.\n");
        }
        for doc in &result.fused_docs {
            let title = doc_field(&doc.source, "title");
            let url = doc_field(&doc.source, "reference");
            let content = doc_field(&doc.source, "content");
            let snippet: String = content.chars().take(200).collect();
            reply.push_str(&format!("*{title}*\n{snippet}\n{url}\n\n"));
        }
        let method = serde_json::to_value(result.search_method)?;
        reply.push_str(&format!("_search: {}_", method.as_str().unwrap_or("unknown")));
        Ok(Some(reply))
    }
}

// ---------------------------------------------------------------------------
// Tool adapter
// ---------------------------------------------------------------------------

/// JSON Schema for the `hybrid_search` tool.
pub fn hybrid_search_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "query": { "type": "string", "description": "Search query text" },
            "top_k": { "type": "integer", "minimum": 1, "maximum": 100, "description": "Number of results (default: 10)" },
            "bm25_weight": { "type": "number", "minimum": 0, "maximum": 1, "description": "Lexical score weight (default: 0.5)" },
            "vector_weight": { "type": "number", "minimum": 0, "maximum": 1, "description": "Semantic score weight (default: 0.5)" },
            "fusion_method": { "type": "string", "enum": ["weighted_sum", "rrf"], "description": "Result fusion strategy (default: weighted_sum)" },
            "filters": { "type": "object", "description": "Keyword field filters (e.g. {\"category\": \"ops\"})" }
        },
        "required": ["query"]
    })
}

/// Validate and coerce tool parameters into a [`HybridQuery`].
pub fn params_to_query(index_name: &str, params: &serde_json::Value) -> Result<HybridQuery> {
    let query = params["query"]
        .as_str()
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .ok_or_else(|| Error::Validation("query is required".into()))?;

    let top_k = match params.get("top_k") {
        None | Some(serde_json::Value::Null) => 10,
        Some(v) => {
            let k = v
                .as_i64()
                .or_else(|| v.as_f64().map(|f| f as i64))
                .ok_or_else(|| Error::Validation("top_k must be an integer".into()))?;
            if !(1..=100).contains(&k) {
                return Err(Error::Validation(format!("top_k {k} outside [1, 100]")));
            }
            k as usize
        }
    };

    let weight = |key: &str, default: f64| -> Result<f64> {
        match params.get(key) {
            None | Some(serde_json::Value::Null) => Ok(default),
            Some(v) => {
                let w = v
                    .as_f64()
                    .ok_or_else(|| Error::Validation(format!("{key} must be a number")))?;
                if !(0.0..=1.0).contains(&w) {
                    return Err(Error::Validation(format!("{key} {w} outside [0, 1]")));
                }
                Ok(w)
            }
        }
    };

    let fusion_method = match params.get("fusion_method").and_then(|v| v.as_str()) {
        None => FusionMethod::WeightedSum,
        Some("weighted_sum") => FusionMethod::WeightedSum,
        Some("rrf") => FusionMethod::Rrf,
        Some(other) => {
            return Err(Error::Validation(format!("unknown fusion_method '{other}'")));
        }
    };

    let mut filters = std::collections::BTreeMap::new();
    if let Some(obj) = params.get("filters").and_then(|v| v.as_object()) {
        for (k, v) in obj {
            let value = v
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| v.to_string());
            filters.insert(k.clone(), value);
        }
    }

    Ok(HybridQuery {
        query: query.to_string(),
        index_name: index_name.to_string(),
        size: top_k,
        bm25_weight: weight("bm25_weight", 0.5)?,
        vector_weight: weight("vector_weight", 0.5)?,
        fusion_method,
        ..Default::default()
    })
}

/// Serialize a [`HybridResult`] for the tool-call envelope.
pub fn result_to_json(result: &HybridResult) -> serde_json::Value {
    serde_json::json!({
        "total": result.total,
        "search_method": result.search_method,
        "url_detected": result.url_detected,
        "fallback_reason": result.fallback_reason,
        "execution_time_ms": result.execution_time.as_millis() as u64,
        "documents": result.fused_docs,
    })
}

/// Build the `hybrid_search` tool definition bound to an engine.
pub fn hybrid_search_tool(engine: Arc<HybridEngine>, index_name: String) -> ToolDefinition {
    let handler: ToolHandler = Arc::new(move |params| {
        let engine = Arc::clone(&engine);
        let index_name = index_name.clone();
        Box::pin(async move {
            let query = params_to_query(&index_name, &params)?;
            let result = engine.search(&query).await?;
            Ok(result_to_json(&result))
        })
    });
    ToolDefinition::new(
        "hybrid_search",
        "Hybrid document search combining BM25 lexical ranking with dense-vector \
         k-NN, fused into a single ranked list. Detects URLs in the query and \
         short-circuits to exact reference lookup.",
        hybrid_search_schema(),
        handler,
    )
}

/// Default per-call deadline for tool execution.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);
