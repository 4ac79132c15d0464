//! Canonical document model: the one record shape every reader produces and
//! both stores index.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};

/// Accepted embedding dimensionalities (must match a cluster-side HNSW field).
pub const ALLOWED_DIMS: [usize; 6] = [384, 512, 768, 1024, 1536, 3072];

const MAX_ID_BYTES: usize = 512;
const MAX_TITLE_BYTES: usize = 1000;
const MAX_CONTENT_BYTES: usize = 10 * 1024 * 1024;
const MAX_EMBEDDING_ABS: f32 = 1e10;

// ---------------------------------------------------------------------------
// Source type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Markdown,
    Csv,
    Chat,
    Other,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Markdown => "markdown",
            SourceType::Csv => "csv",
            SourceType::Chat => "chat",
            SourceType::Other => "other",
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub title: String,
    pub content: String,
    /// Language-normalized variant indexed under the secondary analyzer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_secondary: Option<String>,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub author: String,
    /// Canonical URL/URI used for exact-match lookup.
    #[serde(default)]
    pub reference: String,
    pub source: SourceType,
    #[serde(default)]
    pub file_path: String,
    #[serde(default)]
    pub word_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub indexed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<u32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_fields: BTreeMap<String, serde_json::Value>,
}

impl Document {
    /// A minimally valid document; readers fill the rest in.
    pub fn new(id: impl Into<String>, title: impl Into<String>, content: impl Into<String>, source: SourceType) -> Self {
        let now = Utc::now();
        let content = content.into();
        let word_count = content.split_whitespace().count();
        Self {
            id: id.into(),
            title: title.into(),
            content,
            content_secondary: None,
            category: String::new(),
            tags: BTreeSet::new(),
            author: String::new(),
            reference: String::new(),
            source,
            file_path: String::new(),
            word_count,
            created_at: now,
            updated_at: now,
            indexed_at: now,
            embedding: None,
            chunk_index: None,
            total_chunks: None,
            custom_fields: BTreeMap::new(),
        }
    }

    /// 128-bit content digest, lowercase hex. Drives change detection in the
    /// hash store.
    pub fn content_hash(&self) -> String {
        format!("{:x}", md5::compute(self.content.as_bytes()))
    }

    /// Enforce every model rule; first violation wins.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::Validation("document id is empty".into()));
        }
        if self.id.len() > MAX_ID_BYTES {
            return Err(Error::Validation(format!(
                "document id exceeds {MAX_ID_BYTES} bytes"
            )));
        }
        if self.title.is_empty() {
            return Err(Error::Validation(format!("document '{}': title is empty", self.id)));
        }
        if self.title.len() > MAX_TITLE_BYTES {
            return Err(Error::Validation(format!(
                "document '{}': title exceeds {MAX_TITLE_BYTES} bytes",
                self.id
            )));
        }
        if self.content.is_empty() {
            return Err(Error::Validation(format!("document '{}': content is empty", self.id)));
        }
        if self.content.len() > MAX_CONTENT_BYTES {
            return Err(Error::Validation(format!(
                "document '{}': content exceeds {} bytes",
                self.id, MAX_CONTENT_BYTES
            )));
        }

        let horizon = Utc::now() + ChronoDuration::hours(1);
        for (name, ts) in [
            ("created_at", self.created_at),
            ("updated_at", self.updated_at),
            ("indexed_at", self.indexed_at),
        ] {
            if ts.timestamp() == 0 && ts.timestamp_subsec_nanos() == 0 {
                return Err(Error::Validation(format!(
                    "document '{}': {name} is zero",
                    self.id
                )));
            }
            if ts > horizon {
                return Err(Error::Validation(format!(
                    "document '{}': {name} is more than 1 hour in the future",
                    self.id
                )));
            }
        }
        if self.created_at > self.updated_at {
            return Err(Error::Validation(format!(
                "document '{}': created_at is after updated_at",
                self.id
            )));
        }

        if let Some(ref emb) = self.embedding {
            if !ALLOWED_DIMS.contains(&emb.len()) {
                return Err(Error::Validation(format!(
                    "document '{}': embedding dimension {} not in {:?}",
                    self.id,
                    emb.len(),
                    ALLOWED_DIMS
                )));
            }
            for (i, v) in emb.iter().enumerate() {
                if !v.is_finite() {
                    return Err(Error::Validation(format!(
                        "document '{}': embedding[{i}] is not finite",
                        self.id
                    )));
                }
                if v.abs() > MAX_EMBEDDING_ABS {
                    return Err(Error::Validation(format!(
                        "document '{}': embedding[{i}] magnitude exceeds {MAX_EMBEDDING_ABS}",
                        self.id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Serialize to the cluster wire schema (field names per the index
    /// mapping; RFC3339 dates).
    pub fn to_index_json(&self) -> serde_json::Value {
        let mut obj = serde_json::json!({
            "id": self.id,
            "title": self.title,
            "content": self.content,
            "category": self.category,
            "tags": self.tags,
            "author": self.author,
            "reference": self.reference,
            "source": self.source.as_str(),
            "file_path": self.file_path,
            "word_count": self.word_count,
            "created_at": self.created_at.to_rfc3339(),
            "updated_at": self.updated_at.to_rfc3339(),
            "indexed_at": self.indexed_at.to_rfc3339(),
        });
        let map = obj.as_object_mut().unwrap();
        if let Some(ref cs) = self.content_secondary {
            map.insert("content_secondary".into(), serde_json::json!(cs));
        }
        if let Some(ref emb) = self.embedding {
            map.insert("embedding".into(), serde_json::json!(emb));
        }
        if let Some(ci) = self.chunk_index {
            map.insert("chunk_index".into(), serde_json::json!(ci));
        }
        if let Some(tc) = self.total_chunks {
            map.insert("total_chunks".into(), serde_json::json!(tc));
        }
        if !self.custom_fields.is_empty() {
            map.insert("custom_fields".into(), serde_json::json!(self.custom_fields));
        }
        obj
    }

    /// Parse a cluster hit `_source` back into a Document.
    pub fn from_index_json(v: &serde_json::Value) -> Result<Document> {
        serde_json::from_value(v.clone())
            .map_err(|e| Error::SearchMapping(format!("document parse: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_doc() -> Document {
        let mut d = Document::new("doc-1", "Title", "Some body text here", SourceType::Markdown);
        d.reference = "https://example.com/doc-1".into();
        d
    }

    #[test]
    fn valid_document_passes() {
        assert!(valid_doc().validate().is_ok());
    }

    #[test]
    fn empty_fields_rejected() {
        let mut d = valid_doc();
        d.id = String::new();
        assert!(d.validate().is_err());

        let mut d = valid_doc();
        d.title = String::new();
        assert!(d.validate().is_err());

        let mut d = valid_doc();
        d.content = String::new();
        assert!(d.validate().is_err());
    }

    #[test]
    fn oversized_fields_rejected() {
        let mut d = valid_doc();
        d.id = "x".repeat(513);
        assert!(d.validate().is_err());

        let mut d = valid_doc();
        d.title = "x".repeat(1001);
        assert!(d.validate().is_err());
    }

    #[test]
    fn timestamp_ordering() {
        let mut d = valid_doc();
        d.created_at = d.updated_at + ChronoDuration::seconds(1);
        assert!(d.validate().is_err());

        let mut d = valid_doc();
        d.updated_at = Utc::now() + ChronoDuration::hours(2);
        assert!(d.validate().is_err());
    }

    #[test]
    fn embedding_rules() {
        let mut d = valid_doc();
        d.embedding = Some(vec![0.1; 384]);
        assert!(d.validate().is_ok());

        d.embedding = Some(vec![0.1; 100]);
        assert!(d.validate().is_err());

        let mut bad = vec![0.1; 768];
        bad[5] = f32::NAN;
        d.embedding = Some(bad);
        assert!(d.validate().is_err());

        let mut big = vec![0.1; 768];
        big[0] = 2e10;
        d.embedding = Some(big);
        assert!(d.validate().is_err());
    }

    #[test]
    fn content_hash_is_stable_128_bit_hex() {
        let d = valid_doc();
        let h = d.content_hash();
        assert_eq!(h.len(), 32);
        assert_eq!(h, d.clone().content_hash());

        let mut d2 = d.clone();
        d2.content.push('!');
        assert_ne!(h, d2.content_hash());
    }

    #[test]
    fn wire_roundtrip_preserves_fields() {
        let mut d = valid_doc();
        d.tags.insert("a".into());
        d.tags.insert("b".into());
        d.embedding = Some(vec![0.5; 384]);
        d.chunk_index = Some(2);
        d.total_chunks = Some(5);

        let wire = d.to_index_json();
        let back = Document::from_index_json(&wire).unwrap();
        assert_eq!(back.id, d.id);
        assert_eq!(back.title, d.title);
        assert_eq!(back.content, d.content);
        assert_eq!(back.tags, d.tags);
        assert_eq!(back.embedding, d.embedding);
        assert_eq!(back.chunk_index, Some(2));
        assert_eq!(back.created_at, d.created_at);
    }
}
