//! Vector store implementations behind the [`VectorStore`] capability.
//!
//! Production deployments point this at an object-store bucket; the embedded
//! sled variant keeps the same dual-write semantics for local runs and tests.

use async_trait::async_trait;
use std::path::Path;

use crate::document::Document;
use crate::error::{Error, Result};
use crate::ingest::VectorStore;

/// Embedded vector store: full documents (embedding included) keyed by id.
pub struct SledVectorStore {
    tree: sled::Db,
}

impl SledVectorStore {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self { tree: sled::open(path)? })
    }

    pub fn get(&self, id: &str) -> Result<Option<Document>> {
        match self.tree.get(id.as_bytes())? {
            Some(v) => Ok(Some(serde_json::from_slice(&v)?)),
            None => Ok(None),
        }
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

#[async_trait]
impl VectorStore for SledVectorStore {
    async fn put(&self, doc: &Document) -> Result<()> {
        if doc.embedding.is_none() {
            return Err(Error::VectorUpload(format!("document '{}' has no embedding", doc.id)));
        }
        self.tree.insert(doc.id.as_bytes(), serde_json::to_vec(doc)?)?;
        self.tree.flush().map_err(Error::from)?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.tree.remove(id.as_bytes())?;
        self.tree.flush().map_err(Error::from)?;
        Ok(())
    }
}
