//! Persistent content-hash ledger backed by sled.
//!
//! Keyed by `(source_type, file_path)`; classifies the current file set into
//! new / modified / unchanged / deleted against what was last indexed.
//! Commits flush before returning so the orchestrator can report success
//! only after the record is durable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::document::SourceType;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HashRecord {
    pub source_type: SourceType,
    pub file_path: String,
    /// 128-bit digest, lowercase hex.
    pub content_hash: String,
    pub file_size: u64,
    pub vectorized_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    New,
    Modified,
}

#[derive(Debug)]
pub struct PendingFile {
    pub path: String,
    pub change: Change,
    pub new_hash: String,
    pub old_hash: Option<String>,
}

#[derive(Debug, Default)]
pub struct Classification {
    pub to_process: Vec<PendingFile>,
    pub unchanged: Vec<String>,
    pub deleted: Vec<String>,
}

pub struct HashStore {
    db: sled::Db,
}

impl HashStore {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self { db: sled::open(path)? })
    }

    fn key(source: SourceType, path: &str) -> Vec<u8> {
        let mut k = Vec::with_capacity(source.as_str().len() + 1 + path.len());
        k.extend_from_slice(source.as_str().as_bytes());
        k.push(0);
        k.extend_from_slice(path.as_bytes());
        k
    }

    pub fn get(&self, source: SourceType, path: &str) -> Result<Option<HashRecord>> {
        match self.db.get(Self::key(source, path))? {
            Some(v) => Ok(Some(serde_json::from_slice(&v)?)),
            None => Ok(None),
        }
    }

    /// Compare the current file set against the persisted records for one
    /// source type. `current` is `(path, content_hash, file_size)`.
    pub fn classify(
        &self,
        source: SourceType,
        current: &[(String, String, u64)],
    ) -> Result<Classification> {
        let mut out = Classification::default();

        for (path, hash, _size) in current {
            match self.get(source, path)? {
                None => out.to_process.push(PendingFile {
                    path: path.clone(),
                    change: Change::New,
                    new_hash: hash.clone(),
                    old_hash: None,
                }),
                Some(rec) if rec.content_hash != *hash => out.to_process.push(PendingFile {
                    path: path.clone(),
                    change: Change::Modified,
                    new_hash: hash.clone(),
                    old_hash: Some(rec.content_hash),
                }),
                Some(_) => out.unchanged.push(path.clone()),
            }
        }

        // Deletion detection: persisted paths absent from the current set.
        let current_paths: std::collections::HashSet<&str> =
            current.iter().map(|(p, _, _)| p.as_str()).collect();
        let mut prefix = source.as_str().as_bytes().to_vec();
        prefix.push(0);
        for item in self.db.scan_prefix(&prefix) {
            let (k, _) = item?;
            let path = String::from_utf8_lossy(&k[prefix.len()..]).into_owned();
            if !current_paths.contains(path.as_str()) {
                out.deleted.push(path);
            }
        }

        Ok(out)
    }

    /// Record a successful index; durable before return.
    pub fn commit(&self, source: SourceType, path: &str, hash: &str, size: u64) -> Result<()> {
        let rec = HashRecord {
            source_type: source,
            file_path: path.to_string(),
            content_hash: hash.to_string(),
            file_size: size,
            vectorized_at: Utc::now(),
        };
        self.db.insert(Self::key(source, path), serde_json::to_vec(&rec)?)?;
        self.db.flush().map_err(Error::from)?;
        Ok(())
    }

    pub fn remove(&self, source: SourceType, path: &str) -> Result<()> {
        self.db.remove(Self::key(source, path))?;
        self.db.flush().map_err(Error::from)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }
}
