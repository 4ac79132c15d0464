//! Runtime configuration, loaded once at startup and passed by value.
//!
//! Sources, in order: built-in defaults, a TOML file (`ragserver.toml` or
//! `--config <path>`), then `RAGSERVER_*` environment overrides for the
//! handful of values that differ between deploy targets. Nothing here is
//! mutable after startup.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cluster: ClusterConfig,
    pub ingest: IngestConfig,
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub sse: SseConfig,
    /// Ordered CSV source patterns; first glob match wins.
    pub sources: Vec<SourceConfig>,
    /// Tool name remapping: internal name -> exported name.
    pub tool_names: std::collections::BTreeMap<String, String>,
}

impl Config {
    /// Load from a TOML file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg: Config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p).map_err(|e| Error::FileRead {
                    path: p.display().to_string(),
                    reason: e.to_string(),
                })?;
                toml::from_str(&raw).map_err(|e| Error::Validation(format!("config: {e}")))?
            }
            None => {
                let default = Path::new("ragserver.toml");
                if default.exists() {
                    let raw = std::fs::read_to_string(default).map_err(|e| Error::FileRead {
                        path: default.display().to_string(),
                        reason: e.to_string(),
                    })?;
                    toml::from_str(&raw).map_err(|e| Error::Validation(format!("config: {e}")))?
                } else {
                    Config::default()
                }
            }
        };
        cfg.apply_env();
        Ok(cfg)
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("RAGSERVER_CLUSTER_ENDPOINT") {
            self.cluster.endpoint = v;
        }
        if let Ok(v) = std::env::var("RAGSERVER_INDEX_NAME") {
            self.cluster.index_name = v;
        }
        if let Ok(v) = std::env::var("RAGSERVER_EMBEDDING_ENDPOINT") {
            self.cluster.embedding_endpoint = v;
        }
        if let Ok(v) = std::env::var("RAGSERVER_TOKEN") {
            self.auth.token = Some(v);
        }
        if let Ok(v) = std::env::var("RAGSERVER_PORT") {
            if let Ok(p) = v.parse() {
                self.server.port = p;
            }
        }
    }

    /// Required-field validation, run before any subsystem starts.
    pub fn validate(&self) -> Result<()> {
        if self.cluster.endpoint.is_empty() {
            return Err(Error::Validation("cluster.endpoint is required".into()));
        }
        if self.cluster.index_name.is_empty() {
            return Err(Error::Validation("cluster.index_name is required".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Search cluster + embedder
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub endpoint: String,
    pub index_name: String,
    pub region: Option<String>,
    pub embedding_endpoint: String,
    pub embedding_model: String,
    pub embedding_dimension: usize,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub rate_limit_per_sec: f64,
    pub rate_limit_burst: u32,
    pub max_connections: usize,
    pub idle_connections: usize,
    pub idle_timeout_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            index_name: String::new(),
            region: None,
            embedding_endpoint: String::new(),
            embedding_model: "text-embedding".to_string(),
            embedding_dimension: 1024,
            connect_timeout_secs: 30,
            request_timeout_secs: 60,
            max_retries: 3,
            retry_delay_secs: 1,
            rate_limit_per_sec: 10.0,
            rate_limit_burst: 20,
            max_connections: 100,
            idle_connections: 10,
            idle_timeout_secs: 90,
        }
    }
}

impl ClusterConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Ingestion
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Markdown / CSV roots to enumerate.
    pub markdown_dir: Option<String>,
    pub csv_dir: Option<String>,
    pub vector_bucket: Option<String>,
    pub vector_index: Option<String>,
    pub chat_model_id: Option<String>,
    pub chat_endpoint: Option<String>,
    pub concurrency: usize,
    pub retry_attempts: u32,
    pub retry_delay_secs: u64,
    pub bulk_batch_size: usize,
    pub excluded_categories: Vec<String>,
    /// Path of the sled hash-store file.
    pub hash_store_path: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            markdown_dir: None,
            csv_dir: None,
            vector_bucket: None,
            vector_index: None,
            chat_model_id: None,
            chat_endpoint: None,
            concurrency: 10,
            retry_attempts: 0,
            retry_delay_secs: 2,
            bulk_batch_size: 1000,
            excluded_categories: Vec::new(),
            hash_store_path: ".ragserver/hashes".to_string(),
        }
    }
}

impl IngestConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

// ---------------------------------------------------------------------------
// Protocol server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_header_bytes: usize,
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8180,
            read_timeout_secs: 30,
            write_timeout_secs: 30,
            idle_timeout_secs: 120,
            max_header_bytes: 1 << 20,
            shutdown_timeout_secs: 10,
        }
    }
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

/// Identity auth mode. `Both` requires network and token checks to pass,
/// `Either` accepts whichever succeeds first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    #[default]
    None,
    Token,
    Both,
    Either,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub enabled: bool,
    pub mode: AuthMode,
    /// IPs / CIDRs allowed through the network check.
    pub allowed_ips: Vec<String>,
    /// CIDRs exempt from identity auth entirely.
    pub bypass_ranges: Vec<String>,
    /// Proxies whose X-Forwarded-For header is trusted.
    pub trusted_proxies: Vec<String>,
    pub token: Option<String>,
    pub verbose_log: bool,
    pub audit_log: bool,
}

// ---------------------------------------------------------------------------
// SSE
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SseConfig {
    pub heartbeat_interval_secs: u64,
    pub buffer_size: usize,
    pub max_clients: usize,
    pub history_size: usize,
}

impl Default for SseConfig {
    fn default() -> Self {
        Self { heartbeat_interval_secs: 30, buffer_size: 64, max_clients: 100, history_size: 100 }
    }
}

impl SseConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

// ---------------------------------------------------------------------------
// Per-pattern CSV source config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Glob matched against the file basename (NFC-normalized).
    pub pattern: String,
    /// 1-indexed header row; rows before it are skipped.
    pub header_row: usize,
    /// Explicit content columns. Empty plus `auto_detect` unset/true means
    /// the column detector chooses.
    pub content_columns: Vec<String>,
    /// Unset means true: distinguish "not configured" from "disabled".
    pub auto_detect: Option<bool>,
    /// Template with `{{col}}` placeholders; takes precedence over joins.
    pub template: Option<String>,
    pub title_column: Option<String>,
    pub category_column: Option<String>,
    pub tags_column: Option<String>,
    pub id_column: Option<String>,
    pub created_at_column: Option<String>,
    pub updated_at_column: Option<String>,
    pub reference_column: Option<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            pattern: String::new(),
            header_row: 1,
            content_columns: Vec::new(),
            auto_detect: None,
            template: None,
            title_column: None,
            category_column: None,
            tags_column: None,
            id_column: None,
            created_at_column: None,
            updated_at_column: None,
            reference_column: None,
        }
    }
}

impl SourceConfig {
    /// Auto-detection defaults to on when the field is absent.
    pub fn auto_detect(&self) -> bool {
        self.auto_detect.unwrap_or(true)
    }
}
