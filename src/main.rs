//! ragserver binary — thin CLI shell over the [`ragserver`] library crate.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use ragserver::adapters::{self, ChatAdapter, HttpChatModel};
use ragserver::auth::AuthState;
use ragserver::cluster::{HttpSearchCluster, SearchCluster};
use ragserver::config::Config;
use ragserver::document::SourceType;
use ragserver::embedder::HttpEmbedder;
use ragserver::error::{Error, Result};
use ragserver::hashstore::HashStore;
use ragserver::hybrid::{FusionMethod, HybridEngine, HybridQuery};
use ragserver::ingest::Orchestrator;
use ragserver::ratelimit::RateLimiter;
use ragserver::readers;
use ragserver::registry::ToolRegistry;
use ragserver::rpc::{self, AppContext};
use ragserver::sse::Broadcaster;
use ragserver::vectorstore::SledVectorStore;

// ---------------------------------------------------------------------------
// CLI definition (clap derive)
// ---------------------------------------------------------------------------

/// Hybrid-search RAG server: ingest documents into a search cluster and serve
/// retrieval tools over JSON-RPC and SSE.
#[derive(Parser)]
#[command(name = "ragserver", version, about, long_about = None)]
struct Cli {
    /// Path to a TOML config file (default: ./ragserver.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest configured sources into the vector store and search index
    Index {
        /// Parallel embedding workers (overrides config)
        #[arg(long)]
        concurrency: Option<usize>,

        /// Enumerate and classify only; no external writes
        #[arg(long)]
        dry_run: bool,

        /// Restrict to one source type (markdown|csv|chat)
        #[arg(long)]
        source: Option<String>,
    },
    /// Run a hybrid query and print the fused results as JSON
    Query {
        /// Query text
        text: String,

        /// Number of results (1-100)
        #[arg(long, default_value_t = 10)]
        top_k: usize,

        /// BM25 score weight in [0, 1]
        #[arg(long, default_value_t = 0.5)]
        bm25_weight: f64,

        /// Vector score weight in [0, 1]
        #[arg(long, default_value_t = 0.5)]
        vector_weight: f64,

        /// Use reciprocal rank fusion instead of weighted sum
        #[arg(long)]
        rrf: bool,
    },
    /// List the registered tools
    List,
    /// One-shot retrieval-augmented chat completion
    Chat {
        /// User prompt
        prompt: String,
    },
    /// Start the JSON-RPC / SSE protocol server
    Serve {
        /// Bind host (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Bind port (overrides config)
        #[arg(long)]
        port: Option<u16>,
    },
}

// ---------------------------------------------------------------------------
// Graceful shutdown signal
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }
}

// ---------------------------------------------------------------------------
// Collaborator assembly
// ---------------------------------------------------------------------------

struct Collaborators {
    cluster: Arc<HttpSearchCluster>,
    embedder: Arc<HttpEmbedder>,
    limiter: Arc<RateLimiter>,
}

fn build_collaborators(cfg: &Config) -> Result<Collaborators> {
    cfg.validate()?;
    let limiter = Arc::new(RateLimiter::new(
        cfg.cluster.rate_limit_per_sec,
        cfg.cluster.rate_limit_burst,
    ));
    let cluster = Arc::new(HttpSearchCluster::new(&cfg.cluster, Arc::clone(&limiter))?);
    let embedder = Arc::new(HttpEmbedder::new(&cfg.cluster, Arc::clone(&limiter))?);
    Ok(Collaborators { cluster, embedder, limiter })
}

fn build_registry(cfg: &Config, engine: Arc<HybridEngine>) -> Result<Arc<ToolRegistry>> {
    let registry = Arc::new(ToolRegistry::new());
    let mut tool = adapters::hybrid_search_tool(engine, cfg.cluster.index_name.clone());
    if let Some(exported) = cfg.tool_names.get(&tool.internal_name) {
        tool = tool.exported_as(exported.clone());
    }
    registry.register(tool)?;
    Ok(registry)
}

// ---------------------------------------------------------------------------
// Subcommands
// ---------------------------------------------------------------------------

fn enumerate_files(dir: &str, ext: &str) -> Vec<PathBuf> {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some(ext))
        .map(|e| e.into_path())
        .collect()
}

async fn run_index(
    cfg: &Config,
    concurrency: Option<usize>,
    dry_run: bool,
    source: Option<String>,
) -> Result<()> {
    let mut ingest_cfg = cfg.ingest.clone();
    if let Some(c) = concurrency {
        ingest_cfg.concurrency = c;
    }

    let collabs = build_collaborators(cfg)?;
    let hash_store = Arc::new(HashStore::open(std::path::Path::new(&ingest_cfg.hash_store_path))?);
    let vector_path = ingest_cfg
        .vector_index
        .clone()
        .unwrap_or_else(|| ".ragserver/vectors".to_string());
    let vector_store = Arc::new(SledVectorStore::open(std::path::Path::new(&vector_path))?);

    let wants = |s: &str| source.as_deref().map(|w| w == s).unwrap_or(true);

    // Readers fail fast per file; the run records the error and moves on.
    let mut batches: Vec<(SourceType, Vec<ragserver::Document>)> = Vec::new();

    if wants("markdown") {
        if let Some(ref dir) = ingest_cfg.markdown_dir {
            let mut docs = Vec::new();
            for path in enumerate_files(dir, "md") {
                match readers::markdown::read_markdown(&path) {
                    Ok(doc) => docs.push(doc),
                    Err(e) => warn!(path = %path.display(), error = %e, "markdown read failed"),
                }
            }
            info!(count = docs.len(), dir = dir.as_str(), "markdown documents read");
            batches.push((SourceType::Markdown, docs));
        }
    }

    if wants("csv") {
        if let Some(ref dir) = ingest_cfg.csv_dir {
            let mut docs = Vec::new();
            for path in enumerate_files(dir, "csv") {
                match readers::csv::read_csv(&path, &cfg.sources) {
                    Ok(mut rows) => docs.append(&mut rows),
                    Err(e) => warn!(path = %path.display(), error = %e, "csv read failed"),
                }
            }
            info!(count = docs.len(), dir = dir.as_str(), "csv documents read");
            batches.push((SourceType::Csv, docs));
        }
    }

    if wants("chat") && source.as_deref() == Some("chat") {
        return Err(Error::Validation(
            "chat ingestion requires a platform client; run it from the service integration".into(),
        ));
    }

    if !dry_run {
        collabs
            .cluster
            .create_index(&cfg.cluster.index_name, cfg.cluster.embedding_dimension)
            .await?;
    }

    let orchestrator = Orchestrator::new(
        ingest_cfg,
        cfg.cluster.index_name.clone(),
        collabs.cluster,
        vector_store,
        collabs.embedder,
        hash_store,
    );
    let stats = orchestrator.run(batches, dry_run).await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    if stats.failed > 0 {
        return Err(Error::Internal(format!("{} documents failed", stats.failed)));
    }
    Ok(())
}

async fn run_query(
    cfg: &Config,
    text: String,
    top_k: usize,
    bm25_weight: f64,
    vector_weight: f64,
    rrf: bool,
) -> Result<()> {
    if !(1..=100).contains(&top_k) {
        return Err(Error::Validation(format!("top_k {top_k} outside [1, 100]")));
    }
    let collabs = build_collaborators(cfg)?;
    let engine = HybridEngine::new(collabs.cluster, collabs.embedder);
    let query = HybridQuery {
        query: text,
        index_name: cfg.cluster.index_name.clone(),
        size: top_k,
        bm25_weight,
        vector_weight,
        fusion_method: if rrf { FusionMethod::Rrf } else { FusionMethod::WeightedSum },
        timeout: cfg.cluster.request_timeout(),
        ..Default::default()
    };
    let result = engine.search(&query).await?;
    println!("{}", serde_json::to_string_pretty(&adapters::result_to_json(&result))?);
    Ok(())
}

async fn run_list(cfg: &Config) -> Result<()> {
    let collabs = build_collaborators(cfg)?;
    let engine = Arc::new(HybridEngine::new(collabs.cluster, collabs.embedder));
    let registry = build_registry(cfg, engine)?;
    for tool in registry.list() {
        let first_line = tool.description.lines().next().unwrap_or("");
        println!("{:<24} {first_line}", tool.exported_name);
    }
    Ok(())
}

async fn run_chat(cfg: &Config, prompt: String) -> Result<()> {
    let endpoint = cfg
        .ingest
        .chat_endpoint
        .clone()
        .ok_or_else(|| Error::Validation("ingest.chat_endpoint is required for chat".into()))?;
    let model_id = cfg
        .ingest
        .chat_model_id
        .clone()
        .ok_or_else(|| Error::Validation("ingest.chat_model_id is required for chat".into()))?;

    let collabs = build_collaborators(cfg)?;
    let engine = Arc::new(HybridEngine::new(collabs.cluster, collabs.embedder));
    let model = Arc::new(HttpChatModel::new(
        endpoint,
        model_id,
        cfg.cluster.request_timeout(),
        collabs.limiter,
    )?);
    let adapter = ChatAdapter::new(engine, model, cfg.cluster.index_name.clone());
    let answer = adapter.ask(&prompt).await?;
    println!("{answer}");
    Ok(())
}

async fn run_serve(cfg: &Config, host: Option<String>, port: Option<u16>) -> Result<()> {
    let collabs = build_collaborators(cfg)?;
    let engine = Arc::new(HybridEngine::new(collabs.cluster.clone(), collabs.embedder.clone()));
    let registry = build_registry(cfg, engine)?;

    let broadcaster = Broadcaster::new(cfg.sse.clone());
    broadcaster.clone().start();

    // Ingest runs triggered in-process feed the SSE channel through a
    // one-way bridge; the orchestrator never sees the broadcaster.
    let hash_store = Arc::new(HashStore::open(std::path::Path::new(
        &cfg.ingest.hash_store_path,
    ))?);
    let vector_path = cfg
        .ingest
        .vector_index
        .clone()
        .unwrap_or_else(|| ".ragserver/vectors".to_string());
    let vector_store = Arc::new(SledVectorStore::open(std::path::Path::new(&vector_path))?);
    let orchestrator = Arc::new(Orchestrator::new(
        cfg.ingest.clone(),
        cfg.cluster.index_name.clone(),
        collabs.cluster,
        vector_store,
        collabs.embedder,
        hash_store,
    ));
    let _bridge = rpc::spawn_event_bridge(orchestrator.subscribe(), Arc::clone(&broadcaster));

    let auth = AuthState::new(cfg.auth.clone())?;
    let ctx = AppContext {
        registry,
        broadcaster: Arc::clone(&broadcaster),
        call_timeout: cfg.cluster.request_timeout(),
    };
    let app = rpc::build_router(ctx, auth);

    let bind_host = host.unwrap_or_else(|| cfg.server.host.clone());
    let bind_port = port.unwrap_or(cfg.server.port);
    let listener = tokio::net::TcpListener::bind(format!("{bind_host}:{bind_port}"))
        .await
        .map_err(|e| Error::Internal(format!("bind {bind_host}:{bind_port}: {e}")))?;
    let addr = listener.local_addr().map_err(|e| Error::Internal(e.to_string()))?;
    info!(addr = %addr, "protocol server listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| Error::Internal(format!("server: {e}")))?;

    orchestrator.stop();
    broadcaster.stop();
    Ok(())
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ragserver=info".parse().unwrap()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let cfg = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            std::process::exit(1);
        }
    };

    let outcome = match cli.command {
        Commands::Index { concurrency, dry_run, source } => {
            run_index(&cfg, concurrency, dry_run, source).await
        }
        Commands::Query { text, top_k, bm25_weight, vector_weight, rrf } => {
            run_query(&cfg, text, top_k, bm25_weight, vector_weight, rrf).await
        }
        Commands::List => run_list(&cfg).await,
        Commands::Chat { prompt } => run_chat(&cfg, prompt).await,
        Commands::Serve { host, port } => run_serve(&cfg, host, port).await,
    };

    if let Err(e) = outcome {
        error!(kind = e.kind(), error = %e, "command failed");
        std::process::exit(1);
    }
}
