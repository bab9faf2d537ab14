//! Claimwise CLI
//!
//! Ingest policy documents into a namespace and ask for claim decisions
//! against it. Every command prints one JSON document on stdout; logs go to
//! stderr (`RUST_LOG`, default `info`).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use claimwise::{Pipeline, PipelineConfig, RefreshPolicy, ScoredChunk};

#[derive(Parser)]
#[command(name = "claimwise")]
#[command(
    about = "Claimwise CLI - Claim decisions over uploaded policy documents",
    long_about = None
)]
struct Cli {
    /// Config file (default: ~/.claimwise/config.toml)
    #[arg(short, long, global = true, env = "CLAIMWISE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load, chunk, embed and index files into a namespace
    Ingest {
        /// Namespace to populate
        #[arg(short, long)]
        namespace: String,
        /// skip_if_exists or always_clear_then_reload (default: from config)
        #[arg(short, long)]
        policy: Option<RefreshPolicy>,
        /// Files to ingest
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Answer a query against a namespace
    Answer {
        #[arg(short, long)]
        namespace: String,
        /// Chunks to retrieve (default: from config)
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
        /// Natural-language query
        query: String,
    },
    /// Show the chunks a query retrieves, with scores
    Retrieve {
        #[arg(short, long)]
        namespace: String,
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
        query: String,
    },
    /// Check whether a namespace holds any vectors
    Exists {
        namespace: String,
    },
    /// Delete every vector in a namespace
    Clear {
        namespace: String,
    },
    /// List populated namespaces
    Namespaces,
    /// Delete the whole index and reopen it at the current embedding dimension
    ResetIndex,
}

// ============ Output Types ============

#[derive(Serialize)]
struct ExistsOutput {
    namespace: String,
    exists: bool,
    count: usize,
}

#[derive(Serialize)]
struct ClearOutput {
    namespace: String,
    cleared: bool,
}

#[derive(Serialize)]
struct RetrieveOutput {
    namespace: String,
    hits: Vec<ScoredChunk>,
}

#[derive(Serialize)]
struct ErrorOutput {
    error: String,
}

// ============ Main ============

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(json) => println!("{}", json),
        Err(e) => {
            let error = ErrorOutput {
                error: format!("{:#}", e),
            };
            match serde_json::to_string(&error) {
                Ok(json) => println!("{}", json),
                Err(_) => println!("{{\"error\":\"{}\"}}", error.error.escape_default()),
            }
            std::process::exit(1);
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<PipelineConfig> {
    match path {
        Some(path) => PipelineConfig::load_from(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => PipelineConfig::load().context("loading default config"),
    }
}

async fn open_pipeline(config: &PipelineConfig) -> Result<Pipeline> {
    Pipeline::from_config(config)
        .await
        .context("initializing pipeline")
}

// ============ Handlers ============

async fn run(cli: Cli) -> Result<String> {
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Ingest {
            namespace,
            policy,
            files,
        } => {
            let pipeline = open_pipeline(&config).await?;
            let policy = policy.unwrap_or(config.ingest.refresh_policy);
            let report = pipeline
                .ingest_with(&files, &namespace, policy)
                .await
                .with_context(|| format!("ingesting into namespace '{}'", namespace))?;
            Ok(serde_json::to_string(&report)?)
        }

        Commands::Answer {
            namespace,
            top_k,
            query,
        } => {
            let pipeline = open_pipeline(&config).await?;
            let top_k = top_k.unwrap_or(config.retrieval.top_k);
            let record = pipeline
                .answer_with_top_k(&query, &namespace, top_k)
                .await
                .with_context(|| format!("answering against namespace '{}'", namespace))?;
            Ok(serde_json::to_string(&record)?)
        }

        Commands::Retrieve {
            namespace,
            top_k,
            query,
        } => {
            let pipeline = open_pipeline(&config).await?;
            let top_k = top_k.unwrap_or(config.retrieval.top_k);
            let hits = pipeline
                .retriever()
                .retrieve_scored(&query, &namespace, top_k)
                .await?;
            Ok(serde_json::to_string(&RetrieveOutput { namespace, hits })?)
        }

        Commands::Exists { namespace } => {
            let pipeline = open_pipeline(&config).await?;
            let count = pipeline.count(&namespace).await?;
            Ok(serde_json::to_string(&ExistsOutput {
                namespace,
                exists: count > 0,
                count,
            })?)
        }

        Commands::Clear { namespace } => {
            let pipeline = open_pipeline(&config).await?;
            pipeline.clear(&namespace).await?;
            Ok(serde_json::to_string(&ClearOutput {
                namespace,
                cleared: true,
            })?)
        }

        Commands::Namespaces => {
            let pipeline = open_pipeline(&config).await?;
            Ok(serde_json::to_string(&pipeline.namespaces().await?)?)
        }

        // Never opens the existing index, which may be at the wrong dimension
        Commands::ResetIndex => {
            let (_, report) = Pipeline::reset_index(&config)
                .await
                .context("resetting index")?;
            Ok(serde_json::to_string(&report)?)
        }
    }
}
