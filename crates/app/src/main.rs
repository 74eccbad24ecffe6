use clap::{Parser, Subcommand};
use chrono::Utc;
use pdf_rag_core::chunking::{DEFAULT_CHUNK_SIZE, DEFAULT_OVERLAP_SENTENCES};
use pdf_rag_core::{
    AnswerGenerator, CharacterNgramEmbedder, ChatCompletionsGenerator, ChunkingConfig,
    ExtractiveGenerator, IndexStore, IngestionCoordinator, IngestionOptions, LopdfExtractor,
    RagPipeline, RetrievalEngine, RetrievalOptions, DEFAULT_EMBEDDING_DIMENSIONS,
    DEFAULT_NAMESPACE,
};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "pdf-rag", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Directory holding one sub-directory per namespace
    #[arg(long, env = "RAG_DATA_DIR", default_value = "data/index")]
    data_dir: PathBuf,

    /// Namespace to ingest into or ask against
    #[arg(long, env = "RAG_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    namespace: String,

    /// Embedding dimensionality; must match any existing index
    #[arg(long, default_value_t = DEFAULT_EMBEDDING_DIMENSIONS)]
    dimensions: usize,

    /// Maximum characters per chunk (a longer single sentence stays whole)
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

    /// Trailing sentences repeated at the start of the next chunk
    #[arg(long, default_value_t = DEFAULT_OVERLAP_SENTENCES)]
    overlap_sentences: usize,

    /// Word-set Jaccard similarity above which results count as duplicates
    #[arg(long, default_value_t = 0.8)]
    dedup_threshold: f64,

    /// OpenAI-compatible base URL; answers are extracted locally when unset
    #[arg(long, env = "RAG_LLM_ENDPOINT")]
    llm_endpoint: Option<String>,

    /// Model name sent to the chat completions endpoint
    #[arg(long, env = "RAG_LLM_MODEL", default_value = "llama3.1")]
    llm_model: String,

    /// Bearer token for the chat completions endpoint
    #[arg(long, env = "RAG_LLM_API_KEY", hide_env_values = true)]
    llm_api_key: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest one PDF, or every PDF below a folder, into the namespace.
    Ingest {
        /// PDF file or folder searched recursively.
        #[arg(long)]
        path: PathBuf,
    },
    /// Answer a question from the namespace's documents.
    Ask {
        /// Question text
        #[arg(long)]
        question: String,
        /// Number of chunks used as context.
        #[arg(long, default_value = "3")]
        top_k: usize,
        /// Print the response as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Show the deduplicated chunks retrieval would use for a query.
    Search {
        /// Search query
        #[arg(long)]
        query: String,
        /// Number of chunks to return.
        #[arg(long, default_value = "5")]
        top_k: usize,
    },
    /// List namespaces and their vector counts.
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();

    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        data_dir = %cli.data_dir.display(),
        namespace = %cli.namespace,
        "pdf-rag boot"
    );

    let options = IngestionOptions {
        chunking: ChunkingConfig {
            chunk_size: cli.chunk_size,
            overlap_sentences: cli.overlap_sentences,
        },
        ..IngestionOptions::default()
    };
    let retrieval_options = RetrievalOptions {
        dedup_threshold: cli.dedup_threshold,
        ..RetrievalOptions::default()
    };

    let generator: Box<dyn AnswerGenerator + Send + Sync> = match &cli.llm_endpoint {
        Some(endpoint) => Box::new(ChatCompletionsGenerator::new(
            endpoint,
            cli.llm_model.clone(),
            cli.llm_api_key.clone(),
        )?),
        None => Box::new(ExtractiveGenerator::default()),
    };

    let embedder = CharacterNgramEmbedder {
        dimensions: cli.dimensions,
    };
    let store = IndexStore::open(&cli.data_dir, cli.dimensions);
    let pipeline = RagPipeline::new(
        IngestionCoordinator::new(LopdfExtractor, options)?,
        RetrievalEngine::with_options(store, embedder, retrieval_options),
        generator,
    );

    match cli.command {
        Command::Ingest { path } => {
            let report = pipeline.ingest_path(&cli.namespace, &path).await?;

            if !report.skipped_files.is_empty() {
                warn!(
                    "skipped_files={} for path={}",
                    report.skipped_files.len(),
                    path.display()
                );
                for skipped in &report.skipped_files {
                    warn!(path = %skipped.path.display(), reason = %skipped.reason, "skipped pdf");
                }
            }

            for summary in &report.ingested {
                println!(
                    "{} chunks={} sha256={}",
                    summary.filename, summary.chunk_count, summary.checksum
                );
            }

            let chunk_count: usize = report.ingested.iter().map(|summary| summary.chunk_count).sum();
            if chunk_count == 0 {
                println!("0 chunks ingested (all files were skipped)");
            } else {
                println!(
                    "{} chunks ingested into '{}' at {}",
                    chunk_count,
                    cli.namespace,
                    Utc::now().to_rfc3339()
                );
            }
        }
        Command::Ask {
            question,
            top_k,
            json,
        } => {
            let response = pipeline.ask(&cli.namespace, &question, top_k).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                println!("answer: {}", response.answer);
                for source in &response.sources {
                    println!(
                        "  source={} page={} chunk={}",
                        source.source_document, source.page_number, source.chunk_id
                    );
                }
            }
        }
        Command::Search { query, top_k } => {
            let results = pipeline.search(&cli.namespace, &query, top_k).await?;

            println!("query: {query}");
            for result in results {
                let realm = result
                    .metadata
                    .realm_tag
                    .map(|realm| realm.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "[{:.4}] chunk={} page={} realm={}",
                    result.score, result.metadata.chunk_id, result.metadata.page_number, realm
                );
                println!("  chunk_text:\n{}", result.metadata.text);
            }
        }
        Command::Stats => {
            let store = pipeline.retrieval().store();
            let namespaces = store.namespaces()?;
            if namespaces.is_empty() {
                println!("no namespaces under {}", store.root().display());
            }
            for namespace in namespaces {
                println!("{namespace}: {} vectors", store.count(&namespace)?);
            }
        }
    }

    Ok(())
}
