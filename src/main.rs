use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use docsiphon::embedder::{Embedder, HashEmbedder, Model2VecEmbedder};
use docsiphon::error::PttsError;
use docsiphon::model::{DocStatus, OcrMode};
use docsiphon::ocr::DatalabClient;
use docsiphon::pipeline::{ingest_paths, ChunkingStrategy, Pipeline, ProcessOptions};
use docsiphon::search;
use docsiphon::settings::SharedSettings;
use docsiphon::store::{self, Store};
use docsiphon::vision::HttpVisionClient;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "docsiphon")]
#[command(version)]
#[command(about = "Provenance-tracked document corpus with hybrid search")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Corpus lifecycle: create, list, select, stats, delete
    #[command(subcommand)]
    Db(DbCommand),

    /// Register files or directory trees as pending documents
    Ingest {
        /// Files or directories to register
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Run the OCR → chunk → embed → vision pipeline over pending documents
    Process {
        /// OCR mode: fast | balanced | accurate (defaults to config)
        #[arg(long)]
        ocr_mode: Option<String>,

        /// Chunking strategy: fixed | page-aware
        #[arg(long, default_value = "page-aware")]
        chunking: String,

        /// Cap on pages submitted to OCR
        #[arg(long)]
        max_pages: Option<u32>,

        /// Insert image rows but skip vision descriptions
        #[arg(long)]
        skip_vlm: bool,

        /// Embedding model repo id override, or "hash" for the offline
        /// deterministic provider
        #[arg(long)]
        embed_model: Option<String>,
    },

    /// Document operations
    #[command(subcommand)]
    Docs(DocsCommand),

    /// Search the corpus
    #[command(subcommand)]
    Search(SearchCommand),

    /// Provenance chains, verification, export
    #[command(subcommand)]
    Prov(ProvCommand),

    /// Runtime configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    Create { name: String },
    List,
    Select { name: String },
    Stats,
    Delete {
        name: String,
        /// Required confirmation; deletion is irreversible
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Debug, Subcommand)]
enum DocsCommand {
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },
    Get {
        id: String,
        /// Include the full OCR text
        #[arg(long)]
        text: bool,
        /// Include chunk rows
        #[arg(long)]
        chunks: bool,
        /// Include the full provenance subtree
        #[arg(long)]
        provenance: bool,
    },
    Delete { id: String },
}

#[derive(Debug, Subcommand)]
enum SearchCommand {
    /// Lexical search over chunk text
    Text {
        query: String,
        #[arg(long, default_value = "fuzzy")]
        match_type: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
        #[arg(long)]
        provenance: bool,
    },
    /// Nearest-neighbor search over the embedding index
    Vector {
        query: String,
        #[arg(long)]
        threshold: Option<f64>,
        #[arg(long, default_value_t = 10)]
        limit: usize,
        #[arg(long)]
        provenance: bool,
        #[arg(long)]
        embed_model: Option<String>,
    },
    /// Reciprocal-rank fusion of keyword and vector legs
    Hybrid {
        query: String,
        #[arg(long, default_value_t = 0.5)]
        semantic_weight: f64,
        #[arg(long, default_value_t = 0.5)]
        keyword_weight: f64,
        #[arg(long, default_value_t = 10)]
        limit: usize,
        #[arg(long)]
        provenance: bool,
        #[arg(long)]
        embed_model: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
enum ProvCommand {
    /// Walk a node's ancestry up to its DOCUMENT root
    Chain { id: String },
    /// Re-derive and compare a node's content hash
    Verify {
        id: String,
        /// Verify the whole chain instead of the single node
        #[arg(long)]
        chain: bool,
    },
    /// Sweep every provenance node in the corpus
    VerifyDb,
    /// Rehash a document's source file against the stored file hash
    VerifyFile { document_id: String },
    /// Export one document's subtree
    Export {
        root_id: String,
        /// json | prov
        #[arg(long, default_value = "json")]
        format: String,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    Get { key: Option<String> },
    Set { key: String, value: String },
}

fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner} {msg}")
            .unwrap()
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.enable_steady_tick(std::time::Duration::from_millis(80));
    pb.set_message(msg.to_string());
    pb
}

fn emit(value: serde_json::Value) {
    println!("{}", serde_json::to_string_pretty(&value).expect("json output"));
}

fn open_current(storage: &std::path::Path) -> std::result::Result<Store, PttsError> {
    let name = store::current_corpus(storage)?;
    Store::open(&name, storage)
}

fn load_embedder(
    model_override: Option<&str>,
) -> std::result::Result<Arc<dyn Embedder>, PttsError> {
    match model_override {
        Some("hash") => Ok(Arc::new(HashEmbedder::new())),
        Some(model) => Ok(Arc::new(Model2VecEmbedder::load(model)?)),
        None => Ok(Arc::new(Model2VecEmbedder::load_default()?)),
    }
}

async fn run(
    cli: Cli,
    settings: SharedSettings,
    storage: PathBuf,
) -> std::result::Result<(), PttsError> {
    match cli.cmd {
        Command::Db(cmd) => match cmd {
            DbCommand::Create { name } => {
                let s = Store::create(&name, &storage)?;
                emit(json!({ "created": s.name(), "path": s.path() }));
            }
            DbCommand::List => {
                let names = store::list_corpora(&storage)?;
                let current = store::current_corpus(&storage).ok();
                emit(json!({ "corpora": names, "current": current }));
            }
            DbCommand::Select { name } => {
                store::select_corpus(&storage, &name)?;
                emit(json!({ "selected": name }));
            }
            DbCommand::Stats => {
                let s = open_current(&storage)?;
                let stats = s.get_stats().await?;
                emit(serde_json::to_value(stats).expect("stats serialize"));
            }
            DbCommand::Delete { name, yes } => {
                if !yes {
                    return Err(PttsError::validation(
                        "refusing to delete a corpus without --yes",
                    ));
                }
                Store::destroy(&name, &storage)?;
                emit(json!({ "deleted": name }));
            }
        },

        Command::Ingest { paths } => {
            let s = open_current(&storage)?;
            let pb = spinner("hashing and registering files...");
            let report = ingest_paths(&s, paths).await?;
            pb.finish_with_message(format!(
                "registered {} files ({} skipped)",
                report.registered, report.skipped
            ));
            emit(serde_json::to_value(report).expect("report serialize"));
        }

        Command::Process {
            ocr_mode,
            chunking,
            max_pages,
            skip_vlm,
            embed_model,
        } => {
            let opts = ProcessOptions {
                ocr_mode: ocr_mode.as_deref().map(OcrMode::parse).transpose()?,
                chunking: ChunkingStrategy::parse(&chunking)?,
                max_pages,
                skip_vlm,
            };
            let s = Arc::new(open_current(&storage)?);

            let pb = spinner("loading embedding model...");
            let embedder = load_embedder(embed_model.as_deref())?;
            pb.finish_with_message("model ready");

            let ocr_url = std::env::var("DATALAB_BASE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8901".to_string());
            let vlm_url = std::env::var("VLM_BASE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8902".to_string());

            let pipeline = Arc::new(Pipeline {
                store: s,
                ocr: Arc::new(DatalabClient::new(ocr_url)),
                vision: Arc::new(HttpVisionClient::new(vlm_url)),
                embedder,
                settings: settings.clone(),
                storage_root: storage.clone(),
            });

            let pb = spinner("processing pending documents...");
            let report = pipeline.process_pending(opts).await?;
            pb.finish_with_message(format!(
                "{} complete, {} failed of {}",
                report.complete, report.failed, report.processed
            ));
            emit(serde_json::to_value(report).expect("report serialize"));
        }

        Command::Docs(cmd) => match cmd {
            DocsCommand::List {
                status,
                limit,
                offset,
            } => {
                let s = open_current(&storage)?;
                let filter = store::ListFilter {
                    status: status.as_deref().map(DocStatus::parse).transpose()?,
                    limit: Some(limit),
                    offset,
                };
                let docs = s.list_documents(filter).await?;
                emit(json!({ "total": docs.len(), "documents": docs }));
            }
            DocsCommand::Get {
                id,
                text,
                chunks,
                provenance,
            } => {
                let s = open_current(&storage)?;
                let doc = s
                    .get_document(id.clone())
                    .await?
                    .ok_or(PttsError::NotFound {
                        entity: "document",
                        id: id.clone(),
                    })?;
                let mut out = json!({ "document": doc });
                if text {
                    let ocr = s.get_ocr_result(id.clone()).await?;
                    out["text"] = json!(ocr.map(|o| o.extracted_text));
                }
                if chunks {
                    let rows = s.list_chunks(id.clone()).await?;
                    out["chunks"] = json!(rows);
                }
                if provenance {
                    out["provenance"] =
                        s.export_provenance_json(doc.provenance_id.clone()).await?;
                }
                emit(out);
            }
            DocsCommand::Delete { id } => {
                let s = open_current(&storage)?;
                let counts = s.delete_document(id.clone()).await?;
                for file in &counts.image_files {
                    let _ = std::fs::remove_file(file);
                }
                let _ = std::fs::remove_dir(storage.join("images").join(&id));
                emit(json!({
                    "deleted": id,
                    "chunks": counts.chunks,
                    "embeddings": counts.embeddings,
                    "images": counts.images,
                    "provenance": counts.provenance,
                    "extension_rows": counts.extension_rows,
                }));
            }
        },

        Command::Search(cmd) => match cmd {
            SearchCommand::Text {
                query,
                match_type,
                limit,
                provenance,
            } => {
                let s = open_current(&storage)?;
                let resp = search::lexical(
                    &s,
                    search::TextSearch {
                        query,
                        match_type: search::MatchType::parse(&match_type)?,
                        limit,
                        include_provenance: provenance,
                    },
                )
                .await?;
                emit(serde_json::to_value(resp).expect("response serialize"));
            }
            SearchCommand::Vector {
                query,
                threshold,
                limit,
                provenance,
                embed_model,
            } => {
                let s = open_current(&storage)?;
                let embedder = load_embedder(embed_model.as_deref())?;
                let resp = search::vector(
                    &s,
                    embedder.as_ref(),
                    search::VectorSearch {
                        query,
                        similarity_threshold: threshold,
                        limit,
                        include_provenance: provenance,
                    },
                )
                .await?;
                emit(serde_json::to_value(resp).expect("response serialize"));
            }
            SearchCommand::Hybrid {
                query,
                semantic_weight,
                keyword_weight,
                limit,
                provenance,
                embed_model,
            } => {
                let s = open_current(&storage)?;
                let embedder = load_embedder(embed_model.as_deref())?;
                let resp = search::hybrid(
                    &s,
                    embedder.as_ref(),
                    search::HybridSearch {
                        query,
                        semantic_weight,
                        keyword_weight,
                        limit,
                        include_provenance: provenance,
                    },
                )
                .await?;
                emit(serde_json::to_value(resp).expect("response serialize"));
            }
        },

        Command::Prov(cmd) => match cmd {
            ProvCommand::Chain { id } => {
                let s = open_current(&storage)?;
                let chain = s.get_chain(id).await?;
                emit(serde_json::to_value(chain).expect("chain serialize"));
            }
            ProvCommand::Verify { id, chain } => {
                let s = open_current(&storage)?;
                if chain {
                    let report = s.verify_chain(id).await?;
                    emit(serde_json::to_value(report).expect("report serialize"));
                } else {
                    let outcome = s.verify_content_hash(id).await?;
                    emit(serde_json::to_value(outcome).expect("outcome serialize"));
                }
            }
            ProvCommand::VerifyDb => {
                let s = open_current(&storage)?;
                let pb = spinner("verifying corpus...");
                let report = s.verify_database().await?;
                pb.finish_with_message(format!(
                    "{} verified, {} failed of {}",
                    report.verified, report.failed, report.total_nodes
                ));
                emit(serde_json::to_value(report).expect("report serialize"));
            }
            ProvCommand::VerifyFile { document_id } => {
                let s = open_current(&storage)?;
                let outcome = s.verify_file_integrity(document_id).await?;
                emit(serde_json::to_value(outcome).expect("outcome serialize"));
            }
            ProvCommand::Export { root_id, format } => {
                let s = open_current(&storage)?;
                let out = match format.as_str() {
                    "json" => s.export_provenance_json(root_id).await?,
                    "prov" => s.export_provenance_prov(root_id).await?,
                    other => {
                        return Err(PttsError::validation(format!(
                            "format must be json|prov, got {other:?}"
                        )))
                    }
                };
                emit(out);
            }
        },

        Command::Config(cmd) => match cmd {
            ConfigCommand::Get { key } => {
                emit(settings.get(key.as_deref())?);
            }
            ConfigCommand::Set { key, value } => {
                emit(settings.set(&key, &value)?);
            }
        },
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let storage = store::storage_root();
    std::fs::create_dir_all(&storage)
        .with_context(|| format!("cannot create storage root {}", storage.display()))?;
    let settings = SharedSettings::load(&storage);

    // Diagnostics go to stderr; stdout carries exactly one JSON document.
    let default_level = settings.snapshot().log_level;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli, settings, storage).await {
        emit(e.envelope());
        std::process::exit(1);
    }
    Ok(())
}
