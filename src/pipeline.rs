//! Pipeline orchestrator: registration of source files and the
//! OCR → chunk → embed → (image → vision) transformation of pending
//! documents.
//!
//! Worker budget is a semaphore sized by `datalab_max_concurrent`; each
//! worker suspends on collaborator I/O and touches the store only in short
//! transactional sections after external results are in hand. A document's
//! `processing` status doubles as the soft lease and the crash-recovery
//! marker: on startup anything still `processing` is reset to `pending`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rayon::prelude::*;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::chunker::{chunk_text, ChunkingConfig, PageOffset};
use crate::embedder::Embedder;
use crate::error::{io_err, PttsError, Result};
use crate::hasher::{compute_hash_str, hash_file};
use crate::indexer;
use crate::model::{
    new_id, now_rfc3339, Chunk, DocStatus, Document, EmbeddingStatus, ImageRecord, OcrMode,
    OcrResult, ProvenanceRecord, ProvenanceType,
};
use crate::ocr::{OcrClient, OcrOutput};
use crate::settings::SharedSettings;
use crate::store::Store;
use crate::vision::VisionClient;

/// Hard ceiling for one document's end-to-end processing.
const DOCUMENT_CEILING: Duration = Duration::from_secs(600);

/// Extensions the directory walk registers; explicit file arguments are
/// accepted regardless.
const INGESTIBLE_EXTENSIONS: &[&str] = &[
    "pdf", "docx", "doc", "pptx", "xlsx", "png", "jpg", "jpeg", "tif", "tiff", "webp", "txt", "md",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChunkingStrategy {
    Fixed,
    #[default]
    PageAware,
}

impl ChunkingStrategy {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "fixed" => Ok(Self::Fixed),
            "page-aware" | "page_aware" => Ok(Self::PageAware),
            other => Err(PttsError::validation(format!(
                "chunking_strategy must be fixed|page-aware, got {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProcessOptions {
    pub ocr_mode: Option<OcrMode>,
    pub chunking: ChunkingStrategy,
    pub max_pages: Option<u32>,
    pub skip_vlm: bool,
}

#[derive(Debug, Serialize)]
pub struct DocumentReport {
    pub document_id: String,
    pub status: DocStatus,
    pub chunks: usize,
    pub embedded: usize,
    pub failed_embeddings: usize,
    pub images: usize,
    pub described: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct ProcessReport {
    pub processed: usize,
    pub complete: usize,
    pub failed: usize,
    pub skipped: usize,
    pub recovered: usize,
    pub reports: Vec<DocumentReport>,
}

#[derive(Debug, Default, Serialize)]
pub struct IngestReport {
    pub registered: usize,
    pub skipped: usize,
    pub documents: Vec<String>,
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

fn file_type_tag(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Expand directories into ingestible files. `.gitignore`-style filtering
/// comes with the walker; hidden files are skipped.
fn expand_paths(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in paths {
        let meta = std::fs::metadata(path).map_err(io_err(path))?;
        if meta.is_file() {
            files.push(path.clone());
            continue;
        }
        let walker = ignore::WalkBuilder::new(path).standard_filters(true).build();
        for entry in walker.flatten() {
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let p = entry.into_path();
            let ext = file_type_tag(&p);
            if INGESTIBLE_EXTENSIONS.contains(&ext.as_str()) {
                files.push(p);
            }
        }
    }
    files.sort();
    files.dedup();
    Ok(files)
}

/// Register files (or directory trees) as pending documents. Hashing runs
/// in parallel on the CPU pool; each document and its depth-0 provenance
/// node commit together.
pub async fn ingest_paths(store: &Store, paths: Vec<PathBuf>) -> Result<IngestReport> {
    let files = tokio::task::spawn_blocking(move || -> Result<Vec<(PathBuf, u64, String)>> {
        let files = expand_paths(&paths)?;
        files
            .par_iter()
            .map(|p| {
                let size = std::fs::metadata(p).map_err(io_err(p))?.len();
                let hash = hash_file(p)?;
                Ok((p.clone(), size, hash))
            })
            .collect()
    })
    .await
    .map_err(|e| PttsError::Database {
        operation: "ingest hash pool".to_string(),
        cause: e.to_string(),
    })??;

    let mut report = IngestReport::default();
    for (path, size, hash) in files {
        let abs = path
            .canonicalize()
            .unwrap_or_else(|_| path.clone())
            .to_string_lossy()
            .into_owned();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let prov = ProvenanceRecord::root(&abs, &hash, "ingest", env!("CARGO_PKG_VERSION"));
        let now = now_rfc3339();
        let doc = Document {
            id: new_id(),
            file_path: abs,
            file_name,
            file_size: size as i64,
            file_type: file_type_tag(&path),
            file_hash: hash,
            status: DocStatus::Pending,
            page_count: None,
            title: None,
            author: None,
            subject: None,
            provenance_id: prov.id.clone(),
            error_message: None,
            created_at: now.clone(),
            updated_at: now,
        };

        match store.insert_document(doc.clone(), prov).await {
            Ok(()) => {
                report.registered += 1;
                report.documents.push(doc.id);
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipped during ingest");
                report.skipped += 1;
            }
        }
    }
    Ok(report)
}

// ---------------------------------------------------------------------------
// Processing
// ---------------------------------------------------------------------------

pub struct Pipeline {
    pub store: Arc<Store>,
    pub ocr: Arc<dyn OcrClient>,
    pub vision: Arc<dyn VisionClient>,
    pub embedder: Arc<dyn Embedder>,
    pub settings: SharedSettings,
    pub storage_root: PathBuf,
}

impl Pipeline {
    /// Drive every pending document to completion, FIFO by registration,
    /// bounded by the worker budget.
    pub async fn process_pending(self: &Arc<Self>, opts: ProcessOptions) -> Result<ProcessReport> {
        let recovered = self.store.reset_processing().await?;
        if recovered > 0 {
            tracing::info!(recovered, "reset stale processing documents to pending");
        }

        let docs = self.store.pending_documents().await?;
        let budget = self.settings.snapshot().datalab_max_concurrent;
        let semaphore = Arc::new(Semaphore::new(budget.max(1)));

        let mut join_set: JoinSet<DocumentReport> = JoinSet::new();
        for doc in docs {
            let this = Arc::clone(self);
            let permit_source = Arc::clone(&semaphore);
            let opts = opts.clone();
            join_set.spawn(async move {
                let _permit = permit_source.acquire_owned().await.expect("semaphore open");
                this.process_document(doc, opts).await
            });
        }

        let mut report = ProcessReport {
            recovered,
            ..Default::default()
        };
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(doc_report) => {
                    report.processed += 1;
                    match doc_report.status {
                        DocStatus::Complete => report.complete += 1,
                        DocStatus::Failed => report.failed += 1,
                        _ => report.skipped += 1,
                    }
                    report.reports.push(doc_report);
                }
                Err(e) => {
                    // A panicked worker leaves its document `processing`;
                    // the next run's recovery pass resets it.
                    tracing::error!(error = %e, "document worker aborted");
                    report.processed += 1;
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    async fn process_document(&self, doc: Document, opts: ProcessOptions) -> DocumentReport {
        let mut report = DocumentReport {
            document_id: doc.id.clone(),
            status: DocStatus::Pending,
            chunks: 0,
            embedded: 0,
            failed_embeddings: 0,
            images: 0,
            described: 0,
            error: None,
        };

        match self.store.claim_document(doc.id.clone()).await {
            Ok(true) => {}
            Ok(false) => {
                // Another worker holds the lease.
                report.status = DocStatus::Processing;
                return report;
            }
            Err(e) => {
                report.status = DocStatus::Failed;
                report.error = Some(e.to_string());
                return report;
            }
        }

        let outcome = tokio::time::timeout(DOCUMENT_CEILING, self.run_document(&doc, &opts, &mut report))
            .await
            .unwrap_or(Err(PttsError::ExternalTimeout {
                operation: format!("document {}", doc.id),
            }));

        match outcome {
            Ok(page_count) => {
                if let Err(e) = self.store.mark_document_complete(doc.id.clone(), page_count).await
                {
                    report.status = DocStatus::Failed;
                    report.error = Some(e.to_string());
                } else {
                    report.status = DocStatus::Complete;
                }
            }
            Err(e) => {
                tracing::warn!(document = %doc.id, error = %e, "document processing failed");
                let _ = self
                    .store
                    .mark_document_failed(doc.id.clone(), e.to_string())
                    .await;
                report.status = DocStatus::Failed;
                report.error = Some(e.to_string());
            }
        }
        report
    }

    /// The transformation itself. External results are collected first; each
    /// store write happens in its own short transaction.
    async fn run_document(
        &self,
        doc: &Document,
        opts: &ProcessOptions,
        report: &mut DocumentReport,
    ) -> Result<i64> {
        let settings = self.settings.snapshot();
        let mode = opts.ocr_mode.unwrap_or(settings.datalab_default_mode);

        let output = self
            .ocr
            .process(Path::new(&doc.file_path), mode, opts.max_pages)
            .await?;

        let root_prov = self
            .store
            .get_provenance(doc.provenance_id.clone())
            .await?
            .ok_or_else(|| PttsError::ChainBroken {
                detail: format!("document {} has no root provenance", doc.id),
            })?;

        let (ocr_result, ocr_prov) = self.build_ocr_result(doc, &root_prov, mode, &output);

        let page_offsets: Option<&[PageOffset]> = match opts.chunking {
            ChunkingStrategy::PageAware if !output.pages.is_empty() => Some(&output.pages),
            _ => None,
        };
        let cfg = ChunkingConfig {
            chunk_size: settings.chunk_size,
            overlap_percent: settings.chunk_overlap_percent,
        };
        let windows = chunk_text(&output.text, &cfg, page_offsets);
        let (chunks, chunk_provs) = build_chunks(doc, &ocr_result, &ocr_prov, &windows, &cfg);
        report.chunks = chunks.len();

        self.store
            .store_ocr_output(ocr_result.clone(), ocr_prov.clone(), chunks, chunk_provs)
            .await?;

        let embed_report = indexer::embed_document_chunks(
            &self.store,
            &self.embedder,
            doc,
            settings.embedding_batch_size,
        )
        .await?;
        report.embedded = embed_report.embedded;
        report.failed_embeddings = embed_report.failed;

        if !output.images.is_empty() {
            self.handle_images(doc, &ocr_result, &ocr_prov, &output, opts.skip_vlm, report)
                .await?;
        }

        Ok(output.page_count)
    }

    fn build_ocr_result(
        &self,
        doc: &Document,
        root_prov: &ProvenanceRecord,
        mode: OcrMode,
        output: &OcrOutput,
    ) -> (OcrResult, ProvenanceRecord) {
        let text_hash = compute_hash_str(&output.text);
        let (processor, processor_version) = self.ocr.processor();

        let mut prov = ProvenanceRecord::child_of(
            root_prov,
            ProvenanceType::OcrResult,
            "ocr",
            &text_hash,
            processor,
            processor_version,
        );
        prov.processing_params = json!({ "mode": mode.as_str() }).to_string();
        prov.processing_duration_ms = Some(output.duration_ms);
        prov.quality_score = output.quality_score;

        let ocr_result = OcrResult {
            id: new_id(),
            document_id: doc.id.clone(),
            extracted_text: output.text.clone(),
            text_length: output.text.chars().count() as i64,
            request_id: Some(output.request_id.clone()),
            mode,
            page_count: output.page_count,
            quality_score: output.quality_score,
            cost: output.cost,
            text_hash,
            duration_ms: output.duration_ms,
            blocks: output.blocks.as_ref().map(|b| b.to_string()),
            extras: Some(json!({ "pages": output.pages }).to_string()),
            provenance_id: prov.id.clone(),
            created_at: now_rfc3339(),
        };
        (ocr_result, prov)
    }

    async fn handle_images(
        &self,
        doc: &Document,
        ocr_result: &OcrResult,
        ocr_prov: &ProvenanceRecord,
        output: &OcrOutput,
        skip_vlm: bool,
        report: &mut DocumentReport,
    ) -> Result<()> {
        let image_dir = self.storage_root.join("images").join(&doc.id);
        std::fs::create_dir_all(&image_dir).map_err(io_err(&image_dir))?;

        let mut records = Vec::new();
        let mut provs = Vec::new();
        for ocr_image in &output.images {
            let bytes = match ocr_image.decode_bytes() {
                Ok(b) => b,
                Err(e) => {
                    tracing::warn!(document = %doc.id, index = ocr_image.index, error = %e,
                        "dropping undecodable image payload");
                    continue;
                }
            };
            let file_path = image_dir.join(format!("{}.{}", ocr_image.index, ocr_image.format));
            std::fs::write(&file_path, &bytes).map_err(io_err(&file_path))?;
            let content_hash = crate::hasher::compute_hash(&bytes);

            let mut prov = ProvenanceRecord::child_of(
                ocr_prov,
                ProvenanceType::Image,
                "image_extraction",
                &content_hash,
                "image-extractor",
                env!("CARGO_PKG_VERSION"),
            );
            prov.location = Some(
                json!({
                    "page_number": ocr_image.page,
                    "bbox": ocr_image.bbox,
                    "image_index": ocr_image.index,
                })
                .to_string(),
            );

            let now = now_rfc3339();
            records.push(ImageRecord {
                id: new_id(),
                document_id: doc.id.clone(),
                ocr_result_id: ocr_result.id.clone(),
                page_number: ocr_image.page,
                bbox_x: ocr_image.bbox.x,
                bbox_y: ocr_image.bbox.y,
                bbox_width: ocr_image.bbox.width,
                bbox_height: ocr_image.bbox.height,
                image_index: ocr_image.index,
                format: ocr_image.format.clone(),
                width: ocr_image.width,
                height: ocr_image.height,
                file_path: file_path.to_string_lossy().into_owned(),
                file_size: bytes.len() as i64,
                vlm_status: DocStatus::Pending,
                vlm_description: None,
                structured_data: None,
                confidence: None,
                tokens_used: None,
                content_hash: Some(content_hash),
                provenance_id: prov.id.clone(),
                created_at: now.clone(),
                updated_at: now,
            });
            provs.push(prov);
        }

        report.images = records.len();
        if records.is_empty() {
            return Ok(());
        }
        self.store.store_images(records.clone(), provs.clone()).await?;

        if skip_vlm {
            return Ok(());
        }

        for (image, image_prov) in records.iter().zip(&provs) {
            if !self.store.claim_image_vision(image.id.clone()).await? {
                continue;
            }
            match self
                .vision
                .describe(Path::new(&image.file_path), &image.format)
                .await
            {
                Ok(vision) => {
                    let (vlm_processor, vlm_version) = self.vision.processor();
                    let mut vlm_prov = ProvenanceRecord::child_of(
                        image_prov,
                        ProvenanceType::VlmDescription,
                        "vision_analysis",
                        &compute_hash_str(&vision.description),
                        vlm_processor,
                        vlm_version,
                    );
                    vlm_prov.quality_score = Some(vision.confidence);

                    let vectors = self
                        .embedder
                        .embed_documents(std::slice::from_ref(&vision.description))
                        .await;
                    let embedding = match vectors {
                        Ok(mut v) if v.len() == 1 => {
                            let (row, prov) = indexer::build_description_embedding(
                                self.embedder.as_ref(),
                                doc,
                                image,
                                &vision.description,
                                &vlm_prov,
                            );
                            Some((row, v.remove(0), prov))
                        }
                        _ => None,
                    };

                    self.store
                        .store_vision_result(
                            image.id.clone(),
                            vision.description,
                            vision.structured_data.map(|v| v.to_string()),
                            vision.confidence,
                            vision.tokens_used,
                            vlm_prov,
                            embedding,
                        )
                        .await?;
                    report.described += 1;
                }
                Err(e) => {
                    tracing::warn!(image = %image.id, error = %e, "vision describe failed");
                    self.store.mark_image_vision_failed(image.id.clone()).await?;
                }
            }
        }
        Ok(())
    }
}

fn build_chunks(
    doc: &Document,
    ocr_result: &OcrResult,
    ocr_prov: &ProvenanceRecord,
    windows: &[crate::chunker::TextWindow],
    cfg: &ChunkingConfig,
) -> (Vec<Chunk>, Vec<ProvenanceRecord>) {
    let mut chunks = Vec::with_capacity(windows.len());
    let mut provs = Vec::with_capacity(windows.len());
    for window in windows {
        let text_hash = compute_hash_str(&window.text);
        let mut prov = ProvenanceRecord::child_of(
            ocr_prov,
            ProvenanceType::Chunk,
            "chunking",
            &text_hash,
            "chunker",
            env!("CARGO_PKG_VERSION"),
        );
        prov.location = Some(
            json!({
                "chunk_index": window.index,
                "character_start": window.char_start,
                "character_end": window.char_end,
                "page_number": window.page_number,
                "page_range": window.page_range,
            })
            .to_string(),
        );
        prov.processing_params = json!({
            "chunk_size": cfg.chunk_size,
            "overlap_percent": cfg.overlap_percent,
        })
        .to_string();

        let now = now_rfc3339();
        chunks.push(Chunk {
            id: new_id(),
            document_id: doc.id.clone(),
            ocr_result_id: ocr_result.id.clone(),
            text: window.text.clone(),
            text_hash,
            chunk_index: window.index as i64,
            character_start: window.char_start as i64,
            character_end: window.char_end as i64,
            page_number: window.page_number,
            page_range: window.page_range.clone(),
            overlap_previous: window.overlap_previous as i64,
            overlap_next: window.overlap_next as i64,
            embedding_status: EmbeddingStatus::Pending,
            provenance_id: prov.id.clone(),
            created_at: now.clone(),
            updated_at: now,
        });
        provs.push(prov);
    }
    (chunks, provs)
}
