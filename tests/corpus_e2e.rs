//! End-to-end pipeline test against a temp storage root: register files,
//! run OCR → chunk → embed → vision with fake collaborators, then exercise
//! search, verification, and the delete cascade.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use docsiphon::embedder::HashEmbedder;
use docsiphon::error::{PttsError, Result};
use docsiphon::model::{DocStatus, EmbeddingStatus, OcrMode, ProvenanceType};
use docsiphon::ocr::{BoundingBox, OcrClient, OcrImage, OcrOutput};
use docsiphon::pipeline::{ingest_paths, ChunkingStrategy, Pipeline, ProcessOptions};
use docsiphon::retry::BreakerState;
use docsiphon::search;
use docsiphon::settings::{SharedSettings, Settings};
use docsiphon::store::{ListFilter, Store};
use docsiphon::vision::{VisionClient, VisionOutput};

// ---------------------------------------------------------------------------
// Fake collaborators
// ---------------------------------------------------------------------------

/// Maps source file names to canned OCR text; optionally attaches one
/// embedded figure to a named file.
struct FakeOcr {
    texts: HashMap<String, String>,
    image_in: Option<String>,
}

#[async_trait]
impl OcrClient for FakeOcr {
    async fn process(
        &self,
        file_path: &Path,
        _mode: OcrMode,
        _max_pages: Option<u32>,
    ) -> Result<OcrOutput> {
        let name = file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let text = self
            .texts
            .get(&name)
            .cloned()
            .ok_or_else(|| PttsError::validation(format!("no canned text for {name}")))?;
        let chars = text.chars().count();

        let images = if self.image_in.as_deref() == Some(name.as_str()) {
            vec![OcrImage {
                page: 1,
                index: 0,
                bbox: BoundingBox {
                    x: 10.0,
                    y: 20.0,
                    width: 120.0,
                    height: 80.0,
                },
                format: "png".into(),
                width: Some(120),
                height: Some(80),
                data: base64::engine::general_purpose::STANDARD.encode(b"png-pixel-data"),
            }]
        } else {
            Vec::new()
        };

        Ok(OcrOutput {
            request_id: format!("req-{name}"),
            text,
            page_count: 1,
            pages: vec![docsiphon::chunker::PageOffset {
                page: 1,
                char_start: 0,
                char_end: chars,
            }],
            quality_score: Some(0.95),
            cost: Some(0.001),
            duration_ms: 7,
            blocks: None,
            images,
        })
    }

    fn breaker_state(&self) -> BreakerState {
        BreakerState::Closed
    }
}

struct FailingOcr;

#[async_trait]
impl OcrClient for FailingOcr {
    async fn process(&self, _: &Path, _: OcrMode, _: Option<u32>) -> Result<OcrOutput> {
        Err(PttsError::validation("unsupported file layout"))
    }

    fn breaker_state(&self) -> BreakerState {
        BreakerState::Closed
    }
}

struct FakeVision;

#[async_trait]
impl VisionClient for FakeVision {
    async fn describe(&self, _image_path: &Path, _format: &str) -> Result<VisionOutput> {
        Ok(VisionOutput {
            description: "A pie chart of quarterly expenses".to_string(),
            confidence: 0.9,
            structured_data: Some(serde_json::json!({ "kind": "chart" })),
            tokens_used: Some(42),
        })
    }

    fn breaker_state(&self) -> BreakerState {
        BreakerState::Closed
    }
}

/// Always-failing embedder, used to drive the per-batch failure path.
struct BrokenEmbedder;

#[async_trait]
impl docsiphon::embedder::Embedder for BrokenEmbedder {
    fn model_name(&self) -> &str {
        "broken"
    }
    fn model_version(&self) -> &str {
        "0"
    }
    fn dimensions(&self) -> usize {
        docsiphon::settings::EMBEDDING_DIMENSIONS
    }
    async fn embed_documents(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(PttsError::ExternalUnavailable {
            operation: "embed".into(),
            cause: "device lost".into(),
        })
    }
    async fn embed_query(&self, _text: &str) -> Result<Vec<f32>> {
        Err(PttsError::ExternalUnavailable {
            operation: "embed".into(),
            cause: "device lost".into(),
        })
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Corpus {
    _dir: tempfile::TempDir,
    storage: PathBuf,
    store: Arc<Store>,
    files: Vec<PathBuf>,
}

/// Create a corpus with three source files and canned OCR text; the first
/// file also yields an embedded figure.
async fn seeded_corpus() -> (Corpus, Arc<Pipeline>) {
    let dir = tempfile::tempdir().unwrap();
    let storage = dir.path().to_path_buf();
    let store = Arc::new(Store::create("e2e", &storage).unwrap());

    let specs = [
        ("alpha.pdf", "Hello World"),
        ("bravo.pdf", "hello world"),
        ("charlie.pdf", "Phone: 123-456-7890 call me"),
    ];
    let mut files = Vec::new();
    let mut texts = HashMap::new();
    for (name, text) in specs {
        let path = storage.join(name);
        std::fs::write(&path, format!("%binary-source-of {name}")).unwrap();
        texts.insert(name.to_string(), text.to_string());
        files.push(path);
    }

    let pipeline = Arc::new(Pipeline {
        store: Arc::clone(&store),
        ocr: Arc::new(FakeOcr {
            texts,
            image_in: Some("alpha.pdf".into()),
        }),
        vision: Arc::new(FakeVision),
        embedder: Arc::new(HashEmbedder::new()),
        settings: SharedSettings::new(Settings::default()),
        storage_root: storage.clone(),
    });

    (
        Corpus {
            _dir: dir,
            storage,
            store,
            files,
        },
        pipeline,
    )
}

async fn ingest_and_process(corpus: &Corpus, pipeline: &Arc<Pipeline>) {
    let report = ingest_paths(&corpus.store, corpus.files.clone()).await.unwrap();
    assert_eq!(report.registered, 3);

    let report = pipeline
        .process_pending(ProcessOptions {
            ocr_mode: None,
            chunking: ChunkingStrategy::PageAware,
            max_pages: None,
            skip_vlm: false,
        })
        .await
        .unwrap();
    assert_eq!(report.processed, 3);
    assert_eq!(report.complete, 3, "reports: {:?}", report.reports);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pipeline_produces_verifiable_corpus() {
    let (corpus, pipeline) = seeded_corpus().await;
    ingest_and_process(&corpus, &pipeline).await;

    let docs = corpus
        .store
        .list_documents(ListFilter::default())
        .await
        .unwrap();
    assert_eq!(docs.len(), 3);
    assert!(docs.iter().all(|d| d.status == DocStatus::Complete));
    assert!(docs.iter().all(|d| d.page_count == Some(1)));

    // Every chunk embedded; lexical and vector indexes in lockstep.
    for doc in &docs {
        let chunks = corpus.store.list_chunks(doc.id.clone()).await.unwrap();
        assert_eq!(chunks.len(), 1); // short texts fit one window
        assert!(chunks
            .iter()
            .all(|c| c.embedding_status == EmbeddingStatus::Complete));
    }
    let stats = corpus.store.get_stats().await.unwrap();
    assert_eq!(stats.total_chunks, 3);
    assert_eq!(stats.total_images, 1);
    // 3 chunk embeddings + 1 description embedding
    assert_eq!(stats.total_embeddings, 4);
    let (fts, vec) = corpus.store.index_counts().await.unwrap();
    assert_eq!(fts, stats.total_chunks);
    assert_eq!(vec, stats.total_embeddings);

    // The figure got described and its description embedded at depth 4.
    let alpha = docs.iter().find(|d| d.file_name == "alpha.pdf").unwrap();
    let images = corpus.store.list_images(alpha.id.clone()).await.unwrap();
    assert_eq!(images.len(), 1);
    let image = &images[0];
    assert_eq!(image.vlm_status, DocStatus::Complete);
    assert_eq!(
        image.vlm_description.as_deref(),
        Some("A pie chart of quarterly expenses")
    );
    assert!(Path::new(&image.file_path).exists());

    let subtree = corpus
        .store
        .get_by_root(alpha.provenance_id.clone())
        .await
        .unwrap();
    let depths: Vec<i64> = subtree.iter().map(|n| n.chain_depth).collect();
    assert!(depths.contains(&4), "expected a depth-4 node, got {depths:?}");
    let vlm_embedding = subtree
        .iter()
        .find(|n| n.chain_depth == 4 && n.node_type == ProvenanceType::Embedding)
        .expect("description embedding node");
    let chain = corpus
        .store
        .get_chain(vlm_embedding.id.clone())
        .await
        .unwrap();
    assert!(chain.is_complete);
    assert_eq!(chain.ancestors.len(), 4);
    assert_eq!(chain.ancestors[0].node_type, ProvenanceType::Document);

    // Hash canonicality and chain structure over the whole corpus.
    let report = corpus.store.verify_database().await.unwrap();
    assert_eq!(report.failed, 0, "failures: {:?}", report.failed_items);
    assert_eq!(report.verified, report.total_nodes);
    assert!(report.chain_errors.is_empty());

    let integrity = corpus
        .store
        .verify_file_integrity(alpha.id.clone())
        .await
        .unwrap();
    assert!(integrity.valid);
}

#[tokio::test]
async fn search_semantics_match_the_contract() {
    let (corpus, pipeline) = seeded_corpus().await;
    ingest_and_process(&corpus, &pipeline).await;
    let store = &corpus.store;

    // Empty query: rejected before touching the store.
    let err = search::lexical(
        store,
        search::TextSearch {
            query: "".into(),
            match_type: search::MatchType::Exact,
            limit: 10,
            include_provenance: false,
        },
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), "VALIDATION_ERROR");

    // Exact is case-sensitive; fuzzy is not.
    let exact = search::lexical(
        store,
        search::TextSearch {
            query: "Hello".into(),
            match_type: search::MatchType::Exact,
            limit: 10,
            include_provenance: false,
        },
    )
    .await
    .unwrap();
    assert_eq!(exact.total, 1);
    assert_eq!(exact.results[0].original_text, "Hello World");
    assert_eq!(exact.results[0].source_file_name, "alpha.pdf");

    let fuzzy = search::lexical(
        store,
        search::TextSearch {
            query: "Hello".into(),
            match_type: search::MatchType::Fuzzy,
            limit: 10,
            include_provenance: false,
        },
    )
    .await
    .unwrap();
    assert_eq!(fuzzy.total, 2);

    // Regex with a digit pattern; malformed patterns are validation errors.
    let regex = search::lexical(
        store,
        search::TextSearch {
            query: r"\d{3}-\d{3}-\d{4}".into(),
            match_type: search::MatchType::Regex,
            limit: 10,
            include_provenance: true,
        },
    )
    .await
    .unwrap();
    assert_eq!(regex.total, 1);
    assert_eq!(regex.results[0].source_file_name, "charlie.pdf");
    let prov = regex.results[0].provenance.as_ref().unwrap();
    assert_eq!(prov[0].node_type, "DOCUMENT");
    assert_eq!(prov[1].node_type, "OCR_RESULT");
    assert_eq!(prov[2].node_type, "CHUNK");

    let err = search::lexical(
        store,
        search::TextSearch {
            query: "[invalid(".into(),
            match_type: search::MatchType::Regex,
            limit: 10,
            include_provenance: false,
        },
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), "VALIDATION_ERROR");

    // Vector search: identical text embeds to the identical unit vector, so
    // the matching chunk comes back first with similarity ~1 and carries its
    // denormalized source fields.
    let embedder = HashEmbedder::new();
    let vector = search::vector(
        store,
        &embedder,
        search::VectorSearch {
            query: "Hello World".into(),
            similarity_threshold: Some(0.99),
            limit: 5,
            include_provenance: false,
        },
    )
    .await
    .unwrap();
    assert!(vector.total >= 1);
    assert_eq!(vector.results[0].original_text, "Hello World");
    assert_eq!(vector.results[0].source_file_name, "alpha.pdf");
    assert!(vector.results[0].score > 0.99);

    // Hybrid: weights must sum to 1.
    let err = search::hybrid(
        store,
        &embedder,
        search::HybridSearch {
            query: "x".into(),
            semantic_weight: 0.5,
            keyword_weight: 0.3,
            limit: 10,
            include_provenance: false,
        },
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), "VALIDATION_ERROR");

    let hybrid = search::hybrid(
        store,
        &embedder,
        search::HybridSearch {
            query: "Hello World".into(),
            semantic_weight: 0.6,
            keyword_weight: 0.4,
            limit: 5,
            include_provenance: false,
        },
    )
    .await
    .unwrap();
    assert!(hybrid.total >= 1);
    // Both legs agree on the alpha chunk, so it must rank first.
    assert_eq!(hybrid.results[0].original_text, "Hello World");
    assert!(hybrid.results.windows(2).all(|w| w[0].score >= w[1].score));
}

#[tokio::test]
async fn delete_cascade_clears_subtree_and_indexes() {
    let (corpus, pipeline) = seeded_corpus().await;
    ingest_and_process(&corpus, &pipeline).await;
    let store = &corpus.store;

    let docs = store.list_documents(ListFilter::default()).await.unwrap();
    let alpha = docs.iter().find(|d| d.file_name == "alpha.pdf").unwrap();
    let image_file = store.list_images(alpha.id.clone()).await.unwrap()[0]
        .file_path
        .clone();

    let (fts_before, vec_before) = store.index_counts().await.unwrap();
    let counts = store.delete_document(alpha.id.clone()).await.unwrap();
    assert_eq!(counts.chunks, 1);
    assert_eq!(counts.embeddings, 2); // chunk + description embedding
    assert_eq!(counts.images, 1);
    // DOCUMENT, OCR_RESULT, CHUNK, IMAGE, VLM_DESCRIPTION, 2×EMBEDDING
    assert_eq!(counts.provenance, 7);
    assert_eq!(counts.image_files, vec![image_file.clone()]);

    let (fts_after, vec_after) = store.index_counts().await.unwrap();
    assert_eq!(fts_before - fts_after, 1);
    assert_eq!(vec_before - vec_after, 2);

    assert!(store
        .get_document(alpha.id.clone())
        .await
        .unwrap()
        .is_none());
    assert!(store
        .get_by_root(alpha.provenance_id.clone())
        .await
        .unwrap()
        .is_empty());

    // Lexical hits for the deleted chunk are gone.
    let exact = search::lexical(
        store,
        search::TextSearch {
            query: "Hello".into(),
            match_type: search::MatchType::Exact,
            limit: 10,
            include_provenance: false,
        },
    )
    .await
    .unwrap();
    assert_eq!(exact.total, 0);

    // On-disk cleanup is the caller's job after commit.
    std::fs::remove_file(&image_file).unwrap();
}

#[tokio::test]
async fn embedding_failure_flips_chunks_failed_but_document_completes() {
    let (corpus, pipeline) = seeded_corpus().await;

    let broken = Arc::new(Pipeline {
        store: Arc::clone(&pipeline.store),
        ocr: Arc::clone(&pipeline.ocr),
        vision: Arc::clone(&pipeline.vision),
        embedder: Arc::new(BrokenEmbedder),
        settings: pipeline.settings.clone(),
        storage_root: corpus.storage.clone(),
    });

    ingest_paths(&corpus.store, corpus.files.clone()).await.unwrap();
    let report = broken
        .process_pending(ProcessOptions {
            skip_vlm: true,
            ..Default::default()
        })
        .await
        .unwrap();

    // OCR and chunking succeed; the batches fail; artifacts are retained.
    assert_eq!(report.complete, 3);
    for doc_report in &report.reports {
        assert_eq!(doc_report.embedded, 0);
        assert!(doc_report.failed_embeddings > 0);
    }
    let docs = corpus
        .store
        .list_documents(ListFilter::default())
        .await
        .unwrap();
    for doc in &docs {
        let chunks = corpus.store.list_chunks(doc.id.clone()).await.unwrap();
        assert!(chunks
            .iter()
            .all(|c| c.embedding_status == EmbeddingStatus::Failed));
    }
    let (_, vec_count) = corpus.store.index_counts().await.unwrap();
    assert_eq!(vec_count, 0);
}

#[tokio::test]
async fn tampered_source_file_fails_verification() {
    let (corpus, pipeline) = seeded_corpus().await;
    ingest_and_process(&corpus, &pipeline).await;

    let docs = corpus
        .store
        .list_documents(ListFilter::default())
        .await
        .unwrap();
    let alpha = docs.iter().find(|d| d.file_name == "alpha.pdf").unwrap();

    // Rewrite the source bytes after ingestion.
    std::fs::write(&alpha.file_path, "tampered contents").unwrap();

    let integrity = corpus
        .store
        .verify_file_integrity(alpha.id.clone())
        .await
        .unwrap();
    assert!(!integrity.valid);
    assert_ne!(integrity.expected, integrity.computed);

    let outcome = corpus
        .store
        .verify_content_hash(alpha.provenance_id.clone())
        .await
        .unwrap();
    assert!(!outcome.valid);
    assert!(outcome.format_valid);

    // The sweep pinpoints exactly the tampered DOCUMENT node; the rest of
    // the DAG still verifies.
    let report = corpus.store.verify_database().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.failed_items[0].node_type, "DOCUMENT");
    assert_eq!(report.verified, report.total_nodes - 1);
}

#[tokio::test]
async fn ocr_failure_marks_document_failed_with_message() {
    let (corpus, pipeline) = seeded_corpus().await;

    let failing = Arc::new(Pipeline {
        store: Arc::clone(&pipeline.store),
        ocr: Arc::new(FailingOcr),
        vision: Arc::clone(&pipeline.vision),
        embedder: Arc::new(HashEmbedder::new()),
        settings: pipeline.settings.clone(),
        storage_root: corpus.storage.clone(),
    });

    ingest_paths(&corpus.store, vec![corpus.files[0].clone()])
        .await
        .unwrap();
    let report = failing.process_pending(ProcessOptions::default()).await.unwrap();
    assert_eq!(report.failed, 1);

    let docs = corpus
        .store
        .list_documents(ListFilter {
            status: Some(DocStatus::Failed),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(docs.len(), 1);
    assert!(docs[0]
        .error_message
        .as_deref()
        .unwrap()
        .contains("unsupported file layout"));

    // A failed document is out of the pending queue until re-ingested.
    let rerun = failing.process_pending(ProcessOptions::default()).await.unwrap();
    assert_eq!(rerun.processed, 0);
}
