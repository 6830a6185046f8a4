//! Shared fixtures for the unit-test suites.

use crate::hasher::compute_hash_str;
use crate::model::{
    new_id, now_rfc3339, Chunk, DocStatus, Document, EmbeddingRow, EmbeddingStatus, OcrMode,
    OcrResult, ProvenanceRecord, ProvenanceType, TaskType,
};
use crate::settings::EMBEDDING_DIMENSIONS;
use crate::store::Store;

pub(crate) fn sample_document() -> (Document, ProvenanceRecord) {
    sample_document_with_path("/tmp/report.pdf")
}

/// Like [`sample_document`], but the source file really exists on disk so
/// file-hash verification can succeed.
pub(crate) fn sample_document_at(dir: &std::path::Path) -> (Document, ProvenanceRecord) {
    let path = dir.join("report.pdf");
    std::fs::write(&path, "file-bytes").unwrap();
    sample_document_with_path(&path.to_string_lossy())
}

fn sample_document_with_path(path: &str) -> (Document, ProvenanceRecord) {
    let hash = compute_hash_str("file-bytes");
    let prov = ProvenanceRecord::root(path, &hash, "ingest", "1");
    let now = now_rfc3339();
    let doc = Document {
        id: new_id(),
        file_path: path.to_string(),
        file_name: "report.pdf".into(),
        file_size: 10,
        file_type: "pdf".into(),
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
    (doc, prov)
}

pub(crate) fn sample_ocr(
    doc: &Document,
    root: &ProvenanceRecord,
    text: &str,
) -> (OcrResult, ProvenanceRecord) {
    let text_hash = compute_hash_str(text);
    let prov = ProvenanceRecord::child_of(
        root,
        ProvenanceType::OcrResult,
        "ocr",
        &text_hash,
        "datalab-ocr",
        "1",
    );
    let ocr = OcrResult {
        id: new_id(),
        document_id: doc.id.clone(),
        extracted_text: text.to_string(),
        text_length: text.chars().count() as i64,
        request_id: Some("req-1".into()),
        mode: OcrMode::Balanced,
        page_count: 1,
        quality_score: Some(0.9),
        cost: None,
        text_hash,
        duration_ms: 5,
        blocks: None,
        extras: None,
        provenance_id: prov.id.clone(),
        created_at: now_rfc3339(),
    };
    (ocr, prov)
}

pub(crate) fn sample_chunk(
    doc: &Document,
    ocr: &OcrResult,
    ocr_prov: &ProvenanceRecord,
    index: i64,
    text: &str,
) -> (Chunk, ProvenanceRecord) {
    let text_hash = compute_hash_str(text);
    let prov = ProvenanceRecord::child_of(
        ocr_prov,
        ProvenanceType::Chunk,
        "chunking",
        &text_hash,
        "chunker",
        "1",
    );
    let now = now_rfc3339();
    let chunk = Chunk {
        id: new_id(),
        document_id: doc.id.clone(),
        ocr_result_id: ocr.id.clone(),
        text: text.to_string(),
        text_hash,
        chunk_index: index,
        character_start: index * 10,
        character_end: index * 10 + text.chars().count() as i64,
        page_number: Some(1),
        page_range: None,
        overlap_previous: 0,
        overlap_next: 0,
        embedding_status: EmbeddingStatus::Pending,
        provenance_id: prov.id.clone(),
        created_at: now.clone(),
        updated_at: now,
    };
    (chunk, prov)
}

pub(crate) fn sample_embedding(
    doc: &Document,
    chunk: &Chunk,
    chunk_prov: &ProvenanceRecord,
) -> (EmbeddingRow, Vec<f32>, ProvenanceRecord) {
    let prov = ProvenanceRecord::child_of(
        chunk_prov,
        ProvenanceType::Embedding,
        "embedding",
        &chunk.text_hash,
        "test-model",
        "1",
    );
    let row = EmbeddingRow {
        id: new_id(),
        chunk_id: Some(chunk.id.clone()),
        image_id: None,
        extraction_id: None,
        original_text: chunk.text.clone(),
        source_file_path: doc.file_path.clone(),
        source_file_name: doc.file_name.clone(),
        source_file_hash: doc.file_hash.clone(),
        chunk_index: Some(chunk.chunk_index),
        total_chunks: Some(1),
        page_number: chunk.page_number,
        page_range: None,
        character_start: Some(chunk.character_start),
        character_end: Some(chunk.character_end),
        model_name: "test-model".into(),
        model_version: "1".into(),
        task_type: TaskType::Document,
        inference_mode: "local".into(),
        provenance_id: prov.id.clone(),
        created_at: now_rfc3339(),
    };
    (row, vec![0.05f32; EMBEDDING_DIMENSIONS], prov)
}

/// Insert a document with one OCR result, `n` embedded chunks.
/// Returns the document, its chunks, and the OCR provenance node.
pub(crate) async fn populate(
    store: &Store,
    n: usize,
) -> (Document, Vec<Chunk>, ProvenanceRecord) {
    let (doc, root) = sample_document();
    populate_from(store, doc, root, n).await
}

/// [`populate`] with an on-disk source file under `dir`.
pub(crate) async fn populate_at(
    store: &Store,
    dir: &std::path::Path,
    n: usize,
) -> (Document, Vec<Chunk>, ProvenanceRecord) {
    let (doc, root) = sample_document_at(dir);
    populate_from(store, doc, root, n).await
}

async fn populate_from(
    store: &Store,
    doc: Document,
    root: ProvenanceRecord,
    n: usize,
) -> (Document, Vec<Chunk>, ProvenanceRecord) {
    store
        .insert_document(doc.clone(), root.clone())
        .await
        .unwrap();

    let (ocr, ocr_prov) = sample_ocr(&doc, &root, "The quick brown fox");
    let mut chunks = Vec::new();
    let mut provs = Vec::new();
    for i in 0..n {
        let (c, p) = sample_chunk(&doc, &ocr, &ocr_prov, i as i64, &format!("chunk text {i}"));
        chunks.push(c);
        provs.push(p);
    }
    store
        .store_ocr_output(ocr, ocr_prov.clone(), chunks.clone(), provs.clone())
        .await
        .unwrap();

    let batch: Vec<_> = chunks
        .iter()
        .zip(&provs)
        .map(|(c, p)| sample_embedding(&doc, c, p))
        .collect();
    store.store_embedding_batch(batch).await.unwrap();
    (doc, chunks, ocr_prov)
}
