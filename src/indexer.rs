//! Embedding indexer: turns pending chunks into embedding rows, vec0 index
//! entries, and depth-3 provenance, batch by batch in ascending chunk index,
//! one transaction per batch. A failed batch flips only its own chunks to
//! `failed`; later batches still run.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;

use crate::embedder::Embedder;
use crate::error::Result;
use crate::hasher::compute_hash_str;
use crate::model::{
    new_id, now_rfc3339, Chunk, Document, EmbeddingRow, ImageRecord, ProvenanceRecord,
    ProvenanceType, TaskType,
};
use crate::store::Store;

#[derive(Debug, Default, Serialize)]
pub struct EmbedReport {
    pub embedded: usize,
    pub failed: usize,
    pub batches: usize,
    pub failed_batches: usize,
}

/// Embed every pending chunk of one document.
pub async fn embed_document_chunks(
    store: &Store,
    embedder: &Arc<dyn Embedder>,
    doc: &Document,
    batch_size: usize,
) -> Result<EmbedReport> {
    let chunks = store.pending_chunks(doc.id.clone()).await?;
    let total_chunks = store.list_chunks(doc.id.clone()).await?.len() as i64;
    let mut report = EmbedReport::default();

    for batch in chunks.chunks(batch_size.max(1)) {
        report.batches += 1;
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();

        let vectors = match embedder.embed_documents(&texts).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(document = %doc.id, error = %e, "embedding batch failed");
                store
                    .mark_chunks_failed(batch.iter().map(|c| c.id.clone()).collect())
                    .await?;
                report.failed += batch.len();
                report.failed_batches += 1;
                continue;
            }
        };

        let mut rows = Vec::with_capacity(batch.len());
        for (chunk, vector) in batch.iter().zip(vectors) {
            let (row, prov) =
                build_chunk_embedding(store, embedder.as_ref(), doc, chunk, total_chunks).await?;
            rows.push((row, vector, prov));
        }
        store.store_embedding_batch(rows).await?;
        report.embedded += batch.len();
    }

    Ok(report)
}

async fn build_chunk_embedding(
    store: &Store,
    embedder: &dyn Embedder,
    doc: &Document,
    chunk: &Chunk,
    total_chunks: i64,
) -> Result<(EmbeddingRow, ProvenanceRecord)> {
    // Re-hash the text being embedded; this is the hash the verifier will
    // re-derive from `original_text`, independent of the stored chunk row.
    let content_hash = compute_hash_str(&chunk.text);

    let chunk_prov = store
        .get_provenance(chunk.provenance_id.clone())
        .await?
        .ok_or_else(|| crate::error::PttsError::ChainBroken {
            detail: format!("chunk {} has no provenance node", chunk.id),
        })?;

    let mut prov = ProvenanceRecord::child_of(
        &chunk_prov,
        ProvenanceType::Embedding,
        "embedding",
        &content_hash,
        embedder.model_name(),
        embedder.model_version(),
    );
    prov.location = Some(
        json!({
            "chunk_index": chunk.chunk_index,
            "character_start": chunk.character_start,
            "character_end": chunk.character_end,
            "page_number": chunk.page_number,
            "page_range": chunk.page_range,
        })
        .to_string(),
    );
    prov.processing_params = json!({
        "model": embedder.model_name(),
        "dimensions": embedder.dimensions(),
        "task_type": TaskType::Document.as_str(),
    })
    .to_string();

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
        total_chunks: Some(total_chunks),
        page_number: chunk.page_number,
        page_range: chunk.page_range.clone(),
        character_start: Some(chunk.character_start),
        character_end: Some(chunk.character_end),
        model_name: embedder.model_name().to_string(),
        model_version: embedder.model_version().to_string(),
        task_type: TaskType::Document,
        inference_mode: "local".to_string(),
        provenance_id: prov.id.clone(),
        created_at: now_rfc3339(),
    };

    Ok((row, prov))
}

/// Depth-4 embedding over a vision description, derived from the
/// VLM_DESCRIPTION node.
pub fn build_description_embedding(
    embedder: &dyn Embedder,
    doc: &Document,
    image: &ImageRecord,
    description: &str,
    vlm_prov: &ProvenanceRecord,
) -> (EmbeddingRow, ProvenanceRecord) {
    let content_hash = compute_hash_str(description);
    let mut prov = ProvenanceRecord::child_of(
        vlm_prov,
        ProvenanceType::Embedding,
        "embedding",
        &content_hash,
        embedder.model_name(),
        embedder.model_version(),
    );
    prov.location = Some(
        json!({
            "page_number": image.page_number,
            "image_index": image.image_index,
        })
        .to_string(),
    );

    let row = EmbeddingRow {
        id: new_id(),
        chunk_id: None,
        image_id: Some(image.id.clone()),
        extraction_id: None,
        original_text: description.to_string(),
        source_file_path: doc.file_path.clone(),
        source_file_name: doc.file_name.clone(),
        source_file_hash: doc.file_hash.clone(),
        chunk_index: None,
        total_chunks: None,
        page_number: Some(image.page_number),
        page_range: None,
        character_start: None,
        character_end: None,
        model_name: embedder.model_name().to_string(),
        model_version: embedder.model_version().to_string(),
        task_type: TaskType::Document,
        inference_mode: "local".to_string(),
        provenance_id: prov.id.clone(),
        created_at: now_rfc3339(),
    };

    (row, prov)
}
