use serde::{Deserialize, Serialize};

use crate::error::PttsError;

// ---------------------------------------------------------------------------
// Status and mode enums. Each round-trips through the TEXT columns that the
// schema CHECK-constrains, so `as_str` / `parse` are the single source of the
// wire spelling.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocStatus {
    Pending,
    Processing,
    Complete,
    Failed,
}

impl DocStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, PttsError> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            other => Err(PttsError::validation(format!("unknown status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingStatus {
    Pending,
    Complete,
    Failed,
}

impl EmbeddingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, PttsError> {
        match s {
            "pending" => Ok(Self::Pending),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            other => Err(PttsError::validation(format!(
                "unknown embedding status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OcrMode {
    Fast,
    #[default]
    Balanced,
    Accurate,
}

impl OcrMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Balanced => "balanced",
            Self::Accurate => "accurate",
        }
    }

    pub fn parse(s: &str) -> Result<Self, PttsError> {
        match s {
            "fast" => Ok(Self::Fast),
            "balanced" => Ok(Self::Balanced),
            "accurate" => Ok(Self::Accurate),
            other => Err(PttsError::validation(format!("unknown ocr mode: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Document,
    Query,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Query => "query",
        }
    }
}

// ---------------------------------------------------------------------------
// Provenance node types
// ---------------------------------------------------------------------------

/// Typed node kinds of the provenance DAG. The first six are produced by the
/// core pipeline; the rest are extension processors recorded with the same
/// hash discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProvenanceType {
    Document,
    OcrResult,
    Chunk,
    Image,
    VlmDescription,
    Embedding,
    Extraction,
    FormFill,
    Comparison,
    Clustering,
    KnowledgeGraph,
    EntityExtraction,
}

impl ProvenanceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Document => "DOCUMENT",
            Self::OcrResult => "OCR_RESULT",
            Self::Chunk => "CHUNK",
            Self::Image => "IMAGE",
            Self::VlmDescription => "VLM_DESCRIPTION",
            Self::Embedding => "EMBEDDING",
            Self::Extraction => "EXTRACTION",
            Self::FormFill => "FORM_FILL",
            Self::Comparison => "COMPARISON",
            Self::Clustering => "CLUSTERING",
            Self::KnowledgeGraph => "KNOWLEDGE_GRAPH",
            Self::EntityExtraction => "ENTITY_EXTRACTION",
        }
    }

    pub fn parse(s: &str) -> Result<Self, PttsError> {
        match s {
            "DOCUMENT" => Ok(Self::Document),
            "OCR_RESULT" => Ok(Self::OcrResult),
            "CHUNK" => Ok(Self::Chunk),
            "IMAGE" => Ok(Self::Image),
            "VLM_DESCRIPTION" => Ok(Self::VlmDescription),
            "EMBEDDING" => Ok(Self::Embedding),
            "EXTRACTION" => Ok(Self::Extraction),
            "FORM_FILL" => Ok(Self::FormFill),
            "COMPARISON" => Ok(Self::Comparison),
            "CLUSTERING" => Ok(Self::Clustering),
            "KNOWLEDGE_GRAPH" => Ok(Self::KnowledgeGraph),
            "ENTITY_EXTRACTION" => Ok(Self::EntityExtraction),
            other => Err(PttsError::InvalidType {
                value: other.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// One source file registered into the corpus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub file_path: String,
    pub file_name: String,
    pub file_size: i64,
    pub file_type: String,
    pub file_hash: String,
    pub status: DocStatus,
    pub page_count: Option<i64>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub subject: Option<String>,
    /// Id of the depth-0 provenance node rooting this document's subtree.
    pub provenance_id: String,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Textual output of running OCR over one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrResult {
    pub id: String,
    pub document_id: String,
    pub extracted_text: String,
    pub text_length: i64,
    pub request_id: Option<String>,
    pub mode: OcrMode,
    pub page_count: i64,
    pub quality_score: Option<f64>,
    pub cost: Option<f64>,
    pub text_hash: String,
    pub duration_ms: i64,
    /// Structured layout blocks as returned by the collaborator (JSON).
    pub blocks: Option<String>,
    /// Collaborator extras, including the per-page char offsets (JSON).
    pub extras: Option<String>,
    pub provenance_id: String,
    pub created_at: String,
}

/// One sliding window of OCR text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub ocr_result_id: String,
    pub text: String,
    /// sha256 of `text`, the chunk's content hash.
    pub text_hash: String,
    pub chunk_index: i64,
    pub character_start: i64,
    /// Exclusive end offset, counted in characters.
    pub character_end: i64,
    pub page_number: Option<i64>,
    pub page_range: Option<String>,
    pub overlap_previous: i64,
    pub overlap_next: i64,
    pub embedding_status: EmbeddingStatus,
    pub provenance_id: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Denormalized embedding row. Carries everything a search hit needs so no
/// follow-up reads are required; the vector itself lives in the vec0 index
/// keyed by `id`. Exactly one of `chunk_id` / `image_id` / `extraction_id`
/// is set (CHECK-enforced).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRow {
    pub id: String,
    pub chunk_id: Option<String>,
    pub image_id: Option<String>,
    pub extraction_id: Option<String>,
    pub original_text: String,
    pub source_file_path: String,
    pub source_file_name: String,
    pub source_file_hash: String,
    pub chunk_index: Option<i64>,
    pub total_chunks: Option<i64>,
    pub page_number: Option<i64>,
    pub page_range: Option<String>,
    pub character_start: Option<i64>,
    pub character_end: Option<i64>,
    pub model_name: String,
    pub model_version: String,
    pub task_type: TaskType,
    pub inference_mode: String,
    pub provenance_id: String,
    pub created_at: String,
}

/// One figure extracted from a page during OCR.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: String,
    pub document_id: String,
    pub ocr_result_id: String,
    pub page_number: i64,
    pub bbox_x: f64,
    pub bbox_y: f64,
    pub bbox_width: f64,
    pub bbox_height: f64,
    pub image_index: i64,
    pub format: String,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub file_path: String,
    pub file_size: i64,
    pub vlm_status: DocStatus,
    pub vlm_description: Option<String>,
    pub structured_data: Option<String>,
    pub confidence: Option<f64>,
    pub tokens_used: Option<i64>,
    pub content_hash: Option<String>,
    pub provenance_id: String,
    pub created_at: String,
    pub updated_at: String,
}

/// A typed node of the provenance DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    pub id: String,
    pub node_type: ProvenanceType,
    /// The act that produced the artifact (e.g. "file_upload", "ocr").
    pub source_type: String,
    pub source_path: Option<String>,
    /// Provenance id of the immediate producer.
    pub source_id: Option<String>,
    /// Provenance id of the DOCUMENT node rooting this subtree.
    pub root_document_id: String,
    /// JSON location payload: chunk index, char range, page info, bbox.
    pub location: Option<String>,
    pub content_hash: String,
    pub input_hash: Option<String>,
    pub file_hash: Option<String>,
    pub processor: String,
    pub processor_version: String,
    pub processing_params: String,
    pub processing_duration_ms: Option<i64>,
    pub quality_score: Option<f64>,
    pub parent_id: Option<String>,
    /// JSON array of ancestor ids, root first, immediate parent last.
    pub parent_ids: String,
    pub chain_depth: i64,
    /// JSON array of node type names, root first, self last.
    pub chain_path: String,
    pub created_at: String,
}

impl ProvenanceRecord {
    pub fn parent_id_list(&self) -> Vec<String> {
        serde_json::from_str(&self.parent_ids).unwrap_or_default()
    }
}

/// Corpus-level totals returned by `get_stats`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorpusStats {
    pub total_documents: i64,
    pub total_chunks: i64,
    pub total_embeddings: i64,
    pub total_images: i64,
    pub total_provenance: i64,
    pub documents_by_status: std::collections::BTreeMap<String, i64>,
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips() {
        for s in [
            DocStatus::Pending,
            DocStatus::Processing,
            DocStatus::Complete,
            DocStatus::Failed,
        ] {
            assert_eq!(DocStatus::parse(s.as_str()).unwrap(), s);
        }
        assert!(DocStatus::parse("done").is_err());
    }

    #[test]
    fn provenance_type_round_trips() {
        for t in [
            ProvenanceType::Document,
            ProvenanceType::OcrResult,
            ProvenanceType::Chunk,
            ProvenanceType::Image,
            ProvenanceType::VlmDescription,
            ProvenanceType::Embedding,
            ProvenanceType::Extraction,
            ProvenanceType::FormFill,
            ProvenanceType::Comparison,
            ProvenanceType::Clustering,
            ProvenanceType::KnowledgeGraph,
            ProvenanceType::EntityExtraction,
        ] {
            assert_eq!(ProvenanceType::parse(t.as_str()).unwrap(), t);
        }
        let err = ProvenanceType::parse("WIDGET").unwrap_err();
        assert_eq!(err.kind(), "INVALID_TYPE");
    }

    #[test]
    fn parent_id_list_tolerates_bad_json() {
        let mut rec = ProvenanceRecord {
            id: "p1".into(),
            node_type: ProvenanceType::Chunk,
            source_type: "chunking".into(),
            source_path: None,
            source_id: None,
            root_document_id: "root".into(),
            location: None,
            content_hash: "sha256:0000000000000000000000000000000000000000000000000000000000000000"
                .into(),
            input_hash: None,
            file_hash: None,
            processor: "chunker".into(),
            processor_version: "1".into(),
            processing_params: "{}".into(),
            processing_duration_ms: None,
            quality_score: None,
            parent_id: Some("root".into()),
            parent_ids: r#"["root"]"#.into(),
            chain_depth: 2,
            chain_path: r#"["DOCUMENT","OCR_RESULT","CHUNK"]"#.into(),
            created_at: now_rfc3339(),
        };
        assert_eq!(rec.parent_id_list(), vec!["root".to_string()]);
        rec.parent_ids = "not-json".into();
        assert!(rec.parent_id_list().is_empty());
    }
}
