//! Tri-modal search: lexical (substring / regex over chunk text), vector
//! (KNN over the embedding index), and hybrid (reciprocal rank fusion of a
//! bm25 keyword leg and the vector leg).
//!
//! Every hit is materialized from denormalized columns and carries its
//! original text and source location; callers never need a follow-up read.

use regex::RegexBuilder;
use rusqlite::params;
use serde::Serialize;
use zerocopy::AsBytes;

use crate::embedder::Embedder;
use crate::error::{db_err, PttsError, Result};
use crate::store::{map_chunk, map_embedding, Store, CHUNK_COLS, EMBEDDING_COLS};

/// Queries longer than this are rejected up front.
pub const MAX_QUERY_CHARS: usize = 1000;

/// Rank constant of the reciprocal rank fusion combinator.
const RRF_K: f64 = 60.0;

/// Candidate multiplier for the hybrid legs.
const HYBRID_CANDIDATE_FACTOR: usize = 4;

const WEIGHT_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Exact,
    Fuzzy,
    Regex,
}

impl MatchType {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "exact" => Ok(Self::Exact),
            "fuzzy" => Ok(Self::Fuzzy),
            "regex" => Ok(Self::Regex),
            other => Err(PttsError::validation(format!(
                "match_type must be exact|fuzzy|regex, got {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProvenanceSummary {
    pub id: String,
    pub node_type: String,
    pub chain_depth: i64,
    pub processor: String,
    pub content_hash: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub chunk_id: Option<String>,
    pub image_id: Option<String>,
    pub document_id: Option<String>,
    pub original_text: String,
    pub source_file_path: String,
    pub source_file_name: String,
    pub page_number: Option<i64>,
    pub page_range: Option<String>,
    pub character_start: Option<i64>,
    pub character_end: Option<i64>,
    pub chunk_index: Option<i64>,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Vec<ProvenanceSummary>>,
    #[serde(skip)]
    provenance_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_type: Option<MatchType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub semantic_weight: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyword_weight: Option<f64>,
    pub total: usize,
    pub results: Vec<SearchHit>,
}

fn validate_query(query: &str) -> Result<()> {
    if query.trim().is_empty() {
        return Err(PttsError::validation("query must not be empty"));
    }
    if query.chars().count() > MAX_QUERY_CHARS {
        return Err(PttsError::validation(format!(
            "query exceeds {MAX_QUERY_CHARS} characters"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Lexical search
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TextSearch {
    pub query: String,
    pub match_type: MatchType,
    pub limit: usize,
    pub include_provenance: bool,
}

/// Chunk row joined with the owning document's identity, ready to become a
/// hit without further reads.
struct ChunkHitRow {
    chunk: crate::model::Chunk,
    file_path: String,
    file_name: String,
}

fn chunk_hit(row: ChunkHitRow, score: f64) -> SearchHit {
    SearchHit {
        chunk_id: Some(row.chunk.id),
        image_id: None,
        document_id: Some(row.chunk.document_id),
        original_text: row.chunk.text,
        source_file_path: row.file_path,
        source_file_name: row.file_name,
        page_number: row.chunk.page_number,
        page_range: row.chunk.page_range,
        character_start: Some(row.chunk.character_start),
        character_end: Some(row.chunk.character_end),
        chunk_index: Some(row.chunk.chunk_index),
        score,
        provenance: None,
        provenance_id: Some(row.chunk.provenance_id),
    }
}

pub async fn lexical(store: &Store, req: TextSearch) -> Result<SearchResponse> {
    validate_query(&req.query)?;

    // Compile eagerly so a malformed pattern fails before any table scan.
    let regex = match req.match_type {
        MatchType::Regex => Some(
            RegexBuilder::new(&req.query)
                .case_insensitive(true)
                .build()
                .map_err(|e| PttsError::validation(format!("invalid regex: {e}")))?,
        ),
        _ => None,
    };

    let query = req.query.clone();
    let match_type = req.match_type;
    let limit = req.limit;

    let rows: Vec<ChunkHitRow> = store
        .query(move |conn| {
            let base = format!(
                "SELECT {cols}, d.file_path, d.file_name
                 FROM chunks c JOIN documents d ON d.id = c.document_id",
                cols = qualified_chunk_cols()
            );
            let sql = match match_type {
                MatchType::Exact => format!(
                    "{base} WHERE INSTR(c.text, ?1) > 0
                     ORDER BY c.document_id, c.chunk_index LIMIT ?2"
                ),
                MatchType::Fuzzy => format!(
                    "{base} WHERE INSTR(LOWER(c.text), LOWER(?1)) > 0
                     ORDER BY c.document_id, c.chunk_index LIMIT ?2"
                ),
                // Regex scans every row; the filter happens in Rust below.
                MatchType::Regex => {
                    format!("{base} ORDER BY c.document_id, c.chunk_index")
                }
            };

            let mut stmt = conn.prepare(&sql).map_err(db_err("prepare lexical search"))?;
            let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<ChunkHitRow> {
                Ok(ChunkHitRow {
                    chunk: map_chunk(row)?,
                    file_path: row.get(16)?,
                    file_name: row.get(17)?,
                })
            };
            let collected = match match_type {
                MatchType::Regex => stmt
                    .query_map([], map_row)
                    .map_err(db_err("lexical search"))?
                    .collect::<std::result::Result<Vec<_>, _>>(),
                _ => stmt
                    .query_map(params![query, limit as i64], map_row)
                    .map_err(db_err("lexical search"))?
                    .collect::<std::result::Result<Vec<_>, _>>(),
            };
            collected.map_err(db_err("read lexical row"))
        })
        .await?;

    let mut hits: Vec<SearchHit> = match regex {
        Some(re) => rows
            .into_iter()
            .filter(|r| re.is_match(&r.chunk.text))
            .take(req.limit)
            .map(|r| chunk_hit(r, 1.0))
            .collect(),
        None => rows.into_iter().map(|r| chunk_hit(r, 1.0)).collect(),
    };

    if req.include_provenance {
        attach_provenance(store, &mut hits).await?;
    }

    Ok(SearchResponse {
        query: req.query,
        match_type: Some(req.match_type),
        semantic_weight: None,
        keyword_weight: None,
        total: hits.len(),
        results: hits,
    })
}

// ---------------------------------------------------------------------------
// Vector search
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct VectorSearch {
    pub query: String,
    pub similarity_threshold: Option<f64>,
    pub limit: usize,
    pub include_provenance: bool,
}

pub async fn vector(
    store: &Store,
    embedder: &dyn Embedder,
    req: VectorSearch,
) -> Result<SearchResponse> {
    validate_query(&req.query)?;
    if let Some(t) = req.similarity_threshold {
        if !(0.0..=1.0).contains(&t) {
            return Err(PttsError::validation(format!(
                "similarity_threshold must be within [0, 1], got {t}"
            )));
        }
    }

    let query_vec = embedder.embed_query(&req.query).await?;
    let scored = knn_embeddings(store, query_vec, req.limit).await?;

    let mut hits: Vec<SearchHit> = scored
        .into_iter()
        .filter(|(_, _, similarity)| {
            req.similarity_threshold
                .map(|t| *similarity >= t)
                .unwrap_or(true)
        })
        .map(|(row, document_id, similarity)| embedding_hit(row, document_id, similarity))
        .collect();

    if req.include_provenance {
        attach_provenance(store, &mut hits).await?;
    }

    Ok(SearchResponse {
        query: req.query,
        match_type: None,
        semantic_weight: None,
        keyword_weight: None,
        total: hits.len(),
        results: hits,
    })
}

fn embedding_hit(row: crate::model::EmbeddingRow, document_id: Option<String>, score: f64) -> SearchHit {
    SearchHit {
        chunk_id: row.chunk_id,
        image_id: row.image_id,
        document_id,
        original_text: row.original_text,
        source_file_path: row.source_file_path,
        source_file_name: row.source_file_name,
        page_number: row.page_number,
        page_range: row.page_range,
        character_start: row.character_start,
        character_end: row.character_end,
        chunk_index: row.chunk_index,
        score,
        provenance: None,
        provenance_id: Some(row.provenance_id),
    }
}

/// KNN over the vec0 index joined back to the denormalized rows, plus the
/// owning document id resolved through the source chunk or image.
/// vec0 reports L2 distance; for unit vectors `similarity = 1 − d²/2`.
async fn knn_embeddings(
    store: &Store,
    query_vec: Vec<f32>,
    k: usize,
) -> Result<Vec<(crate::model::EmbeddingRow, Option<String>, f64)>> {
    store
        .query(move |conn| {
            let non_empty: bool = conn
                .query_row("SELECT EXISTS(SELECT 1 FROM embeddings_vec LIMIT 1)", [], |r| {
                    r.get(0)
                })
                .map_err(db_err("check vec non-empty"))?;
            if !non_empty {
                return Ok(Vec::new());
            }

            let sql = format!(
                "SELECT {cols}, v.distance, COALESCE(c.document_id, i.document_id)
                 FROM embeddings_vec v
                 JOIN embeddings e ON e.id = v.embedding_id
                 LEFT JOIN chunks c ON c.id = e.chunk_id
                 LEFT JOIN images i ON i.id = e.image_id
                 WHERE v.vector MATCH ?1 AND k = ?2",
                cols = qualified_embedding_cols()
            );
            let mut stmt = conn.prepare(&sql).map_err(db_err("prepare knn"))?;
            let rows = stmt
                .query_map(params![query_vec.as_bytes(), k as i64], |row| {
                    let rec = map_embedding(row)?;
                    let distance: f64 = row.get(20)?;
                    let document_id: Option<String> = row.get(21)?;
                    Ok((rec, document_id, distance))
                })
                .map_err(db_err("knn"))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(db_err("read knn row"))?;

            Ok(rows
                .into_iter()
                .map(|(rec, doc, d)| (rec, doc, (1.0 - (d * d) / 2.0).clamp(-1.0, 1.0)))
                .collect())
        })
        .await
}

// ---------------------------------------------------------------------------
// Hybrid search
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HybridSearch {
    pub query: String,
    pub semantic_weight: f64,
    pub keyword_weight: f64,
    pub limit: usize,
    pub include_provenance: bool,
}

/// Quote query tokens for the FTS5 MATCH mini-language. Parameter binding
/// protects against SQL injection but not FTS syntax errors, so any token
/// with a non-alphanumeric character is double-quoted with internal quotes
/// doubled.
fn escape_fts5_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|tok| {
            if tok.chars().all(|c| c.is_alphanumeric()) {
                tok.to_string()
            } else {
                format!("\"{}\"", tok.replace('"', "\"\""))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub async fn hybrid(
    store: &Store,
    embedder: &dyn Embedder,
    req: HybridSearch,
) -> Result<SearchResponse> {
    validate_query(&req.query)?;
    if (req.semantic_weight + req.keyword_weight - 1.0).abs() > WEIGHT_EPSILON {
        return Err(PttsError::validation(format!(
            "semantic_weight + keyword_weight must equal 1.0, got {} + {}",
            req.semantic_weight, req.keyword_weight
        )));
    }
    if req.semantic_weight < 0.0 || req.keyword_weight < 0.0 {
        return Err(PttsError::validation("weights must be non-negative"));
    }

    let candidates = req.limit.max(1) * HYBRID_CANDIDATE_FACTOR;

    // Keyword leg: bm25-ranked FTS5 match over chunk text.
    let keyword_leg = fts_candidates(store, &req.query, candidates).await?;

    // Vector leg: KNN restricted to chunk-sourced embeddings so both legs
    // rank the same unit (chunks).
    let query_vec = embedder.embed_query(&req.query).await?;
    let vector_leg: Vec<(crate::model::EmbeddingRow, Option<String>, f64)> =
        knn_embeddings(store, query_vec, candidates)
            .await?
            .into_iter()
            .filter(|(row, _, _)| row.chunk_id.is_some())
            .collect();

    // Reciprocal rank fusion keyed by chunk id.
    let mut fused: std::collections::HashMap<String, (SearchHit, f64)> =
        std::collections::HashMap::new();

    for (rank, row) in keyword_leg.into_iter().enumerate() {
        let contribution = req.keyword_weight / (RRF_K + rank as f64 + 1.0);
        let hit = chunk_hit(row, 0.0);
        let key = hit.chunk_id.clone().expect("keyword leg yields chunks");
        fused
            .entry(key)
            .and_modify(|(_, s)| *s += contribution)
            .or_insert((hit, contribution));
    }
    for (rank, (row, document_id, _similarity)) in vector_leg.into_iter().enumerate() {
        let contribution = req.semantic_weight / (RRF_K + rank as f64 + 1.0);
        let key = row.chunk_id.clone().expect("filtered to chunk rows");
        fused
            .entry(key)
            .and_modify(|(_, s)| *s += contribution)
            .or_insert_with(|| (embedding_hit(row, document_id, 0.0), contribution));
    }

    let mut hits: Vec<SearchHit> = fused
        .into_values()
        .map(|(mut hit, score)| {
            hit.score = score;
            hit
        })
        .collect();

    // Stable ordering: score, then (document_id, chunk_index). Vector-leg
    // hits lack document_id; their chunk_id still pins a total order.
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.document_id.cmp(&b.document_id))
            .then_with(|| a.chunk_index.cmp(&b.chunk_index))
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    hits.truncate(req.limit);

    if req.include_provenance {
        attach_provenance(store, &mut hits).await?;
    }

    Ok(SearchResponse {
        query: req.query,
        match_type: None,
        semantic_weight: Some(req.semantic_weight),
        keyword_weight: Some(req.keyword_weight),
        total: hits.len(),
        results: hits,
    })
}

async fn fts_candidates(store: &Store, query: &str, limit: usize) -> Result<Vec<ChunkHitRow>> {
    let escaped = escape_fts5_query(query);
    if escaped.is_empty() {
        return Ok(Vec::new());
    }
    store
        .query(move |conn| {
            let sql = format!(
                "SELECT {cols}, d.file_path, d.file_name
                 FROM chunks_fts f
                 JOIN chunks c ON c.rowid = f.rowid
                 JOIN documents d ON d.id = c.document_id
                 WHERE chunks_fts MATCH ?1
                 ORDER BY bm25(chunks_fts)
                 LIMIT ?2",
                cols = qualified_chunk_cols()
            );
            let mut stmt = conn.prepare(&sql).map_err(db_err("prepare fts"))?;
            let rows = stmt
                .query_map(params![escaped, limit as i64], |row| {
                    Ok(ChunkHitRow {
                        chunk: map_chunk(row)?,
                        file_path: row.get(16)?,
                        file_name: row.get(17)?,
                    })
                })
                .map_err(db_err("fts search"))?
                .collect::<std::result::Result<Vec<_>, _>>();
            rows.map_err(db_err("read fts row"))
        })
        .await
}

// ---------------------------------------------------------------------------
// Shared plumbing
// ---------------------------------------------------------------------------

fn qualified_chunk_cols() -> String {
    CHUNK_COLS
        .split(", ")
        .map(|c| format!("c.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn qualified_embedding_cols() -> String {
    EMBEDDING_COLS
        .split(", ")
        .map(|c| format!("e.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Attach the DOCUMENT→…→node ancestor list to each hit.
async fn attach_provenance(store: &Store, hits: &mut [SearchHit]) -> Result<()> {
    for hit in hits.iter_mut() {
        let Some(prov_id) = hit.provenance_id.clone() else {
            continue;
        };
        let chain = store.get_chain(prov_id).await?;
        let mut summaries: Vec<ProvenanceSummary> = chain
            .ancestors
            .iter()
            .map(summarize_node)
            .collect();
        summaries.push(summarize_node(&chain.current));
        // For embedding-sourced hits the caller wants DOCUMENT down to
        // CHUNK; deeper nodes (the embedding itself) stay included at the
        // tail, which preserves that prefix.
        hit.provenance = Some(summaries);
    }
    Ok(())
}

fn summarize_node(node: &crate::model::ProvenanceRecord) -> ProvenanceSummary {
    ProvenanceSummary {
        id: node.id.clone(),
        node_type: node.node_type.as_str().to_string(),
        chain_depth: node.chain_depth,
        processor: node.processor.clone(),
        content_hash: node.content_hash.clone(),
        created_at: node.created_at.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_and_oversized_queries_are_rejected() {
        assert_eq!(
            validate_query("").unwrap_err().kind(),
            "VALIDATION_ERROR"
        );
        assert_eq!(
            validate_query("   \t").unwrap_err().kind(),
            "VALIDATION_ERROR"
        );
        let long = "x".repeat(MAX_QUERY_CHARS + 1);
        assert_eq!(validate_query(&long).unwrap_err().kind(), "VALIDATION_ERROR");
        assert!(validate_query("ok").is_ok());
    }

    #[test]
    fn fts_escaping_quotes_special_tokens() {
        assert_eq!(escape_fts5_query("plain words"), "plain words");
        assert_eq!(
            escape_fts5_query(r#"what's "this"?"#),
            r#""what's" """this""?""#
        );
        assert_eq!(escape_fts5_query("123-456"), "\"123-456\"");
    }

    #[test]
    fn match_type_parsing() {
        assert_eq!(MatchType::parse("exact").unwrap(), MatchType::Exact);
        assert_eq!(MatchType::parse("fuzzy").unwrap(), MatchType::Fuzzy);
        assert_eq!(MatchType::parse("regex").unwrap(), MatchType::Regex);
        assert!(MatchType::parse("glob").is_err());
    }
}
