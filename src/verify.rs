//! Verifier: re-derives content hashes across the DAG and checks chain
//! structure. Read-only by construction: nothing here mutates the store.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::canonical;
use crate::error::{db_err, PttsError, Result};
use crate::hasher::{compute_hash, hash_file, is_valid_hash_format};
use crate::model::{ProvenanceRecord, ProvenanceType};
use crate::provenance::{get_provenance_conn, map_provenance, PROVENANCE_COLS};
use crate::store::Store;

/// Cap on itemized failures per report; the remainder is only counted.
const MAX_FAILED_ITEMS: usize = 50;

#[derive(Debug, Serialize)]
pub struct HashVerification {
    pub provenance_id: String,
    pub valid: bool,
    pub expected: String,
    pub computed: String,
    pub format_valid: bool,
}

#[derive(Debug, Serialize)]
pub struct FailedItem {
    pub provenance_id: String,
    pub node_type: String,
    pub reason: String,
}

#[derive(Debug, Serialize)]
pub struct ChainVerification {
    pub chain_intact: bool,
    pub is_complete: bool,
    pub verified: usize,
    pub failed: usize,
    pub failed_items: Vec<FailedItem>,
}

#[derive(Debug, Default, Serialize)]
pub struct TypeCounts {
    pub total: usize,
    pub verified: usize,
    pub failed: usize,
}

#[derive(Debug, Serialize)]
pub struct DatabaseVerification {
    pub total_nodes: usize,
    pub verified: usize,
    pub failed: usize,
    pub by_type: std::collections::BTreeMap<String, TypeCounts>,
    pub failed_items: Vec<FailedItem>,
    /// Failures beyond the itemized cap.
    pub failed_overflow: usize,
    pub chain_errors: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct FileIntegrity {
    pub document_id: String,
    pub valid: bool,
    pub expected: String,
    pub computed: String,
}

// ---------------------------------------------------------------------------
// Canonical source resolution, dispatched on node type
// ---------------------------------------------------------------------------

/// Recompute a node's content hash from its stored source artifact.
fn recompute_hash(conn: &Connection, node: &ProvenanceRecord) -> Result<String> {
    let by_prov = |sql: &str| -> Result<Option<String>> {
        conn.query_row(sql, params![node.id], |r| r.get::<_, Option<String>>(0))
            .optional()
            .map_err(db_err("resolve content"))
            .map(Option::flatten)
    };
    let content_missing = || PttsError::ContentNotFound {
        id: node.id.clone(),
    };

    match node.node_type {
        ProvenanceType::Document => {
            let path = by_prov("SELECT file_path FROM documents WHERE provenance_id = ?1")?
                .ok_or_else(content_missing)?;
            hash_file(std::path::Path::new(&path))
        }
        ProvenanceType::OcrResult => {
            let text =
                by_prov("SELECT extracted_text FROM ocr_results WHERE provenance_id = ?1")?
                    .ok_or_else(content_missing)?;
            Ok(compute_hash(&canonical::text_bytes(&text)))
        }
        ProvenanceType::Chunk => {
            let text = by_prov("SELECT text FROM chunks WHERE provenance_id = ?1")?
                .ok_or_else(content_missing)?;
            Ok(compute_hash(&canonical::text_bytes(&text)))
        }
        ProvenanceType::Embedding => {
            let text = by_prov("SELECT original_text FROM embeddings WHERE provenance_id = ?1")?
                .ok_or_else(content_missing)?;
            Ok(compute_hash(&canonical::text_bytes(&text)))
        }
        ProvenanceType::Image => {
            let path = by_prov("SELECT file_path FROM images WHERE provenance_id = ?1")?
                .ok_or_else(content_missing)?;
            hash_file(std::path::Path::new(&path))
        }
        ProvenanceType::VlmDescription => {
            // The description lives on the image row one level up.
            let parent = node.parent_id.as_deref().ok_or_else(content_missing)?;
            let text: Option<String> = conn
                .query_row(
                    "SELECT vlm_description FROM images WHERE provenance_id = ?1",
                    params![parent],
                    |r| r.get(0),
                )
                .optional()
                .map_err(db_err("resolve vlm description"))?
                .flatten();
            let text = text.ok_or_else(content_missing)?;
            Ok(compute_hash(&canonical::text_bytes(&text)))
        }
        ProvenanceType::Extraction => {
            let raw = by_prov("SELECT extraction_json FROM extractions WHERE provenance_id = ?1")?
                .ok_or_else(content_missing)?;
            Ok(compute_hash(&canonical::text_bytes(&raw)))
        }
        ProvenanceType::FormFill => {
            let row: Option<(String, String)> = conn
                .query_row(
                    "SELECT fields_filled, fields_not_found FROM form_fills
                     WHERE provenance_id = ?1",
                    params![node.id],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()
                .map_err(db_err("resolve form fill"))?;
            let (filled, not_found) = row.ok_or_else(content_missing)?;
            Ok(compute_hash(&canonical::form_fill_bytes(&filled, &not_found)?))
        }
        ProvenanceType::Comparison => {
            let row: Option<(String, String, String)> = conn
                .query_row(
                    "SELECT text_diff, structural_diff, entity_diff FROM comparisons
                     WHERE provenance_id = ?1",
                    params![node.id],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                )
                .optional()
                .map_err(db_err("resolve comparison"))?;
            let (t, s, e) = row.ok_or_else(content_missing)?;
            Ok(compute_hash(&canonical::comparison_bytes(&t, &s, &e)?))
        }
        ProvenanceType::Clustering => {
            let row: Option<(String, String)> = conn
                .query_row(
                    "SELECT centroid_json, run_id FROM clusters WHERE provenance_id = ?1",
                    params![node.id],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()
                .map_err(db_err("resolve cluster"))?;
            let (centroid, run_id) = row.ok_or_else(content_missing)?;
            Ok(compute_hash(&canonical::clustering_bytes(&centroid, &run_id)))
        }
        ProvenanceType::KnowledgeGraph => {
            if node.processor == "kg-node" {
                let row: Option<(String, String)> = conn
                    .query_row(
                        "SELECT id, canonical_name FROM knowledge_nodes
                         WHERE provenance_id = ?1",
                        params![node.id],
                        |r| Ok((r.get(0)?, r.get(1)?)),
                    )
                    .optional()
                    .map_err(db_err("resolve knowledge node"))?;
                let (node_id, name) = row.ok_or_else(content_missing)?;
                Ok(compute_hash(&canonical::kg_node_bytes(&node_id, &name)))
            } else {
                let ids = entity_ids_for_root(conn, &node.root_document_id)?;
                Ok(compute_hash(&canonical::kg_build_bytes(&ids)))
            }
        }
        ProvenanceType::EntityExtraction => {
            let document_id = document_id_for_root(conn, &node.root_document_id)?
                .ok_or_else(content_missing)?;
            if node.processor == "entity-indexer" {
                Ok(compute_hash(&canonical::entity_index_bytes(
                    &document_id,
                    &node.source_type,
                )))
            } else {
                let names = entity_names_for_document(conn, &document_id)?;
                Ok(compute_hash(&canonical::entity_extraction_bytes(&names)))
            }
        }
    }
}

fn document_id_for_root(conn: &Connection, root_prov: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT id FROM documents WHERE provenance_id = ?1",
        params![root_prov],
        |r| r.get(0),
    )
    .optional()
    .map_err(db_err("resolve document for root"))
}

fn entity_ids_for_root(conn: &Connection, root_prov: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(
            "SELECT e.id FROM entities e
             JOIN documents d ON d.id = e.document_id
             WHERE d.provenance_id = ?1",
        )
        .map_err(db_err("prepare entity ids"))?;
    let rows = stmt
        .query_map(params![root_prov], |r| r.get::<_, String>(0))
        .map_err(db_err("entity ids"))?
        .collect::<std::result::Result<Vec<_>, _>>();
    rows.map_err(db_err("read entity id"))
}

fn entity_names_for_document(conn: &Connection, document_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT name FROM entities WHERE document_id = ?1")
        .map_err(db_err("prepare entity names"))?;
    let rows = stmt
        .query_map(params![document_id], |r| r.get::<_, String>(0))
        .map_err(db_err("entity names"))?
        .collect::<std::result::Result<Vec<_>, _>>();
    rows.map_err(db_err("read entity name"))
}

fn verify_node(conn: &Connection, node: &ProvenanceRecord) -> Result<HashVerification> {
    let format_valid = is_valid_hash_format(&node.content_hash);
    let computed = recompute_hash(conn, node)?;
    Ok(HashVerification {
        provenance_id: node.id.clone(),
        valid: format_valid && computed == node.content_hash,
        expected: node.content_hash.clone(),
        computed,
        format_valid,
    })
}

// ---------------------------------------------------------------------------
// Public operations
// ---------------------------------------------------------------------------

impl Store {
    /// Recompute one node's hash from its canonical source and compare.
    pub async fn verify_content_hash(&self, provenance_id: String) -> Result<HashVerification> {
        self.query(move |conn| {
            let node =
                get_provenance_conn(conn, &provenance_id)?.ok_or_else(|| PttsError::NotFound {
                    entity: "provenance",
                    id: provenance_id.clone(),
                })?;
            verify_node(conn, &node)
        })
        .await
    }

    /// Verify every node from the given one up to its root.
    pub async fn verify_chain(&self, provenance_id: String) -> Result<ChainVerification> {
        let chain = self.get_chain(provenance_id).await?;
        let is_complete = chain.is_complete;

        self.query(move |conn| {
            let mut nodes = chain.ancestors;
            nodes.push(chain.current);

            let mut chain_intact = is_complete;
            for pair in nodes.windows(2) {
                if pair[1].chain_depth != pair[0].chain_depth + 1 {
                    chain_intact = false;
                }
                if pair[1].parent_id.as_deref() != Some(pair[0].id.as_str()) {
                    chain_intact = false;
                }
            }

            let mut verified = 0usize;
            let mut failed = 0usize;
            let mut failed_items = Vec::new();
            for node in &nodes {
                match verify_node(conn, node) {
                    Ok(outcome) if outcome.valid => verified += 1,
                    Ok(outcome) => {
                        failed += 1;
                        push_bounded(&mut failed_items, node, format!(
                            "hash mismatch: expected {}, computed {}",
                            outcome.expected, outcome.computed
                        ));
                    }
                    Err(e) => {
                        failed += 1;
                        push_bounded(&mut failed_items, node, e.to_string());
                    }
                }
            }

            Ok(ChainVerification {
                chain_intact,
                is_complete,
                verified,
                failed,
                failed_items,
            })
        })
        .await
    }

    /// Sweep the entire DAG: per-type hash verification plus a structural
    /// parent/depth consistency scan. Verification continues across
    /// failures; they are counted and (up to a cap) itemized.
    pub async fn verify_database(&self) -> Result<DatabaseVerification> {
        self.query(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {PROVENANCE_COLS} FROM provenance ORDER BY chain_depth, created_at"
                ))
                .map_err(db_err("prepare verify sweep"))?;
            let nodes = stmt
                .query_map([], map_provenance)
                .map_err(db_err("verify sweep"))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(db_err("read provenance row"))?;
            drop(stmt);

            let mut report = DatabaseVerification {
                total_nodes: nodes.len(),
                verified: 0,
                failed: 0,
                by_type: Default::default(),
                failed_items: Vec::new(),
                failed_overflow: 0,
                chain_errors: Vec::new(),
            };

            for node in &nodes {
                let slot = report
                    .by_type
                    .entry(node.node_type.as_str().to_string())
                    .or_default();
                slot.total += 1;

                let outcome = verify_node(conn, node);
                let ok = matches!(&outcome, Ok(o) if o.valid);
                if ok {
                    report.verified += 1;
                    slot.verified += 1;
                } else {
                    report.failed += 1;
                    slot.failed += 1;
                    let reason = match outcome {
                        Ok(o) => format!(
                            "hash mismatch: expected {}, computed {}",
                            o.expected, o.computed
                        ),
                        Err(e) => e.to_string(),
                    };
                    if report.failed_items.len() < MAX_FAILED_ITEMS {
                        report.failed_items.push(FailedItem {
                            provenance_id: node.id.clone(),
                            node_type: node.node_type.as_str().to_string(),
                            reason,
                        });
                    } else {
                        report.failed_overflow += 1;
                    }
                }
            }

            // Structural scan: every edge must step down exactly one level and
            // every subtree must hang off a DOCUMENT root.
            for node in &nodes {
                if let Some(parent_id) = &node.parent_id {
                    let parent_depth: Option<i64> = conn
                        .query_row(
                            "SELECT chain_depth FROM provenance WHERE id = ?1",
                            params![parent_id],
                            |r| r.get(0),
                        )
                        .optional()
                        .map_err(db_err("chain scan parent"))?;
                    match parent_depth {
                        None => report
                            .chain_errors
                            .push(format!("{}: parent {parent_id} missing", node.id)),
                        Some(d) if d != node.chain_depth - 1 => report.chain_errors.push(format!(
                            "{}: parent depth {d} vs child depth {}",
                            node.id, node.chain_depth
                        )),
                        Some(_) => {}
                    }
                    if node.parent_id_list().last() != Some(parent_id) {
                        report
                            .chain_errors
                            .push(format!("{}: parent_ids tail mismatch", node.id));
                    }
                }
                if node.root_document_id != node.id {
                    let root_type: Option<String> = conn
                        .query_row(
                            "SELECT type FROM provenance WHERE id = ?1",
                            params![node.root_document_id],
                            |r| r.get(0),
                        )
                        .optional()
                        .map_err(db_err("chain scan root"))?;
                    if root_type.as_deref() != Some("DOCUMENT") {
                        report
                            .chain_errors
                            .push(format!("{}: root is not a DOCUMENT node", node.id));
                    }
                }
            }

            Ok(report)
        })
        .await
    }

    /// Rehash the source file behind a document and compare to the stored
    /// file hash.
    pub async fn verify_file_integrity(&self, document_id: String) -> Result<FileIntegrity> {
        let doc = self
            .get_document(document_id.clone())
            .await?
            .ok_or_else(|| PttsError::NotFound {
                entity: "document",
                id: document_id.clone(),
            })?;
        let computed = hash_file(std::path::Path::new(&doc.file_path))?;
        Ok(FileIntegrity {
            document_id,
            valid: computed == doc.file_hash,
            expected: doc.file_hash,
            computed,
        })
    }
}

fn push_bounded(items: &mut Vec<FailedItem>, node: &ProvenanceRecord, reason: String) {
    if items.len() < MAX_FAILED_ITEMS {
        items.push(FailedItem {
            provenance_id: node.id.clone(),
            node_type: node.node_type.as_str().to_string(),
            reason,
        });
    }
}
