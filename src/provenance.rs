//! Provenance engine: typed DAG nodes, chain invariants, and export.
//!
//! Invariants enforced at insert time:
//! - `content_hash` (and `input_hash`/`file_hash` when present) match the
//!   `sha256:<hex>` shape.
//! - a referenced parent exists and sits exactly one level above the child.
//! - `parent_ids` is the root-to-parent list, so its last element is the
//!   parent id; a root node has an empty list.
//! - `root_document_id` resolves to a DOCUMENT node (or is the node itself).

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;

use crate::error::{db_err, PttsError, Result};
use crate::hasher::is_valid_hash_format;
use crate::model::{new_id, now_rfc3339, ProvenanceRecord, ProvenanceType};
use crate::store::Store;

impl ProvenanceRecord {
    /// Depth-0 DOCUMENT node rooting a new subtree. `root_document_id` is the
    /// node's own id.
    pub fn root(
        source_path: &str,
        file_hash: &str,
        processor: &str,
        processor_version: &str,
    ) -> Self {
        let id = new_id();
        Self {
            id: id.clone(),
            node_type: ProvenanceType::Document,
            source_type: "file_upload".to_string(),
            source_path: Some(source_path.to_string()),
            source_id: None,
            root_document_id: id,
            location: None,
            content_hash: file_hash.to_string(),
            input_hash: None,
            file_hash: Some(file_hash.to_string()),
            processor: processor.to_string(),
            processor_version: processor_version.to_string(),
            processing_params: "{}".to_string(),
            processing_duration_ms: None,
            quality_score: None,
            parent_id: None,
            parent_ids: "[]".to_string(),
            chain_depth: 0,
            chain_path: json!([ProvenanceType::Document.as_str()]).to_string(),
            created_at: now_rfc3339(),
        }
    }

    /// Derive a child node one level below `parent`. Ancestry bookkeeping
    /// (depth, parent list, chain path, root pointer) is computed here so
    /// callers cannot get it wrong; per-node fields are set afterwards by
    /// struct update.
    pub fn child_of(
        parent: &ProvenanceRecord,
        node_type: ProvenanceType,
        source_type: &str,
        content_hash: &str,
        processor: &str,
        processor_version: &str,
    ) -> Self {
        let mut parent_ids = parent.parent_id_list();
        parent_ids.push(parent.id.clone());
        let mut chain_path: Vec<String> =
            serde_json::from_str(&parent.chain_path).unwrap_or_default();
        chain_path.push(node_type.as_str().to_string());

        Self {
            id: new_id(),
            node_type,
            source_type: source_type.to_string(),
            source_path: None,
            source_id: Some(parent.id.clone()),
            root_document_id: parent.root_document_id.clone(),
            location: None,
            content_hash: content_hash.to_string(),
            input_hash: Some(parent.content_hash.clone()),
            file_hash: parent.file_hash.clone(),
            processor: processor.to_string(),
            processor_version: processor_version.to_string(),
            processing_params: "{}".to_string(),
            processing_duration_ms: None,
            quality_score: None,
            parent_id: Some(parent.id.clone()),
            parent_ids: serde_json::to_string(&parent_ids).expect("string vec serializes"),
            chain_depth: parent.chain_depth + 1,
            chain_path: serde_json::to_string(&chain_path).expect("string vec serializes"),
            created_at: now_rfc3339(),
        }
    }
}

/// A node plus its ancestry, root first.
#[derive(Debug, Serialize)]
pub struct ChainView {
    pub current: ProvenanceRecord,
    pub ancestors: Vec<ProvenanceRecord>,
    /// True iff the walk reaches a DOCUMENT node whose id equals
    /// `root_document_id`.
    pub is_complete: bool,
}

pub(crate) const PROVENANCE_COLS: &str = "id, type, source_type, source_path, source_id, \
     root_document_id, location, content_hash, input_hash, file_hash, processor, \
     processor_version, processing_params, processing_duration_ms, quality_score, parent_id, \
     parent_ids, chain_depth, chain_path, created_at";

pub(crate) fn map_provenance(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProvenanceRecord> {
    let type_str: String = row.get(1)?;
    Ok(ProvenanceRecord {
        id: row.get(0)?,
        node_type: ProvenanceType::parse(&type_str).unwrap_or(ProvenanceType::Document),
        source_type: row.get(2)?,
        source_path: row.get(3)?,
        source_id: row.get(4)?,
        root_document_id: row.get(5)?,
        location: row.get(6)?,
        content_hash: row.get(7)?,
        input_hash: row.get(8)?,
        file_hash: row.get(9)?,
        processor: row.get(10)?,
        processor_version: row.get(11)?,
        processing_params: row.get(12)?,
        processing_duration_ms: row.get(13)?,
        quality_score: row.get(14)?,
        parent_id: row.get(15)?,
        parent_ids: row.get(16)?,
        chain_depth: row.get(17)?,
        chain_path: row.get(18)?,
        created_at: row.get(19)?,
    })
}

fn check_hash_fields(rec: &ProvenanceRecord) -> Result<()> {
    for (label, value) in [
        ("content_hash", Some(&rec.content_hash)),
        ("input_hash", rec.input_hash.as_ref()),
        ("file_hash", rec.file_hash.as_ref()),
    ] {
        if let Some(v) = value {
            if !is_valid_hash_format(v) {
                return Err(PttsError::HashFormatInvalid {
                    value: format!("{label}={v}"),
                });
            }
        }
    }
    Ok(())
}

/// Validated insert, callable inside any open transaction.
pub(crate) fn insert_provenance_tx(tx: &Connection, rec: &ProvenanceRecord) -> Result<()> {
    check_hash_fields(rec)?;

    let parent_list = rec.parent_id_list();
    match &rec.parent_id {
        Some(parent_id) => {
            if parent_list.last() != Some(parent_id) {
                return Err(PttsError::ChainBroken {
                    detail: format!(
                        "parent_ids of {} does not end with parent {parent_id}",
                        rec.id
                    ),
                });
            }
            let parent_depth: Option<i64> = tx
                .query_row(
                    "SELECT chain_depth FROM provenance WHERE id = ?1",
                    params![parent_id],
                    |r| r.get(0),
                )
                .optional()
                .map_err(db_err("lookup parent"))?;
            match parent_depth {
                None => {
                    return Err(PttsError::ChainBroken {
                        detail: format!("parent {parent_id} of {} does not exist", rec.id),
                    })
                }
                Some(d) if d != rec.chain_depth - 1 => {
                    return Err(PttsError::ChainBroken {
                        detail: format!(
                            "parent {parent_id} has depth {d}, child {} has depth {}",
                            rec.id, rec.chain_depth
                        ),
                    })
                }
                Some(_) => {}
            }
        }
        None => {
            if !parent_list.is_empty() {
                return Err(PttsError::ChainBroken {
                    detail: format!("{} has parent_ids but no parent_id", rec.id),
                });
            }
            if rec.chain_depth != 0 {
                return Err(PttsError::ChainBroken {
                    detail: format!(
                        "{} has no parent but chain_depth {}",
                        rec.id, rec.chain_depth
                    ),
                });
            }
        }
    }

    if rec.root_document_id != rec.id {
        let root_type: Option<String> = tx
            .query_row(
                "SELECT type FROM provenance WHERE id = ?1",
                params![rec.root_document_id],
                |r| r.get(0),
            )
            .optional()
            .map_err(db_err("lookup root"))?;
        match root_type.as_deref() {
            Some("DOCUMENT") => {}
            Some(other) => {
                return Err(PttsError::ChainBroken {
                    detail: format!(
                        "root {} of {} is a {other}, not a DOCUMENT",
                        rec.root_document_id, rec.id
                    ),
                })
            }
            None => {
                return Err(PttsError::ChainBroken {
                    detail: format!("root {} of {} does not exist", rec.root_document_id, rec.id),
                })
            }
        }
    }

    tx.execute(
        &format!(
            "INSERT INTO provenance ({PROVENANCE_COLS})
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20)"
        ),
        params![
            rec.id,
            rec.node_type.as_str(),
            rec.source_type,
            rec.source_path,
            rec.source_id,
            rec.root_document_id,
            rec.location,
            rec.content_hash,
            rec.input_hash,
            rec.file_hash,
            rec.processor,
            rec.processor_version,
            rec.processing_params,
            rec.processing_duration_ms,
            rec.quality_score,
            rec.parent_id,
            rec.parent_ids,
            rec.chain_depth,
            rec.chain_path,
            rec.created_at,
        ],
    )
    .map_err(db_err("insert provenance"))?;
    Ok(())
}

impl Store {
    /// Standalone validated insert (one transaction). Returns the node id.
    pub async fn create_provenance(&self, rec: ProvenanceRecord) -> Result<String> {
        let id = rec.id.clone();
        self.query(move |conn| {
            let tx = conn
                .unchecked_transaction()
                .map_err(db_err("begin create_provenance"))?;
            insert_provenance_tx(&tx, &rec)?;
            tx.commit().map_err(db_err("commit create_provenance"))
        })
        .await?;
        Ok(id)
    }

    pub async fn get_provenance(&self, id: String) -> Result<Option<ProvenanceRecord>> {
        self.query(move |conn| get_provenance_conn(conn, &id)).await
    }

    /// Walk from a node to its root. Ancestors come back ordered by
    /// ascending depth (root first).
    pub async fn get_chain(&self, id: String) -> Result<ChainView> {
        self.query(move |conn| {
            let current = get_provenance_conn(conn, &id)?.ok_or_else(|| PttsError::NotFound {
                entity: "provenance",
                id: id.clone(),
            })?;

            let mut ancestors = Vec::new();
            let mut cursor = current.parent_id.clone();
            while let Some(parent_id) = cursor {
                match get_provenance_conn(conn, &parent_id)? {
                    Some(parent) => {
                        cursor = parent.parent_id.clone();
                        ancestors.push(parent);
                    }
                    None => break, // broken chain; reported via is_complete
                }
            }
            ancestors.reverse();

            let top = ancestors.first().unwrap_or(&current);
            let is_complete = top.node_type == ProvenanceType::Document
                && top.id == current.root_document_id;

            Ok(ChainView {
                current,
                ancestors,
                is_complete,
            })
        })
        .await
    }

    /// Every node of one document's subtree, shallow to deep.
    pub async fn get_by_root(&self, root_id: String) -> Result<Vec<ProvenanceRecord>> {
        self.query(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {PROVENANCE_COLS} FROM provenance
                     WHERE root_document_id = ?1
                     ORDER BY chain_depth ASC, created_at ASC"
                ))
                .map_err(db_err("prepare get_by_root"))?;
            let rows = stmt
                .query_map(params![root_id], map_provenance)
                .map_err(db_err("get_by_root"))?
                .collect::<std::result::Result<Vec<_>, _>>();
            rows.map_err(db_err("read provenance row"))
        })
        .await
    }

    /// Raw JSON export: the full subtree as an ordered node array.
    pub async fn export_provenance_json(&self, root_id: String) -> Result<serde_json::Value> {
        let nodes = self.get_by_root(root_id.clone()).await?;
        if nodes.is_empty() {
            return Err(PttsError::NotFound {
                entity: "provenance",
                id: root_id,
            });
        }
        Ok(json!({ "root": root_id, "node_count": nodes.len(), "nodes": nodes }))
    }

    /// W3C-PROV-shaped attribution document: artifacts as entities, the acts
    /// that produced them as activities, edges as derivations.
    pub async fn export_provenance_prov(&self, root_id: String) -> Result<serde_json::Value> {
        let nodes = self.get_by_root(root_id.clone()).await?;
        if nodes.is_empty() {
            return Err(PttsError::NotFound {
                entity: "provenance",
                id: root_id,
            });
        }

        let mut entities = serde_json::Map::new();
        let mut activities = serde_json::Map::new();
        let mut derivations = serde_json::Map::new();

        for (i, node) in nodes.iter().enumerate() {
            entities.insert(
                format!("ds:{}", node.id),
                json!({
                    "prov:type": node.node_type.as_str(),
                    "ds:contentHash": node.content_hash,
                    "ds:chainDepth": node.chain_depth,
                    "prov:generatedAtTime": node.created_at,
                }),
            );
            activities.insert(
                format!("ds:act-{}", node.id),
                json!({
                    "prov:type": node.source_type,
                    "ds:processor": node.processor,
                    "ds:processorVersion": node.processor_version,
                }),
            );
            if let Some(parent) = &node.parent_id {
                derivations.insert(
                    format!("_:d{i}"),
                    json!({
                        "prov:generatedEntity": format!("ds:{}", node.id),
                        "prov:usedEntity": format!("ds:{parent}"),
                        "prov:activity": format!("ds:act-{}", node.id),
                    }),
                );
            }
        }

        Ok(json!({
            "prefix": { "ds": "urn:docsiphon:", "prov": "http://www.w3.org/ns/prov#" },
            "entity": entities,
            "activity": activities,
            "wasDerivedFrom": derivations,
        }))
    }
}

pub(crate) fn get_provenance_conn(
    conn: &Connection,
    id: &str,
) -> Result<Option<ProvenanceRecord>> {
    conn.query_row(
        &format!("SELECT {PROVENANCE_COLS} FROM provenance WHERE id = ?1"),
        params![id],
        map_provenance,
    )
    .optional()
    .map_err(db_err("get provenance"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::compute_hash_str;
    use crate::store::Store;

    async fn test_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::create("prov-test", dir.path()).unwrap();
        (dir, store)
    }

    fn sample_root() -> ProvenanceRecord {
        ProvenanceRecord::root(
            "/tmp/report.pdf",
            &compute_hash_str("file-bytes"),
            "ingest",
            "1",
        )
    }

    #[tokio::test]
    async fn chain_construction_and_walk() {
        let (_dir, store) = test_store().await;

        let root = sample_root();
        let ocr = ProvenanceRecord::child_of(
            &root,
            ProvenanceType::OcrResult,
            "ocr",
            &compute_hash_str("the text"),
            "datalab-ocr",
            "1",
        );
        let chunk = ProvenanceRecord::child_of(
            &ocr,
            ProvenanceType::Chunk,
            "chunking",
            &compute_hash_str("a window"),
            "chunker",
            "1",
        );

        assert_eq!(root.chain_depth, 0);
        assert_eq!(ocr.chain_depth, 1);
        assert_eq!(chunk.chain_depth, 2);
        assert_eq!(chunk.parent_id_list(), vec![root.id.clone(), ocr.id.clone()]);
        assert_eq!(chunk.root_document_id, root.id);
        assert_eq!(chunk.input_hash.as_deref(), Some(ocr.content_hash.as_str()));

        store.create_provenance(root.clone()).await.unwrap();
        store.create_provenance(ocr.clone()).await.unwrap();
        let chunk_id = store.create_provenance(chunk).await.unwrap();

        let chain = store.get_chain(chunk_id).await.unwrap();
        assert!(chain.is_complete);
        assert_eq!(chain.ancestors.len(), 2);
        assert_eq!(chain.ancestors[0].id, root.id);
        assert_eq!(chain.ancestors[1].id, ocr.id);

        let subtree = store.get_by_root(root.id.clone()).await.unwrap();
        assert_eq!(subtree.len(), 3);
        assert!(subtree.windows(2).all(|w| w[0].chain_depth <= w[1].chain_depth));
    }

    #[tokio::test]
    async fn missing_parent_is_chain_broken() {
        let (_dir, store) = test_store().await;
        let root = sample_root();
        store.create_provenance(root.clone()).await.unwrap();

        let ocr = ProvenanceRecord::child_of(
            &root,
            ProvenanceType::OcrResult,
            "ocr",
            &compute_hash_str("text"),
            "datalab-ocr",
            "1",
        );
        // The chunk's parent is never inserted.
        let chunk = ProvenanceRecord::child_of(
            &ocr,
            ProvenanceType::Chunk,
            "chunking",
            &compute_hash_str("window"),
            "chunker",
            "1",
        );
        let err = store.create_provenance(chunk).await.unwrap_err();
        assert_eq!(err.kind(), "CHAIN_BROKEN");
    }

    #[tokio::test]
    async fn depth_mismatch_is_chain_broken() {
        let (_dir, store) = test_store().await;
        let root = sample_root();
        store.create_provenance(root.clone()).await.unwrap();

        let mut bad = ProvenanceRecord::child_of(
            &root,
            ProvenanceType::Chunk,
            "chunking",
            &compute_hash_str("window"),
            "chunker",
            "1",
        );
        bad.chain_depth = 3; // root is depth 0; child must be 1
        let err = store.create_provenance(bad).await.unwrap_err();
        assert_eq!(err.kind(), "CHAIN_BROKEN");
    }

    #[tokio::test]
    async fn malformed_hash_is_rejected() {
        let (_dir, store) = test_store().await;
        let mut root = sample_root();
        root.content_hash = "sha256:nope".to_string();
        root.file_hash = None;
        let err = store.create_provenance(root).await.unwrap_err();
        assert_eq!(err.kind(), "HASH_FORMAT_INVALID");
    }

    #[tokio::test]
    async fn duplicate_id_is_unique_violation() {
        let (_dir, store) = test_store().await;
        let root = sample_root();
        store.create_provenance(root.clone()).await.unwrap();
        let err = store.create_provenance(root).await.unwrap_err();
        assert_eq!(err.kind(), "UNIQUE_VIOLATION");
    }

    #[tokio::test]
    async fn prov_export_links_children_to_parents() {
        let (_dir, store) = test_store().await;
        let root = sample_root();
        let ocr = ProvenanceRecord::child_of(
            &root,
            ProvenanceType::OcrResult,
            "ocr",
            &compute_hash_str("text"),
            "datalab-ocr",
            "1",
        );
        store.create_provenance(root.clone()).await.unwrap();
        store.create_provenance(ocr.clone()).await.unwrap();

        let doc = store
            .export_provenance_prov(root.id.clone())
            .await
            .unwrap();
        let entities = doc["entity"].as_object().unwrap();
        assert_eq!(entities.len(), 2);
        let derivations = doc["wasDerivedFrom"].as_object().unwrap();
        assert_eq!(derivations.len(), 1);
        let d = derivations.values().next().unwrap();
        assert_eq!(d["prov:usedEntity"], format!("ds:{}", root.id));

        let raw = store.export_provenance_json(root.id.clone()).await.unwrap();
        assert_eq!(raw["node_count"], 2);
    }
}
