//! Persistent corpus store: one SQLite file per corpus, WAL journaling,
//! FTS5 + vec0 virtual tables, and transactional multi-row operations.
//!
//! The connection lives behind `Arc<Mutex<_>>`; every public operation routes
//! through [`Store::query`], which hops onto the blocking pool so store work
//! never stalls the async workers. Writes that span multiple rows always run
//! inside one transaction.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Once};

use rusqlite::{params, Connection, OptionalExtension};
use zerocopy::AsBytes;

use crate::error::{db_err, io_err, PttsError, Result};
use crate::migrate;
use crate::model::{
    Chunk, CorpusStats, DocStatus, Document, EmbeddingRow, EmbeddingStatus, ImageRecord, OcrMode,
    OcrResult, ProvenanceRecord, TaskType,
};
use crate::settings::{EMBEDDING_DIMENSIONS, EMBEDDING_MODEL, EMBEDDING_MODEL_VERSION};

static VEC_INIT: Once = Once::new();

/// Register sqlite-vec before any connection opens.
///
/// SAFETY: `sqlite3_vec_init` is the extension entry point exported by the
/// sqlite-vec crate; `sqlite3_auto_extension` expects the C init signature.
/// This transmute is the documented registration pattern from the crate.
pub(crate) fn register_vec_extension() {
    VEC_INIT.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite_vec::sqlite3_vec_init as *const (),
        )));
    });
}

/// Storage root: `STORAGE_PATH` or `~/.docsiphon`.
pub fn storage_root() -> PathBuf {
    if let Ok(p) = std::env::var("STORAGE_PATH") {
        if !p.trim().is_empty() {
            return PathBuf::from(p.trim());
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".docsiphon")
}

fn db_path(storage_dir: &Path, name: &str) -> PathBuf {
    storage_dir.join(format!("{name}.db"))
}

fn validate_corpus_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(PttsError::validation(format!(
            "corpus name must be alphanumeric with - or _, got {name:?}"
        )))
    }
}

// ---------------------------------------------------------------------------
// Corpus selection (the `current` pointer under the storage root)
// ---------------------------------------------------------------------------

pub fn select_corpus(storage_dir: &Path, name: &str) -> Result<()> {
    if !Store::exists(name, storage_dir) {
        return Err(PttsError::NotFound {
            entity: "corpus",
            id: name.to_string(),
        });
    }
    let marker = storage_dir.join("current");
    std::fs::write(&marker, name).map_err(io_err(&marker))
}

pub fn current_corpus(storage_dir: &Path) -> Result<String> {
    let marker = storage_dir.join("current");
    let name = std::fs::read_to_string(&marker)
        .map_err(|_| PttsError::DatabaseNotSelected)?
        .trim()
        .to_string();
    if name.is_empty() || !Store::exists(&name, storage_dir) {
        return Err(PttsError::DatabaseNotSelected);
    }
    Ok(name)
}

pub fn list_corpora(storage_dir: &Path) -> Result<Vec<String>> {
    let mut out = Vec::new();
    let entries = match std::fs::read_dir(storage_dir) {
        Ok(e) => e,
        Err(_) => return Ok(out),
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().map(|e| e == "db").unwrap_or(false) {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                out.push(stem.to_string());
            }
        }
    }
    out.sort();
    Ok(out)
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Rows removed by a cascading document delete, plus the extracted image
/// files whose on-disk cleanup is the caller's to perform after commit.
#[derive(Debug, Default)]
pub struct DeletedCounts {
    pub chunks: usize,
    pub embeddings: usize,
    pub images: usize,
    pub provenance: usize,
    pub extension_rows: usize,
    pub image_files: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub status: Option<DocStatus>,
    pub limit: Option<i64>,
    pub offset: i64,
}

// Extension processor outputs. Stored with the same hash discipline as the
// core artifacts; their engines live outside this crate.

#[derive(Debug, Clone)]
pub struct ExtractionRecord {
    pub id: String,
    pub document_id: String,
    pub schema_name: Option<String>,
    pub extraction_json: String,
}

#[derive(Debug, Clone)]
pub struct FormFillRecord {
    pub id: String,
    pub document_id: String,
    pub fields_filled: String,
    pub fields_not_found: String,
}

#[derive(Debug, Clone)]
pub struct ComparisonRecord {
    pub id: String,
    pub document_a_id: String,
    pub document_b_id: String,
    pub text_diff: String,
    pub structural_diff: String,
    pub entity_diff: String,
}

#[derive(Debug, Clone)]
pub struct ClusterRecord {
    pub id: String,
    pub run_id: String,
    pub centroid_json: String,
    pub member_count: i64,
}

#[derive(Debug, Clone)]
pub struct KnowledgeNodeRecord {
    pub id: String,
    pub canonical_name: String,
    pub node_type: String,
    pub summary: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EntityRecord {
    pub id: String,
    pub document_id: String,
    pub name: String,
    pub entity_type: String,
    pub mention_count: i64,
}

#[derive(Debug)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
    name: String,
}

impl Store {
    pub fn exists(name: &str, storage_dir: &Path) -> bool {
        db_path(storage_dir, name).exists()
    }

    /// Create a fresh corpus; fails when the file already exists.
    pub fn create(name: &str, storage_dir: &Path) -> Result<Self> {
        validate_corpus_name(name)?;
        let path = db_path(storage_dir, name);
        if path.exists() {
            return Err(PttsError::UniqueViolation {
                detail: format!("corpus {name} already exists"),
            });
        }
        std::fs::create_dir_all(storage_dir).map_err(io_err(storage_dir))?;
        let store = Self::open_at(name, path)?;
        store.write_metadata()?;
        Ok(store)
    }

    /// Open an existing corpus and bring its schema up to date.
    pub fn open(name: &str, storage_dir: &Path) -> Result<Self> {
        validate_corpus_name(name)?;
        let path = db_path(storage_dir, name);
        if !path.exists() {
            return Err(PttsError::NotFound {
                entity: "corpus",
                id: name.to_string(),
            });
        }
        Self::open_at(name, path)
    }

    fn open_at(name: &str, path: PathBuf) -> Result<Self> {
        register_vec_extension();
        let conn = Connection::open(&path).map_err(db_err("open corpus"))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -65536;
             PRAGMA wal_autocheckpoint = 1000;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(db_err("apply pragmas"))?;
        migrate::run(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: path,
            name: name.to_string(),
        })
    }

    fn write_metadata(&self) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex");
        conn.execute(
            "INSERT OR IGNORE INTO database_metadata
                 (id, name, created_at, embedding_model, embedding_model_version, embedding_dimensions)
             VALUES (1, ?1, ?2, ?3, ?4, ?5)",
            params![
                self.name,
                crate::model::now_rfc3339(),
                EMBEDDING_MODEL,
                EMBEDDING_MODEL_VERSION,
                EMBEDDING_DIMENSIONS as i64,
            ],
        )
        .map_err(db_err("write metadata"))?;
        Ok(())
    }

    /// Remove the corpus file (and WAL sidecars). The store must be the last
    /// handle; callers drop clones first.
    pub fn destroy(name: &str, storage_dir: &Path) -> Result<()> {
        let path = db_path(storage_dir, name);
        if !path.exists() {
            return Err(PttsError::NotFound {
                entity: "corpus",
                id: name.to_string(),
            });
        }
        std::fs::remove_file(&path).map_err(io_err(&path))?;
        for suffix in ["-wal", "-shm"] {
            let side = PathBuf::from(format!("{}{suffix}", path.display()));
            let _ = std::fs::remove_file(side);
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Run a closure against the connection on the blocking pool.
    pub(crate) async fn query<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| PttsError::Database {
                operation: "lock connection".to_string(),
                cause: "mutex poisoned".to_string(),
            })?;
            f(&guard)
        })
        .await
        .map_err(|e| PttsError::Database {
            operation: "spawn_blocking".to_string(),
            cause: e.to_string(),
        })?
    }

    // ── Documents ─────────────────────────────────────────────────────────

    /// Insert a document and its depth-0 provenance node in one transaction.
    pub async fn insert_document(&self, doc: Document, prov: ProvenanceRecord) -> Result<()> {
        self.query(move |conn| {
            let tx = conn.unchecked_transaction().map_err(db_err("begin insert_document"))?;
            insert_document_tx(&tx, &doc)?;
            crate::provenance::insert_provenance_tx(&tx, &prov)?;
            tx.commit().map_err(db_err("commit insert_document"))
        })
        .await
    }

    pub async fn get_document(&self, id: String) -> Result<Option<Document>> {
        self.query(move |conn| {
            conn.query_row(
                &format!("SELECT {DOCUMENT_COLS} FROM documents WHERE id = ?1"),
                params![id],
                map_document,
            )
            .optional()
            .map_err(db_err("get document"))
        })
        .await
    }

    pub async fn list_documents(&self, filter: ListFilter) -> Result<Vec<Document>> {
        self.query(move |conn| {
            let limit = filter.limit.unwrap_or(100);
            // `status` binds to the wildcard when no filter is set, keeping a
            // single statement shape for both cases.
            let sql = format!(
                "SELECT {DOCUMENT_COLS} FROM documents
                 WHERE (?1 IS NULL OR status = ?1)
                 ORDER BY created_at DESC LIMIT ?2 OFFSET ?3"
            );
            let status = filter.status.map(|s| s.as_str().to_string());
            let mut stmt = conn.prepare(&sql).map_err(db_err("prepare list documents"))?;
            let rows = stmt
                .query_map(params![status, limit, filter.offset], map_document)
                .map_err(db_err("list documents"))?
                .collect::<std::result::Result<Vec<_>, _>>();
            rows.map_err(db_err("read document row"))
        })
        .await
    }

    /// FIFO claim: `pending → processing`. False when another worker won.
    pub async fn claim_document(&self, id: String) -> Result<bool> {
        self.query(move |conn| {
            let n = conn
                .execute(
                    "UPDATE documents SET status = 'processing', updated_at = ?2
                     WHERE id = ?1 AND status = 'pending'",
                    params![id, crate::model::now_rfc3339()],
                )
                .map_err(db_err("claim document"))?;
            Ok(n == 1)
        })
        .await
    }

    pub async fn pending_documents(&self) -> Result<Vec<Document>> {
        self.query(move |conn| {
            let sql = format!(
                "SELECT {DOCUMENT_COLS} FROM documents WHERE status = 'pending'
                 ORDER BY created_at ASC"
            );
            let mut stmt = conn.prepare(&sql).map_err(db_err("prepare pending documents"))?;
            let rows = stmt
                .query_map([], map_document)
                .map_err(db_err("pending documents"))?
                .collect::<std::result::Result<Vec<_>, _>>();
            rows.map_err(db_err("read document row"))
        })
        .await
    }

    pub async fn mark_document_complete(&self, id: String, page_count: i64) -> Result<()> {
        self.query(move |conn| {
            conn.execute(
                "UPDATE documents SET status = 'complete', page_count = ?2,
                     error_message = NULL, updated_at = ?3
                 WHERE id = ?1",
                params![id, page_count, crate::model::now_rfc3339()],
            )
            .map_err(db_err("mark document complete"))?;
            Ok(())
        })
        .await
    }

    /// Failure is recorded in its own transaction so it survives whatever
    /// rollback produced it.
    pub async fn mark_document_failed(&self, id: String, error: String) -> Result<()> {
        self.query(move |conn| {
            conn.execute(
                "UPDATE documents SET status = 'failed', error_message = ?2, updated_at = ?3
                 WHERE id = ?1",
                params![id, error, crate::model::now_rfc3339()],
            )
            .map_err(db_err("mark document failed"))?;
            Ok(())
        })
        .await
    }

    /// Restart recovery: anything left `processing` by a dead run returns to
    /// `pending`. Chunk embedding failures are preserved (status stays
    /// monotonic); pending chunks are simply picked up again.
    pub async fn reset_processing(&self) -> Result<usize> {
        self.query(move |conn| {
            let now = crate::model::now_rfc3339();
            let docs = conn
                .execute(
                    "UPDATE documents SET status = 'pending', updated_at = ?1
                     WHERE status = 'processing'",
                    params![now],
                )
                .map_err(db_err("reset processing documents"))?;
            conn.execute(
                "UPDATE images SET vlm_status = 'pending', updated_at = ?1
                 WHERE vlm_status = 'processing'",
                params![now],
            )
            .map_err(db_err("reset processing images"))?;
            Ok(docs)
        })
        .await
    }

    // ── OCR output (ocr result + chunks + provenance, one transaction) ────

    pub async fn store_ocr_output(
        &self,
        ocr: OcrResult,
        ocr_prov: ProvenanceRecord,
        chunks: Vec<Chunk>,
        chunk_provs: Vec<ProvenanceRecord>,
    ) -> Result<()> {
        debug_assert_eq!(chunks.len(), chunk_provs.len());
        self.query(move |conn| {
            let tx = conn.unchecked_transaction().map_err(db_err("begin store_ocr_output"))?;

            tx.execute(
                "INSERT INTO ocr_results
                     (id, document_id, extracted_text, text_length, request_id, mode, page_count,
                      quality_score, cost, text_hash, duration_ms, blocks, extras, provenance_id,
                      created_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
                params![
                    ocr.id,
                    ocr.document_id,
                    ocr.extracted_text,
                    ocr.text_length,
                    ocr.request_id,
                    ocr.mode.as_str(),
                    ocr.page_count,
                    ocr.quality_score,
                    ocr.cost,
                    ocr.text_hash,
                    ocr.duration_ms,
                    ocr.blocks,
                    ocr.extras,
                    ocr.provenance_id,
                    ocr.created_at,
                ],
            )
            .map_err(db_err("insert ocr result"))?;
            crate::provenance::insert_provenance_tx(&tx, &ocr_prov)?;

            {
                let mut stmt = tx
                    .prepare_cached(
                        "INSERT INTO chunks
                             (id, document_id, ocr_result_id, text, text_hash, chunk_index,
                              character_start, character_end, page_number, page_range,
                              overlap_previous, overlap_next, embedding_status, provenance_id,
                              created_at, updated_at)
                         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)",
                    )
                    .map_err(db_err("prepare insert chunk"))?;
                for chunk in &chunks {
                    stmt.execute(params![
                        chunk.id,
                        chunk.document_id,
                        chunk.ocr_result_id,
                        chunk.text,
                        chunk.text_hash,
                        chunk.chunk_index,
                        chunk.character_start,
                        chunk.character_end,
                        chunk.page_number,
                        chunk.page_range,
                        chunk.overlap_previous,
                        chunk.overlap_next,
                        chunk.embedding_status.as_str(),
                        chunk.provenance_id,
                        chunk.created_at,
                        chunk.updated_at,
                    ])
                    .map_err(db_err("insert chunk"))?;
                }
            }
            for prov in &chunk_provs {
                crate::provenance::insert_provenance_tx(&tx, prov)?;
            }

            tx.commit().map_err(db_err("commit store_ocr_output"))
        })
        .await
    }

    pub async fn get_ocr_result(&self, document_id: String) -> Result<Option<OcrResult>> {
        self.query(move |conn| {
            conn.query_row(
                "SELECT id, document_id, extracted_text, text_length, request_id, mode,
                        page_count, quality_score, cost, text_hash, duration_ms, blocks, extras,
                        provenance_id, created_at
                 FROM ocr_results WHERE document_id = ?1",
                params![document_id],
                map_ocr_result,
            )
            .optional()
            .map_err(db_err("get ocr result"))
        })
        .await
    }

    // ── Chunks ────────────────────────────────────────────────────────────

    pub async fn list_chunks(&self, document_id: String) -> Result<Vec<Chunk>> {
        self.query(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {CHUNK_COLS} FROM chunks WHERE document_id = ?1 ORDER BY chunk_index ASC"
                ))
                .map_err(db_err("prepare list chunks"))?;
            let rows = stmt
                .query_map(params![document_id], map_chunk)
                .map_err(db_err("list chunks"))?
                .collect::<std::result::Result<Vec<_>, _>>();
            rows.map_err(db_err("read chunk row"))
        })
        .await
    }

    pub async fn pending_chunks(&self, document_id: String) -> Result<Vec<Chunk>> {
        self.query(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {CHUNK_COLS} FROM chunks
                     WHERE document_id = ?1 AND embedding_status = 'pending'
                     ORDER BY chunk_index ASC"
                ))
                .map_err(db_err("prepare pending chunks"))?;
            let rows = stmt
                .query_map(params![document_id], map_chunk)
                .map_err(db_err("pending chunks"))?
                .collect::<std::result::Result<Vec<_>, _>>();
            rows.map_err(db_err("read chunk row"))
        })
        .await
    }

    /// One batch commit: embedding rows, their vec0 entries, their depth-3
    /// provenance, and the owning chunks' `pending → complete` flip.
    pub async fn store_embedding_batch(
        &self,
        batch: Vec<(EmbeddingRow, Vec<f32>, ProvenanceRecord)>,
    ) -> Result<()> {
        self.query(move |conn| {
            let tx = conn.unchecked_transaction().map_err(db_err("begin embedding batch"))?;
            for (row, vector, prov) in &batch {
                insert_embedding_tx(&tx, row, vector)?;
                crate::provenance::insert_provenance_tx(&tx, prov)?;
                if let Some(chunk_id) = &row.chunk_id {
                    tx.execute(
                        "UPDATE chunks SET embedding_status = 'complete', updated_at = ?2
                         WHERE id = ?1",
                        params![chunk_id, crate::model::now_rfc3339()],
                    )
                    .map_err(db_err("flip chunk complete"))?;
                }
            }
            tx.commit().map_err(db_err("commit embedding batch"))
        })
        .await
    }

    pub async fn mark_chunks_failed(&self, chunk_ids: Vec<String>) -> Result<()> {
        self.query(move |conn| {
            let tx = conn.unchecked_transaction().map_err(db_err("begin mark chunks failed"))?;
            for id in &chunk_ids {
                tx.execute(
                    "UPDATE chunks SET embedding_status = 'failed', updated_at = ?2
                     WHERE id = ?1 AND embedding_status = 'pending'",
                    params![id, crate::model::now_rfc3339()],
                )
                .map_err(db_err("flip chunk failed"))?;
            }
            tx.commit().map_err(db_err("commit mark chunks failed"))
        })
        .await
    }

    // ── Images ────────────────────────────────────────────────────────────

    pub async fn store_images(
        &self,
        images: Vec<ImageRecord>,
        provs: Vec<ProvenanceRecord>,
    ) -> Result<()> {
        debug_assert_eq!(images.len(), provs.len());
        self.query(move |conn| {
            let tx = conn.unchecked_transaction().map_err(db_err("begin store_images"))?;
            for image in &images {
                tx.execute(
                    "INSERT INTO images
                         (id, document_id, ocr_result_id, page_number, bbox_x, bbox_y,
                          bbox_width, bbox_height, image_index, format, width, height,
                          file_path, file_size, vlm_status, vlm_description, structured_data,
                          confidence, tokens_used, content_hash, provenance_id, created_at,
                          updated_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,
                             ?19,?20,?21,?22,?23)",
                    params![
                        image.id,
                        image.document_id,
                        image.ocr_result_id,
                        image.page_number,
                        image.bbox_x,
                        image.bbox_y,
                        image.bbox_width,
                        image.bbox_height,
                        image.image_index,
                        image.format,
                        image.width,
                        image.height,
                        image.file_path,
                        image.file_size,
                        image.vlm_status.as_str(),
                        image.vlm_description,
                        image.structured_data,
                        image.confidence,
                        image.tokens_used,
                        image.content_hash,
                        image.provenance_id,
                        image.created_at,
                        image.updated_at,
                    ],
                )
                .map_err(db_err("insert image"))?;
            }
            for prov in &provs {
                crate::provenance::insert_provenance_tx(&tx, prov)?;
            }
            tx.commit().map_err(db_err("commit store_images"))
        })
        .await
    }

    pub async fn list_images(&self, document_id: String) -> Result<Vec<ImageRecord>> {
        self.query(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {IMAGE_COLS} FROM images WHERE document_id = ?1 ORDER BY image_index"
                ))
                .map_err(db_err("prepare list images"))?;
            let rows = stmt
                .query_map(params![document_id], map_image)
                .map_err(db_err("list images"))?
                .collect::<std::result::Result<Vec<_>, _>>();
            rows.map_err(db_err("read image row"))
        })
        .await
    }

    pub async fn claim_image_vision(&self, id: String) -> Result<bool> {
        self.query(move |conn| {
            let n = conn
                .execute(
                    "UPDATE images SET vlm_status = 'processing', updated_at = ?2
                     WHERE id = ?1 AND vlm_status = 'pending'",
                    params![id, crate::model::now_rfc3339()],
                )
                .map_err(db_err("claim image vision"))?;
            Ok(n == 1)
        })
        .await
    }

    /// Record a vision description: image row update, depth-3 provenance,
    /// and (when enabled) the depth-4 description embedding, atomically.
    #[allow(clippy::too_many_arguments)]
    pub async fn store_vision_result(
        &self,
        image_id: String,
        description: String,
        structured_data: Option<String>,
        confidence: f64,
        tokens_used: Option<i64>,
        vlm_prov: ProvenanceRecord,
        embedding: Option<(EmbeddingRow, Vec<f32>, ProvenanceRecord)>,
    ) -> Result<()> {
        self.query(move |conn| {
            let tx = conn.unchecked_transaction().map_err(db_err("begin store_vision_result"))?;
            tx.execute(
                "UPDATE images SET vlm_status = 'complete', vlm_description = ?2,
                     structured_data = ?3, confidence = ?4, tokens_used = ?5, updated_at = ?6
                 WHERE id = ?1",
                params![
                    image_id,
                    description,
                    structured_data,
                    confidence,
                    tokens_used,
                    crate::model::now_rfc3339(),
                ],
            )
            .map_err(db_err("update image vision"))?;
            crate::provenance::insert_provenance_tx(&tx, &vlm_prov)?;
            if let Some((row, vector, prov)) = &embedding {
                insert_embedding_tx(&tx, row, vector)?;
                crate::provenance::insert_provenance_tx(&tx, prov)?;
            }
            tx.commit().map_err(db_err("commit store_vision_result"))
        })
        .await
    }

    pub async fn mark_image_vision_failed(&self, id: String) -> Result<()> {
        self.query(move |conn| {
            conn.execute(
                "UPDATE images SET vlm_status = 'failed', updated_at = ?2 WHERE id = ?1",
                params![id, crate::model::now_rfc3339()],
            )
            .map_err(db_err("mark image vision failed"))?;
            Ok(())
        })
        .await
    }

    // ── Stats, counts, cascade ────────────────────────────────────────────

    pub async fn get_stats(&self) -> Result<CorpusStats> {
        self.query(move |conn| {
            let count = |sql: &str| -> Result<i64> {
                conn.query_row(sql, [], |r| r.get(0)).map_err(db_err("count"))
            };
            let mut by_status = std::collections::BTreeMap::new();
            let mut stmt = conn
                .prepare("SELECT status, COUNT(*) FROM documents GROUP BY status")
                .map_err(db_err("prepare status histogram"))?;
            let rows = stmt
                .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))
                .map_err(db_err("status histogram"))?;
            for row in rows {
                let (status, n) = row.map_err(db_err("read histogram row"))?;
                by_status.insert(status, n);
            }
            Ok(CorpusStats {
                total_documents: count("SELECT COUNT(*) FROM documents")?,
                total_chunks: count("SELECT COUNT(*) FROM chunks")?,
                total_embeddings: count("SELECT COUNT(*) FROM embeddings")?,
                total_images: count("SELECT COUNT(*) FROM images")?,
                total_provenance: count("SELECT COUNT(*) FROM provenance")?,
                documents_by_status: by_status,
            })
        })
        .await
    }

    /// Index-liveness counters used by the verifier and the test suite.
    pub async fn index_counts(&self) -> Result<(i64, i64)> {
        self.query(move |conn| {
            let fts: i64 = conn
                .query_row("SELECT COUNT(*) FROM chunks_fts", [], |r| r.get(0))
                .map_err(db_err("count chunks_fts"))?;
            let vec: i64 = conn
                .query_row("SELECT COUNT(*) FROM embeddings_vec", [], |r| r.get(0))
                .map_err(db_err("count embeddings_vec"))?;
            Ok((fts, vec))
        })
        .await
    }

    // ── Extension records ─────────────────────────────────────────────────

    /// Structured extraction output plus its provenance, one transaction.
    pub async fn insert_extraction(
        &self,
        rec: ExtractionRecord,
        prov: ProvenanceRecord,
    ) -> Result<()> {
        self.query(move |conn| {
            let tx = conn.unchecked_transaction().map_err(db_err("begin insert_extraction"))?;
            tx.execute(
                "INSERT INTO extractions (id, document_id, schema_name, extraction_json,
                     provenance_id, created_at)
                 VALUES (?1,?2,?3,?4,?5,?6)",
                params![
                    rec.id,
                    rec.document_id,
                    rec.schema_name,
                    rec.extraction_json,
                    prov.id,
                    crate::model::now_rfc3339(),
                ],
            )
            .map_err(db_err("insert extraction"))?;
            crate::provenance::insert_provenance_tx(&tx, &prov)?;
            tx.commit().map_err(db_err("commit insert_extraction"))
        })
        .await
    }

    pub async fn insert_form_fill(
        &self,
        rec: FormFillRecord,
        prov: ProvenanceRecord,
    ) -> Result<()> {
        self.query(move |conn| {
            let tx = conn.unchecked_transaction().map_err(db_err("begin insert_form_fill"))?;
            tx.execute(
                "INSERT INTO form_fills (id, document_id, fields_filled, fields_not_found,
                     provenance_id, created_at)
                 VALUES (?1,?2,?3,?4,?5,?6)",
                params![
                    rec.id,
                    rec.document_id,
                    rec.fields_filled,
                    rec.fields_not_found,
                    prov.id,
                    crate::model::now_rfc3339(),
                ],
            )
            .map_err(db_err("insert form fill"))?;
            crate::provenance::insert_provenance_tx(&tx, &prov)?;
            tx.commit().map_err(db_err("commit insert_form_fill"))
        })
        .await
    }

    pub async fn insert_comparison(
        &self,
        rec: ComparisonRecord,
        prov: ProvenanceRecord,
    ) -> Result<()> {
        self.query(move |conn| {
            let tx = conn.unchecked_transaction().map_err(db_err("begin insert_comparison"))?;
            tx.execute(
                "INSERT INTO comparisons (id, document_a_id, document_b_id, text_diff,
                     structural_diff, entity_diff, provenance_id, created_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
                params![
                    rec.id,
                    rec.document_a_id,
                    rec.document_b_id,
                    rec.text_diff,
                    rec.structural_diff,
                    rec.entity_diff,
                    prov.id,
                    crate::model::now_rfc3339(),
                ],
            )
            .map_err(db_err("insert comparison"))?;
            crate::provenance::insert_provenance_tx(&tx, &prov)?;
            tx.commit().map_err(db_err("commit insert_comparison"))
        })
        .await
    }

    pub async fn insert_cluster(&self, rec: ClusterRecord, prov: ProvenanceRecord) -> Result<()> {
        self.query(move |conn| {
            let tx = conn.unchecked_transaction().map_err(db_err("begin insert_cluster"))?;
            tx.execute(
                "INSERT INTO clusters (id, run_id, centroid_json, member_count, provenance_id,
                     created_at)
                 VALUES (?1,?2,?3,?4,?5,?6)",
                params![
                    rec.id,
                    rec.run_id,
                    rec.centroid_json,
                    rec.member_count,
                    prov.id,
                    crate::model::now_rfc3339(),
                ],
            )
            .map_err(db_err("insert cluster"))?;
            crate::provenance::insert_provenance_tx(&tx, &prov)?;
            tx.commit().map_err(db_err("commit insert_cluster"))
        })
        .await
    }

    pub async fn insert_knowledge_node(
        &self,
        rec: KnowledgeNodeRecord,
        prov: Option<ProvenanceRecord>,
    ) -> Result<()> {
        self.query(move |conn| {
            let tx = conn.unchecked_transaction().map_err(db_err("begin insert_knowledge_node"))?;
            tx.execute(
                "INSERT INTO knowledge_nodes (id, canonical_name, node_type, summary,
                     provenance_id, created_at)
                 VALUES (?1,?2,?3,?4,?5,?6)",
                params![
                    rec.id,
                    rec.canonical_name,
                    rec.node_type,
                    rec.summary,
                    prov.as_ref().map(|p| p.id.clone()),
                    crate::model::now_rfc3339(),
                ],
            )
            .map_err(db_err("insert knowledge node"))?;
            if let Some(prov) = &prov {
                crate::provenance::insert_provenance_tx(&tx, prov)?;
            }
            tx.commit().map_err(db_err("commit insert_knowledge_node"))
        })
        .await
    }

    /// Entity rows for one document, optionally with the extraction-level
    /// provenance node covering the run.
    pub async fn insert_entities(
        &self,
        entities: Vec<EntityRecord>,
        prov: Option<ProvenanceRecord>,
    ) -> Result<()> {
        self.query(move |conn| {
            let tx = conn.unchecked_transaction().map_err(db_err("begin insert_entities"))?;
            for e in &entities {
                tx.execute(
                    "INSERT INTO entities (id, document_id, name, entity_type, mention_count,
                         provenance_id, created_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7)",
                    params![
                        e.id,
                        e.document_id,
                        e.name,
                        e.entity_type,
                        e.mention_count,
                        prov.as_ref().map(|p| p.id.clone()),
                        crate::model::now_rfc3339(),
                    ],
                )
                .map_err(db_err("insert entity"))?;
            }
            if let Some(prov) = &prov {
                crate::provenance::insert_provenance_tx(&tx, prov)?;
            }
            tx.commit().map_err(db_err("commit insert_entities"))
        })
        .await
    }

    /// Cascading delete of a document's entire subtree in one transaction.
    /// Lexical entries fall out via triggers; vec0 rows are removed here
    /// because that index is application-managed. Extracted image files are
    /// returned for post-commit disk cleanup.
    pub async fn delete_document(&self, id: String) -> Result<DeletedCounts> {
        self.query(move |conn| {
            let root_prov: Option<String> = conn
                .query_row(
                    "SELECT provenance_id FROM documents WHERE id = ?1",
                    params![&id],
                    |r| r.get(0),
                )
                .optional()
                .map_err(db_err("lookup document"))?;
            let Some(root_prov) = root_prov else {
                return Err(PttsError::NotFound {
                    entity: "document",
                    id: id.clone(),
                });
            };

            let tx = conn.unchecked_transaction().map_err(db_err("begin delete_document"))?;
            let mut counts = DeletedCounts::default();

            let mut stmt = tx
                .prepare("SELECT file_path FROM images WHERE document_id = ?1")
                .map_err(db_err("prepare image files"))?;
            let files = stmt
                .query_map(params![&id], |r| r.get::<_, String>(0))
                .map_err(db_err("image files"))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(db_err("read image file row"))?;
            drop(stmt);
            counts.image_files = files;

            tx.execute(
                "DELETE FROM embeddings_vec WHERE embedding_id IN (
                     SELECT e.id FROM embeddings e
                     LEFT JOIN chunks c ON c.id = e.chunk_id
                     LEFT JOIN images i ON i.id = e.image_id
                     LEFT JOIN extractions x ON x.id = e.extraction_id
                     WHERE c.document_id = ?1 OR i.document_id = ?1 OR x.document_id = ?1
                 )",
                params![&id],
            )
            .map_err(db_err("delete vec entries"))?;

            counts.embeddings = tx
                .execute(
                    "DELETE FROM embeddings WHERE id IN (
                         SELECT e.id FROM embeddings e
                         LEFT JOIN chunks c ON c.id = e.chunk_id
                         LEFT JOIN images i ON i.id = e.image_id
                         LEFT JOIN extractions x ON x.id = e.extraction_id
                         WHERE c.document_id = ?1 OR i.document_id = ?1 OR x.document_id = ?1
                     )",
                    params![&id],
                )
                .map_err(db_err("delete embeddings"))?;

            counts.chunks = tx
                .execute("DELETE FROM chunks WHERE document_id = ?1", params![&id])
                .map_err(db_err("delete chunks"))?;
            counts.images = tx
                .execute("DELETE FROM images WHERE document_id = ?1", params![&id])
                .map_err(db_err("delete images"))?;
            tx.execute("DELETE FROM ocr_results WHERE document_id = ?1", params![&id])
                .map_err(db_err("delete ocr results"))?;

            for sql in [
                "DELETE FROM entity_segments WHERE document_id = ?1",
                "DELETE FROM entity_embeddings WHERE entity_id IN
                     (SELECT id FROM entities WHERE document_id = ?1)",
                "DELETE FROM entities WHERE document_id = ?1",
                "DELETE FROM extractions WHERE document_id = ?1",
                "DELETE FROM form_fills WHERE document_id = ?1",
                "DELETE FROM uploaded_files WHERE document_id = ?1",
                "DELETE FROM knowledge_links WHERE document_id = ?1",
            ] {
                counts.extension_rows += tx
                    .execute(sql, params![&id])
                    .map_err(db_err("delete extension rows"))?;
            }

            counts.provenance = tx
                .execute(
                    "DELETE FROM provenance WHERE root_document_id = ?1",
                    params![&root_prov],
                )
                .map_err(db_err("delete provenance"))?;
            tx.execute("DELETE FROM documents WHERE id = ?1", params![&id])
                .map_err(db_err("delete document"))?;

            tx.commit().map_err(db_err("commit delete_document"))?;
            Ok(counts)
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Row plumbing shared across modules
// ---------------------------------------------------------------------------

pub(crate) const DOCUMENT_COLS: &str = "id, file_path, file_name, file_size, file_type, file_hash, \
     status, page_count, title, author, subject, provenance_id, error_message, created_at, updated_at";

pub(crate) fn map_document(row: &rusqlite::Row<'_>) -> rusqlite::Result<Document> {
    let status: String = row.get(6)?;
    Ok(Document {
        id: row.get(0)?,
        file_path: row.get(1)?,
        file_name: row.get(2)?,
        file_size: row.get(3)?,
        file_type: row.get(4)?,
        file_hash: row.get(5)?,
        status: DocStatus::parse(&status).unwrap_or(DocStatus::Failed),
        page_count: row.get(7)?,
        title: row.get(8)?,
        author: row.get(9)?,
        subject: row.get(10)?,
        provenance_id: row.get(11)?,
        error_message: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

pub(crate) const CHUNK_COLS: &str = "id, document_id, ocr_result_id, text, text_hash, chunk_index, \
     character_start, character_end, page_number, page_range, overlap_previous, overlap_next, \
     embedding_status, provenance_id, created_at, updated_at";

pub(crate) fn map_chunk(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chunk> {
    let status: String = row.get(12)?;
    Ok(Chunk {
        id: row.get(0)?,
        document_id: row.get(1)?,
        ocr_result_id: row.get(2)?,
        text: row.get(3)?,
        text_hash: row.get(4)?,
        chunk_index: row.get(5)?,
        character_start: row.get(6)?,
        character_end: row.get(7)?,
        page_number: row.get(8)?,
        page_range: row.get(9)?,
        overlap_previous: row.get(10)?,
        overlap_next: row.get(11)?,
        embedding_status: EmbeddingStatus::parse(&status).unwrap_or(EmbeddingStatus::Failed),
        provenance_id: row.get(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

fn map_ocr_result(row: &rusqlite::Row<'_>) -> rusqlite::Result<OcrResult> {
    let mode: String = row.get(5)?;
    Ok(OcrResult {
        id: row.get(0)?,
        document_id: row.get(1)?,
        extracted_text: row.get(2)?,
        text_length: row.get(3)?,
        request_id: row.get(4)?,
        mode: OcrMode::parse(&mode).unwrap_or(OcrMode::Balanced),
        page_count: row.get(6)?,
        quality_score: row.get(7)?,
        cost: row.get(8)?,
        text_hash: row.get(9)?,
        duration_ms: row.get(10)?,
        blocks: row.get(11)?,
        extras: row.get(12)?,
        provenance_id: row.get(13)?,
        created_at: row.get(14)?,
    })
}

pub(crate) const IMAGE_COLS: &str = "id, document_id, ocr_result_id, page_number, bbox_x, bbox_y, \
     bbox_width, bbox_height, image_index, format, width, height, file_path, file_size, vlm_status, \
     vlm_description, structured_data, confidence, tokens_used, content_hash, provenance_id, \
     created_at, updated_at";

pub(crate) fn map_image(row: &rusqlite::Row<'_>) -> rusqlite::Result<ImageRecord> {
    let status: String = row.get(14)?;
    Ok(ImageRecord {
        id: row.get(0)?,
        document_id: row.get(1)?,
        ocr_result_id: row.get(2)?,
        page_number: row.get(3)?,
        bbox_x: row.get(4)?,
        bbox_y: row.get(5)?,
        bbox_width: row.get(6)?,
        bbox_height: row.get(7)?,
        image_index: row.get(8)?,
        format: row.get(9)?,
        width: row.get(10)?,
        height: row.get(11)?,
        file_path: row.get(12)?,
        file_size: row.get(13)?,
        vlm_status: DocStatus::parse(&status).unwrap_or(DocStatus::Failed),
        vlm_description: row.get(15)?,
        structured_data: row.get(16)?,
        confidence: row.get(17)?,
        tokens_used: row.get(18)?,
        content_hash: row.get(19)?,
        provenance_id: row.get(20)?,
        created_at: row.get(21)?,
        updated_at: row.get(22)?,
    })
}

pub(crate) const EMBEDDING_COLS: &str = "id, chunk_id, image_id, extraction_id, original_text, \
     source_file_path, source_file_name, source_file_hash, chunk_index, total_chunks, page_number, \
     page_range, character_start, character_end, model_name, model_version, task_type, \
     inference_mode, provenance_id, created_at";

pub(crate) fn map_embedding(row: &rusqlite::Row<'_>) -> rusqlite::Result<EmbeddingRow> {
    let task: String = row.get(16)?;
    Ok(EmbeddingRow {
        id: row.get(0)?,
        chunk_id: row.get(1)?,
        image_id: row.get(2)?,
        extraction_id: row.get(3)?,
        original_text: row.get(4)?,
        source_file_path: row.get(5)?,
        source_file_name: row.get(6)?,
        source_file_hash: row.get(7)?,
        chunk_index: row.get(8)?,
        total_chunks: row.get(9)?,
        page_number: row.get(10)?,
        page_range: row.get(11)?,
        character_start: row.get(12)?,
        character_end: row.get(13)?,
        model_name: row.get(14)?,
        model_version: row.get(15)?,
        task_type: if task == "query" {
            TaskType::Query
        } else {
            TaskType::Document
        },
        inference_mode: row.get(17)?,
        provenance_id: row.get(18)?,
        created_at: row.get(19)?,
    })
}

fn insert_document_tx(tx: &Connection, doc: &Document) -> Result<()> {
    tx.execute(
        "INSERT INTO documents
             (id, file_path, file_name, file_size, file_type, file_hash, status, page_count,
              title, author, subject, provenance_id, error_message, created_at, updated_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
        params![
            doc.id,
            doc.file_path,
            doc.file_name,
            doc.file_size,
            doc.file_type,
            doc.file_hash,
            doc.status.as_str(),
            doc.page_count,
            doc.title,
            doc.author,
            doc.subject,
            doc.provenance_id,
            doc.error_message,
            doc.created_at,
            doc.updated_at,
        ],
    )
    .map_err(db_err("insert document"))?;
    Ok(())
}

/// Embedding row + its vec0 entry. Same transaction, so index liveness
/// cannot lapse between the two.
pub(crate) fn insert_embedding_tx(
    tx: &Connection,
    row: &EmbeddingRow,
    vector: &[f32],
) -> Result<()> {
    if vector.len() != EMBEDDING_DIMENSIONS {
        return Err(PttsError::validation(format!(
            "embedding vector has {} dims, expected {}",
            vector.len(),
            EMBEDDING_DIMENSIONS
        )));
    }
    tx.execute(
        "INSERT INTO embeddings
             (id, chunk_id, image_id, extraction_id, original_text, source_file_path,
              source_file_name, source_file_hash, chunk_index, total_chunks, page_number,
              page_range, character_start, character_end, model_name, model_version, task_type,
              inference_mode, provenance_id, created_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20)",
        params![
            row.id,
            row.chunk_id,
            row.image_id,
            row.extraction_id,
            row.original_text,
            row.source_file_path,
            row.source_file_name,
            row.source_file_hash,
            row.chunk_index,
            row.total_chunks,
            row.page_number,
            row.page_range,
            row.character_start,
            row.character_end,
            row.model_name,
            row.model_version,
            row.task_type.as_str(),
            row.inference_mode,
            row.provenance_id,
            row.created_at,
        ],
    )
    .map_err(db_err("insert embedding"))?;
    tx.execute(
        "INSERT INTO embeddings_vec (embedding_id, vector) VALUES (?1, ?2)",
        params![row.id, vector.as_bytes()],
    )
    .map_err(db_err("insert vec entry"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{populate, sample_chunk, sample_document, sample_embedding, sample_ocr};

    #[tokio::test]
    async fn create_open_exists_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!Store::exists("corpus", dir.path()));
        let s = Store::create("corpus", dir.path()).unwrap();
        assert!(Store::exists("corpus", dir.path()));
        drop(s);

        // Re-create fails; open succeeds.
        assert_eq!(
            Store::create("corpus", dir.path()).unwrap_err().kind(),
            "UNIQUE_VIOLATION"
        );
        Store::open("corpus", dir.path()).unwrap();
        assert_eq!(
            Store::open("missing", dir.path()).unwrap_err().kind(),
            "NOT_FOUND"
        );
        assert!(Store::create("bad name!", dir.path()).is_err());
    }

    #[tokio::test]
    async fn duplicate_document_id_is_unique_violation() {
        let dir = tempfile::tempdir().unwrap();
        let s = Store::create("corpus", dir.path()).unwrap();
        let (doc, prov) = sample_document();
        s.insert_document(doc.clone(), prov).await.unwrap();

        // Same id, fresh provenance node.
        let mut dup = doc.clone();
        let prov2 = ProvenanceRecord::root("/tmp/other.pdf", &doc.file_hash, "ingest", "1");
        dup.provenance_id = prov2.id.clone();
        let err = s.insert_document(dup, prov2).await.unwrap_err();
        assert_eq!(err.kind(), "UNIQUE_VIOLATION");
    }

    #[tokio::test]
    async fn claim_is_single_winner_and_resets_on_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let s = Store::create("corpus", dir.path()).unwrap();
        let (doc, prov) = sample_document();
        s.insert_document(doc.clone(), prov).await.unwrap();

        assert!(s.claim_document(doc.id.clone()).await.unwrap());
        assert!(!s.claim_document(doc.id.clone()).await.unwrap());

        let recovered = s.reset_processing().await.unwrap();
        assert_eq!(recovered, 1);
        let reloaded = s.get_document(doc.id.clone()).await.unwrap().unwrap();
        assert_eq!(reloaded.status, DocStatus::Pending);
        assert!(s.claim_document(doc.id).await.unwrap());
    }

    #[tokio::test]
    async fn triggers_keep_lexical_index_live() {
        let dir = tempfile::tempdir().unwrap();
        let s = Store::create("corpus", dir.path()).unwrap();
        let (_doc, chunks, _) = populate(&s, 3).await;

        let (fts, vec) = s.index_counts().await.unwrap();
        assert_eq!(fts, chunks.len() as i64);
        assert_eq!(vec, chunks.len() as i64);

        let stats = s.get_stats().await.unwrap();
        assert_eq!(stats.total_chunks, 3);
        assert_eq!(stats.total_embeddings, 3);
        // DOCUMENT + OCR_RESULT + 3 CHUNK + 3 EMBEDDING
        assert_eq!(stats.total_provenance, 8);
        assert_eq!(stats.documents_by_status.get("pending"), Some(&1));
    }

    #[tokio::test]
    async fn embedding_batch_flips_chunks_complete() {
        let dir = tempfile::tempdir().unwrap();
        let s = Store::create("corpus", dir.path()).unwrap();
        let (doc, _chunks, _) = populate(&s, 2).await;

        let reloaded = s.list_chunks(doc.id.clone()).await.unwrap();
        assert!(reloaded
            .iter()
            .all(|c| c.embedding_status == EmbeddingStatus::Complete));
        assert!(s.pending_chunks(doc.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_chunks_stay_failed() {
        let dir = tempfile::tempdir().unwrap();
        let s = Store::create("corpus", dir.path()).unwrap();

        let (doc, root) = sample_document();
        s.insert_document(doc.clone(), root.clone()).await.unwrap();
        let (ocr, ocr_prov) = sample_ocr(&doc, &root, "text");
        let (chunk, chunk_prov) = sample_chunk(&doc, &ocr, &ocr_prov, 0, "window");
        s.store_ocr_output(ocr, ocr_prov, vec![chunk.clone()], vec![chunk_prov])
            .await
            .unwrap();

        s.mark_chunks_failed(vec![chunk.id.clone()]).await.unwrap();
        let reloaded = s.list_chunks(doc.id.clone()).await.unwrap();
        assert_eq!(reloaded[0].embedding_status, EmbeddingStatus::Failed);

        // The guard in mark_chunks_failed only flips pending rows, so a
        // second call cannot resurrect or re-fail anything.
        s.mark_chunks_failed(vec![chunk.id]).await.unwrap();
        let again = s.list_chunks(doc.id).await.unwrap();
        assert_eq!(again[0].embedding_status, EmbeddingStatus::Failed);
    }

    #[tokio::test]
    async fn exactly_one_embedding_source_is_check_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let s = Store::create("corpus", dir.path()).unwrap();
        let (doc, chunks, _) = populate(&s, 1).await;

        let chunk_prov_id = chunks[0].provenance_id.clone();
        let chunk_prov = s.get_provenance(chunk_prov_id).await.unwrap().unwrap();
        let (mut row, vector, prov) = sample_embedding(&doc, &chunks[0], &chunk_prov);
        row.image_id = Some("img-1".into()); // two discriminators set

        let err = s
            .store_embedding_batch(vec![(row, vector, prov)])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "DATABASE_ERROR");
    }

    #[tokio::test]
    async fn delete_document_cascades_and_shrinks_indexes() {
        let dir = tempfile::tempdir().unwrap();
        let s = Store::create("corpus", dir.path()).unwrap();
        let (doc, chunks, _) = populate(&s, 4).await;
        let n = chunks.len() as i64;

        let (fts_before, vec_before) = s.index_counts().await.unwrap();
        let stats_before = s.get_stats().await.unwrap();
        assert_eq!(stats_before.total_documents, 1);

        let counts = s.delete_document(doc.id.clone()).await.unwrap();
        assert_eq!(counts.chunks as i64, n);
        assert_eq!(counts.embeddings as i64, n);
        assert_eq!(counts.provenance as i64, n * 2 + 2);

        let stats = s.get_stats().await.unwrap();
        assert_eq!(stats.total_documents, 0);
        assert_eq!(stats.total_chunks, 0);
        assert_eq!(stats.total_embeddings, 0);
        assert_eq!(stats.total_provenance, 0);

        let (fts_after, vec_after) = s.index_counts().await.unwrap();
        assert_eq!(fts_before - fts_after, n);
        assert_eq!(vec_before - vec_after, n);

        assert_eq!(
            s.delete_document(doc.id).await.unwrap_err().kind(),
            "NOT_FOUND"
        );
    }

    #[tokio::test]
    async fn list_documents_orders_newest_first_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        let s = Store::create("corpus", dir.path()).unwrap();

        for _ in 0..3 {
            let (doc, prov) = sample_document();
            s.insert_document(doc, prov).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let docs = s.list_documents(ListFilter::default()).await.unwrap();
        assert_eq!(docs.len(), 3);
        assert!(docs.windows(2).all(|w| w[0].created_at >= w[1].created_at));

        let complete = s
            .list_documents(ListFilter {
                status: Some(DocStatus::Complete),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(complete.is_empty());

        let limited = s
            .list_documents(ListFilter {
                limit: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);
    }
}
