//! Forward-only schema versioning.
//!
//! The stored version lives in the single-row `schema_version` table. Bring-up
//! on an empty database applies every step; an existing database applies only
//! the steps above its stored version, one transaction per step with the
//! version bumped at the end of each. A database written by a newer build
//! fails fast instead of being touched.
//!
//! Migrations never drop data. Step 3 widens the CHECK on `provenance.type`
//! by rebuilding the table (create new, copy rows verbatim, drop old, rename,
//! re-create indexes) because SQLite cannot alter a CHECK in place.

use rusqlite::Connection;

use crate::error::{db_err, PttsError, Result};
use crate::model::now_rfc3339;

pub const SCHEMA_VERSION: i64 = 3;

const CORE_PROVENANCE_TYPES: &str = "'DOCUMENT','OCR_RESULT','CHUNK','IMAGE','VLM_DESCRIPTION','EMBEDDING'";

const ALL_PROVENANCE_TYPES: &str = "'DOCUMENT','OCR_RESULT','CHUNK','IMAGE','VLM_DESCRIPTION','EMBEDDING',\
     'EXTRACTION','FORM_FILL','COMPARISON','CLUSTERING','KNOWLEDGE_GRAPH','ENTITY_EXTRACTION'";

/// Run all pending migrations. Safe to call on every open.
pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            version INTEGER NOT NULL,
            updated_at TEXT NOT NULL
        );",
    )
    .map_err(db_err("create schema_version"))?;

    let stored: i64 = conn
        .query_row(
            "SELECT version FROM schema_version WHERE id = 1",
            [],
            |r| r.get(0),
        )
        .unwrap_or(0);

    if stored == SCHEMA_VERSION {
        return Ok(());
    }
    if stored > SCHEMA_VERSION {
        return Err(PttsError::SchemaNewerThanSupported {
            stored,
            supported: SCHEMA_VERSION,
        });
    }

    for step in (stored + 1)..=SCHEMA_VERSION {
        apply_step(conn, step)?;
        tracing::info!(step, "applied schema migration");
    }
    Ok(())
}

/// One migration inside one transaction, version bump included.
fn apply_step(conn: &Connection, step: i64) -> Result<()> {
    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("begin migration"))?;

    match step {
        1 => tx
            .execute_batch(&migration_core())
            .map_err(db_err("migration 1 (core schema)"))?,
        2 => tx
            .execute_batch(MIGRATION_EXTENSIONS)
            .map_err(db_err("migration 2 (extension tables)"))?,
        3 => tx
            .execute_batch(&migration_widen_provenance_types())
            .map_err(db_err("migration 3 (widen provenance types)"))?,
        other => {
            return Err(PttsError::Database {
                operation: "migrate".to_string(),
                cause: format!("no migration registered for step {other}"),
            })
        }
    }

    tx.execute(
        "INSERT INTO schema_version (id, version, updated_at) VALUES (1, ?1, ?2)
         ON CONFLICT(id) DO UPDATE SET version = ?1, updated_at = ?2",
        rusqlite::params![step, now_rfc3339()],
    )
    .map_err(db_err("bump schema version"))?;

    tx.commit().map_err(db_err("commit migration"))?;
    Ok(())
}

fn provenance_ddl(table: &str, allowed_types: &str) -> String {
    format!(
        "CREATE TABLE {table} (
            id TEXT PRIMARY KEY,
            type TEXT NOT NULL CHECK (type IN ({allowed_types})),
            source_type TEXT NOT NULL,
            source_path TEXT,
            source_id TEXT,
            root_document_id TEXT NOT NULL,
            location TEXT,
            content_hash TEXT NOT NULL,
            input_hash TEXT,
            file_hash TEXT,
            processor TEXT NOT NULL,
            processor_version TEXT NOT NULL,
            processing_params TEXT NOT NULL DEFAULT '{{}}',
            processing_duration_ms INTEGER,
            quality_score REAL,
            parent_id TEXT,
            parent_ids TEXT NOT NULL DEFAULT '[]',
            chain_depth INTEGER NOT NULL,
            chain_path TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL
        );"
    )
}

const PROVENANCE_INDEX_DDL: &str = "
    CREATE INDEX IF NOT EXISTS idx_provenance_root ON provenance(root_document_id);
    CREATE INDEX IF NOT EXISTS idx_provenance_parent ON provenance(parent_id);
    CREATE INDEX IF NOT EXISTS idx_provenance_content_hash ON provenance(content_hash);
    CREATE INDEX IF NOT EXISTS idx_provenance_type ON provenance(type);";

fn migration_core() -> String {
    format!(
        "
    CREATE TABLE database_metadata (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        name TEXT NOT NULL,
        created_at TEXT NOT NULL,
        embedding_model TEXT NOT NULL,
        embedding_model_version TEXT NOT NULL,
        embedding_dimensions INTEGER NOT NULL
    );

    CREATE TABLE documents (
        id TEXT PRIMARY KEY,
        file_path TEXT NOT NULL,
        file_name TEXT NOT NULL,
        file_size INTEGER NOT NULL,
        file_type TEXT NOT NULL,
        file_hash TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending'
            CHECK (status IN ('pending','processing','complete','failed')),
        page_count INTEGER,
        title TEXT,
        author TEXT,
        subject TEXT,
        provenance_id TEXT NOT NULL UNIQUE,
        error_message TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE INDEX idx_documents_status ON documents(status);
    CREATE INDEX idx_documents_file_hash ON documents(file_hash);

    CREATE TABLE ocr_results (
        id TEXT PRIMARY KEY,
        document_id TEXT NOT NULL REFERENCES documents(id),
        extracted_text TEXT NOT NULL,
        text_length INTEGER NOT NULL,
        request_id TEXT,
        mode TEXT NOT NULL CHECK (mode IN ('fast','balanced','accurate')),
        page_count INTEGER NOT NULL,
        quality_score REAL,
        cost REAL,
        text_hash TEXT NOT NULL,
        duration_ms INTEGER NOT NULL,
        blocks TEXT,
        extras TEXT,
        provenance_id TEXT NOT NULL UNIQUE,
        created_at TEXT NOT NULL
    );
    CREATE INDEX idx_ocr_results_document ON ocr_results(document_id);

    CREATE TABLE chunks (
        id TEXT PRIMARY KEY,
        document_id TEXT NOT NULL REFERENCES documents(id),
        ocr_result_id TEXT NOT NULL REFERENCES ocr_results(id),
        text TEXT NOT NULL,
        text_hash TEXT NOT NULL,
        chunk_index INTEGER NOT NULL,
        character_start INTEGER NOT NULL,
        character_end INTEGER NOT NULL,
        page_number INTEGER,
        page_range TEXT,
        overlap_previous INTEGER NOT NULL DEFAULT 0,
        overlap_next INTEGER NOT NULL DEFAULT 0,
        embedding_status TEXT NOT NULL DEFAULT 'pending'
            CHECK (embedding_status IN ('pending','complete','failed')),
        provenance_id TEXT NOT NULL UNIQUE,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE INDEX idx_chunks_document ON chunks(document_id);
    CREATE INDEX idx_chunks_ocr_result ON chunks(ocr_result_id);
    CREATE INDEX idx_chunks_text_hash ON chunks(text_hash);
    CREATE INDEX idx_chunks_page ON chunks(page_number);
    CREATE INDEX idx_chunks_embedding_status ON chunks(embedding_status);

    CREATE TABLE images (
        id TEXT PRIMARY KEY,
        document_id TEXT NOT NULL REFERENCES documents(id),
        ocr_result_id TEXT NOT NULL REFERENCES ocr_results(id),
        page_number INTEGER NOT NULL,
        bbox_x REAL NOT NULL,
        bbox_y REAL NOT NULL,
        bbox_width REAL NOT NULL,
        bbox_height REAL NOT NULL,
        image_index INTEGER NOT NULL,
        format TEXT NOT NULL,
        width INTEGER,
        height INTEGER,
        file_path TEXT NOT NULL,
        file_size INTEGER NOT NULL,
        vlm_status TEXT NOT NULL DEFAULT 'pending'
            CHECK (vlm_status IN ('pending','processing','complete','failed')),
        vlm_description TEXT,
        structured_data TEXT,
        confidence REAL,
        tokens_used INTEGER,
        content_hash TEXT,
        provenance_id TEXT NOT NULL UNIQUE,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE INDEX idx_images_document ON images(document_id);
    CREATE INDEX idx_images_page ON images(page_number);
    CREATE INDEX idx_images_pending_vlm ON images(vlm_status) WHERE vlm_status = 'pending';

    CREATE TABLE embeddings (
        id TEXT PRIMARY KEY,
        chunk_id TEXT REFERENCES chunks(id),
        image_id TEXT REFERENCES images(id),
        extraction_id TEXT,
        original_text TEXT NOT NULL,
        source_file_path TEXT NOT NULL,
        source_file_name TEXT NOT NULL,
        source_file_hash TEXT NOT NULL,
        chunk_index INTEGER,
        total_chunks INTEGER,
        page_number INTEGER,
        page_range TEXT,
        character_start INTEGER,
        character_end INTEGER,
        model_name TEXT NOT NULL,
        model_version TEXT NOT NULL,
        task_type TEXT NOT NULL DEFAULT 'document' CHECK (task_type IN ('document','query')),
        inference_mode TEXT NOT NULL DEFAULT 'local',
        provenance_id TEXT NOT NULL UNIQUE,
        created_at TEXT NOT NULL,
        CHECK (
            (chunk_id IS NOT NULL) + (image_id IS NOT NULL) + (extraction_id IS NOT NULL) = 1
        )
    );
    CREATE INDEX idx_embeddings_chunk ON embeddings(chunk_id);
    CREATE INDEX idx_embeddings_image ON embeddings(image_id);
    CREATE INDEX idx_embeddings_extraction ON embeddings(extraction_id);

    {provenance}
    {prov_indexes}

    -- Lexical index over chunk text: porter stemming on a unicode tokenizer,
    -- external-content mode so the text is stored once. Triggers keep the
    -- index in lockstep with the base table inside the same transaction.
    CREATE VIRTUAL TABLE chunks_fts USING fts5(
        text,
        content='chunks',
        content_rowid='rowid',
        tokenize='porter unicode61'
    );
    CREATE TRIGGER chunks_fts_ai AFTER INSERT ON chunks BEGIN
        INSERT INTO chunks_fts(rowid, text) VALUES (new.rowid, new.text);
    END;
    CREATE TRIGGER chunks_fts_ad AFTER DELETE ON chunks BEGIN
        INSERT INTO chunks_fts(chunks_fts, rowid, text) VALUES ('delete', old.rowid, old.text);
    END;
    CREATE TRIGGER chunks_fts_au AFTER UPDATE OF text ON chunks BEGIN
        INSERT INTO chunks_fts(chunks_fts, rowid, text) VALUES ('delete', old.rowid, old.text);
        INSERT INTO chunks_fts(rowid, text) VALUES (new.rowid, new.text);
    END;

    -- Lexical index over image-description embeddings only. The triggers
    -- guard on image_id so chunk- and extraction-sourced rows stay out.
    CREATE VIRTUAL TABLE image_embeddings_fts USING fts5(
        original_text,
        content='embeddings',
        content_rowid='rowid',
        tokenize='porter unicode61'
    );
    CREATE TRIGGER image_embeddings_fts_ai AFTER INSERT ON embeddings
    WHEN new.image_id IS NOT NULL BEGIN
        INSERT INTO image_embeddings_fts(rowid, original_text)
        VALUES (new.rowid, new.original_text);
    END;
    CREATE TRIGGER image_embeddings_fts_ad AFTER DELETE ON embeddings
    WHEN old.image_id IS NOT NULL BEGIN
        INSERT INTO image_embeddings_fts(image_embeddings_fts, rowid, original_text)
        VALUES ('delete', old.rowid, old.original_text);
    END;

    -- Vector index keyed by embedding id; maintained by application code in
    -- the same transaction as the embedding insert.
    CREATE VIRTUAL TABLE embeddings_vec USING vec0(
        embedding_id TEXT PRIMARY KEY,
        vector float[256]
    );
    ",
        provenance = provenance_ddl("provenance", CORE_PROVENANCE_TYPES),
        prov_indexes = PROVENANCE_INDEX_DDL,
    )
}

const MIGRATION_EXTENSIONS: &str = "
    CREATE TABLE extractions (
        id TEXT PRIMARY KEY,
        document_id TEXT NOT NULL REFERENCES documents(id),
        schema_name TEXT,
        extraction_json TEXT NOT NULL,
        provenance_id TEXT NOT NULL UNIQUE,
        created_at TEXT NOT NULL
    );
    CREATE INDEX idx_extractions_document ON extractions(document_id);

    CREATE TABLE form_fills (
        id TEXT PRIMARY KEY,
        document_id TEXT NOT NULL REFERENCES documents(id),
        fields_filled TEXT NOT NULL DEFAULT '{}',
        fields_not_found TEXT NOT NULL DEFAULT '[]',
        provenance_id TEXT NOT NULL UNIQUE,
        created_at TEXT NOT NULL
    );
    CREATE INDEX idx_form_fills_document ON form_fills(document_id);

    CREATE TABLE uploaded_files (
        id TEXT PRIMARY KEY,
        document_id TEXT REFERENCES documents(id),
        file_path TEXT NOT NULL,
        file_name TEXT NOT NULL,
        file_size INTEGER NOT NULL,
        content_hash TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE TABLE entities (
        id TEXT PRIMARY KEY,
        document_id TEXT NOT NULL REFERENCES documents(id),
        name TEXT NOT NULL,
        entity_type TEXT NOT NULL,
        mention_count INTEGER NOT NULL DEFAULT 1,
        provenance_id TEXT,
        created_at TEXT NOT NULL
    );
    CREATE INDEX idx_entities_document ON entities(document_id);

    CREATE TABLE entity_segments (
        id TEXT PRIMARY KEY,
        entity_id TEXT NOT NULL REFERENCES entities(id),
        document_id TEXT NOT NULL REFERENCES documents(id),
        chunk_id TEXT REFERENCES chunks(id),
        char_start INTEGER,
        char_end INTEGER,
        created_at TEXT NOT NULL
    );
    CREATE INDEX idx_entity_segments_entity ON entity_segments(entity_id);

    CREATE TABLE entity_embeddings (
        id TEXT PRIMARY KEY,
        entity_id TEXT NOT NULL REFERENCES entities(id),
        model_name TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE TABLE comparisons (
        id TEXT PRIMARY KEY,
        document_a_id TEXT NOT NULL,
        document_b_id TEXT NOT NULL,
        text_diff TEXT NOT NULL DEFAULT '{}',
        structural_diff TEXT NOT NULL DEFAULT '{}',
        entity_diff TEXT NOT NULL DEFAULT '{}',
        provenance_id TEXT NOT NULL UNIQUE,
        created_at TEXT NOT NULL
    );

    CREATE TABLE clusters (
        id TEXT PRIMARY KEY,
        run_id TEXT NOT NULL,
        centroid_json TEXT NOT NULL,
        member_count INTEGER NOT NULL DEFAULT 0,
        provenance_id TEXT NOT NULL UNIQUE,
        created_at TEXT NOT NULL
    );
    CREATE INDEX idx_clusters_run ON clusters(run_id);

    CREATE TABLE knowledge_nodes (
        id TEXT PRIMARY KEY,
        canonical_name TEXT NOT NULL,
        node_type TEXT NOT NULL,
        summary TEXT,
        provenance_id TEXT,
        created_at TEXT NOT NULL
    );
    CREATE INDEX idx_knowledge_nodes_name ON knowledge_nodes(canonical_name COLLATE NOCASE);

    CREATE TABLE knowledge_edges (
        id TEXT PRIMARY KEY,
        source_node_id TEXT NOT NULL REFERENCES knowledge_nodes(id),
        target_node_id TEXT NOT NULL REFERENCES knowledge_nodes(id),
        relation TEXT NOT NULL,
        weight REAL,
        created_at TEXT NOT NULL
    );

    CREATE TABLE knowledge_links (
        id TEXT PRIMARY KEY,
        node_id TEXT NOT NULL REFERENCES knowledge_nodes(id),
        document_id TEXT NOT NULL REFERENCES documents(id),
        chunk_id TEXT REFERENCES chunks(id),
        created_at TEXT NOT NULL
    );
    CREATE INDEX idx_knowledge_links_node ON knowledge_links(node_id);

    -- Entity vector index uses an explicit cosine metric.
    CREATE VIRTUAL TABLE entities_vec USING vec0(
        entity_embedding_id TEXT PRIMARY KEY,
        vector float[256] distance_metric=cosine
    );
";

/// Widen the provenance type CHECK to admit the extension processors.
/// SQLite cannot alter a CHECK, so the table is rebuilt and rows are copied
/// verbatim; indexes are re-created afterwards, all within the step's
/// transaction.
fn migration_widen_provenance_types() -> String {
    format!(
        "
    {new_table}
    INSERT INTO provenance_new SELECT * FROM provenance;
    DROP TABLE provenance;
    ALTER TABLE provenance_new RENAME TO provenance;
    {prov_indexes}
    ",
        new_table = provenance_ddl("provenance_new", ALL_PROVENANCE_TYPES),
        prov_indexes = PROVENANCE_INDEX_DDL,
    )
}
