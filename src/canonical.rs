//! Canonical byte forms, one per provenance node type.
//!
//! Writer and verifier both call into this module, so the encoding of an
//! artifact's content hash cannot drift between the two. Keys of JSON-shaped
//! forms serialize in sorted order (serde_json map behavior), which makes the
//! byte form deterministic.

use serde_json::json;

use crate::error::{PttsError, Result};

/// CHUNK / OCR_RESULT / EMBEDDING / VLM_DESCRIPTION / EXTRACTION:
/// the UTF-8 bytes of the stored text itself.
pub fn text_bytes(text: &str) -> Vec<u8> {
    text.as_bytes().to_vec()
}

/// FORM_FILL: `JSON({fields_filled, fields_not_found})` reparsed from the
/// stored JSON columns.
pub fn form_fill_bytes(fields_filled: &str, fields_not_found: &str) -> Result<Vec<u8>> {
    let filled: serde_json::Value = serde_json::from_str(fields_filled)
        .map_err(|e| PttsError::validation(format!("form_fill fields_filled is not JSON: {e}")))?;
    let not_found: serde_json::Value = serde_json::from_str(fields_not_found).map_err(|e| {
        PttsError::validation(format!("form_fill fields_not_found is not JSON: {e}"))
    })?;
    let v = json!({ "fields_filled": filled, "fields_not_found": not_found });
    Ok(v.to_string().into_bytes())
}

/// COMPARISON: `JSON({text_diff, structural_diff, entity_diff})` reparsed
/// from the stored JSON blobs.
pub fn comparison_bytes(
    text_diff: &str,
    structural_diff: &str,
    entity_diff: &str,
) -> Result<Vec<u8>> {
    let reparse = |label: &str, raw: &str| -> Result<serde_json::Value> {
        serde_json::from_str(raw)
            .map_err(|e| PttsError::validation(format!("comparison {label} is not JSON: {e}")))
    };
    let v = json!({
        "text_diff": reparse("text_diff", text_diff)?,
        "structural_diff": reparse("structural_diff", structural_diff)?,
        "entity_diff": reparse("entity_diff", entity_diff)?,
    });
    Ok(v.to_string().into_bytes())
}

/// CLUSTERING: `centroid_json + ":" + run_id`, verbatim.
pub fn clustering_bytes(centroid_json: &str, run_id: &str) -> Vec<u8> {
    format!("{centroid_json}:{run_id}").into_bytes()
}

/// KNOWLEDGE_GRAPH, build level: `JSON(sorted_entity_ids)`.
pub fn kg_build_bytes(entity_ids: &[String]) -> Vec<u8> {
    let mut ids = entity_ids.to_vec();
    ids.sort();
    serde_json::to_string(&ids)
        .expect("string vec serializes")
        .into_bytes()
}

/// KNOWLEDGE_GRAPH, per node: `JSON({node_id, canonical_name})`.
pub fn kg_node_bytes(node_id: &str, canonical_name: &str) -> Vec<u8> {
    json!({ "node_id": node_id, "canonical_name": canonical_name })
        .to_string()
        .into_bytes()
}

/// ENTITY_EXTRACTION, extractor processor: `JSON([deduped_entities])` with
/// the entity names deduped and sorted.
pub fn entity_extraction_bytes(entity_names: &[String]) -> Vec<u8> {
    let mut names: Vec<&str> = entity_names.iter().map(String::as_str).collect();
    names.sort_unstable();
    names.dedup();
    serde_json::to_string(&names)
        .expect("string vec serializes")
        .into_bytes()
}

/// ENTITY_EXTRACTION, indexer processor: `JSON({document_id, source})`.
pub fn entity_index_bytes(document_id: &str, source: &str) -> Vec<u8> {
    json!({ "document_id": document_id, "source": source })
        .to_string()
        .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::compute_hash;

    #[test]
    fn json_forms_serialize_with_sorted_keys() {
        let bytes = form_fill_bytes(r#"{"name":"A"}"#, r#"["dob"]"#).unwrap();
        // "fields_filled" sorts before "fields_not_found".
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"fields_filled":{"name":"A"},"fields_not_found":["dob"]}"#
        );

        let bytes = kg_node_bytes("n-7", "ACME Corp");
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"canonical_name":"ACME Corp","node_id":"n-7"}"#
        );
    }

    #[test]
    fn kg_build_sorts_ids() {
        let a = kg_build_bytes(&["e2".into(), "e1".into()]);
        let b = kg_build_bytes(&["e1".into(), "e2".into()]);
        assert_eq!(a, b);
        assert_eq!(String::from_utf8(a).unwrap(), r#"["e1","e2"]"#);
    }

    #[test]
    fn entity_extraction_dedupes() {
        let bytes = entity_extraction_bytes(&["ACME".into(), "ACME".into(), "Bob".into()]);
        assert_eq!(String::from_utf8(bytes).unwrap(), r#"["ACME","Bob"]"#);
    }

    #[test]
    fn clustering_concatenation_is_stable() {
        let bytes = clustering_bytes("[0.1,0.2]", "run-42");
        assert_eq!(String::from_utf8(bytes.clone()).unwrap(), "[0.1,0.2]:run-42");
        // Same inputs, same hash; writer and verifier agree by construction.
        assert_eq!(
            compute_hash(&bytes),
            compute_hash(&clustering_bytes("[0.1,0.2]", "run-42"))
        );
    }

    #[test]
    fn malformed_stored_json_is_a_validation_error() {
        let err = comparison_bytes("not json", "{}", "{}").unwrap_err();
        assert_eq!(err.kind(), "VALIDATION_ERROR");
    }
}
