use std::path::PathBuf;

use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PttsError>;

/// Every failure the core can surface, one variant per error kind.
///
/// Kinds are stable strings (see [`PttsError::kind`]) so callers can switch
/// on them without matching Rust variants across the CLI boundary.
#[derive(Debug, Error)]
pub enum PttsError {
    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("no corpus is selected; run `db select <name>` first")]
    DatabaseNotSelected,

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("unique violation: {detail}")]
    UniqueViolation { detail: String },

    #[error("provenance chain broken: {detail}")]
    ChainBroken { detail: String },

    #[error("invalid provenance type: {value}")]
    InvalidType { value: String },

    #[error("no stored content backs provenance node {id}")]
    ContentNotFound { id: String },

    #[error("file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("stored hash has invalid format: {value}")]
    HashFormatInvalid { value: String },

    #[error("integrity verification failed for {id}")]
    IntegrityVerificationFailed {
        id: String,
        expected: String,
        computed: String,
    },

    #[error("database schema version {stored} is newer than this build supports ({supported})")]
    SchemaNewerThanSupported { stored: i64, supported: i64 },

    #[error("external call timed out: {operation}")]
    ExternalTimeout { operation: String },

    #[error("external collaborator failed during {operation}: {cause}")]
    ExternalUnavailable { operation: String, cause: String },

    #[error("circuit open for {service}; request suppressed")]
    CircuitOpen { service: &'static str },

    #[error("database failure during {operation}: {cause}")]
    Database { operation: String, cause: String },

    #[error("io failure at {path}: {cause}")]
    Io { path: PathBuf, cause: String },
}

impl PttsError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Stable machine-readable kind string.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::DatabaseNotSelected => "DATABASE_NOT_SELECTED",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::UniqueViolation { .. } => "UNIQUE_VIOLATION",
            Self::ChainBroken { .. } => "CHAIN_BROKEN",
            Self::InvalidType { .. } => "INVALID_TYPE",
            Self::ContentNotFound { .. } => "CONTENT_NOT_FOUND",
            Self::FileNotFound { .. } => "FILE_NOT_FOUND",
            Self::HashFormatInvalid { .. } => "HASH_FORMAT_INVALID",
            Self::IntegrityVerificationFailed { .. } => "INTEGRITY_VERIFICATION_FAILED",
            Self::SchemaNewerThanSupported { .. } => "SCHEMA_NEWER_THAN_SUPPORTED",
            Self::ExternalTimeout { .. } => "EXTERNAL_TIMEOUT",
            Self::ExternalUnavailable { .. } => "EXTERNAL_UNAVAILABLE",
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Self::Database { .. } => "DATABASE_ERROR",
            Self::Io { .. } => "IO_ERROR",
        }
    }

    /// True for failure classes worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ExternalTimeout { .. } | Self::ExternalUnavailable { .. }
        )
    }

    /// Structured error envelope: kind, human message, small details object.
    pub fn envelope(&self) -> serde_json::Value {
        let details = match self {
            Self::NotFound { entity, id } => json!({ "entity": entity, "id": id }),
            Self::FileNotFound { path } => json!({ "path": path }),
            Self::Io { path, .. } => json!({ "path": path }),
            Self::IntegrityVerificationFailed {
                id,
                expected,
                computed,
            } => json!({ "id": id, "expected": expected, "computed": computed }),
            Self::SchemaNewerThanSupported { stored, supported } => {
                json!({ "stored": stored, "supported": supported })
            }
            Self::ContentNotFound { id } => json!({ "id": id }),
            Self::CircuitOpen { service } => json!({ "service": service }),
            _ => json!({}),
        };
        json!({
            "error": {
                "kind": self.kind(),
                "message": self.to_string(),
                "details": details,
            }
        })
    }
}

/// Map a rusqlite failure into our error space, preserving the operation name.
///
/// Constraint violations on primary keys / UNIQUE indexes surface as
/// `UNIQUE_VIOLATION` so duplicate ids fail with the documented kind.
pub fn db_err(operation: &str) -> impl FnOnce(rusqlite::Error) -> PttsError + '_ {
    move |e| {
        if let rusqlite::Error::SqliteFailure(ref ffi, ref msg) = e {
            if ffi.code == rusqlite::ErrorCode::ConstraintViolation {
                let detail = msg
                    .clone()
                    .unwrap_or_else(|| format!("constraint violation during {operation}"));
                if detail.contains("UNIQUE") || detail.contains("PRIMARY KEY") {
                    return PttsError::UniqueViolation { detail };
                }
            }
        }
        PttsError::Database {
            operation: operation.to_string(),
            cause: e.to_string(),
        }
    }
}

pub fn io_err(path: &std::path::Path) -> impl FnOnce(std::io::Error) -> PttsError + '_ {
    move |e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            PttsError::FileNotFound {
                path: path.to_path_buf(),
            }
        } else {
            PttsError::Io {
                path: path.to_path_buf(),
                cause: e.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable_strings() {
        assert_eq!(
            PttsError::validation("weights must sum to 1.0").kind(),
            "VALIDATION_ERROR"
        );
        assert_eq!(PttsError::DatabaseNotSelected.kind(), "DATABASE_NOT_SELECTED");
        assert_eq!(
            PttsError::SchemaNewerThanSupported {
                stored: 9,
                supported: 3
            }
            .kind(),
            "SCHEMA_NEWER_THAN_SUPPORTED"
        );
    }

    #[test]
    fn envelope_carries_kind_and_details() {
        let e = PttsError::NotFound {
            entity: "document",
            id: "doc-1".into(),
        };
        let v = e.envelope();
        assert_eq!(v["error"]["kind"], "NOT_FOUND");
        assert_eq!(v["error"]["details"]["id"], "doc-1");
    }

    #[test]
    fn transient_classification() {
        assert!(PttsError::ExternalTimeout {
            operation: "ocr".into()
        }
        .is_transient());
        assert!(!PttsError::validation("bad regex").is_transient());
    }
}
