//! Runtime configuration: a process-wide snapshot with validated mutation.
//!
//! Immutable keys are fixed at corpus creation (they are baked into stored
//! artifacts); attempting to set them at runtime is a validation error.
//! Mutable keys are range-checked and replaced atomically; the snapshot is
//! persisted to `config.json` under the storage root.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{io_err, PttsError, Result};
use crate::model::OcrMode;

/// Embedding model identity. Fixed per corpus: the vec0 schema and every
/// stored embedding row depend on it.
pub const EMBEDDING_MODEL: &str = "minishlab/potion-base-8M";
pub const EMBEDDING_MODEL_VERSION: &str = "1";
pub const EMBEDDING_DIMENSIONS: usize = 256;
pub const HASH_ALGORITHM: &str = "sha256";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub datalab_default_mode: OcrMode,
    pub datalab_max_concurrent: usize,
    pub embedding_batch_size: usize,
    pub embedding_device: String,
    pub chunk_size: usize,
    pub chunk_overlap_percent: usize,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            datalab_default_mode: OcrMode::Balanced,
            datalab_max_concurrent: 4,
            embedding_batch_size: 32,
            embedding_device: "cpu".to_string(),
            chunk_size: 2000,
            chunk_overlap_percent: 10,
            log_level: "info".to_string(),
        }
    }
}

const IMMUTABLE_KEYS: &[&str] = &["embedding_model", "embedding_dimensions", "hash_algorithm"];

const MUTABLE_KEYS: &[&str] = &[
    "datalab_default_mode",
    "datalab_max_concurrent",
    "embedding_batch_size",
    "embedding_device",
    "chunk_size",
    "chunk_overlap_percent",
    "log_level",
];

fn parse_usize(key: &str, value: &str) -> Result<usize> {
    value
        .parse::<usize>()
        .map_err(|_| PttsError::validation(format!("{key} must be an integer, got {value:?}")))
}

fn check_range(key: &str, v: usize, lo: usize, hi: usize) -> Result<usize> {
    if (lo..=hi).contains(&v) {
        Ok(v)
    } else {
        Err(PttsError::validation(format!(
            "{key} must be within [{lo}, {hi}], got {v}"
        )))
    }
}

impl Settings {
    /// Apply one validated mutation. Unknown and immutable keys are rejected.
    fn set_field(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "datalab_default_mode" => self.datalab_default_mode = OcrMode::parse(value)?,
            "datalab_max_concurrent" => {
                self.datalab_max_concurrent = check_range(key, parse_usize(key, value)?, 1, 10)?;
            }
            "embedding_batch_size" => {
                self.embedding_batch_size = check_range(key, parse_usize(key, value)?, 1, 1024)?;
            }
            "embedding_device" => self.embedding_device = value.to_string(),
            "chunk_size" => {
                self.chunk_size = check_range(key, parse_usize(key, value)?, 100, 10_000)?;
            }
            "chunk_overlap_percent" => {
                self.chunk_overlap_percent = check_range(key, parse_usize(key, value)?, 0, 50)?;
            }
            "log_level" => {
                if !["debug", "info", "warn", "error"].contains(&value) {
                    return Err(PttsError::validation(format!(
                        "log_level must be one of debug|info|warn|error, got {value:?}"
                    )));
                }
                self.log_level = value.to_string();
            }
            _ if IMMUTABLE_KEYS.contains(&key) => {
                return Err(PttsError::validation(format!(
                    "{key} is immutable and cannot be changed at runtime"
                )));
            }
            _ => {
                return Err(PttsError::validation(format!("unknown config key: {key}")));
            }
        }
        Ok(())
    }

    fn get_field(&self, key: &str) -> Result<serde_json::Value> {
        let v = match key {
            "datalab_default_mode" => json!(self.datalab_default_mode.as_str()),
            "datalab_max_concurrent" => json!(self.datalab_max_concurrent),
            "embedding_batch_size" => json!(self.embedding_batch_size),
            "embedding_device" => json!(self.embedding_device),
            "chunk_size" => json!(self.chunk_size),
            "chunk_overlap_percent" => json!(self.chunk_overlap_percent),
            "log_level" => json!(self.log_level),
            "embedding_model" => json!(EMBEDDING_MODEL),
            "embedding_dimensions" => json!(EMBEDDING_DIMENSIONS),
            "hash_algorithm" => json!(HASH_ALGORITHM),
            _ => {
                return Err(PttsError::validation(format!("unknown config key: {key}")));
            }
        };
        Ok(v)
    }

    /// Full snapshot including the immutable keys.
    pub fn snapshot_json(&self) -> serde_json::Value {
        let mut out = serde_json::Map::new();
        for key in IMMUTABLE_KEYS.iter().chain(MUTABLE_KEYS) {
            out.insert((*key).to_string(), self.get_field(key).expect("known key"));
        }
        serde_json::Value::Object(out)
    }
}

/// Shared handle: cheap snapshot reads, atomic single-field writes.
#[derive(Clone)]
pub struct SharedSettings {
    inner: Arc<RwLock<Settings>>,
    persist_path: Option<PathBuf>,
}

impl SharedSettings {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
            persist_path: None,
        }
    }

    /// Load from `<storage>/config.json` when present, defaults otherwise;
    /// subsequent `set` calls persist back to the same file.
    pub fn load(storage_root: &Path) -> Self {
        let path = storage_root.join("config.json");
        let settings = std::fs::read_to_string(&path)
            .ok()
            .and_then(|text| serde_json::from_str::<Settings>(&text).ok())
            .unwrap_or_default();
        Self {
            inner: Arc::new(RwLock::new(settings)),
            persist_path: Some(path),
        }
    }

    pub fn snapshot(&self) -> Settings {
        self.inner.read().clone()
    }

    pub fn get(&self, key: Option<&str>) -> Result<serde_json::Value> {
        let guard = self.inner.read();
        match key {
            Some(k) => guard.get_field(k),
            None => Ok(guard.snapshot_json()),
        }
    }

    pub fn set(&self, key: &str, value: &str) -> Result<serde_json::Value> {
        let persisted = {
            let mut guard = self.inner.write();
            guard.set_field(key, value)?;
            guard.clone()
        };
        if let Some(path) = &self.persist_path {
            let text = serde_json::to_string_pretty(&persisted)
                .expect("settings serialize");
            std::fs::write(path, text).map_err(io_err(path))?;
        }
        Ok(json!({ "key": key, "value": value }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immutable_keys_reject_mutation() {
        let s = SharedSettings::new(Settings::default());
        for key in IMMUTABLE_KEYS {
            let err = s.set(key, "anything").unwrap_err();
            assert_eq!(err.kind(), "VALIDATION_ERROR", "{key} must be immutable");
        }
        // ...but they are still readable.
        assert_eq!(s.get(Some("hash_algorithm")).unwrap(), json!("sha256"));
    }

    #[test]
    fn ranges_are_enforced() {
        let s = SharedSettings::new(Settings::default());
        assert!(s.set("datalab_max_concurrent", "11").is_err());
        assert!(s.set("datalab_max_concurrent", "0").is_err());
        s.set("datalab_max_concurrent", "10").unwrap();
        assert!(s.set("chunk_size", "99").is_err());
        s.set("chunk_size", "100").unwrap();
        assert!(s.set("chunk_overlap_percent", "51").is_err());
        assert!(s.set("embedding_batch_size", "1025").is_err());
        assert!(s.set("log_level", "trace").is_err());
        s.set("log_level", "debug").unwrap();
        assert!(s.set("datalab_default_mode", "turbo").is_err());
        s.set("datalab_default_mode", "accurate").unwrap();
        assert_eq!(s.snapshot().datalab_default_mode, OcrMode::Accurate);
    }

    #[test]
    fn unknown_key_is_rejected_on_get_and_set() {
        let s = SharedSettings::new(Settings::default());
        assert!(s.get(Some("warp_factor")).is_err());
        assert!(s.set("warp_factor", "9").is_err());
    }

    #[test]
    fn persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let s = SharedSettings::load(dir.path());
        s.set("chunk_size", "1234").unwrap();

        let reloaded = SharedSettings::load(dir.path());
        assert_eq!(reloaded.snapshot().chunk_size, 1234);
    }

    #[test]
    fn full_snapshot_lists_every_key() {
        let s = SharedSettings::new(Settings::default());
        let v = s.get(None).unwrap();
        let obj = v.as_object().unwrap();
        assert_eq!(obj.len(), IMMUTABLE_KEYS.len() + MUTABLE_KEYS.len());
        assert_eq!(obj["embedding_dimensions"], json!(EMBEDDING_DIMENSIONS));
    }
}
