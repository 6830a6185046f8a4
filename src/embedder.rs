//! Embedding collaborator seam.
//!
//! Production uses model2vec static embeddings loaded from the HuggingFace
//! Hub: local inference, no server round trip. Texts are prefixed per task
//! type ("passage: " for stored artifacts, "query: " at search time) and the
//! output is L2-normalized so the vec0 distance metric sees unit vectors.

use async_trait::async_trait;
use model2vec_rs::model::StaticModel;

use crate::error::{PttsError, Result};
use crate::settings::{EMBEDDING_DIMENSIONS, EMBEDDING_MODEL, EMBEDDING_MODEL_VERSION};

#[async_trait]
pub trait Embedder: Send + Sync {
    fn model_name(&self) -> &str;
    fn model_version(&self) -> &str;
    fn dimensions(&self) -> usize;

    /// Embed stored artifact texts, one vector per input, in input order.
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed a search query.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>>;
}

pub fn normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

pub struct Model2VecEmbedder {
    model: StaticModel,
    model_name: String,
}

impl Model2VecEmbedder {
    pub fn load(model_id: &str) -> Result<Self> {
        let model = StaticModel::from_pretrained(model_id, None, None, None).map_err(|e| {
            PttsError::ExternalUnavailable {
                operation: "load embedding model".to_string(),
                cause: e.to_string(),
            }
        })?;
        Ok(Self {
            model,
            model_name: model_id.to_string(),
        })
    }

    pub fn load_default() -> Result<Self> {
        Self::load(EMBEDDING_MODEL)
    }

    fn encode_checked(&self, prefixed: &str) -> Result<Vec<f32>> {
        let v = self.model.encode_single(prefixed);
        if v.len() != EMBEDDING_DIMENSIONS {
            return Err(PttsError::validation(format!(
                "embedding model produced {} dims, expected {}",
                v.len(),
                EMBEDDING_DIMENSIONS
            )));
        }
        Ok(normalize(v))
    }
}

#[async_trait]
impl Embedder for Model2VecEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn model_version(&self) -> &str {
        EMBEDDING_MODEL_VERSION
    }

    fn dimensions(&self) -> usize {
        EMBEDDING_DIMENSIONS
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        texts
            .iter()
            .map(|t| self.encode_checked(&format!("passage: {t}")))
            .collect()
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.encode_checked(&format!("query: {text}"))
    }
}

/// Deterministic stand-in provider: hashes each text into a stable unit
/// vector. Used by the test suite and by offline smoke runs where pulling
/// model weights is not an option; nearest-neighbor ordering is reproducible.
pub struct HashEmbedder {
    pub dims: usize,
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

impl HashEmbedder {
    pub fn new() -> Self {
        Self {
            dims: EMBEDDING_DIMENSIONS,
        }
    }

    fn encode(&self, text: &str) -> Vec<f32> {
        let digest = crate::hasher::compute_hash_str(text);
        let bytes = digest.as_bytes();
        let v: Vec<f32> = (0..self.dims)
            .map(|i| {
                let b = bytes[7 + (i % (digest.len() - 7))];
                (b as f32 / 255.0) - 0.5
            })
            .collect();
        normalize(v)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash-embedder"
    }

    fn model_version(&self) -> &str {
        "0"
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.encode(t)).collect())
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.encode(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_produces_unit_vectors() {
        let v = normalize(vec![3.0, 4.0]);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
        // Zero vectors pass through untouched instead of dividing by zero.
        assert_eq!(normalize(vec![0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[tokio::test]
    async fn hash_embedder_is_deterministic_and_unit_length() {
        let e = HashEmbedder::new();
        let a = e.embed_query("invoice total").await.unwrap();
        let b = e.embed_query("invoice total").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), EMBEDDING_DIMENSIONS);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);

        let c = e.embed_query("completely different text").await.unwrap();
        assert_ne!(a, c);
    }
}
