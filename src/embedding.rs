use model2vec_rs::model::StaticModel;
use thiserror::Error;
use tracing::{info, warn};

/// Embedding failures. Model load failures are fatal at startup; per-call
/// failures are retried once by [`embed_with_retry`] and then surfaced.
#[derive(Debug, Error)]
pub enum EmbedderError {
    #[error("failed to load embedding model '{model}': {detail}")]
    ModelLoad { model: String, detail: String },

    #[error("embedding failed: {0}")]
    Embed(String),
}

/// Maps text to a fixed-dimension, L2-normalized vector.
///
/// The dimension is fixed for the process lifetime and the output is
/// deterministic within a process, so dot product equals cosine similarity
/// across everything embedded by one instance.
pub trait Embedder: Send + Sync {
    fn dim(&self) -> usize;

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError>;

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedderError> {
        texts.iter().map(|t| self.embed(t)).collect()
    }
}

/// Embed with a single retry on a per-call failure.
pub fn embed_with_retry(embedder: &dyn Embedder, text: &str) -> Result<Vec<f32>, EmbedderError> {
    match embedder.embed(text) {
        Ok(v) => Ok(v),
        Err(e) => {
            warn!(error = %e, "embedding failed, retrying once");
            embedder.embed(text)
        }
    }
}

/// Production embedder backed by a model2vec `StaticModel`.
///
/// `StaticModel` is `Send + Sync`; encoding is CPU-bound and lock-free.
pub struct StaticModelEmbedder {
    model: StaticModel,
    dim: usize,
}

impl StaticModelEmbedder {
    /// Load an embedding model from a local path or HuggingFace Hub model ID.
    ///
    /// HF hub models (e.g., "minishlab/potion-base-8M") are auto-downloaded
    /// and cached locally on first use.
    pub fn load(model_path: &str) -> Result<Self, EmbedderError> {
        info!(model = model_path, "loading embedding model");
        let model = StaticModel::from_pretrained(model_path, None, Some(true), None).map_err(
            |e| EmbedderError::ModelLoad {
                model: model_path.to_string(),
                detail: e.to_string(),
            },
        )?;

        // The model does not expose its dimension directly; probe it once.
        let dim = model.encode_single("tool").len();
        if dim == 0 {
            return Err(EmbedderError::ModelLoad {
                model: model_path.to_string(),
                detail: "model produced zero-dimension vectors".to_string(),
            });
        }

        info!(model = model_path, dim, "embedding model loaded");
        Ok(Self { model, dim })
    }
}

impl Embedder for StaticModelEmbedder {
    fn dim(&self) -> usize {
        self.dim
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError> {
        let mut v = self.model.encode_single(text);
        l2_normalize(&mut v);
        Ok(v)
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedderError> {
        let mut vectors = self.model.encode(texts);
        for v in &mut vectors {
            l2_normalize(v);
        }
        Ok(vectors)
    }
}

/// L2-normalize a vector in-place.
pub fn l2_normalize(vec: &mut [f32]) {
    let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vec.iter_mut() {
            *x /= norm;
        }
    }
}

/// Dot product of two vectors (equals cosine similarity when both are L2-normalized).
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}
