//! Embedding client boundary.
//!
//! An [`EmbeddingClient`] turns a batch of texts into one fixed-dimension vector
//! per text, in request order. Implementations must never retry on their own:
//! a timeout or failure is surfaced immediately so the caller can abort.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmbedderError {
    #[error("embedding service unavailable: {0}")]
    Unavailable(String),
    #[error("embedding request timed out after {0} ms")]
    Timeout(u64),
    #[error("embedding service returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("embedding count mismatch: expected {expected}, got {got}")]
    CountMismatch { expected: usize, got: usize },
    #[error("embedding {index} has dimension {got}, expected {expected}")]
    DimensionMismatch {
        index: usize,
        expected: usize,
        got: usize,
    },
    #[error("invalid embedding input: {0}")]
    InvalidInput(String),
}

pub type EmbedderResult<T> = std::result::Result<T, EmbedderError>;

pub trait EmbeddingClient: Send + Sync {
    /// Stable identifier of the model, recorded in index snapshots.
    fn id(&self) -> &str;

    fn dimension(&self) -> usize;

    /// Embed `texts`; the response is position-aligned with the request.
    fn embed_batch(&self, texts: &[&str]) -> EmbedderResult<Vec<Vec<f32>>>;

    fn embed(&self, text: &str) -> EmbedderResult<Vec<f32>> {
        let mut out = self.embed_batch(&[text])?;
        validate_embeddings(&out, 1, self.dimension())?;
        Ok(out.remove(0))
    }
}

/// Check that a response has one vector per request and the expected width.
pub fn validate_embeddings(
    embeddings: &[Vec<f32>],
    expected_count: usize,
    dimension: usize,
) -> EmbedderResult<()> {
    if embeddings.len() != expected_count {
        return Err(EmbedderError::CountMismatch {
            expected: expected_count,
            got: embeddings.len(),
        });
    }
    if let Some((index, bad)) = embeddings
        .iter()
        .enumerate()
        .find(|(_, v)| v.len() != dimension)
    {
        return Err(EmbedderError::DimensionMismatch {
            index,
            expected: dimension,
            got: bad.len(),
        });
    }
    Ok(())
}
