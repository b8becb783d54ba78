//! FNV-1a feature hashing embedder (deterministic fallback).
//!
//! Each lowercase alphanumeric token is hashed into one of `dimension` buckets
//! with a sign bit, then the vector is L2-normalised. No model files, no
//! network: useful offline and for tests that need stable vectors.

use super::embedder::{EmbedderError, EmbedderResult, EmbeddingClient};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
    id: String,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> EmbedderResult<Self> {
        if dimension == 0 {
            return Err(EmbedderError::InvalidInput(
                "dimension must be non-zero".into(),
            ));
        }
        Ok(Self {
            dimension,
            id: format!("fnv1a-{dimension}"),
        })
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimension];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let hash = fnv1a(token.to_lowercase().as_bytes());
            let bucket = (hash % self.dimension as u64) as usize;
            let sign = if (hash >> 63) & 1 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(FNV_PRIME)
    })
}

impl EmbeddingClient for HashEmbedder {
    fn id(&self) -> &str {
        &self.id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed_batch(&self, texts: &[&str]) -> EmbedderResult<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_and_normalised() {
        let e = HashEmbedder::new(64).unwrap();
        let a = e.embed("Quiet 2 bed near campus").unwrap();
        let b = e.embed("quiet 2 BED near campus!").unwrap();
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn empty_text_is_the_zero_vector() {
        let e = HashEmbedder::new(8).unwrap();
        assert_eq!(e.embed("  ").unwrap(), vec![0.0; 8]);
    }

    #[test]
    fn batch_preserves_order() {
        let e = HashEmbedder::new(384).unwrap();
        let batch = e.embed_batch(&["alpha", "beta"]).unwrap();
        assert_eq!(batch[0], e.embed("alpha").unwrap());
        assert_eq!(batch[1], e.embed("beta").unwrap());
        assert_eq!(e.id(), "fnv1a-384");
    }

    #[test]
    fn zero_dimension_is_rejected() {
        assert!(HashEmbedder::new(0).is_err());
    }
}
