//! Embedding seam
//!
//! The worker pool embeds summaries through this trait; the runtime plugs in
//! its model client. [`HashEmbedder`] is a deterministic offline backend for
//! tests and airgapped runs.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

/// Produces embedding vectors for a batch of texts
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> eyre::Result<Vec<Vec<f32>>>;
}

/// Deterministic embedding from hashed token counts.
///
/// Each whitespace token is hashed into one of `dim` buckets; the bucket
/// counts are L2-normalised. No network, stable across runs.
pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, texts: &[String]) -> eyre::Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            let mut vec = vec![0.0f32; self.dim];
            for token in text.split_whitespace() {
                let digest = Sha256::digest(token.as_bytes());
                let bucket = u64::from_be_bytes(digest[..8].try_into().unwrap()) as usize % self.dim;
                vec[bucket] += 1.0;
            }
            let norm = vec.iter().map(|v| v * v).sum::<f32>().sqrt().max(1.0e-9);
            for v in &mut vec {
                *v /= norm;
            }
            vectors.push(vec);
        }
        Ok(vectors)
    }
}

/// Cosine similarity between two vectors of equal dimension
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hash_embedder_deterministic() {
        let embedder = HashEmbedder::default();
        let a = embedder.embed(&["hello world".to_string()]).await.unwrap();
        let b = embedder.embed(&["hello world".to_string()]).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].len(), 256);
    }

    #[tokio::test]
    async fn test_hash_embedder_normalised() {
        let embedder = HashEmbedder::default();
        let vecs = embedder.embed(&["alpha beta gamma".to_string()]).await.unwrap();
        let norm: f32 = vecs[0].iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1.0e-5);
    }

    #[tokio::test]
    async fn test_similar_texts_closer_than_dissimilar() {
        let embedder = HashEmbedder::default();
        let vecs = embedder
            .embed(&[
                "database query performance tuning".to_string(),
                "database query optimization".to_string(),
                "birdwatching in the alps".to_string(),
            ])
            .await
            .unwrap();
        let close = cosine_similarity(&vecs[0], &vecs[1]);
        let far = cosine_similarity(&vecs[0], &vecs[2]);
        assert!(close > far);
    }

    #[test]
    fn test_cosine_edge_cases() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }
}
