//! Feature-hashing embedder.
//!
//! Projects content words into a fixed-dimension space with several signed
//! hashes per word. Lexically similar texts land close together, which is
//! enough for offline use and deterministic tests without a model service.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use super::EmbeddingModel;
use crate::search::keyword_terms;

pub struct HashingEmbedder {
    dimension: usize,
    num_hashes: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
            num_hashes: 4,
        }
    }

    fn hash_with_seed(&self, word: &str, seed: u64) -> usize {
        let mut hasher = DefaultHasher::new();
        seed.hash(&mut hasher);
        word.hash(&mut hasher);
        (hasher.finish() as usize) % self.dimension
    }

    fn sign_hash(&self, word: &str, seed: u64) -> f32 {
        let mut hasher = DefaultHasher::new();
        (seed + 1000).hash(&mut hasher);
        word.hash(&mut hasher);
        if hasher.finish() % 2 == 0 {
            1.0
        } else {
            -1.0
        }
    }

    pub fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(anyhow!("cannot embed empty text"));
        }

        let mut vector = vec![0.0f32; self.dimension];
        // Term frequency is ignored; presence is what matters for short chunks.
        for token in keyword_terms(text) {
            for seed in 0..self.num_hashes as u64 {
                let idx = self.hash_with_seed(&token, seed);
                vector[idx] += self.sign_hash(&token, seed);
            }
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Ok(vector)
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(384)
    }
}

#[async_trait]
impl EmbeddingModel for HashingEmbedder {
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(text)
    }

    async fn embed_document(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(text)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::vector::cosine_similarity;

    #[test]
    fn test_embeddings_are_deterministic_and_normalized() {
        let embedder = HashingEmbedder::new(128);
        let a = embedder.embed("Hypertension is defined by blood pressure").unwrap();
        let b = embedder.embed("Hypertension is defined by blood pressure").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 128);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_related_texts_are_closer() {
        let embedder = HashingEmbedder::new(256);
        let query = embedder.embed("What is hypertension?").unwrap();
        let related = embedder
            .embed("Hypertension is defined as systolic blood pressure of 140 mmHg")
            .unwrap();
        let unrelated = embedder.embed("Metformin dosing in renal impairment").unwrap();
        assert!(cosine_similarity(&query, &related) > cosine_similarity(&query, &unrelated));
    }

    #[test]
    fn test_stopword_only_text_is_zero_vector() {
        let embedder = HashingEmbedder::new(16);
        let v = embedder.embed("what is the").unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
        assert!(embedder.embed("   ").is_err());
    }
}
