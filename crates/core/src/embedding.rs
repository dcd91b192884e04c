//! Text-to-vector adapters for [`Database::insert_text`] and
//! [`Database::search_text`].
//!
//! The engine never ships a model. Callers plug one in through
//! [`TextEmbedder`]; [`HashEmbedder`] is a deterministic, dependency-free
//! stand-in that hashes word tokens into signed buckets, so texts sharing
//! words land close together. It is meant for tests and demos.
//!
//! [`Database::insert_text`]: crate::Database::insert_text
//! [`Database::search_text`]: crate::Database::search_text

use crate::{Result, RiceError};

pub trait TextEmbedder: Send + Sync {
    /// Length of every vector this embedder produces.
    fn dimension(&self) -> usize;

    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }
}

#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Result<Self> {
        if dimension == 0 {
            return Err(RiceError::Validation("embedding dimension must be > 0".into()));
        }
        Ok(Self { dimension })
    }
}

fn token_hash(token: &str) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    token
        .bytes()
        .fold(OFFSET, |h, b| (h ^ b as u64).wrapping_mul(PRIME))
}

impl TextEmbedder for HashEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut v = vec![0.0f32; self.dimension];
        let mut tokens = 0;
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let h = token_hash(&token.to_lowercase());
            let bucket = (h % self.dimension as u64) as usize;
            let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
            tokens += 1;
        }
        if tokens == 0 {
            return Err(RiceError::Validation(
                "text contains no embeddable tokens".into(),
            ));
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        Ok(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::distance::cosine_similarity;

    #[test]
    fn same_text_same_vector() {
        let e = HashEmbedder::new(64).unwrap();
        assert_eq!(e.embed("hello world").unwrap(), e.embed("Hello, WORLD!").unwrap());
    }

    #[test]
    fn output_is_unit_length() {
        let e = HashEmbedder::new(32).unwrap();
        let v = e.embed("the quick brown fox").unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert_eq!(v.len(), 32);
    }

    #[test]
    fn shared_words_are_more_similar() {
        let e = HashEmbedder::new(256).unwrap();
        let a = e.embed("rust storage engine").unwrap();
        let b = e.embed("rust storage layer").unwrap();
        let c = e.embed("banana smoothie recipe").unwrap();
        assert!(cosine_similarity(&a, &b) > cosine_similarity(&a, &c));
    }

    #[test]
    fn empty_text_is_rejected() {
        let e = HashEmbedder::new(8).unwrap();
        assert!(matches!(e.embed("  ,, "), Err(RiceError::Validation(_))));
        assert!(HashEmbedder::new(0).is_err());
    }

    #[test]
    fn batch_matches_single() {
        let e = HashEmbedder::new(16).unwrap();
        let batch = e.embed_batch(&["a b", "c"]).unwrap();
        assert_eq!(batch[1], e.embed("c").unwrap());
    }
}
