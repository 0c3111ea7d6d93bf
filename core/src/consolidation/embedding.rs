//! Text embeddings for similarity clustering

/// Maps record content to a vector; similar texts should map close together
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Vec<f64>;
}

/// Default dimensionality of `TokenHashEmbedder`
pub const DEFAULT_DIMENSIONS: usize = 256;

/// Feature-hashing bag of words
///
/// Lowercased alphanumeric tokens are hashed with blake3 into a fixed
/// number of signed buckets and the result is L2-normalized. Texts with
/// the same tokens embed identically regardless of punctuation or case.
#[derive(Debug, Clone)]
pub struct TokenHashEmbedder {
    dimensions: usize,
}

impl TokenHashEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }
}

impl Default for TokenHashEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_DIMENSIONS)
    }
}

impl Embedder for TokenHashEmbedder {
    fn embed(&self, text: &str) -> Vec<f64> {
        let mut vector = vec![0.0; self.dimensions];
        let lowered = text.to_lowercase();

        for token in lowered.split(|c: char| !c.is_alphanumeric()).filter(|t| !t.is_empty()) {
            let hash = blake3::hash(token.as_bytes());
            let bytes = hash.as_bytes();
            let mut bucket = [0u8; 8];
            bucket.copy_from_slice(&bytes[..8]);
            let index = (u64::from_le_bytes(bucket) % self.dimensions as u64) as usize;
            let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[index] += sign;
        }

        normalize(&mut vector);
        vector
    }
}

/// Scale to unit length; zero vectors are left as is
pub fn normalize(vector: &mut [f64]) {
    let norm = vector.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

/// Cosine similarity; 0.0 when either vector is zero or lengths differ
pub fn cosine(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_and_punctuation_insensitive() {
        let e = TokenHashEmbedder::default();
        let a = e.embed("The deploy failed at 3am.");
        let b = e.embed("the DEPLOY failed at 3am");
        assert!((cosine(&a, &b) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_unrelated_texts_are_far_apart() {
        let e = TokenHashEmbedder::default();
        let a = e.embed("database migration completed");
        let b = e.embed("user prefers dark mode");
        assert!(cosine(&a, &b) < 0.5);
    }

    #[test]
    fn test_empty_text() {
        let e = TokenHashEmbedder::new(16);
        let v = e.embed("   ");
        assert_eq!(v.len(), 16);
        assert_eq!(cosine(&v, &v), 0.0);
    }
}
