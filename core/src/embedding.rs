use sha2::{Digest, Sha256};

pub const DEFAULT_DIMS: usize = 384;

/// Deterministic text embedding. The digest of `(model_id, text)` seeds a
/// counter-block expansion so any dimensionality can be filled, and the
/// result is scaled to unit length so dot products are cosine similarities.
pub fn embed_text(text: &str, model_id: &str, dims: usize) -> Vec<f32> {
    let dims = dims.max(1);

    let mut seed = Sha256::new();
    seed.update(model_id.as_bytes());
    seed.update(text.as_bytes());
    let seed = seed.finalize();

    let mut out = Vec::with_capacity(dims);
    let mut counter: u64 = 0;
    while out.len() < dims {
        let mut block = Sha256::new();
        block.update(seed);
        block.update(counter.to_le_bytes());
        let digest = block.finalize();
        for byte in digest.iter() {
            if out.len() == dims {
                break;
            }
            out.push((*byte as f32 / 127.5) - 1.0);
        }
        counter += 1;
    }

    let norm = out.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in &mut out {
            *v /= norm;
        }
    }
    out
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if na <= f32::EPSILON || nb <= f32::EPSILON {
        return 0.0;
    }
    dot / (na * nb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_is_reproducible_for_same_inputs() {
        let a = embed_text("hello", "embedding-default-v1", 64);
        let b = embed_text("hello", "embedding-default-v1", 64);
        assert_eq!(a, b);
    }

    #[test]
    fn embedding_changes_when_model_changes() {
        let a = embed_text("hello", "embedding-default-v1", 64);
        let b = embed_text("hello", "embedding-alt-v1", 64);
        assert_ne!(a, b);
    }

    #[test]
    fn embedding_is_unit_length() {
        let v = embed_text("some text", "m", 384);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = embed_text("same", "m", 32);
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn fills_dimensions_beyond_one_digest_block() {
        let v = embed_text("long", "m", 100);
        assert_eq!(v.len(), 100);
        // The tail past the 32-byte digest must not be constant padding.
        assert!(v[32..].iter().any(|x| (x - v[32]).abs() > 1e-6) || v.len() <= 33);
    }
}
