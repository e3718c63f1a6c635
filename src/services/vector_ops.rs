//! Vector math used by the store's similarity scan.

/// Utility struct for vector operations.
pub struct VectorOps;

impl VectorOps {
    /// Cosine similarity, given both norms, clamped to `[-1, 1]`.
    ///
    /// Returns `0.0` when either norm is zero.
    pub fn cosine_with_norms(a: &[f32], norm_a: f32, b: &[f32], norm_b: f32) -> f32 {
        if norm_a == 0.0 || norm_b == 0.0 {
            return 0.0;
        }
        (Self::dot_product(a, b) / (norm_a * norm_b)).clamp(-1.0, 1.0)
    }

    /// Dot product; `0.0` on length mismatch.
    pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
        if a.len() != b.len() {
            return 0.0;
        }
        a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
    }

    /// Euclidean norm.
    pub fn norm(vector: &[f32]) -> f32 {
        vector.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    /// True when every component is finite.
    pub fn is_finite(vector: &[f32]) -> bool {
        vector.iter().all(|x| x.is_finite())
    }
}
