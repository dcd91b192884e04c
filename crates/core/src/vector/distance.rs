//! Distance metrics. Every metric returns a value where lower means more
//! similar.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// `1 - cosine_similarity`, clamped to `[0, 2]`. Zero vectors are at
    /// distance 1 from everything.
    #[default]
    Cosine,
    /// L2 distance.
    Euclidean,
    /// Negative dot product.
    DotProduct,
    /// Number of dimensions whose sign bit differs (`x > 0` is a set bit).
    Hamming,
}

impl DistanceMetric {
    #[inline]
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            DistanceMetric::Cosine => cosine_distance(a, b),
            DistanceMetric::Euclidean => euclidean_sq(a, b).sqrt(),
            DistanceMetric::DotProduct => -dot(a, b),
            DistanceMetric::Hamming => hamming(a, b),
        }
    }

    /// Distance with the query norm computed once up front. Only cosine uses it.
    #[inline]
    pub(crate) fn distance_prenorm(&self, query: &[f32], query_norm: f32, b: &[f32]) -> f32 {
        match self {
            DistanceMetric::Cosine => {
                let b_norm = l2_norm(b);
                if query_norm == 0.0 || b_norm == 0.0 {
                    return 1.0;
                }
                (1.0 - dot(query, b) / (query_norm * b_norm)).clamp(0.0, 2.0)
            }
            other => other.distance(query, b),
        }
    }
}

#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[inline]
pub fn l2_norm(v: &[f32]) -> f32 {
    dot(v, v).sqrt()
}

/// Cosine similarity in `[-1, 1]`; 0 when either vector has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let (na, nb) = (l2_norm(a), l2_norm(b));
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    (dot(a, b) / (na * nb)).clamp(-1.0, 1.0)
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let (na, nb) = (l2_norm(a), l2_norm(b));
    if na == 0.0 || nb == 0.0 {
        return 1.0;
    }
    (1.0 - dot(a, b) / (na * nb)).clamp(0.0, 2.0)
}

fn euclidean_sq(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn hamming(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).filter(|(x, y)| (**x > 0.0) != (**y > 0.0)).count() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_identical_is_zero() {
        let v = [0.3, -1.2, 4.0];
        assert!(DistanceMetric::Cosine.distance(&v, &v).abs() < 1e-6);
    }

    #[test]
    fn cosine_orthogonal_is_one_and_opposite_is_two() {
        let d = DistanceMetric::Cosine;
        assert!((d.distance(&[1.0, 0.0], &[0.0, 1.0]) - 1.0).abs() < 1e-6);
        assert!((d.distance(&[1.0, 0.0], &[-1.0, 0.0]) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_zero_vector_does_not_produce_nan() {
        let d = DistanceMetric::Cosine.distance(&[0.0, 0.0], &[1.0, 2.0]);
        assert_eq!(d, 1.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn euclidean_is_l2() {
        assert!((DistanceMetric::Euclidean.distance(&[0.0, 0.0], &[3.0, 4.0]) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn dot_product_prefers_larger_projection() {
        let d = DistanceMetric::DotProduct;
        assert!(d.distance(&[1.0, 1.0], &[2.0, 2.0]) < d.distance(&[1.0, 1.0], &[1.0, 0.0]));
    }

    #[test]
    fn hamming_counts_sign_flips() {
        let d = DistanceMetric::Hamming.distance(&[1.0, -1.0, 0.5, 0.0], &[1.0, 1.0, -0.5, 0.0]);
        assert_eq!(d, 2.0);
    }

    #[test]
    fn prenorm_matches_plain_cosine() {
        let a = [1.0, 2.0, 3.0];
        let b = [-2.0, 0.5, 1.0];
        let plain = DistanceMetric::Cosine.distance(&a, &b);
        let pre = DistanceMetric::Cosine.distance_prenorm(&a, l2_norm(&a), &b);
        assert!((plain - pre).abs() < 1e-6);
    }
}
