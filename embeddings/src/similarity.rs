//! Similarity computation for embeddings.

use ordered_float::OrderedFloat;

use crate::error::{EmbeddingError, Result};

/// Compute the dot product between two embeddings.
///
/// For unit-length vectors this is their cosine similarity.
pub fn dot_product(a: &[f32], b: &[f32]) -> Result<f32> {
    if a.len() != b.len() {
        return Err(EmbeddingError::DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }

    Ok(a.iter().zip(b.iter()).map(|(x, y)| x * y).sum())
}

/// Normalize an embedding to unit length. Zero vectors are left unchanged.
pub fn normalize(embedding: &mut [f32]) {
    let magnitude: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
    if magnitude > 0.0 {
        for x in embedding.iter_mut() {
            *x /= magnitude;
        }
    }
}

/// Select the `k` highest scores as `(position, score)`, best first.
///
/// Equal scores keep their original order.
pub fn top_k(scores: &[f32], k: usize) -> Vec<(usize, f32)> {
    if k == 0 {
        return Vec::new();
    }

    let order = |a: &(OrderedFloat<f32>, usize), b: &(OrderedFloat<f32>, usize)| {
        b.0.cmp(&a.0).then(a.1.cmp(&b.1))
    };

    let mut ranked: Vec<(OrderedFloat<f32>, usize)> = scores
        .iter()
        .enumerate()
        .map(|(i, score)| (OrderedFloat(*score), i))
        .collect();

    if k < ranked.len() {
        ranked.select_nth_unstable_by(k, order);
        ranked.truncate(k);
    }
    ranked.sort_by(order);

    ranked
        .into_iter()
        .map(|(score, i)| (i, score.into_inner()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_dot_product() {
        let a = vec![1.0, 2.0, 3.0];
        let b = vec![4.0, 5.0, 6.0];
        assert!((dot_product(&a, &b).unwrap() - 32.0).abs() < 1e-6);
    }

    #[test]
    fn test_dimension_mismatch() {
        let a = vec![1.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert!(dot_product(&a, &b).is_err());
    }

    #[test]
    fn test_normalize() {
        let mut v = vec![3.0, 4.0];
        normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_zero_vector() {
        let mut v = vec![0.0, 0.0];
        normalize(&mut v);
        assert_eq!(v, vec![0.0, 0.0]);
    }

    #[test]
    fn test_top_k_orders_by_score() {
        let results = top_k(&[0.1, 0.9, 0.5, 0.7], 2);
        assert_eq!(results, vec![(1, 0.9), (3, 0.7)]);
    }

    #[test]
    fn test_top_k_ties_keep_insertion_order() {
        let results = top_k(&[0.5, 0.8, 0.5, 0.8, 0.5], 4);
        assert_eq!(results, vec![(1, 0.8), (3, 0.8), (0, 0.5), (2, 0.5)]);
    }

    #[test]
    fn test_top_k_fewer_than_k() {
        assert_eq!(top_k(&[0.2, 0.3], 10), vec![(1, 0.3), (0, 0.2)]);
        assert!(top_k(&[], 3).is_empty());
        assert!(top_k(&[1.0], 0).is_empty());
    }
}
