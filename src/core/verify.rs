//! Identity verification by embedding similarity against a single reference.

use crate::core::models::{FaceCandidate, SimilarityStats, VerificationResult};

/// Scale `v` to unit length. Zero vectors come back unchanged.
pub fn l2_normalize(v: &[f32]) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return v.to_vec();
    }
    v.iter().map(|x| x / norm).collect()
}

/// Cosine similarity of the normalized vectors, clamped to `[0, 1]`.
///
/// Returns 0.0 for empty, zero-norm or mismatched-length input.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 || !norm_a.is_finite() || !norm_b.is_finite() {
        return 0.0;
    }
    let dot: f32 = a
        .iter()
        .zip(b)
        .map(|(x, y)| (x / norm_a) * (y / norm_b))
        .sum();
    if dot.is_nan() {
        return 0.0;
    }
    dot.clamp(0.0, 1.0)
}

/// Accepted subset plus one result per input candidate.
#[derive(Debug, Clone, Default)]
pub struct BatchVerification {
    pub accepted: Vec<FaceCandidate>,
    pub results: Vec<VerificationResult>,
}

impl BatchVerification {
    pub fn scores(&self) -> Vec<f32> {
        self.results.iter().map(|r| r.similarity_score).collect()
    }

    pub fn stats(&self) -> Option<SimilarityStats> {
        SimilarityStats::from_scores(&self.scores())
    }
}

pub struct VerificationEngine {
    reference: Vec<f32>,
    threshold: f32,
}

impl VerificationEngine {
    pub fn new(reference: &[f32], threshold: f32) -> Self {
        Self {
            reference: l2_normalize(reference),
            threshold,
        }
    }

    pub fn reference(&self) -> &[f32] {
        &self.reference
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn score(&self, embedding: &[f32]) -> f32 {
        cosine_similarity(&self.reference, embedding)
    }

    pub fn is_accepted(&self, score: f32) -> bool {
        score >= self.threshold
    }

    pub fn verify(&self, candidate: &FaceCandidate) -> VerificationResult {
        let score = self.score(&candidate.embedding);
        VerificationResult {
            face_ref: candidate.id.clone(),
            similarity_score: score,
            accepted: self.is_accepted(score),
        }
    }

    /// Score every candidate; keep the accepted ones in input order.
    pub fn verify_batch(&self, candidates: &[FaceCandidate]) -> BatchVerification {
        let mut batch = BatchVerification::default();
        for candidate in candidates {
            let result = self.verify(candidate);
            if result.accepted {
                log::debug!(
                    "Accepted {} (similarity {:.4})",
                    candidate.id,
                    result.similarity_score
                );
                batch.accepted.push(candidate.clone());
            } else {
                log::debug!(
                    "Rejected {} (similarity {:.4})",
                    candidate.id,
                    result.similarity_score
                );
            }
            batch.results.push(result);
        }
        log::info!(
            "Verified {}/{} faces at threshold {:.2}",
            batch.accepted.len(),
            candidates.len(),
            self.threshold
        );
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::BoundingBox;
    use std::path::PathBuf;

    fn candidate(id: &str, embedding: Vec<f32>) -> FaceCandidate {
        FaceCandidate {
            id: id.to_string(),
            source_image: PathBuf::from(format!("{id}.jpg")),
            bounding_box: BoundingBox {
                x1: 0.0,
                y1: 0.0,
                x2: 60.0,
                y2: 60.0,
            },
            confidence: 0.9,
            embedding,
            crop_path: PathBuf::from(format!("faces/{id}.jpg")),
        }
    }

    /// Unit vector in the x/y plane whose cosine with `[1, 0]` is `similarity`.
    fn at_similarity(similarity: f32) -> Vec<f32> {
        vec![similarity, (1.0 - similarity * similarity).sqrt()]
    }

    #[test]
    fn test_cosine_similarity_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        // opposite vectors clamp to zero
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]), 0.0);
        // scale does not matter
        let a = [3.0f32, 4.0];
        let b = [6.0f32, 8.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_norm_and_mismatch() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_cosine_similarity_symmetric_and_bounded() {
        let vectors: [Vec<f32>; 4] = [
            vec![0.3, -0.2, 0.9, 0.1],
            vec![-0.5, 0.5, 0.5, -0.5],
            vec![1.0, 2.0, 3.0, 4.0],
            vec![0.0, 0.0, 0.0, 1e-3],
        ];
        for a in &vectors {
            for b in &vectors {
                let ab = cosine_similarity(a, b);
                let ba = cosine_similarity(b, a);
                assert!((ab - ba).abs() < 1e-6);
                assert!((0.0..=1.0).contains(&ab));
            }
        }
    }

    #[test]
    fn test_threshold_scenario_keeps_order() {
        let engine = VerificationEngine::new(&[1.0, 0.0], 0.42);
        let candidates = vec![
            candidate("a", at_similarity(0.1)),
            candidate("b", at_similarity(0.5)),
            candidate("c", at_similarity(0.42)),
            candidate("d", at_similarity(0.9)),
        ];

        let batch = engine.verify_batch(&candidates);
        let accepted: Vec<_> = batch.accepted.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(accepted, vec!["b", "c", "d"]);
        assert_eq!(batch.results.len(), 4);
        assert!(!batch.results[0].accepted);
    }

    #[test]
    fn test_threshold_boundary_is_inclusive() {
        let engine = VerificationEngine::new(&[1.0, 0.0], 0.5);
        assert!(engine.is_accepted(0.5));
        assert!(!engine.is_accepted(0.499_99));
    }

    #[test]
    fn test_accepted_count_non_increasing_in_threshold() {
        let candidates: Vec<_> = (0..=20)
            .map(|i| candidate(&format!("f{i}"), at_similarity(i as f32 / 20.0)))
            .collect();

        let mut previous = usize::MAX;
        for step in 0..=10 {
            let t = step as f32 / 10.0;
            let engine = VerificationEngine::new(&[1.0, 0.0], t);
            let batch = engine.verify_batch(&candidates);
            for (c, r) in candidates.iter().zip(&batch.results) {
                assert_eq!(r.accepted, cosine_similarity(engine.reference(), &c.embedding) >= t);
            }
            assert!(batch.accepted.len() <= previous);
            previous = batch.accepted.len();
        }
    }

    #[test]
    fn test_empty_embedding_is_rejected() {
        let engine = VerificationEngine::new(&[1.0, 0.0], 0.0);
        let result = engine.verify(&candidate("x", Vec::new()));
        assert_eq!(result.similarity_score, 0.0);
        // threshold 0 accepts a zero score
        assert!(result.accepted);

        let strict = VerificationEngine::new(&[1.0, 0.0], 0.1);
        assert!(!strict.verify(&candidate("x", Vec::new())).accepted);
    }
}
