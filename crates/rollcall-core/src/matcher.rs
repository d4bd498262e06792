//! Gallery snapshot and nearest-neighbour matching over cosine distance.

use crate::types::{Embedding, Enrollment};
use std::collections::BTreeMap;

/// Immutable snapshot of enrolled identities for one recognition session.
///
/// Iteration is in ascending id order, which is what makes tie-breaking
/// between equidistant enrollments deterministic.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    entries: BTreeMap<String, Embedding>,
}

impl Gallery {
    /// Build a gallery from store rows.
    ///
    /// A repeated id replaces the earlier embedding (last write wins).
    /// Embeddings that are not unit length are rejected with a warning.
    pub fn from_enrollments(enrollments: impl IntoIterator<Item = Enrollment>) -> Self {
        let mut entries = BTreeMap::new();
        for Enrollment { id, embedding } in enrollments {
            if !embedding.is_normalized() {
                tracing::warn!(
                    id = %id,
                    norm = embedding.norm(),
                    "rejecting enrollment with non-normalized embedding"
                );
                continue;
            }
            entries.insert(id, embedding);
        }
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Embedding> {
        self.entries.get(id)
    }

    /// Enrollments in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Embedding)> {
        self.entries.iter().map(|(id, e)| (id.as_str(), e))
    }
}

/// A gallery entry accepted as the identity of a query.
#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    pub id: String,
    /// Cosine distance to the query, strictly below the threshold.
    pub distance: f32,
    /// `1 - distance`.
    pub confidence: f32,
}

/// Result of scanning a gallery with one query embedding.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchResult {
    pub best: Option<Match>,
    /// Enrollments actually compared against the query.
    pub compared: usize,
    /// Enrollments skipped because their dimension differs from the query.
    pub skipped: usize,
}

/// Strategy for comparing a query embedding against a gallery of enrolled faces.
pub trait Matcher {
    fn best_match(&self, query: &Embedding, gallery: &Gallery, threshold: f32) -> MatchResult;
}

/// Cosine distance matcher doing a full linear scan of the gallery.
///
/// A candidate is accepted only if its distance is strictly below the
/// threshold. Among accepted candidates the smallest distance wins; on a
/// tie the first id in gallery order is kept.
#[derive(Debug, Clone, Copy, Default)]
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn best_match(&self, query: &Embedding, gallery: &Gallery, threshold: f32) -> MatchResult {
        let mut result = MatchResult::default();
        let mut best: Option<(&str, f32)> = None;

        for (id, enrolled) in gallery.iter() {
            let Some(distance) = query.cosine_distance(enrolled) else {
                result.skipped += 1;
                tracing::debug!(
                    id,
                    query_dim = query.dim(),
                    enrolled_dim = enrolled.dim(),
                    "skipping enrollment with mismatched embedding dimension"
                );
                continue;
            };
            result.compared += 1;
            tracing::trace!(id, distance, "compared");

            if distance < threshold && best.map_or(true, |(_, d)| distance < d) {
                best = Some((id, distance));
            }
        }

        result.best = best.map(|(id, distance)| Match {
            id: id.to_string(),
            distance,
            confidence: 1.0 - distance,
        });
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enrollment(id: &str, values: Vec<f32>) -> Enrollment {
        Enrollment {
            id: id.to_string(),
            embedding: Embedding::from_normalized(values),
        }
    }

    fn unit(values: Vec<f32>) -> Embedding {
        Embedding::normalized(values)
    }

    #[test]
    fn test_gallery_last_write_wins() {
        let gallery = Gallery::from_enrollments(vec![
            enrollment("a", vec![1.0, 0.0]),
            enrollment("a", vec![0.0, 1.0]),
        ]);
        assert_eq!(gallery.len(), 1);
        assert_eq!(gallery.get("a").unwrap().values(), &[0.0, 1.0]);
    }

    #[test]
    fn test_gallery_rejects_non_normalized() {
        let gallery = Gallery::from_enrollments(vec![
            enrollment("ok", vec![0.6, 0.8]),
            enrollment("long", vec![3.0, 4.0]),
            enrollment("zero", vec![0.0, 0.0]),
        ]);
        assert_eq!(gallery.len(), 1);
        assert!(gallery.contains("ok"));
        assert!(gallery.iter().all(|(_, e)| (e.norm() - 1.0).abs() < 1e-3));
    }

    #[test]
    fn test_exact_enrollment_matches_with_full_confidence() {
        let gallery = Gallery::from_enrollments(vec![
            enrollment("a", vec![1.0, 0.0, 0.0]),
            enrollment("b", vec![0.0, 1.0, 0.0]),
        ]);
        for threshold in [0.01, 0.5, 1.0, 2.0] {
            let result = CosineMatcher.best_match(
                &Embedding::from_normalized(vec![0.0, 1.0, 0.0]),
                &gallery,
                threshold,
            );
            let best = result.best.expect("exact match");
            assert_eq!(best.id, "b");
            assert_eq!(best.confidence, 1.0);
        }
    }

    /// Deterministic pseudo-random values in `[-1, 1)`.
    fn pseudo_random(seed: u64, len: usize) -> Vec<f32> {
        let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (0..len)
            .map(|_| {
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                ((state >> 40) as f32 / (1u64 << 24) as f32) * 2.0 - 1.0
            })
            .collect()
    }

    #[test]
    fn test_exact_match_survives_rounding_in_128_dims() {
        for seed in 0..200 {
            let enrolled = Embedding::normalized(pseudo_random(seed, 128));
            let gallery = Gallery::from_enrollments(vec![Enrollment {
                id: "p".to_string(),
                embedding: enrolled.clone(),
            }]);

            assert_eq!(enrolled.cosine_distance(&enrolled), Some(0.0), "seed {seed}");
            let best = CosineMatcher
                .best_match(&enrolled, &gallery, 1e-9)
                .best
                .unwrap_or_else(|| panic!("seed {seed}: exact match rejected"));
            assert_eq!(best.id, "p");
            assert_eq!(best.confidence, 1.0, "seed {seed}");
        }
    }

    #[test]
    fn test_distance_equal_to_threshold_is_rejected() {
        let gallery = Gallery::from_enrollments(vec![enrollment("a", vec![0.0, 1.0])]);
        let query = Embedding::from_normalized(vec![1.0, 0.0]);

        // Orthogonal: distance is exactly 1.0.
        let result = CosineMatcher.best_match(&query, &gallery, 1.0);
        assert_eq!(result.best, None);
        assert_eq!(result.compared, 1);

        let result = CosineMatcher.best_match(&query, &gallery, 1.0001);
        assert_eq!(result.best.map(|m| m.id).as_deref(), Some("a"));
    }

    #[test]
    fn test_orthogonal_pair_credits_only_exact() {
        let gallery = Gallery::from_enrollments(vec![
            enrollment("A", vec![1.0, 0.0]),
            enrollment("B", vec![0.0, 1.0]),
        ]);
        let result =
            CosineMatcher.best_match(&Embedding::from_normalized(vec![1.0, 0.0]), &gallery, 1.0);
        let best = result.best.unwrap();
        assert_eq!(best.id, "A");
        assert_eq!(best.distance, 0.0);
        assert_eq!(best.confidence, 1.0);
        assert_eq!(result.compared, 2);
    }

    #[test]
    fn test_full_scan_picks_minimum_distance() {
        // Closest entry is last in iteration order.
        let gallery = Gallery::from_enrollments(vec![
            enrollment("1", vec![0.0, 1.0, 0.0]),
            enrollment("2", unit(vec![0.5, 0.5, 0.0]).values().to_vec()),
            enrollment("3", unit(vec![0.9, 0.1, 0.0]).values().to_vec()),
        ]);
        let result =
            CosineMatcher.best_match(&Embedding::from_normalized(vec![1.0, 0.0, 0.0]), &gallery, 1.0);
        assert_eq!(result.best.unwrap().id, "3");
        assert_eq!(result.compared, 3);
    }

    #[test]
    fn test_tie_resolves_to_first_id() {
        let gallery = Gallery::from_enrollments(vec![
            enrollment("zed", vec![1.0, 0.0]),
            enrollment("amy", vec![1.0, 0.0]),
        ]);
        let result =
            CosineMatcher.best_match(&Embedding::from_normalized(vec![1.0, 0.0]), &gallery, 0.5);
        assert_eq!(result.best.unwrap().id, "amy");
    }

    #[test]
    fn test_no_candidate_under_threshold() {
        let gallery = Gallery::from_enrollments(vec![enrollment("a", vec![0.0, 1.0])]);
        let result =
            CosineMatcher.best_match(&Embedding::from_normalized(vec![1.0, 0.0]), &gallery, 0.5);
        assert_eq!(result.best, None);
    }

    #[test]
    fn test_empty_gallery() {
        let result = CosineMatcher.best_match(
            &Embedding::from_normalized(vec![1.0, 0.0]),
            &Gallery::default(),
            1.0,
        );
        assert_eq!(result, MatchResult::default());
    }

    #[test]
    fn test_dimension_mismatch_skips_only_offending_entry() {
        let gallery = Gallery::from_enrollments(vec![
            enrollment("a", vec![1.0, 0.0, 0.0]),
            enrollment("b", vec![1.0, 0.0]),
        ]);
        let result =
            CosineMatcher.best_match(&Embedding::from_normalized(vec![1.0, 0.0]), &gallery, 0.5);
        assert_eq!(result.skipped, 1);
        assert_eq!(result.compared, 1);
        assert_eq!(result.best.unwrap().id, "b");
    }
}
