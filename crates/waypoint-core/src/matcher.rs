//! Match decision policy: per-place aggregation and thresholding.

use crate::catalog::ReferenceCatalog;
use crate::types::{DetectionResult, Embedding, MatchScore, Place};

/// Default combined-score threshold for a positive detection.
pub const DEFAULT_THRESHOLD: f32 = 0.65;

/// Weight of the single best reference in the combined score.
const MAX_WEIGHT: f32 = 0.7;
/// Weight of the mean over all references in the combined score.
const AVG_WEIGHT: f32 = 0.3;

/// Strategy for deciding which catalog place, if any, a query embedding shows.
pub trait Matcher: Send + Sync {
    fn decide(&self, query: &Embedding, catalog: &ReferenceCatalog) -> DetectionResult;
}

/// Blends the best and the mean reference similarity per place.
///
/// `combined = 0.7 * max + 0.3 * mean`.
#[derive(Debug, Clone, Copy)]
pub struct WeightedMatcher {
    threshold: f32,
}

impl Default for WeightedMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD)
    }
}

impl WeightedMatcher {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Score one place. Returns `None` for a place without references.
    pub fn score_place(&self, query: &Embedding, place: &Place) -> Option<MatchScore> {
        if place.is_empty() {
            return None;
        }

        let mut max_similarity = f32::NEG_INFINITY;
        let mut sum = 0.0f32;
        let mut matches = 0usize;

        // One similarity per pair feeds both aggregates.
        for entry in place.entries() {
            let sim = query.similarity(&entry.embedding);
            max_similarity = max_similarity.max(sim);
            sum += sim;
            if sim > self.threshold {
                matches += 1;
            }
        }

        let avg_similarity = sum / place.len() as f32;

        Some(MatchScore {
            place_id: place.id().to_string(),
            max_similarity,
            avg_similarity,
            combined_score: MAX_WEIGHT * max_similarity + AVG_WEIGHT * avg_similarity,
            matches,
        })
    }

    /// Scores for every place, in catalog order.
    pub fn score_all(&self, query: &Embedding, catalog: &ReferenceCatalog) -> Vec<MatchScore> {
        catalog
            .places()
            .filter_map(|place| self.score_place(query, place))
            .collect()
    }
}

impl Matcher for WeightedMatcher {
    fn decide(&self, query: &Embedding, catalog: &ReferenceCatalog) -> DetectionResult {
        let mut best: Option<MatchScore> = None;

        for score in self.score_all(query, catalog) {
            // Strictly greater: ties keep the earlier place.
            let is_better = match &best {
                None => true,
                Some(prev) => score.combined_score > prev.combined_score,
            };
            if is_better {
                best = Some(score);
            }
        }

        let Some(best) = best else {
            return DetectionResult::none();
        };

        let detected = best.combined_score >= self.threshold;
        tracing::trace!(
            place = %best.place_id,
            combined = best.combined_score,
            max = best.max_similarity,
            avg = best.avg_similarity,
            detected,
            "best candidate"
        );

        DetectionResult {
            detected,
            place_id: detected.then(|| best.place_id.clone()),
            confidence: best.combined_score,
            best_candidate: Some(best.place_id),
            matches_above_threshold: best.matches,
        }
    }
}
