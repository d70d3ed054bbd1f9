use serde::Serialize;

use crate::similarity::{cosine_similarity, l2_normalize};

/// Upper bound on reference entries kept per place.
pub const MAX_REFERENCES_PER_PLACE: usize = 5;

/// Image embedding vector, L2-normalized at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    values: Vec<f32>,
    /// Model that produced this embedding (e.g., "mobilenet_v3_large").
    model_version: Option<String>,
}

impl Embedding {
    /// Build an embedding from raw extractor output, normalizing it to unit length.
    pub fn new(mut values: Vec<f32>) -> Self {
        l2_normalize(&mut values);
        Self {
            values,
            model_version: None,
        }
    }

    pub fn with_model_version(mut self, version: impl Into<String>) -> Self {
        self.model_version = Some(version.into());
        self
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn model_version(&self) -> Option<&str> {
        self.model_version.as_deref()
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        cosine_similarity(&self.values, &other.values)
    }
}

/// One stored embedding for a place, derived from one photo.
#[derive(Debug, Clone)]
pub struct ReferenceEntry {
    pub place_id: String,
    pub embedding: Embedding,
    pub source_uri: String,
}

/// A known place and its reference embeddings.
///
/// Never holds more than the capacity it was filled with; see [`Place::push`].
#[derive(Debug, Clone)]
pub struct Place {
    place_id: String,
    entries: Vec<ReferenceEntry>,
}

impl Place {
    pub fn new(place_id: impl Into<String>) -> Self {
        Self {
            place_id: place_id.into(),
            entries: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.place_id
    }

    pub fn entries(&self) -> &[ReferenceEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append an entry unless the place already holds `capacity` entries.
    ///
    /// Returns false when the entry was discarded. Existing entries are never evicted.
    pub fn push(&mut self, entry: ReferenceEntry, capacity: usize) -> bool {
        if self.entries.len() >= capacity {
            return false;
        }
        self.entries.push(entry);
        true
    }
}

/// Per-place aggregate similarity for one query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchScore {
    pub place_id: String,
    pub max_similarity: f32,
    pub avg_similarity: f32,
    pub combined_score: f32,
    /// Reference entries whose similarity exceeds the threshold.
    pub matches: usize,
}

/// Outcome of one detection attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionResult {
    pub detected: bool,
    /// Matched place, set only when `detected` is true.
    pub place_id: Option<String>,
    /// Combined score of the best candidate, 0.0 when the catalog is empty.
    pub confidence: f32,
    /// Highest-scoring place whether or not it cleared the threshold.
    pub best_candidate: Option<String>,
    pub matches_above_threshold: usize,
}

impl DetectionResult {
    /// Result for a query against an empty catalog.
    pub fn none() -> Self {
        Self {
            detected: false,
            place_id: None,
            confidence: 0.0,
            best_candidate: None,
            matches_above_threshold: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(place: &str, values: Vec<f32>) -> ReferenceEntry {
        ReferenceEntry {
            place_id: place.into(),
            embedding: Embedding::new(values),
            source_uri: format!("https://photos.example/{place}.jpg"),
        }
    }

    #[test]
    fn test_embedding_is_normalized() {
        let e = Embedding::new(vec![3.0, 4.0]);
        let norm: f32 = e.values().iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
        assert_eq!(e.dim(), 2);
    }

    #[test]
    fn test_zero_embedding_stays_zero() {
        let e = Embedding::new(vec![0.0; 4]);
        assert!(e.values().iter().all(|&v| v == 0.0));
        assert_eq!(e.similarity(&Embedding::new(vec![1.0, 0.0, 0.0, 0.0])), 0.0);
    }

    #[test]
    fn test_model_version() {
        let e = Embedding::new(vec![1.0]).with_model_version("test_v1");
        assert_eq!(e.model_version(), Some("test_v1"));
    }

    #[test]
    fn test_place_push_respects_capacity() {
        let mut place = Place::new("library");
        for i in 0..MAX_REFERENCES_PER_PLACE {
            assert!(place.push(entry("library", vec![1.0, i as f32]), MAX_REFERENCES_PER_PLACE));
        }
        assert!(!place.push(entry("library", vec![0.0, 1.0]), MAX_REFERENCES_PER_PLACE));
        assert_eq!(place.len(), MAX_REFERENCES_PER_PLACE);
        // The first entry is kept, nothing rotated out.
        assert_eq!(place.entries()[0].embedding, Embedding::new(vec![1.0, 0.0]));
    }

    #[test]
    fn test_detection_result_none() {
        let r = DetectionResult::none();
        assert!(!r.detected);
        assert_eq!(r.confidence, 0.0);
        assert!(r.best_candidate.is_none());
    }

    #[test]
    fn test_detection_result_serializes() {
        let r = DetectionResult {
            detected: true,
            place_id: Some("cafeteria".into()),
            confidence: 0.8,
            best_candidate: Some("cafeteria".into()),
            matches_above_threshold: 2,
        };
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["place_id"], "cafeteria");
        assert_eq!(json["matches_above_threshold"], 2);
    }
}
