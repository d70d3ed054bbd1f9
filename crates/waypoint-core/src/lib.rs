//! waypoint-core: place recognition from reference photos.
//!
//! Reference photos of known places are embedded with an ONNX feature
//! extractor and kept in an in-memory catalog. Live frames are embedded the
//! same way and scored against every place by cosine similarity.

pub mod catalog;
pub mod config;
pub mod detection_loop;
pub mod engine;
pub mod extractor;
pub mod frame;
pub mod matcher;
pub mod photo_store;
pub mod similarity;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use catalog::{Catalog, LoadReport, ReferenceCatalog};
pub use config::{EngineConfig, LoopConfig};
pub use detection_loop::{frame_channel, DetectionLoop, FrameSender, FrameSource, LoopState, LoopStats};
pub use engine::{EngineError, PlaceRecognitionEngine};
pub use extractor::{EmbeddingExtractor, ExtractError, OnnxExtractor, UnavailableExtractor};
pub use frame::{Frame, FrameError};
pub use matcher::{Matcher, WeightedMatcher, DEFAULT_THRESHOLD};
pub use photo_store::{
    HttpPhotoStore, ImageFetcher, ManifestPhotoStore, PhotoStore, PhotoStoreError, PlacePhotos, StaticPhotoStore,
    UriImageFetcher,
};
pub use types::{DetectionResult, Embedding, MatchScore, Place, ReferenceEntry, MAX_REFERENCES_PER_PLACE};
