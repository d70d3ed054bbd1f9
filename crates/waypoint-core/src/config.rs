use std::time::Duration;
use url::Url;

use crate::matcher::DEFAULT_THRESHOLD;
use crate::types::MAX_REFERENCES_PER_PLACE;

/// Engine tuning. Defaults match the recognition behavior users expect.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Combined-score threshold for a positive detection.
    pub threshold: f32,
    /// Reference photos kept per place.
    pub max_references_per_place: usize,
    /// Timeout for fetching one reference photo.
    pub fetch_timeout: Duration,
    /// Timeout for one embedding extraction; `None` waits indefinitely.
    pub extract_timeout: Option<Duration>,
    /// Reference photos processed concurrently during a catalog build.
    pub fetch_concurrency: usize,
    /// Base for relative photo URIs.
    pub photo_base_url: Option<Url>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            max_references_per_place: MAX_REFERENCES_PER_PLACE,
            fetch_timeout: Duration::from_secs(10),
            extract_timeout: Some(Duration::from_secs(5)),
            fetch_concurrency: 4,
            photo_base_url: None,
        }
    }
}

/// Detection loop cadence and delivery.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Minimum time between the starts of two detection attempts.
    pub min_interval: Duration,
    /// Ignore frames that are almost entirely black.
    pub skip_dark_frames: bool,
    /// Fraction of near-black pixels above which a frame counts as dark.
    pub dark_fraction: f32,
    /// Capacity of the result channel handed to the consumer.
    pub result_capacity: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(3000),
            skip_dark_frames: true,
            dark_fraction: 0.95,
            result_capacity: 8,
        }
    }
}
