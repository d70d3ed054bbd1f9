use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use url::Url;
use waypoint_core::photo_store::DEFAULT_LISTING_PATH;
use waypoint_core::{EngineConfig, LoopConfig, DEFAULT_THRESHOLD, MAX_REFERENCES_PER_PLACE};

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// File name of the feature-extraction model inside `model_dir`.
    pub model_file: String,
    /// Length of the vectors the model emits.
    pub embedding_dim: usize,
    /// Photo store service base URL.
    pub store_url: Option<Url>,
    /// Listing endpoint, relative to `store_url`.
    pub listing_path: String,
    /// TOML manifest used instead of the HTTP store when set.
    pub manifest_path: Option<PathBuf>,
    /// Base for relative photo URIs.
    pub photo_base_url: Option<Url>,
    pub threshold: f32,
    pub max_references_per_place: usize,
    pub fetch_timeout_secs: u64,
    /// Zero disables the extraction timeout.
    pub extract_timeout_ms: u64,
    pub fetch_concurrency: usize,
    /// Minimum time between detection attempts on submitted frames.
    pub detect_interval_ms: u64,
    pub skip_dark_frames: bool,
    /// Frames buffered between D-Bus submissions and the detection loop.
    pub frame_buffer: usize,
    /// Serve on the system bus instead of the session bus.
    pub system_bus: bool,
}

impl Config {
    /// Load configuration from `WAYPOINT_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let model_dir = var("WAYPOINT_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| default_data_dir(&var).join("models"));

        Self {
            model_dir,
            model_file: var("WAYPOINT_MODEL_FILE").unwrap_or_else(|| "place_features.onnx".to_string()),
            embedding_dim: parse_or(&var, "WAYPOINT_EMBEDDING_DIM", 1280),
            store_url: url_var(&var, "WAYPOINT_STORE_URL"),
            listing_path: var("WAYPOINT_LISTING_PATH").unwrap_or_else(|| DEFAULT_LISTING_PATH.to_string()),
            manifest_path: var("WAYPOINT_MANIFEST").map(PathBuf::from),
            photo_base_url: url_var(&var, "WAYPOINT_PHOTO_BASE_URL"),
            threshold: parse_or(&var, "WAYPOINT_THRESHOLD", DEFAULT_THRESHOLD),
            max_references_per_place: parse_or(&var, "WAYPOINT_MAX_REFERENCES", MAX_REFERENCES_PER_PLACE),
            fetch_timeout_secs: parse_or(&var, "WAYPOINT_FETCH_TIMEOUT_SECS", 10),
            extract_timeout_ms: parse_or(&var, "WAYPOINT_EXTRACT_TIMEOUT_MS", 5000),
            fetch_concurrency: parse_or(&var, "WAYPOINT_FETCH_CONCURRENCY", 4),
            detect_interval_ms: parse_or(&var, "WAYPOINT_DETECT_INTERVAL_MS", 3000),
            skip_dark_frames: var("WAYPOINT_SKIP_DARK_FRAMES")
                .map(|v| v != "0")
                .unwrap_or(true),
            frame_buffer: parse_or(&var, "WAYPOINT_FRAME_BUFFER", 2),
            system_bus: var("WAYPOINT_SYSTEM_BUS")
                .map(|v| v == "1")
                .unwrap_or(false),
        }
    }

    /// Path to the feature-extraction model.
    pub fn model_path(&self) -> String {
        self.model_dir
            .join(&self.model_file)
            .to_string_lossy()
            .into_owned()
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            threshold: self.threshold,
            max_references_per_place: self.max_references_per_place.max(1),
            fetch_timeout: self.fetch_timeout(),
            extract_timeout: (self.extract_timeout_ms > 0).then(|| Duration::from_millis(self.extract_timeout_ms)),
            fetch_concurrency: self.fetch_concurrency.max(1),
            photo_base_url: self.photo_base_url.clone(),
        }
    }

    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            min_interval: Duration::from_millis(self.detect_interval_ms),
            skip_dark_frames: self.skip_dark_frames,
            ..LoopConfig::default()
        }
    }
}

fn default_data_dir(var: &impl Fn(&str) -> Option<String>) -> PathBuf {
    var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("waypoint")
}

fn parse_or<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn url_var(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Url> {
    let raw = var(key)?;
    match Url::parse(&raw) {
        Ok(url) => Some(url),
        Err(e) => {
            tracing::warn!(key, value = %raw, error = %e, "ignoring invalid URL");
            None
        }
    }
}
