//! Test doubles for the engine's collaborators.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use image::{ImageFormat, Rgb, RgbImage};
use parking_lot::Mutex;
use url::Url;

use crate::extractor::{EmbeddingExtractor, ExtractError};
use crate::frame::Frame;
use crate::photo_store::{FetchError, ImageFetcher, PhotoStore, PhotoStoreError, PlacePhotos};
use crate::types::Embedding;

pub const BASE: &str = "https://photos.test/";

pub fn url(name: &str) -> String {
    format!("{BASE}{name}")
}

pub fn png(rgb: [u8; 3]) -> Vec<u8> {
    let img = RgbImage::from_pixel(4, 4, Rgb(rgb));
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}

pub fn solid_frame(rgb: [u8; 3]) -> Frame {
    let pixels = rgb.iter().copied().cycle().take(4 * 4 * 3).collect();
    Frame::from_rgb(pixels, 4, 4).unwrap()
}

pub fn listing(id: &str, uris: &[&str]) -> PlacePhotos {
    PlacePhotos {
        place_id: id.to_string(),
        photo_uris: uris.iter().map(|u| u.to_string()).collect(),
    }
}

type ExtractFn = dyn Fn(&Frame) -> Result<Embedding, ExtractError> + Send + Sync;

/// Extractor driven by a closure, counting invocations and overlapping calls.
pub struct FnExtractor {
    f: Box<ExtractFn>,
    delay: Option<Duration>,
    /// Restricts `delay` to frames whose top-left pixel has this color.
    delay_on: Option<[u8; 3]>,
    calls: AtomicUsize,
    running: AtomicUsize,
    peak: AtomicUsize,
    model: Option<String>,
}

impl FnExtractor {
    pub fn new(f: impl Fn(&Frame) -> Result<Embedding, ExtractError> + Send + Sync + 'static) -> Self {
        Self {
            f: Box::new(f),
            delay: None,
            delay_on: None,
            calls: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            model: None,
        }
    }

    /// Embeds a frame as the RGB value of its top-left pixel.
    /// Pure red (255, 0, 0) fails, to exercise soft failures.
    pub fn color() -> Self {
        Self::new(|frame| {
            let [r, g, b] = frame.rgb_at(0, 0);
            if [r, g, b] == [255, 0, 0] {
                return Err(ExtractError::InferenceFailed("poisoned pixel".into()));
            }
            Ok(Embedding::new(vec![r as f32, g as f32, b as f32]))
        })
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Sleep only on frames whose top-left pixel is `rgb`.
    pub fn with_delay_on(mut self, rgb: [u8; 3], delay: Duration) -> Self {
        self.delay = Some(delay);
        self.delay_on = Some(rgb);
        self
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = Some(model.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Calls in progress right now.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Most calls ever in progress at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl EmbeddingExtractor for FnExtractor {
    fn extract(&self, frame: &Frame) -> Result<Embedding, ExtractError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            if self.delay_on.map_or(true, |rgb| frame.rgb_at(0, 0) == rgb) {
                std::thread::sleep(delay);
            }
        }
        let result = (self.f)(frame);
        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn model_version(&self) -> Option<&str> {
        self.model.as_deref()
    }
}

/// Fetcher serving canned bytes by URL; unknown URLs are 404s.
#[derive(Default)]
pub struct MapFetcher {
    photos: HashMap<String, Vec<u8>>,
    delays: HashMap<String, Duration>,
    calls: AtomicUsize,
}

impl MapFetcher {
    pub fn with(mut self, url: &str, bytes: Vec<u8>) -> Self {
        self.photos.insert(url.to_string(), bytes);
        self
    }

    pub fn with_delay(mut self, url: &str, delay: Duration) -> Self {
        self.delays.insert(url.to_string(), delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageFetcher for MapFetcher {
    async fn fetch(&self, url: &Url) -> Result<Vec<u8>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delays.get(url.as_str()) {
            tokio::time::sleep(*delay).await;
        }
        self.photos.get(url.as_str()).cloned().ok_or(FetchError::Status {
            url: url.to_string(),
            status: 404,
        })
    }
}

/// Photo store whose listing can be swapped or made to fail.
#[derive(Clone, Default)]
pub struct SwitchableStore {
    listing: Arc<Mutex<Option<Vec<PlacePhotos>>>>,
}

impl SwitchableStore {
    pub fn new(places: Vec<PlacePhotos>) -> Self {
        Self {
            listing: Arc::new(Mutex::new(Some(places))),
        }
    }

    pub fn set(&self, places: Vec<PlacePhotos>) {
        *self.listing.lock() = Some(places);
    }

    /// Make the next listings fail as unreachable.
    pub fn fail(&self) {
        *self.listing.lock() = None;
    }
}

#[async_trait]
impl PhotoStore for SwitchableStore {
    async fn list_places_with_photos(&self) -> Result<Vec<PlacePhotos>, PhotoStoreError> {
        self.listing.lock().clone().ok_or(PhotoStoreError::Status(503))
    }
}
