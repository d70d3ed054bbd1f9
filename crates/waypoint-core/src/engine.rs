//! Place recognition engine: catalog + extractor + decision policy behind one handle.

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::catalog::{Catalog, LoadReport};
use crate::config::EngineConfig;
use crate::extractor::{EmbeddingExtractor, ExtractError, ExtractionSlots};
use crate::frame::Frame;
use crate::matcher::{Matcher, WeightedMatcher};
use crate::photo_store::{ImageFetcher, PhotoStore, PhotoStoreError};
use crate::types::{DetectionResult, Embedding, MatchScore};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("extractor unavailable: {0}")]
    Extractor(#[from] ExtractError),
    #[error("photo store: {0}")]
    PhotoStore(#[from] PhotoStoreError),
}

struct EngineInner {
    catalog: Arc<Catalog>,
    /// Single slot shared by one-shot detections and the detection loop.
    extraction: ExtractionSlots,
    matcher: WeightedMatcher,
    /// Set once population has been started successfully.
    initialized: tokio::sync::Mutex<bool>,
    population: Mutex<Option<JoinHandle<LoadReport>>>,
}

/// Clone-safe handle to a place recognition engine.
///
/// Construct one per application; there is no process-wide instance.
#[derive(Clone)]
pub struct PlaceRecognitionEngine {
    inner: Arc<EngineInner>,
}

impl PlaceRecognitionEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn PhotoStore>,
        fetcher: Arc<dyn ImageFetcher>,
        extractor: Arc<dyn EmbeddingExtractor>,
    ) -> Self {
        let catalog = Arc::new(Catalog::new(&config, store, fetcher, extractor.clone()));
        Self {
            inner: Arc::new(EngineInner {
                catalog,
                extraction: ExtractionSlots::new(extractor, 1, config.extract_timeout),
                matcher: WeightedMatcher::new(config.threshold),
                initialized: tokio::sync::Mutex::new(false),
                population: Mutex::new(None),
            }),
        }
    }

    /// Start populating the catalog. Idempotent.
    ///
    /// Returns once the extractor is confirmed ready and the photo store has
    /// been enumerated; photos are fetched and embedded in the background.
    /// On error nothing is started and the call can be retried; meanwhile the
    /// engine answers every query with "no match".
    pub async fn initialize(&self) -> Result<(), EngineError> {
        let mut initialized = self.inner.initialized.lock().await;
        if *initialized {
            return Ok(());
        }

        self.inner.extraction.extractor().ready()?;
        let listing = self.inner.catalog.enumerate().await?;
        tracing::info!(places = listing.len(), "place listing received; populating catalog");

        let catalog = self.inner.catalog.clone();
        let handle = tokio::spawn(async move { catalog.load_listing(listing).await });
        *self.inner.population.lock() = Some(handle);
        *initialized = true;
        Ok(())
    }

    pub async fn is_initialized(&self) -> bool {
        *self.inner.initialized.lock().await
    }

    /// Wait for the population started by [`initialize`](Self::initialize).
    ///
    /// Returns `None` if no population is pending.
    pub async fn wait_until_populated(&self) -> Option<LoadReport> {
        let handle = self.inner.population.lock().take();
        match handle?.await {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::error!(error = %e, "catalog population task failed");
                None
            }
        }
    }

    /// Rebuild the catalog from the photo store and swap it in.
    pub async fn reload_catalog(&self) -> Result<LoadReport, EngineError> {
        let report = self.inner.catalog.reload().await?;
        *self.inner.initialized.lock().await = true;
        Ok(report)
    }

    pub fn catalog(&self) -> &Catalog {
        &self.inner.catalog
    }

    pub fn threshold(&self) -> f32 {
        self.inner.matcher.threshold()
    }

    /// Identifier of the embedding model, if the extractor reports one.
    pub fn model_version(&self) -> Option<String> {
        self.inner.extraction.extractor().model_version().map(str::to_string)
    }

    /// True while an earlier detection extraction is still running, including
    /// one whose caller gave up on it.
    pub fn extraction_busy(&self) -> bool {
        self.inner.extraction.is_saturated()
    }

    /// One-shot detection. Extraction failures are logged and reported as
    /// "no match".
    pub async fn detect(&self, frame: Frame) -> DetectionResult {
        match self.try_detect(frame).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(error = %e, "detection failed; reporting no match");
                DetectionResult::none()
            }
        }
    }

    /// One-shot detection surfacing extraction failures.
    pub async fn try_detect(&self, frame: Frame) -> Result<DetectionResult, ExtractError> {
        if self.inner.catalog.is_empty() {
            return Ok(DetectionResult::none());
        }
        let embedding = self.embed(frame).await?;
        Ok(self.score(&embedding))
    }

    /// Per-place scores for a frame, in catalog order.
    pub async fn explain(&self, frame: Frame) -> Result<Vec<MatchScore>, ExtractError> {
        let snapshot = self.inner.catalog.snapshot();
        if snapshot.is_empty() {
            return Ok(Vec::new());
        }
        let embedding = self.embed(frame).await?;
        Ok(self.inner.matcher.score_all(&embedding, &snapshot))
    }

    /// Embed a frame, waiting for the detection slot within the timeout.
    pub(crate) async fn embed(&self, frame: Frame) -> Result<Embedding, ExtractError> {
        self.inner.extraction.extract(frame).await
    }

    /// Embed a frame only if the detection slot is free right now.
    pub(crate) async fn try_embed(&self, frame: Frame) -> Result<Embedding, ExtractError> {
        self.inner.extraction.try_extract(frame).await
    }

    /// Decide against the catalog as it is now.
    pub(crate) fn score(&self, embedding: &Embedding) -> DetectionResult {
        let snapshot = self.inner.catalog.snapshot();
        self.inner.matcher.decide(embedding, &snapshot)
    }
}
