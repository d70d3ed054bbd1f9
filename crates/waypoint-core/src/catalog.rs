//! Reference catalog: per-place reference embeddings built from the photo store.
//!
//! A build fetches every listed photo (bounded parallelism, per-photo timeout),
//! decodes it and runs the extractor. Per-photo failures are logged and counted,
//! never fatal. Finished builds are swapped in whole, so readers always see a
//! complete catalog.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use url::Url;

use crate::config::EngineConfig;
use crate::extractor::{EmbeddingExtractor, ExtractError, ExtractionSlots};
use crate::frame::{Frame, FrameError};
use crate::photo_store::{resolve_uri, FetchError, ImageFetcher, PhotoStore, PhotoStoreError, PlacePhotos};
use crate::types::{Embedding, Place, ReferenceEntry};

/// Immutable set of places with at least one reference entry, ordered by id.
#[derive(Debug, Clone, Default)]
pub struct ReferenceCatalog {
    places: BTreeMap<String, Place>,
}

impl ReferenceCatalog {
    /// Build from places; places without entries are left out.
    pub fn from_places(places: impl IntoIterator<Item = Place>) -> Self {
        let places = places
            .into_iter()
            .filter(|p| !p.is_empty())
            .map(|p| (p.id().to_string(), p))
            .collect();
        Self { places }
    }

    pub fn get(&self, place_id: &str) -> Option<&Place> {
        self.places.get(place_id)
    }

    pub fn places(&self) -> impl Iterator<Item = &Place> {
        self.places.values()
    }

    pub fn len(&self) -> usize {
        self.places.len()
    }

    pub fn is_empty(&self) -> bool {
        self.places.is_empty()
    }

    pub fn reference_count(&self) -> usize {
        self.places.values().map(Place::len).sum()
    }
}

/// Why one reference photo was skipped.
#[derive(Debug, Error)]
enum PhotoFailure {
    #[error("resolve: {0}")]
    Resolve(FetchError),
    #[error("fetch: {0}")]
    Fetch(FetchError),
    #[error("decode: {0}")]
    Decode(#[from] FrameError),
    #[error("extract: {0}")]
    Extract(#[from] ExtractError),
}

/// Diagnostics for one catalog build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    /// The call found the catalog populated and did nothing.
    pub skipped: bool,
    pub places_listed: usize,
    pub places_loaded: usize,
    pub photos_attempted: usize,
    pub photos_loaded: usize,
    /// Listed photos beyond the per-place limit, never fetched.
    pub photos_over_limit: usize,
    pub resolve_failures: usize,
    pub fetch_failures: usize,
    pub decode_failures: usize,
    pub extract_failures: usize,
}

impl LoadReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    fn record_failure(&mut self, failure: &PhotoFailure) {
        match failure {
            PhotoFailure::Resolve(_) => self.resolve_failures += 1,
            PhotoFailure::Fetch(_) => self.fetch_failures += 1,
            PhotoFailure::Decode(_) => self.decode_failures += 1,
            PhotoFailure::Extract(_) => self.extract_failures += 1,
        }
    }
}

/// Shared, swappable reference catalog plus the collaborators that fill it.
pub struct Catalog {
    store: Arc<dyn PhotoStore>,
    fetcher: Arc<dyn ImageFetcher>,
    /// One slot per concurrent photo; hung extractions keep theirs.
    extraction: ExtractionSlots,
    base_url: Option<Url>,
    max_references: usize,
    fetch_timeout: Duration,
    concurrency: usize,
    current: RwLock<Arc<ReferenceCatalog>>,
    /// Serializes builds; readers never take it.
    build_lock: tokio::sync::Mutex<()>,
}

impl Catalog {
    pub fn new(
        config: &EngineConfig,
        store: Arc<dyn PhotoStore>,
        fetcher: Arc<dyn ImageFetcher>,
        extractor: Arc<dyn EmbeddingExtractor>,
    ) -> Self {
        let concurrency = config.fetch_concurrency.max(1);
        Self {
            store,
            fetcher,
            extraction: ExtractionSlots::new(extractor, concurrency, config.extract_timeout),
            base_url: config.photo_base_url.clone(),
            max_references: config.max_references_per_place,
            fetch_timeout: config.fetch_timeout,
            concurrency,
            current: RwLock::new(Arc::new(ReferenceCatalog::default())),
            build_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// The current complete catalog.
    pub fn snapshot(&self) -> Arc<ReferenceCatalog> {
        self.current.read().clone()
    }

    pub fn get(&self, place_id: &str) -> Option<Place> {
        self.snapshot().get(place_id).cloned()
    }

    pub fn all_places(&self) -> Vec<Place> {
        self.snapshot().places().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.current.read().is_empty()
    }

    /// List places from the photo store. Failure here is fatal for a build.
    pub async fn enumerate(&self) -> Result<Vec<PlacePhotos>, PhotoStoreError> {
        self.store.list_places_with_photos().await
    }

    /// Populate the catalog once. A no-op while it already has content.
    pub async fn load_all_places(&self) -> Result<LoadReport, PhotoStoreError> {
        let _guard = self.build_lock.lock().await;
        if !self.is_empty() {
            tracing::debug!("catalog already populated; load skipped");
            return Ok(LoadReport::skipped());
        }
        let listing = self.enumerate().await?;
        Ok(self.build_and_install(&listing).await)
    }

    /// Populate from a listing obtained earlier, unless the catalog has content.
    pub async fn load_listing(&self, listing: Vec<PlacePhotos>) -> LoadReport {
        let _guard = self.build_lock.lock().await;
        if !self.is_empty() {
            tracing::debug!("catalog already populated; load skipped");
            return LoadReport::skipped();
        }
        self.build_and_install(&listing).await
    }

    /// Rebuild from scratch and swap the result in.
    ///
    /// If the store cannot be enumerated the current catalog is kept.
    pub async fn reload(&self) -> Result<LoadReport, PhotoStoreError> {
        let _guard = self.build_lock.lock().await;
        let listing = self.enumerate().await?;
        Ok(self.build_and_install(&listing).await)
    }

    async fn build_and_install(&self, listing: &[PlacePhotos]) -> LoadReport {
        let (catalog, report) = self.build(listing).await;
        tracing::info!(
            places = catalog.len(),
            references = catalog.reference_count(),
            listed = report.places_listed,
            photos_loaded = report.photos_loaded,
            photos_attempted = report.photos_attempted,
            "reference catalog built"
        );
        *self.current.write() = Arc::new(catalog);
        report
    }

    async fn build(&self, listing: &[PlacePhotos]) -> (ReferenceCatalog, LoadReport) {
        let mut report = LoadReport {
            places_listed: listing.len(),
            ..LoadReport::default()
        };

        let mut jobs = Vec::new();
        for (place_idx, place) in listing.iter().enumerate() {
            if place.place_id.is_empty() {
                tracing::warn!("photo store listed a place with an empty id; ignored");
                continue;
            }
            let take = place.photo_uris.len().min(self.max_references);
            report.photos_over_limit += place.photo_uris.len() - take;
            for uri in &place.photo_uris[..take] {
                jobs.push((place_idx, uri.clone()));
            }
        }
        report.photos_attempted = jobs.len();

        // `buffered` keeps listing order while running photos concurrently.
        let outcomes: Vec<_> = stream::iter(jobs)
            .map(|(place_idx, uri): (usize, String)| async move {
                let outcome = self.load_photo(&uri).await;
                (place_idx, uri, outcome)
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut places: BTreeMap<String, Place> = BTreeMap::new();
        let mut dimension: Option<usize> = None;

        for (place_idx, uri, outcome) in outcomes {
            let place_id = &listing[place_idx].place_id;
            let embedding = match outcome {
                Ok(embedding) => embedding,
                Err(failure) => {
                    tracing::warn!(place = %place_id, uri = %uri, error = %failure, "reference photo skipped");
                    report.record_failure(&failure);
                    continue;
                }
            };

            let expected = *dimension.get_or_insert(embedding.dim());
            if embedding.dim() != expected {
                let failure = PhotoFailure::Extract(ExtractError::DimensionMismatch {
                    expected,
                    actual: embedding.dim(),
                });
                tracing::warn!(place = %place_id, uri = %uri, error = %failure, "reference photo skipped");
                report.record_failure(&failure);
                continue;
            }

            let entry = ReferenceEntry {
                place_id: place_id.clone(),
                embedding,
                source_uri: uri,
            };
            let place = places
                .entry(place_id.clone())
                .or_insert_with(|| Place::new(place_id.clone()));
            if place.push(entry, self.max_references) {
                report.photos_loaded += 1;
            } else {
                report.photos_over_limit += 1;
            }
        }

        for place in listing {
            if !place.place_id.is_empty() && !places.contains_key(&place.place_id) {
                tracing::warn!(place = %place.place_id, "no usable reference photos; place not loaded");
            }
        }

        let catalog = ReferenceCatalog::from_places(places.into_values());
        report.places_loaded = catalog.len();
        (catalog, report)
    }

    async fn load_photo(&self, uri: &str) -> Result<Embedding, PhotoFailure> {
        let url = resolve_uri(self.base_url.as_ref(), uri).map_err(PhotoFailure::Resolve)?;

        let bytes = tokio::time::timeout(self.fetch_timeout, self.fetcher.fetch(&url))
            .await
            .map_err(|_| PhotoFailure::Fetch(FetchError::TimedOut(self.fetch_timeout)))?
            .map_err(PhotoFailure::Fetch)?;

        let frame = Frame::decode(&bytes)?;
        let embedding = self.extraction.extract(frame).await?;
        tracing::debug!(uri = %url, dim = embedding.dim(), "reference photo embedded");
        Ok(embedding)
    }
}
