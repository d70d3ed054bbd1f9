//! Photo store and image fetching.
//!
//! The photo store enumerates places and the URIs of their photos; the image
//! fetcher turns a resolved URI into encoded image bytes. Both are traits so
//! the catalog can be driven by an HTTP backend, a local manifest, or a test
//! double.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Largest photo body accepted from a fetch.
pub const MAX_PHOTO_BYTES: usize = 20 * 1024 * 1024;

/// Default listing endpoint, relative to the store base URL.
pub const DEFAULT_LISTING_PATH: &str = "api/places/photos";

#[derive(Error, Debug)]
pub enum PhotoStoreError {
    #[error("photo store unreachable: {0}")]
    Unreachable(#[from] reqwest::Error),
    #[error("photo store returned HTTP {0}")]
    Status(u16),
    #[error("invalid listing URL: {0}")]
    InvalidListing(String),
    #[error("failed to read manifest {path}: {source}")]
    ManifestIo {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid manifest {path}: {source}")]
    ManifestParse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("relative photo URI {0:?} with no base URL configured")]
    NoBase(String),
    #[error("invalid photo URI {uri:?}: {source}")]
    InvalidUri { uri: String, source: url::ParseError },
    #[error("unsupported URI scheme: {0}")]
    UnsupportedScheme(String),
    #[error("HTTP {status} fetching {url}")]
    Status { url: String, status: u16 },
    #[error("photo too large: over {limit} bytes (read {size})")]
    TooLarge { size: usize, limit: usize },
    #[error("fetch timed out after {0:?}")]
    TimedOut(Duration),
    #[error("network: {0}")]
    Network(#[from] reqwest::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// One place and the URIs of its photos, as listed by the store.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PlacePhotos {
    pub place_id: String,
    #[serde(default)]
    pub photo_uris: Vec<String>,
}

/// Source of place listings.
///
/// Must return a stable listing for the duration of one catalog build.
#[async_trait]
pub trait PhotoStore: Send + Sync {
    async fn list_places_with_photos(&self) -> Result<Vec<PlacePhotos>, PhotoStoreError>;
}

/// Retrieves encoded image bytes for a resolved URI.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<Vec<u8>, FetchError>;
}

/// Resolve a photo URI against an optional base URL.
///
/// Absolute URIs are returned unchanged. The base is treated as a directory
/// even without a trailing slash.
pub fn resolve_uri(base: Option<&Url>, uri: &str) -> Result<Url, FetchError> {
    match Url::parse(uri) {
        Ok(url) => Ok(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let base = base.ok_or_else(|| FetchError::NoBase(uri.to_string()))?;
            let mut dir = base.clone();
            if !dir.path().ends_with('/') {
                let path = format!("{}/", dir.path());
                dir.set_path(&path);
            }
            dir.join(uri).map_err(|source| FetchError::InvalidUri {
                uri: uri.to_string(),
                source,
            })
        }
        Err(source) => Err(FetchError::InvalidUri {
            uri: uri.to_string(),
            source,
        }),
    }
}

/// Photo store backed by an HTTP endpoint returning a JSON array of
/// `{ "place_id": "...", "photo_uris": ["..."] }`.
pub struct HttpPhotoStore {
    client: reqwest::Client,
    listing_url: Url,
}

impl HttpPhotoStore {
    pub fn new(base_url: &Url, listing_path: &str, timeout: Duration) -> Result<Self, PhotoStoreError> {
        let listing_url = resolve_uri(Some(base_url), listing_path)
            .map_err(|e| PhotoStoreError::InvalidListing(e.to_string()))?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, listing_url })
    }

    pub fn listing_url(&self) -> &Url {
        &self.listing_url
    }
}

#[async_trait]
impl PhotoStore for HttpPhotoStore {
    async fn list_places_with_photos(&self) -> Result<Vec<PlacePhotos>, PhotoStoreError> {
        let response = self.client.get(self.listing_url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(PhotoStoreError::Status(response.status().as_u16()));
        }
        let places: Vec<PlacePhotos> = response.json().await?;
        tracing::debug!(url = %self.listing_url, places = places.len(), "fetched place listing");
        Ok(places)
    }
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default, rename = "place")]
    places: Vec<ManifestPlace>,
}

#[derive(Debug, Deserialize)]
struct ManifestPlace {
    id: String,
    #[serde(default)]
    photos: Vec<String>,
}

/// Photo store backed by a TOML manifest:
///
/// ```toml
/// [[place]]
/// id = "library"
/// photos = ["library/entrance.jpg", "https://cdn.example.org/library-2.jpg"]
/// ```
///
/// The file is reread on every listing so edits are picked up by a reload.
pub struct ManifestPhotoStore {
    path: PathBuf,
}

impl ManifestPhotoStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parse(path: &Path, src: &str) -> Result<Vec<PlacePhotos>, PhotoStoreError> {
        let manifest: Manifest = toml::from_str(src).map_err(|source| PhotoStoreError::ManifestParse {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(manifest
            .places
            .into_iter()
            .map(|p| PlacePhotos {
                place_id: p.id,
                photo_uris: p.photos,
            })
            .collect())
    }
}

#[async_trait]
impl PhotoStore for ManifestPhotoStore {
    async fn list_places_with_photos(&self) -> Result<Vec<PlacePhotos>, PhotoStoreError> {
        let src = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| PhotoStoreError::ManifestIo {
                path: self.path.clone(),
                source,
            })?;
        Self::parse(&self.path, &src)
    }
}

/// Fixed in-memory listing.
#[derive(Debug, Clone, Default)]
pub struct StaticPhotoStore {
    places: Vec<PlacePhotos>,
}

impl StaticPhotoStore {
    pub fn new(places: Vec<PlacePhotos>) -> Self {
        Self { places }
    }
}

#[async_trait]
impl PhotoStore for StaticPhotoStore {
    async fn list_places_with_photos(&self) -> Result<Vec<PlacePhotos>, PhotoStoreError> {
        Ok(self.places.clone())
    }
}

/// Fetches `http`/`https` URIs with reqwest and `file` URIs from disk.
///
/// Bodies are read incrementally and abandoned once they pass `max_bytes`,
/// whether or not the server declared a length.
pub struct UriImageFetcher {
    client: reqwest::Client,
    max_bytes: usize,
}

impl UriImageFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            max_bytes: MAX_PHOTO_BYTES,
        })
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    fn too_large(&self, size: usize) -> FetchError {
        FetchError::TooLarge {
            size,
            limit: self.max_bytes,
        }
    }

    async fn fetch_http(&self, url: &Url) -> Result<Vec<u8>, FetchError> {
        let mut response = self.client.get(url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        if let Some(len) = response.content_length() {
            if len as usize > self.max_bytes {
                return Err(self.too_large(len as usize));
            }
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            let size = body.len() + chunk.len();
            if size > self.max_bytes {
                tracing::debug!(url = %url, size, "photo body over limit; download abandoned");
                return Err(self.too_large(size));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }

    async fn fetch_file(&self, url: &Url) -> Result<Vec<u8>, FetchError> {
        let path = url
            .to_file_path()
            .map_err(|_| FetchError::UnsupportedScheme(url.to_string()))?;
        let len = tokio::fs::metadata(&path).await?.len() as usize;
        if len > self.max_bytes {
            return Err(self.too_large(len));
        }
        Ok(tokio::fs::read(&path).await?)
    }
}

#[async_trait]
impl ImageFetcher for UriImageFetcher {
    async fn fetch(&self, url: &Url) -> Result<Vec<u8>, FetchError> {
        match url.scheme() {
            "http" | "https" => self.fetch_http(url).await,
            "file" => self.fetch_file(url).await,
            other => Err(FetchError::UnsupportedScheme(other.to_string())),
        }
    }
}
