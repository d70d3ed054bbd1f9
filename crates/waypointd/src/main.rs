use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::Utc;
use tracing_subscriber::EnvFilter;
use waypoint_core::{
    frame_channel, DetectionLoop, DetectionResult, EmbeddingExtractor, HttpPhotoStore, ManifestPhotoStore,
    OnnxExtractor, PhotoStore, PlaceRecognitionEngine, UnavailableExtractor, UriImageFetcher,
};

mod config;
mod dbus_interface;

use config::Config;
use dbus_interface::{detection_payload, RecognizerService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("waypointd starting");
    let config = Config::from_env();

    let store = photo_store(&config)?;
    let fetcher = Arc::new(UriImageFetcher::new(config.fetch_timeout())?);
    let extractor = load_extractor(&config);

    let engine = PlaceRecognitionEngine::new(config.engine_config(), store, fetcher, extractor);
    if let Err(e) = engine.initialize().await {
        // Queries answer "no match" until a successful Reload.
        tracing::warn!(error = %e, "catalog initialization failed; running without references");
    }

    let (frames, source) = frame_channel(config.frame_buffer);
    let (detection, mut results) = DetectionLoop::spawn(engine.clone(), source, config.loop_config());
    let detection = Arc::new(detection);

    let service = RecognizerService::new(engine, frames, detection.clone());
    let builder = if config.system_bus {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await?;
    let iface = conn
        .object_server()
        .interface::<_, RecognizerService>(OBJECT_PATH)
        .await?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, system_bus = config.system_bus, "waypointd ready");

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
            result = results.recv() => {
                let Some(result) = result else {
                    tracing::warn!("detection loop ended");
                    break;
                };
                if let Err(e) = announce(iface.signal_emitter(), &result).await {
                    tracing::error!(error = %e, "failed to emit PlaceDetected");
                }
            }
        }
    }

    tracing::info!("waypointd shutting down");
    detection.stop();
    Ok(())
}

fn photo_store(config: &Config) -> Result<Arc<dyn PhotoStore>> {
    if let Some(path) = &config.manifest_path {
        tracing::info!(path = %path.display(), "using photo manifest");
        return Ok(Arc::new(ManifestPhotoStore::new(path)));
    }
    let Some(base) = &config.store_url else {
        bail!("no photo store configured: set WAYPOINT_STORE_URL or WAYPOINT_MANIFEST");
    };
    let store = HttpPhotoStore::new(base, &config.listing_path, config.fetch_timeout())?;
    tracing::info!(listing = %store.listing_url(), "using photo store service");
    Ok(Arc::new(store))
}

fn load_extractor(config: &Config) -> Arc<dyn EmbeddingExtractor> {
    let path = config.model_path();
    match OnnxExtractor::load(&path, config.embedding_dim) {
        Ok(extractor) => Arc::new(extractor),
        Err(e) => {
            tracing::error!(path, error = %e, "embedding model unavailable; detections disabled");
            Arc::new(UnavailableExtractor::new(e.to_string()))
        }
    }
}

async fn announce(emitter: &zbus::object_server::SignalEmitter<'_>, result: &DetectionResult) -> Result<()> {
    if !result.detected {
        tracing::debug!(best = ?result.best_candidate, confidence = result.confidence, "no place detected");
        return Ok(());
    }
    tracing::info!(place = ?result.place_id, confidence = result.confidence, "announcing detection");
    let payload = detection_payload(result, Utc::now())?;
    RecognizerService::place_detected(emitter, &payload).await?;
    Ok(())
}
