//! Image embedding extraction.
//!
//! [`EmbeddingExtractor`] is the seam between the engine and the model. The
//! production implementation runs an ImageNet-style feature backbone
//! (e.g., MobileNetV3 with the classifier head removed) via ONNX Runtime.

use crate::frame::Frame;
use crate::types::Embedding;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;

// --- Named constants ---
pub const DEFAULT_INPUT_SIZE: usize = 224;
const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("extractor not ready: {0}")]
    NotReady(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("model produced an empty embedding")]
    Empty,
    #[error("expected {expected}-dim embedding, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("extraction timed out after {0:?}")]
    TimedOut(Duration),
    #[error("extractor busy with an earlier call")]
    Busy,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Maps an image to a fixed-length embedding.
///
/// Implementations must return the same dimensionality for every call within
/// one process. `extract` is blocking; the engine calls it from a blocking
/// thread.
pub trait EmbeddingExtractor: Send + Sync {
    /// Fails when the extractor can never produce embeddings (model missing).
    fn ready(&self) -> Result<(), ExtractError> {
        Ok(())
    }

    fn extract(&self, frame: &Frame) -> Result<Embedding, ExtractError>;

    /// Identifier of the underlying model, if known.
    fn model_version(&self) -> Option<&str> {
        None
    }
}

/// ONNX Runtime feature extractor.
pub struct OnnxExtractor {
    session: Mutex<Session>,
    input_size: usize,
    embedding_dim: usize,
    model_version: String,
}

impl OnnxExtractor {
    /// Load a feature-extraction model producing `embedding_dim` outputs.
    pub fn load(model_path: &str, embedding_dim: usize) -> Result<Self, ExtractError> {
        if !Path::new(model_path).exists() {
            return Err(ExtractError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            embedding_dim,
            "loaded embedding model"
        );

        let model_version = Path::new(model_path)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unknown".to_string());

        Ok(Self {
            session: Mutex::new(session),
            input_size: DEFAULT_INPUT_SIZE,
            embedding_dim,
            model_version,
        })
    }
}

impl EmbeddingExtractor for OnnxExtractor {
    fn extract(&self, frame: &Frame) -> Result<Embedding, ExtractError> {
        let input = preprocess(frame, self.input_size);

        let mut session = self.session.lock();
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ExtractError::InferenceFailed(format!("embedding extraction: {e}")))?;

        let raw: Vec<f32> = raw_data.to_vec();
        drop(outputs);
        drop(session);

        if raw.is_empty() {
            return Err(ExtractError::Empty);
        }
        if raw.len() != self.embedding_dim {
            return Err(ExtractError::DimensionMismatch {
                expected: self.embedding_dim,
                actual: raw.len(),
            });
        }

        Ok(Embedding::new(raw).with_model_version(self.model_version.clone()))
    }

    fn model_version(&self) -> Option<&str> {
        Some(&self.model_version)
    }
}

/// Runs blocking extractions off the async runtime on a fixed number of slots.
///
/// A slot is held until the blocking call returns, not until the caller stops
/// waiting. A call abandoned on timeout keeps its slot, so a hung model can
/// tie up at most `slots` blocking threads.
pub(crate) struct ExtractionSlots {
    extractor: Arc<dyn EmbeddingExtractor>,
    slots: Arc<Semaphore>,
    capacity: usize,
    timeout: Option<Duration>,
}

impl ExtractionSlots {
    pub(crate) fn new(extractor: Arc<dyn EmbeddingExtractor>, slots: usize, timeout: Option<Duration>) -> Self {
        let capacity = slots.max(1);
        Self {
            extractor,
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
            timeout,
        }
    }

    pub(crate) fn extractor(&self) -> &Arc<dyn EmbeddingExtractor> {
        &self.extractor
    }

    /// Blocking calls currently running, including abandoned ones.
    pub(crate) fn running(&self) -> usize {
        self.capacity - self.slots.available_permits()
    }

    pub(crate) fn is_saturated(&self) -> bool {
        self.slots.available_permits() == 0
    }

    /// Extract on a free slot, failing with `Busy` if none is free right now.
    pub(crate) async fn try_extract(&self, frame: Frame) -> Result<Embedding, ExtractError> {
        let permit = self
            .slots
            .clone()
            .try_acquire_owned()
            .map_err(|_| ExtractError::Busy)?;
        self.bounded(self.spawn(permit, frame)).await
    }

    /// Extract, waiting for a slot. The wait counts against the timeout.
    pub(crate) async fn extract(&self, frame: Frame) -> Result<Embedding, ExtractError> {
        self.bounded(async {
            let permit = self
                .slots
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| ExtractError::NotReady("extraction slots closed".into()))?;
            self.spawn(permit, frame).await
        })
        .await
    }

    async fn spawn(
        &self,
        permit: tokio::sync::OwnedSemaphorePermit,
        frame: Frame,
    ) -> Result<Embedding, ExtractError> {
        let extractor = self.extractor.clone();
        tokio::task::spawn_blocking(move || {
            let _slot = permit;
            extractor.extract(&frame)
        })
        .await
        .map_err(|e| ExtractError::InferenceFailed(format!("extraction task failed: {e}")))?
    }

    async fn bounded(
        &self,
        work: impl std::future::Future<Output = Result<Embedding, ExtractError>>,
    ) -> Result<Embedding, ExtractError> {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, work)
                .await
                .map_err(|_| ExtractError::TimedOut(limit))?,
            None => work.await,
        }
    }
}

/// Stand-in used when the model could not be loaded. The engine stays up
/// but can never produce a match.
pub struct UnavailableExtractor {
    reason: String,
}

impl UnavailableExtractor {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl EmbeddingExtractor for UnavailableExtractor {
    fn ready(&self) -> Result<(), ExtractError> {
        Err(ExtractError::NotReady(self.reason.clone()))
    }

    fn extract(&self, _frame: &Frame) -> Result<Embedding, ExtractError> {
        Err(ExtractError::NotReady(self.reason.clone()))
    }
}

/// Resize an RGB frame to `size`x`size` with bilinear sampling and normalize
/// into a NCHW tensor with ImageNet statistics.
fn preprocess(frame: &Frame, size: usize) -> Array4<f32> {
    let width = frame.width() as usize;
    let height = frame.height() as usize;
    let scale_x = width as f32 / size as f32;
    let scale_y = height as f32 / size as f32;

    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

    for y in 0..size {
        let src_y = ((y as f32 + 0.5) * scale_y - 0.5).max(0.0);
        let y0 = (src_y.floor() as usize).min(height - 1);
        let y1 = (y0 + 1).min(height - 1);
        let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

        for x in 0..size {
            let src_x = ((x as f32 + 0.5) * scale_x - 0.5).max(0.0);
            let x0 = (src_x.floor() as usize).min(width - 1);
            let x1 = (x0 + 1).min(width - 1);
            let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

            let tl = frame.rgb_at(x0, y0);
            let tr = frame.rgb_at(x1, y0);
            let bl = frame.rgb_at(x0, y1);
            let br = frame.rgb_at(x1, y1);

            for c in 0..3 {
                let val = tl[c] as f32 * (1.0 - fx) * (1.0 - fy)
                    + tr[c] as f32 * fx * (1.0 - fy)
                    + bl[c] as f32 * (1.0 - fx) * fy
                    + br[c] as f32 * fx * fy;
                tensor[[0, c, y, x]] = (val / 255.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
            }
        }
    }

    tensor
}
