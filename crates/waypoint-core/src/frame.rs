//! Frame type and image helpers: decoding, luma and dark-frame checks.

use thiserror::Error;

/// Luma values below this fall in the darkest of eight histogram buckets.
const DARK_BUCKET_LIMIT: u8 = 32;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid RGB length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("empty frame ({width}x{height})")]
    Empty { width: u32, height: u32 },
    #[error("image decode failed: {0}")]
    Decode(#[from] image::ImageError),
}

/// A decoded RGB8 image: a camera frame or a reference photo.
///
/// Only built through [`Frame::from_rgb`] or [`Frame::decode`], so the pixel
/// buffer always holds exactly `width * height * 3` bytes.
#[derive(Clone)]
pub struct Frame {
    pixels: Vec<u8>,
    width: u32,
    height: u32,
    /// Producer-assigned sequence number; 0 for photos.
    sequence: u64,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

impl Frame {
    /// Wrap packed RGB8 pixels, checking the buffer matches the dimensions.
    pub fn from_rgb(pixels: Vec<u8>, width: u32, height: u32) -> Result<Self, FrameError> {
        if width == 0 || height == 0 {
            return Err(FrameError::Empty { width, height });
        }
        let expected = width as usize * height as usize * 3;
        if pixels.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: pixels.len(),
            });
        }
        Ok(Self {
            pixels,
            width,
            height,
            sequence: 0,
        })
    }

    /// Decode an encoded image (JPEG, PNG, ...) into an RGB8 frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let rgb = image::load_from_memory(bytes)?.to_rgb8();
        let (width, height) = rgb.dimensions();
        Self::from_rgb(rgb.into_raw(), width, height)
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    /// Packed RGB pixel data.
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// RGB triple at (x, y). Caller guarantees bounds.
    pub(crate) fn rgb_at(&self, x: usize, y: usize) -> [u8; 3] {
        let i = (y * self.width as usize + x) * 3;
        [self.pixels[i], self.pixels[i + 1], self.pixels[i + 2]]
    }

    /// BT.601 luma plane.
    pub fn luma(&self) -> Vec<u8> {
        self.pixels
            .chunks_exact(3)
            .map(|p| rgb_to_luma(p[0], p[1], p[2]))
            .collect()
    }

    /// True when more than `dark_fraction` of pixels are near black
    /// (lens covered, lights off).
    pub fn is_dark(&self, dark_fraction: f32) -> bool {
        is_dark_frame(&self.luma(), dark_fraction)
    }
}

fn rgb_to_luma(r: u8, g: u8, b: u8) -> u8 {
    (0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32)
        .round()
        .clamp(0.0, 255.0) as u8
}

/// Check if a luma plane is dark using an 8-bucket histogram.
///
/// Returns true if more than `threshold_pct` of pixels fall in the darkest bucket (0–31).
pub fn is_dark_frame(luma: &[u8], threshold_pct: f32) -> bool {
    if luma.is_empty() {
        return true;
    }
    let dark_count = luma.iter().filter(|&&p| p < DARK_BUCKET_LIMIT).count();
    (dark_count as f32 / luma.len() as f32) > threshold_pct
}
