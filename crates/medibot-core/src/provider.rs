//! Image → embedding boundary.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::Embedding;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Turns an encoded image into at most one face embedding.
///
/// `Ok(None)` means the image decoded fine but contains no face; that is
/// an expected outcome, not an error.
pub trait EmbeddingProvider {
    fn extract(&mut self, image: &[u8]) -> Result<Option<Embedding>, ProviderError>;
}

/// SCRFD detection followed by embedding extraction of the most
/// confident face.
pub struct OnnxEmbedder {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxEmbedder {
    pub fn load(detector_path: &Path, recognizer_path: &Path) -> Result<Self, ProviderError> {
        let detector = FaceDetector::load(detector_path)?;
        let recognizer = FaceRecognizer::load(recognizer_path)?;
        Ok(Self {
            detector,
            recognizer,
        })
    }
}

impl EmbeddingProvider for OnnxEmbedder {
    fn extract(&mut self, image: &[u8]) -> Result<Option<Embedding>, ProviderError> {
        let rgb = image::load_from_memory(image)?.to_rgb8();
        let faces = self.detector.detect(&rgb)?;

        let Some(face) = faces.first() else {
            tracing::info!(width = rgb.width(), height = rgb.height(), "no face detected");
            return Ok(None);
        };
        if faces.len() > 1 {
            tracing::debug!(count = faces.len(), "multiple faces; using the most confident");
        }

        let embedding = self.recognizer.extract(&rgb, face)?;
        tracing::debug!(
            confidence = face.confidence,
            dim = embedding.dim(),
            "embedding extracted"
        );
        Ok(Some(embedding))
    }
}
