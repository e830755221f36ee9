//! Face embedding extraction via ONNX Runtime.
//!
//! Aligns the detected face onto the 112×112 ArcFace template using its
//! five landmarks and returns the L2-normalized output vector. Detections
//! without landmarks fall back to a margin crop. Works with ArcFace-style
//! models; the embedding length is whatever the model emits.

use crate::alignment::{align_face, ALIGNED_SIZE};
use crate::detector::FaceBox;
use crate::types::Embedding;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const RECOGNIZER_INPUT_SIZE: u32 = ALIGNED_SIZE;
const RECOGNIZER_MEAN: f32 = 127.5;
const RECOGNIZER_STD: f32 = 127.5;
/// Fraction of the box size added on each side before cropping.
const CROP_MARGIN: f32 = 0.1;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0} (download from insightface into the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face box lies outside the image")]
    EmptyCrop,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Embedding model session.
pub struct FaceRecognizer {
    session: Session,
    model_version: String,
}

impl FaceRecognizer {
    /// Load the recognition ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let model_version = model_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unknown".to_string());

        tracing::info!(
            path = %model_path.display(),
            model_version = %model_version,
            "loaded recognizer model"
        );

        Ok(Self {
            session,
            model_version,
        })
    }

    /// Extract an embedding for `face` within `image`.
    pub fn extract(&mut self, image: &RgbImage, face: &FaceBox) -> Result<Embedding, RecognizerError> {
        let crop = face_input(image, face)?;
        let input = preprocess(&crop);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.is_empty() {
            return Err(RecognizerError::InferenceFailed("model produced an empty embedding".into()));
        }

        Ok(Embedding {
            values: l2_normalize(raw),
            model_version: Some(self.model_version.clone()),
        })
    }
}

/// The recognizer input for `face`: landmark-aligned when possible.
fn face_input(image: &RgbImage, face: &FaceBox) -> Result<RgbImage, RecognizerError> {
    match &face.landmarks {
        Some(landmarks) => Ok(align_face(image, landmarks)),
        None => {
            tracing::debug!("no landmarks, using margin crop");
            crop_face(image, face).ok_or(RecognizerError::EmptyCrop)
        }
    }
}

/// Crop the face box expanded by [`CROP_MARGIN`], clamped to the image,
/// and resize it to the recognizer input size.
fn crop_face(image: &RgbImage, face: &FaceBox) -> Option<RgbImage> {
    let (width, height) = image.dimensions();
    let margin_x = face.width * CROP_MARGIN;
    let margin_y = face.height * CROP_MARGIN;

    let x0 = (face.x - margin_x).max(0.0).floor() as u32;
    let y0 = (face.y - margin_y).max(0.0).floor() as u32;
    let x1 = ((face.x + face.width + margin_x).ceil().max(0.0) as u32).min(width);
    let y1 = ((face.y + face.height + margin_y).ceil().max(0.0) as u32).min(height);

    if x0 >= x1 || y0 >= y1 {
        return None;
    }

    let crop = imageops::crop_imm(image, x0, y0, x1 - x0, y1 - y0).to_image();
    Some(imageops::resize(
        &crop,
        RECOGNIZER_INPUT_SIZE,
        RECOGNIZER_INPUT_SIZE,
        FilterType::Triangle,
    ))
}

/// Normalize a face crop into a NCHW float tensor.
fn preprocess(face: &RgbImage) -> Array4<f32> {
    let size = RECOGNIZER_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in face.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        if x >= size || y >= size {
            continue;
        }
        for c in 0..3 {
            tensor[[0, c, y, x]] = (pixel[c] as f32 - RECOGNIZER_MEAN) / RECOGNIZER_STD;
        }
    }
    tensor
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw.to_vec()
    }
}
