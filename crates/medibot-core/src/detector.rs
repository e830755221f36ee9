//! SCRFD face detector via ONNX Runtime.
//!
//! Letterboxes an RGB image into the 640×640 model input, decodes the
//! anchor-free score/box/landmark heads of the three stride levels and
//! applies non-maximum suppression.

use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [u32; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;
const SCRFD_LANDMARKS: usize = 5;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} (download from insightface into the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Axis-aligned face box in source image pixel coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Eyes, nose tip and mouth corners, when the model has a landmark head.
    pub landmarks: Option<[(f32, f32); SCRFD_LANDMARKS]>,
}

impl FaceBox {
    fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection-over-union with another box.
    pub fn iou(&self, other: &FaceBox) -> f32 {
        let inter_w = ((self.x + self.width).min(other.x + other.width) - self.x.max(other.x)).max(0.0);
        let inter_h =
            ((self.y + self.height).min(other.y + other.height) - self.y.max(other.y)).max(0.0);
        let inter = inter_w * inter_h;
        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

/// Scale and padding applied when fitting the image into the model input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor positions for one stride level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeadIndices {
    score: usize,
    bbox: usize,
    kps: Option<usize>,
}

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    heads: [HeadIndices; 3],
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();
        tracing::info!(path = %model_path.display(), outputs = ?names, "loaded SCRFD model");

        if names.len() < 2 * SCRFD_STRIDES.len() {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires at least 6 outputs (3 strides × score/bbox), got {}",
                names.len()
            )));
        }
        let heads = discover_heads(&names);
        if heads[0].kps.is_none() {
            tracing::warn!("SCRFD model has no landmark outputs; faces will be cropped, not aligned");
        }

        Ok(Self { session, heads })
    }

    /// Detect faces, returning boxes sorted by descending confidence.
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceBox>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }

        let (input, letterbox) = letterbox(image);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (heads, &stride) in self.heads.iter().zip(SCRFD_STRIDES.iter()) {
            let (_, scores) = outputs[heads.score]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, boxes) = outputs[heads.bbox]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("boxes stride {stride}: {e}")))?;
            let kps = match heads.kps {
                Some(idx) => Some(
                    outputs[idx]
                        .try_extract_tensor::<f32>()
                        .map_err(|e| {
                            DetectorError::InferenceFailed(format!("kps stride {stride}: {e}"))
                        })?
                        .1,
                ),
                None => None,
            };

            candidates.extend(decode_level(scores, boxes, kps, stride, &letterbox));
        }

        let faces = suppress(candidates, SCRFD_NMS_THRESHOLD);
        tracing::debug!(faces = faces.len(), "detection complete");
        Ok(faces)
    }
}

/// Resize into the model input with aspect ratio preserved, pad with the
/// mean colour, and normalize into a NCHW tensor.
fn letterbox(image: &RgbImage) -> (Array4<f32>, Letterbox) {
    let (width, height) = image.dimensions();
    let target = SCRFD_INPUT_SIZE as f32;
    let scale = (target / width as f32).min(target / height as f32);

    let new_w = ((width as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
    let new_h = ((height as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
    let pad_x = (SCRFD_INPUT_SIZE - new_w) / 2;
    let pad_y = (SCRFD_INPUT_SIZE - new_h) / 2;

    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

    let size = SCRFD_INPUT_SIZE as usize;
    // Zero is the normalized mean, so the padding needs no explicit fill.
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let tx = (x + pad_x) as usize;
        let ty = (y + pad_y) as usize;
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    (
        tensor,
        Letterbox {
            scale,
            pad_x: pad_x as f32,
            pad_y: pad_y as f32,
        },
    )
}

/// Map output tensors to stride levels.
///
/// Exports that name their outputs `score_8`, `bbox_16`, `kps_32`, ... are
/// mapped by name, whatever their order. Anything else is read positionally
/// as `[scores 8/16/32, boxes 8/16/32, (landmarks 8/16/32)]`.
fn discover_heads(names: &[String]) -> [HeadIndices; 3] {
    let find = |head: &str, stride: u32| names.iter().position(|n| *n == format!("{head}_{stride}"));

    let named: Option<Vec<HeadIndices>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| {
            Some(HeadIndices {
                score: find("score", stride)?,
                bbox: find("bbox", stride)?,
                kps: find("kps", stride),
            })
        })
        .collect();

    if let Some(named) = named {
        // Landmarks are used only when every level has them.
        let all_kps = named.iter().all(|h| h.kps.is_some());
        tracing::debug!("SCRFD: name-based output mapping");
        return std::array::from_fn(|level| HeadIndices {
            kps: if all_kps { named[level].kps } else { None },
            ..named[level]
        });
    }

    let levels = SCRFD_STRIDES.len();
    let has_kps = names.len() >= 3 * levels;
    tracing::debug!(?names, has_kps, "SCRFD: positional output mapping");
    std::array::from_fn(|level| HeadIndices {
        score: level,
        bbox: level + levels,
        kps: has_kps.then_some(level + 2 * levels),
    })
}

/// Decode the score, distance-to-edge box and landmark heads of one stride
/// level.
fn decode_level(
    scores: &[f32],
    boxes: &[f32],
    kps: Option<&[f32]>,
    stride: u32,
    letterbox: &Letterbox,
) -> Vec<FaceBox> {
    let grid = (SCRFD_INPUT_SIZE / stride) as usize;
    let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let step = stride as f32;

    scores
        .iter()
        .take(anchors)
        .enumerate()
        .filter(|&(_, &score)| score > SCRFD_CONFIDENCE_THRESHOLD)
        .filter_map(|(idx, &score)| {
            let d = boxes.get(idx * 4..idx * 4 + 4)?;
            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let cx = (cell % grid) as f32 * step;
            let cy = (cell / grid) as f32 * step;

            let (x1, y1) = letterbox.unmap(cx - d[0] * step, cy - d[1] * step);
            let (x2, y2) = letterbox.unmap(cx + d[2] * step, cy + d[3] * step);

            let landmarks = kps
                .and_then(|k| k.get(idx * 2 * SCRFD_LANDMARKS..(idx + 1) * 2 * SCRFD_LANDMARKS))
                .map(|k| {
                    std::array::from_fn(|i| {
                        letterbox.unmap(cx + k[2 * i] * step, cy + k[2 * i + 1] * step)
                    })
                });

            Some(FaceBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
                landmarks,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression, highest confidence first.
fn suppress(mut candidates: Vec<FaceBox>, iou_threshold: f32) -> Vec<FaceBox> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<FaceBox> = Vec::new();
    for candidate in candidates {
        if kept.iter().all(|k| k.iou(&candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(x: f32, y: f32, w: f32, h: f32, confidence: f32) -> FaceBox {
        FaceBox {
            x,
            y,
            width: w,
            height: h,
            confidence,
            landmarks: None,
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|n| n.to_string()).collect()
    }

    const IDENTITY: Letterbox = Letterbox {
        scale: 1.0,
        pad_x: 0.0,
        pad_y: 0.0,
    };

    #[test]
    fn test_iou_identical() {
        let a = face(10.0, 10.0, 50.0, 50.0, 0.9);
        assert!((a.iou(&a.clone()) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_disjoint() {
        let a = face(0.0, 0.0, 10.0, 10.0, 0.9);
        let b = face(20.0, 20.0, 10.0, 10.0, 0.9);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn test_iou_half_overlap() {
        let a = face(0.0, 0.0, 10.0, 10.0, 0.9);
        let b = face(5.0, 0.0, 10.0, 10.0, 0.9);
        // intersection 50, union 150
        assert!((a.iou(&b) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_suppress_keeps_highest_confidence() {
        let faces = vec![
            face(0.0, 0.0, 100.0, 100.0, 0.7),
            face(2.0, 2.0, 100.0, 100.0, 0.95),
            face(300.0, 300.0, 50.0, 50.0, 0.6),
        ];
        let kept = suppress(faces, 0.4);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.95);
        assert_eq!(kept[1].confidence, 0.6);
    }

    #[test]
    fn test_decode_level_filters_low_scores() {
        let grid = (SCRFD_INPUT_SIZE / 32) as usize;
        let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.1f32; anchors];
        let mut boxes = vec![0.0f32; anchors * 4];

        // Anchor 2 → cell 1 → (cx, cy) = (32, 0)
        scores[2] = 0.9;
        boxes[8..12].copy_from_slice(&[0.5, 0.0, 1.0, 2.0]);

        let faces = decode_level(&scores, &boxes, None, 32, &IDENTITY);
        assert_eq!(faces.len(), 1);
        let f = &faces[0];
        assert_eq!((f.x, f.y), (16.0, 0.0));
        assert_eq!((f.width, f.height), (48.0, 64.0));
        assert_eq!(f.confidence, 0.9);
    }

    #[test]
    fn test_decode_level_unmaps_letterbox() {
        let grid = (SCRFD_INPUT_SIZE / 8) as usize;
        let mut scores = vec![0.0f32; grid * grid * SCRFD_ANCHORS_PER_CELL];
        let boxes = vec![1.0f32; scores.len() * 4];
        scores[0] = 0.8;

        let lb = Letterbox {
            scale: 2.0,
            pad_x: 0.0,
            pad_y: 80.0,
        };
        let faces = decode_level(&scores, &boxes, None, 8, &lb);
        assert_eq!(faces.len(), 1);
        // Input-space box (-8, -8)..(8, 8) → source (-4, -44)..(4, -36)
        assert_eq!((faces[0].x, faces[0].y), (-4.0, -44.0));
        assert_eq!((faces[0].width, faces[0].height), (8.0, 8.0));
    }

    #[test]
    fn test_decode_level_tolerates_short_box_tensor() {
        let scores = vec![0.9f32; 4];
        let boxes = vec![0.0f32; 6];
        let faces = decode_level(&scores, &boxes, None, 32, &IDENTITY);
        assert_eq!(faces.len(), 1, "only the first anchor has a complete box");
    }

    #[test]
    fn test_decode_level_landmarks() {
        let grid = (SCRFD_INPUT_SIZE / 32) as usize;
        let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; anchors];
        let boxes = vec![0.5f32; anchors * 4];
        let mut kps = vec![0.0f32; anchors * 10];
        scores[2] = 0.9;
        // Anchor 2 sits at (32, 0); first landmark one stride right and down.
        kps[20] = 1.0;
        kps[21] = 1.0;

        let faces = decode_level(&scores, &boxes, Some(&kps), 32, &IDENTITY);
        let landmarks = faces[0].landmarks.expect("landmarks decoded");
        assert_eq!(landmarks[0], (64.0, 32.0));
        assert_eq!(landmarks[1], (32.0, 0.0));

        let short = vec![0.0f32; 15];
        let faces = decode_level(&scores, &boxes, Some(&short), 32, &IDENTITY);
        assert_eq!(faces[0].landmarks, None);
    }

    #[test]
    fn test_discover_heads_by_name() {
        let shuffled = names(&[
            "bbox_32", "kps_8", "score_16", "bbox_8", "score_32", "kps_16", "score_8", "bbox_16",
            "kps_32",
        ]);
        let heads = discover_heads(&shuffled);
        assert_eq!(heads[0], HeadIndices { score: 6, bbox: 3, kps: Some(1) });
        assert_eq!(heads[1], HeadIndices { score: 2, bbox: 7, kps: Some(5) });
        assert_eq!(heads[2], HeadIndices { score: 4, bbox: 0, kps: Some(8) });
    }

    #[test]
    fn test_discover_heads_by_name_without_landmarks() {
        let heads = discover_heads(&names(&[
            "bbox_8", "bbox_16", "bbox_32", "score_8", "score_16", "score_32", "kps_8",
        ]));
        assert_eq!(heads[0], HeadIndices { score: 3, bbox: 0, kps: None });
        assert!(heads.iter().all(|h| h.kps.is_none()));
    }

    #[test]
    fn test_discover_heads_positional() {
        let nine = names(&["448", "471", "494", "451", "474", "497", "454", "477", "500"]);
        let heads = discover_heads(&nine);
        assert_eq!(heads[0], HeadIndices { score: 0, bbox: 3, kps: Some(6) });
        assert_eq!(heads[2], HeadIndices { score: 2, bbox: 5, kps: Some(8) });

        let six = names(&["a", "b", "c", "d", "e", "f"]);
        let heads = discover_heads(&six);
        assert_eq!(heads[1], HeadIndices { score: 1, bbox: 4, kps: None });
    }

    #[test]
    fn test_letterbox_landscape() {
        let image = RgbImage::from_pixel(320, 160, image::Rgb([255, 255, 255]));
        let (tensor, lb) = letterbox(&image);
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert_eq!(lb.scale, 2.0);
        assert_eq!((lb.pad_x, lb.pad_y), (0.0, 160.0));

        let white = (255.0 - SCRFD_MEAN) / SCRFD_STD;
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0, "padding row");
        assert!((tensor[[0, 1, 320, 320]] - white).abs() < 1e-2);
    }
}
