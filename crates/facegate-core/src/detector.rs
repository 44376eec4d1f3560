//! SCRFD face detector via ONNX Runtime.
//!
//! Implements the SCRFD (Sample and Computation Redistribution for Efficient Face
//! Detection) model with 3-stride anchor-free decoding and NMS post-processing.
//! Only boxes are decoded; keypoint outputs, when the export has them, are ignored.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// SCRFD model constants
const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;
/// Score outputs for 3 strides + bbox outputs for 3 strides.
const SCRFD_MIN_OUTPUTS: usize = 6;

/// Default minimum detection score.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}; download det_10g.onnx from insightface and place it in the model dir")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Finds axis-aligned face boxes in a frame.
pub trait FaceDetector {
    /// Detect faces, returning boxes in frame pixel coordinates, best first.
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError>;
}

/// Metadata for coordinate de-mapping after letterbox resize.
#[derive(Debug)]
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Decoded detection in frame coordinates, before clamping to the frame.
#[derive(Debug, Clone, Copy)]
struct Detection {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    score: f32,
}

impl Detection {
    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    /// Round to whole pixels and clamp to the frame. Degenerate boxes are dropped.
    fn to_bounding_box(self, frame_width: u32, frame_height: u32) -> Option<BoundingBox> {
        let (fw, fh) = (frame_width as f32, frame_height as f32);
        let x1 = self.x1.clamp(0.0, fw).round();
        let y1 = self.y1.clamp(0.0, fh).round();
        let x2 = self.x2.clamp(0.0, fw).round();
        let y2 = self.y2.clamp(0.0, fh).round();

        let width = (x2 - x1).max(0.0) as u32;
        let height = (y2 - y1).max(0.0) as u32;
        (width > 0 && height > 0).then(|| BoundingBox::new(x1 as u32, y1 as u32, width, height))
    }
}

/// Output tensor indices for one stride: (score_idx, bbox_idx).
type StrideOutputIndices = (usize, usize);

/// SCRFD-based face detector.
pub struct ScrfdDetector {
    session: Session,
    input_height: usize,
    input_width: usize,
    confidence_threshold: f32,
    /// Per-stride output indices [(score, bbox)] for strides [8, 16, 32].
    /// Discovered by name at load time; falls back to positional ordering.
    stride_indices: [StrideOutputIndices; 3],
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &Path, confidence_threshold: f32) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        let num_outputs = output_names.len();

        tracing::info!(
            path = %model_path.display(),
            outputs = ?output_names,
            confidence_threshold,
            "loaded SCRFD model"
        );

        if num_outputs < SCRFD_MIN_OUTPUTS {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires at least {SCRFD_MIN_OUTPUTS} outputs (3 strides × score/bbox), got {num_outputs}"
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session,
            input_height: SCRFD_INPUT_SIZE,
            input_width: SCRFD_INPUT_SIZE,
            confidence_threshold,
            stride_indices,
        })
    }
}

impl FaceDetector for ScrfdDetector {
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        let (input, letterbox) = letterbox_tensor(frame, self.input_width, self.input_height);
        let (input_width, input_height) = (self.input_width, self.input_height);
        let threshold = self.confidence_threshold;
        let stride_indices = self.stride_indices;

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut all_detections = Vec::new();

        for (stride_pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = stride_indices[stride_pos];

            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;

            all_detections.extend(decode_stride(
                scores,
                bboxes,
                stride,
                input_width,
                input_height,
                &letterbox,
                threshold,
            ));
        }

        let boxes: Vec<BoundingBox> = nms(all_detections, SCRFD_NMS_THRESHOLD)
            .into_iter()
            .filter_map(|d| d.to_bounding_box(frame.width(), frame.height()))
            .collect();

        tracing::debug!(faces = boxes.len(), "detection pass");
        Ok(boxes)
    }
}

/// Letterbox an RGB frame into a NCHW float tensor normalized for SCRFD.
///
/// Padding uses the mean value, which normalizes to 0.0.
fn letterbox_tensor(frame: &RgbImage, input_width: usize, input_height: usize) -> (Array4<f32>, LetterboxInfo) {
    let (width, height) = (frame.width() as usize, frame.height() as usize);
    let mut tensor = Array4::<f32>::zeros((1, 3, input_height, input_width));
    if width == 0 || height == 0 {
        return (tensor, LetterboxInfo { scale: 1.0, pad_x: 0.0, pad_y: 0.0 });
    }

    let scale_w = input_width as f32 / width as f32;
    let scale_h = input_height as f32 / height as f32;
    let scale = scale_w.min(scale_h);

    let new_w = ((width as f32 * scale).round() as usize).clamp(1, input_width);
    let new_h = ((height as f32 * scale).round() as usize).clamp(1, input_height);
    let pad_x = (input_width - new_w) as f32 / 2.0;
    let pad_y = (input_height - new_h) as f32 / 2.0;

    let resized = imageops::resize(frame, new_w as u32, new_h as u32, FilterType::Triangle);

    let pad_x_start = pad_x.floor() as usize;
    let pad_y_start = pad_y.floor() as usize;

    for (x, y, pixel) in resized.enumerate_pixels() {
        let (tx, ty) = (pad_x_start + x as usize, pad_y_start + y as usize);
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    (tensor, LetterboxInfo { scale, pad_x, pad_y })
}

/// Discover output tensor ordering by name.
///
/// SCRFD models may export tensors with named outputs ("score_8", "bbox_16", ...) or
/// generic numeric names. If the named pattern is present, maps them to stride slots.
/// Otherwise falls back to the standard positional ordering, which holds for both
/// 6-output and 9-output (with keypoints) exports:
///   [0-2] = scores (strides 8, 16, 32)
///   [3-5] = bboxes (strides 8, 16, 32)
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named: Option<Vec<StrideOutputIndices>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| Some((find("score", stride)?, find("bbox", stride)?)))
        .collect();

    match named {
        Some(indices) => {
            tracing::info!("SCRFD: using name-based output tensor mapping");
            [indices[0], indices[1], indices[2]]
        }
        None => {
            tracing::info!(
                ?names,
                "SCRFD: output names not recognized, using positional mapping [0-2]=scores, [3-5]=bboxes"
            );
            [(0, 3), (1, 4), (2, 5)]
        }
    }
}

/// Decode detections for a single stride level.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    stride: usize,
    input_width: usize,
    input_height: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<Detection> {
    let grid_h = input_height / stride;
    let grid_w = input_width / stride;
    let num_anchors = grid_h * grid_w * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;

    let mut detections = Vec::new();

    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }

        let bbox_off = idx * 4;
        let Some(offsets) = bboxes.get(bbox_off..bbox_off + 4) else {
            continue;
        };

        let anchor_idx = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_cx = (anchor_idx % grid_w) as f32 * s;
        let anchor_cy = (anchor_idx / grid_w) as f32 * s;

        // Offsets are distances to the box edges in stride units; map back
        // from letterboxed space to frame space.
        let unbox_x = |v: f32| (v - letterbox.pad_x) / letterbox.scale;
        let unbox_y = |v: f32| (v - letterbox.pad_y) / letterbox.scale;

        detections.push(Detection {
            x1: unbox_x(anchor_cx - offsets[0] * s),
            y1: unbox_y(anchor_cy - offsets[1] * s),
            x2: unbox_x(anchor_cx + offsets[2] * s),
            y2: unbox_y(anchor_cy + offsets[3] * s),
            score,
        });
    }

    detections
}

/// Non-Maximum Suppression: remove overlapping detections, best score first.
fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<Detection> = Vec::new();
    for det in detections {
        if keep.iter().all(|kept| iou(kept, &det) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

/// Compute Intersection-over-Union between two detections.
fn iou(a: &Detection, b: &Detection) -> f32 {
    let inter = Detection {
        x1: a.x1.max(b.x1),
        y1: a.y1.max(b.y1),
        x2: a.x2.min(b.x2),
        y2: a.y2.min(b.y2),
        score: 0.0,
    };
    let inter_area = inter.area();
    let union_area = a.area() + b.area() - inter_area;

    if union_area > 0.0 {
        inter_area / union_area
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn det(x: f32, y: f32, w: f32, h: f32, score: f32) -> Detection {
        Detection { x1: x, y1: y, x2: x + w, y2: y + h, score }
    }

    #[test]
    fn test_iou_identical() {
        let a = det(0.0, 0.0, 100.0, 100.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_no_overlap() {
        let a = det(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = det(20.0, 20.0, 10.0, 10.0, 1.0);
        assert!(iou(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_iou_partial() {
        let a = det(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = det(5.0, 0.0, 10.0, 10.0, 1.0);
        // Overlap: 5x10 = 50, union: 100+100-50 = 150
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let detections = vec![
            det(5.0, 5.0, 100.0, 100.0, 0.8),
            det(0.0, 0.0, 100.0, 100.0, 0.9),
            det(200.0, 200.0, 50.0, 50.0, 0.7),
        ];
        let result = nms(detections, 0.4);
        assert_eq!(result.len(), 2);
        assert!((result[0].score - 0.9).abs() < 1e-6);
        assert!((result[1].score - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(vec![], 0.4).is_empty());
    }

    #[test]
    fn test_to_bounding_box_clamps_to_frame() {
        let d = det(-10.0, 20.4, 100.0, 300.0, 0.9);
        assert_eq!(d.to_bounding_box(640, 240), Some(BoundingBox::new(0, 20, 90, 220)));
    }

    #[test]
    fn test_to_bounding_box_drops_outside() {
        let d = det(700.0, 10.0, 50.0, 50.0, 0.9);
        assert_eq!(d.to_bounding_box(640, 480), None);
    }

    #[test]
    fn test_letterbox_tensor_padding_and_shape() {
        // 320x160 frame -> scale 2.0, 640x320 content, 160 rows of padding top and bottom.
        let frame = RgbImage::from_pixel(320, 160, Rgb([255, 0, 128]));
        let (tensor, lb) = letterbox_tensor(&frame, 640, 640);

        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert!((lb.scale - 2.0).abs() < 1e-6);
        assert_eq!(lb.pad_x, 0.0);
        assert_eq!(lb.pad_y, 160.0);

        // Padding normalizes to zero.
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
        assert_eq!(tensor[[0, 2, 639, 639]], 0.0);
        // Content keeps per-channel values.
        let mid = 320;
        assert!((tensor[[0, 0, mid, mid]] - (255.0 - SCRFD_MEAN) / SCRFD_STD).abs() < 1e-6);
        assert!((tensor[[0, 1, mid, mid]] - (0.0 - SCRFD_MEAN) / SCRFD_STD).abs() < 1e-6);
        assert!((tensor[[0, 2, mid, mid]] - (128.0 - SCRFD_MEAN) / SCRFD_STD).abs() < 1e-6);
    }

    #[test]
    fn test_decode_stride_maps_back_to_frame() {
        let letterbox = LetterboxInfo { scale: 2.0, pad_x: 0.0, pad_y: 160.0 };
        let stride = 32;
        let grid = 640 / stride;
        let mut scores = vec![0.0f32; grid * grid * SCRFD_ANCHORS_PER_CELL];
        let mut bboxes = vec![0.0f32; scores.len() * 4];

        // Anchor cell (col 5, row 8) -> center (160, 256) in letterboxed space.
        let idx = (8 * grid + 5) * SCRFD_ANCHORS_PER_CELL;
        scores[idx] = 0.95;
        bboxes[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);

        let dets = decode_stride(&scores, &bboxes, stride, 640, 640, &letterbox, 0.5);
        assert_eq!(dets.len(), 1);
        let d = dets[0];
        // x: (160 ± 32) / 2 ; y: (256 ± 32 - 160) / 2
        assert!((d.x1 - 64.0).abs() < 1e-4 && (d.x2 - 96.0).abs() < 1e-4);
        assert!((d.y1 - 32.0).abs() < 1e-4 && (d.y2 - 64.0).abs() < 1e-4);
    }

    #[test]
    fn test_discover_output_indices_named() {
        let names: Vec<String> = [
            "score_8", "score_16", "score_32",
            "bbox_8",  "bbox_16",  "bbox_32",
            "kps_8",   "kps_16",   "kps_32",
        ].iter().map(|s| s.to_string()).collect();

        assert_eq!(discover_output_indices(&names), [(0, 3), (1, 4), (2, 5)]);
    }

    #[test]
    fn test_discover_output_indices_shuffled_named() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8",
            "bbox_16", "kps_16", "score_16",
            "bbox_32", "kps_32", "score_32",
        ].iter().map(|s| s.to_string()).collect();

        assert_eq!(discover_output_indices(&names), [(2, 0), (5, 3), (8, 6)]);
    }

    #[test]
    fn test_discover_output_indices_positional_fallback() {
        let names: Vec<String> = (0..6).map(|i: usize| i.to_string()).collect();
        assert_eq!(discover_output_indices(&names), [(0, 3), (1, 4), (2, 5)]);
    }
}
