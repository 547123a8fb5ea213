//! SCRFD face detector via ONNX Runtime.
//!
//! Anchor-free decoding over three strides followed by greedy NMS.

use attend_core::{BoundingBox, Frame};
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

use crate::ExtractorError;

const INPUT_SIZE: u32 = 640;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 128.0;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

pub const DEFAULT_SCORE_THRESHOLD: f32 = 0.5;
pub const DEFAULT_NMS_THRESHOLD: f32 = 0.4;

/// Where each stride's (score, bbox, kps) tensors sit in the model outputs.
type OutputLayout = [(usize, usize, usize); 3];

/// Letterbox placement of the source frame inside the square model input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: u32,
    pad_y: u32,
    width: u32,
    height: u32,
}

impl Letterbox {
    fn fit(width: u32, height: u32) -> Self {
        let scale = (INPUT_SIZE as f32 / width as f32).min(INPUT_SIZE as f32 / height as f32);
        let new_w = ((width as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
        let new_h = ((height as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
        Self {
            scale,
            pad_x: (INPUT_SIZE - new_w) / 2,
            pad_y: (INPUT_SIZE - new_h) / 2,
            width: new_w,
            height: new_h,
        }
    }

    /// Model-input coordinates back to source-frame coordinates.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.pad_x as f32) / self.scale,
            (y - self.pad_y as f32) / self.scale,
        )
    }
}

/// SCRFD face detector (`det_10g.onnx`).
pub struct Scrfd {
    session: Session,
    layout: OutputLayout,
    score_threshold: f32,
    nms_threshold: f32,
}

impl Scrfd {
    pub fn load(model_path: &Path) -> Result<Self, ExtractorError> {
        if !model_path.exists() {
            return Err(ExtractorError::ModelNotFound(model_path.to_path_buf()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();
        if names.len() < 9 {
            return Err(ExtractorError::Inference(format!(
                "detector needs 9 outputs (score/bbox/kps per stride), model has {}",
                names.len()
            )));
        }
        let layout = output_layout(&names);

        tracing::info!(path = %model_path.display(), outputs = ?names, ?layout, "loaded SCRFD model");

        Ok(Self {
            session,
            layout,
            score_threshold: DEFAULT_SCORE_THRESHOLD,
            nms_threshold: DEFAULT_NMS_THRESHOLD,
        })
    }

    pub fn with_thresholds(mut self, score: f32, nms: f32) -> Self {
        self.score_threshold = score;
        self.nms_threshold = nms;
        self
    }

    /// Detect faces, highest confidence first.
    pub fn detect(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, ExtractorError> {
        let (input, letterbox) = preprocess(frame)?;
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (level, &stride) in STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.layout[level];
            let tensor = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| ExtractorError::Inference(format!("{what} (stride {stride}): {e}")))
            };
            let scores = tensor(score_idx, "scores")?;
            let boxes = tensor(bbox_idx, "boxes")?;
            let kps = tensor(kps_idx, "landmarks")?;

            candidates.extend(decode_level(
                scores,
                boxes,
                kps,
                stride,
                &letterbox,
                self.score_threshold,
            ));
        }

        Ok(suppress(candidates, self.nms_threshold))
    }
}

/// Name-based output discovery (`score_8`, `bbox_16`, ...), falling back to
/// the stock export order: scores, then boxes, then landmarks.
fn output_layout(names: &[String]) -> OutputLayout {
    let find = |kind: &str, stride: usize| {
        let wanted = format!("{kind}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let mut layout = [(0, 3, 6), (1, 4, 7), (2, 5, 8)];
    for (level, &stride) in STRIDES.iter().enumerate() {
        match (find("score", stride), find("bbox", stride), find("kps", stride)) {
            (Some(s), Some(b), Some(k)) => layout[level] = (s, b, k),
            _ => return [(0, 3, 6), (1, 4, 7), (2, 5, 8)],
        }
    }
    layout
}

/// Letterbox a grayscale frame into a 1×3×640×640 tensor.
///
/// Padding is filled with the mean so it normalizes to zero.
fn preprocess(frame: &Frame) -> Result<(Array4<f32>, Letterbox), ExtractorError> {
    let image = GrayImage::from_raw(frame.width, frame.height, frame.data.clone()).ok_or_else(
        || {
            ExtractorError::Inference(format!(
                "frame buffer is {} bytes, expected {}x{}",
                frame.data.len(),
                frame.width,
                frame.height
            ))
        },
    )?;

    let letterbox = Letterbox::fit(frame.width, frame.height);
    let resized = imageops::resize(&image, letterbox.width, letterbox.height, FilterType::Triangle);

    let side = INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let v = (pixel.0[0] as f32 - PIXEL_MEAN) / PIXEL_STD;
        let (tx, ty) = ((x + letterbox.pad_x) as usize, (y + letterbox.pad_y) as usize);
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = v;
        }
    }

    Ok((tensor, letterbox))
}

fn decode_level(
    scores: &[f32],
    boxes: &[f32],
    kps: &[f32],
    stride: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<BoundingBox> {
    let cols = INPUT_SIZE as usize / stride;
    let step = stride as f32;

    scores
        .iter()
        .enumerate()
        .filter(|&(_, &score)| score > threshold)
        .filter_map(|(anchor, &score)| {
            let cell = anchor / ANCHORS_PER_CELL;
            let cx = (cell % cols) as f32 * step;
            let cy = (cell / cols) as f32 * step;

            let d = boxes.get(anchor * 4..anchor * 4 + 4)?;
            let (x1, y1) = letterbox.unmap(cx - d[0] * step, cy - d[1] * step);
            let (x2, y2) = letterbox.unmap(cx + d[2] * step, cy + d[3] * step);

            let landmarks = kps.get(anchor * 10..anchor * 10 + 10).map(|k| {
                std::array::from_fn(|i| letterbox.unmap(cx + k[i * 2] * step, cy + k[i * 2 + 1] * step))
            });

            Some(BoundingBox {
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

/// Greedy non-maximum suppression; output is sorted by confidence.
fn suppress(mut candidates: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<BoundingBox> = Vec::new();
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

    fn bbox(x: f32, y: f32, w: f32, h: f32, confidence: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence, landmarks: None }
    }

    #[test]
    fn test_suppress_keeps_best_of_overlap() {
        let kept = suppress(
            vec![
                bbox(5.0, 5.0, 100.0, 100.0, 0.8),
                bbox(200.0, 200.0, 50.0, 50.0, 0.7),
                bbox(0.0, 0.0, 100.0, 100.0, 0.9),
            ],
            0.4,
        );
        let confidences: Vec<f32> = kept.iter().map(|b| b.confidence).collect();
        assert_eq!(confidences, vec![0.9, 0.7]);
    }

    #[test]
    fn test_suppress_empty() {
        assert!(suppress(Vec::new(), 0.4).is_empty());
    }

    #[test]
    fn test_letterbox_unmap_recovers_source_coordinates() {
        let lb = Letterbox::fit(320, 240);
        assert_eq!((lb.width, lb.height), (640, 480));
        assert_eq!((lb.pad_x, lb.pad_y), (0, 80));

        let (x, y) = lb.unmap(100.0 * lb.scale, 50.0 * lb.scale + 80.0);
        assert!((x - 100.0).abs() < 1e-3 && (y - 50.0).abs() < 1e-3);
    }

    #[test]
    fn test_output_layout_named_and_shuffled() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8", "bbox_16", "kps_16", "score_16", "bbox_32", "kps_32",
            "score_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(output_layout(&names), [(2, 0, 1), (5, 3, 4), (8, 6, 7)]);
    }

    #[test]
    fn test_output_layout_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| format!("{}", 400 + i)).collect();
        assert_eq!(output_layout(&names), [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }

    #[test]
    fn test_decode_level_single_anchor() {
        let lb = Letterbox::fit(640, 640);
        let cells = (640 / 32) * (640 / 32) * ANCHORS_PER_CELL;
        let mut scores = vec![0.0; cells];
        let mut boxes = vec![0.0; cells * 4];
        let kps = vec![0.0; cells * 10];
        // anchor 3 -> cell 1 -> centre (32, 0)
        scores[3] = 0.9;
        boxes[12..16].copy_from_slice(&[0.5, 0.0, 0.5, 1.0]);

        let dets = decode_level(&scores, &boxes, &kps, 32, &lb, 0.5);
        assert_eq!(dets.len(), 1);
        let d = &dets[0];
        assert_eq!((d.x, d.y, d.width, d.height), (16.0, 0.0, 32.0, 32.0));
        assert_eq!(d.landmarks.unwrap()[0], (32.0, 0.0));
    }

    #[test]
    fn test_preprocess_pads_with_zero() {
        let frame = Frame { data: vec![255; 64 * 32], width: 64, height: 32, sequence: 0 };
        let (tensor, lb) = preprocess(&frame).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
        let inside = tensor[[0, 2, lb.pad_y as usize + 10, 10]];
        assert!((inside - (255.0 - PIXEL_MEAN) / PIXEL_STD).abs() < 1e-4);
    }

    #[test]
    fn test_preprocess_rejects_short_buffer() {
        let frame = Frame { data: vec![0; 10], width: 64, height: 32, sequence: 0 };
        assert!(preprocess(&frame).is_err());
    }
}
