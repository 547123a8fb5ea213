//! attend-vision: ONNX face extraction for the attendance engine.
//!
//! [`OnnxExtractor`] chains SCRFD detection, five-point alignment and
//! ArcFace embedding, and plugs into the core as a [`FaceExtractor`].

pub mod alignment;
pub mod detector;
pub mod recognizer;

use attend_core::{Detection, FaceExtractor, Frame};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use detector::Scrfd;
pub use recognizer::ArcFace;

pub const DETECTOR_MODEL: &str = "det_10g.onnx";
pub const RECOGNIZER_MODEL: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("model file not found: {0}; download the insightface buffalo_l models into the model directory")]
    ModelNotFound(PathBuf),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("detected face has no landmarks")]
    NoLandmarks,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Detector + recognizer pair. One instance per engine thread.
pub struct OnnxExtractor {
    detector: Scrfd,
    recognizer: ArcFace,
}

impl OnnxExtractor {
    /// Load `det_10g.onnx` and `w600k_r50.onnx` from `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self, ExtractorError> {
        Ok(Self {
            detector: Scrfd::load(&model_dir.join(DETECTOR_MODEL))?,
            recognizer: ArcFace::load(&model_dir.join(RECOGNIZER_MODEL))?,
        })
    }

    /// Override the SCRFD score and NMS IoU thresholds.
    pub fn with_detection_thresholds(mut self, score: f32, nms: f32) -> Self {
        self.detector = self.detector.with_thresholds(score, nms);
        self
    }
}

impl FaceExtractor for OnnxExtractor {
    type Error = ExtractorError;

    fn extract(&mut self, frame: &Frame) -> Result<Vec<Detection>, ExtractorError> {
        let faces = self.detector.detect(frame)?;
        let mut detections = Vec::with_capacity(faces.len());
        for face in faces {
            // Faces without landmarks cannot be aligned; leave them out of this frame.
            if face.landmarks.is_none() {
                tracing::debug!(confidence = face.confidence, "face without landmarks dropped");
                continue;
            }
            let embedding = self.recognizer.embed(frame, &face)?;
            detections.push(Detection {
                location: face,
                embedding,
            });
        }
        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_reports_missing_detector_model() {
        let dir = std::env::temp_dir().join("attend-vision-no-models");
        match OnnxExtractor::load(&dir) {
            Err(ExtractorError::ModelNotFound(path)) => {
                assert_eq!(path, dir.join(DETECTOR_MODEL));
                let msg = ExtractorError::ModelNotFound(path).to_string();
                assert!(msg.ends_with("; download the insightface buffalo_l models into the model directory"));
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("loaded models from an empty directory"),
        }
    }
}
