//! ArcFace embedding model (`w600k_r50.onnx`).

use crate::alignment::{self, ALIGNED_SIZE};
use crate::ExtractorError;
use attend_core::{BoundingBox, Embedding, Frame};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

// ArcFace normalizes symmetrically, unlike SCRFD.
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 127.5;
pub const EMBEDDING_DIM: usize = 512;
pub const MODEL_VERSION: &str = "w600k_r50";

pub struct ArcFace {
    session: Session,
}

impl ArcFace {
    pub fn load(model_path: &Path) -> Result<Self, ExtractorError> {
        if !model_path.exists() {
            return Err(ExtractorError::ModelNotFound(model_path.to_path_buf()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(path = %model_path.display(), "loaded ArcFace model");
        Ok(Self { session })
    }

    /// L2-normalized embedding of the face at `face`. Requires landmarks.
    pub fn embed(&mut self, frame: &Frame, face: &BoundingBox) -> Result<Embedding, ExtractorError> {
        let landmarks = face.landmarks.as_ref().ok_or(ExtractorError::NoLandmarks)?;
        let crop = alignment::align_face(frame, landmarks);
        let input = to_tensor(&crop);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ExtractorError::Inference(format!("embedding output: {e}")))?;

        if raw.len() != EMBEDDING_DIM {
            return Err(ExtractorError::Inference(format!(
                "expected {EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding {
            values: l2_normalize(raw),
            model_version: Some(MODEL_VERSION.to_string()),
        })
    }
}

fn to_tensor(crop: &[u8]) -> Array4<f32> {
    Array4::from_shape_fn((1, 3, ALIGNED_SIZE, ALIGNED_SIZE), |(_, _, y, x)| {
        let pixel = crop.get(y * ALIGNED_SIZE + x).copied().unwrap_or(0) as f32;
        (pixel - PIXEL_MEAN) / PIXEL_STD
    })
}

/// Zero vectors are returned unchanged.
fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm = raw.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|v| v / norm).collect()
    } else {
        raw.to_vec()
    }
}
