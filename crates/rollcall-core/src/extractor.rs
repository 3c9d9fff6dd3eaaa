//! Image → face detections boundary.

use crate::detector::FaceDetector;
use crate::recognizer::FaceRecognizer;
use crate::types::FaceDetection;
use image::RgbImage;
use std::path::Path;
use thiserror::Error;

/// File name of the SCRFD detection model inside the model directory.
pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
/// File name of the ArcFace recognition model inside the model directory.
pub const RECOGNIZER_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("model file not found: {0} (download from insightface and place in the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Finds faces in an RGB image and produces one feature vector per face.
///
/// Detections come back most prominent first; enrollment relies on that
/// when it keeps only the first face of each reference image.
pub trait FaceExtractor {
    fn extract(&mut self, image: &RgbImage) -> Result<Vec<FaceDetection>, ExtractError>;
}

/// SCRFD detection followed by ArcFace embedding.
pub struct OnnxExtractor {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxExtractor {
    /// Load both models from `model_dir`.
    pub fn load(model_dir: &Path, intra_threads: usize) -> Result<Self, ExtractError> {
        let detector = FaceDetector::load(&model_dir.join(DETECTOR_MODEL_FILE), intra_threads)?;
        let recognizer =
            FaceRecognizer::load(&model_dir.join(RECOGNIZER_MODEL_FILE), intra_threads)?;
        Ok(Self { detector, recognizer })
    }
}

impl FaceExtractor for OnnxExtractor {
    fn extract(&mut self, image: &RgbImage) -> Result<Vec<FaceDetection>, ExtractError> {
        let boxes = self.detector.detect(image)?;
        let mut detections = Vec::with_capacity(boxes.len());

        for bbox in boxes {
            let Some(landmarks) = bbox.landmarks else {
                tracing::debug!(confidence = bbox.confidence, "face without landmarks skipped");
                continue;
            };
            let vector = self.recognizer.extract(image, &landmarks)?;
            detections.push(FaceDetection { bbox, vector });
        }

        tracing::debug!(faces = detections.len(), "extracted face vectors");
        Ok(detections)
    }
}
