//! Recognition pipeline: detect → match → record → annotate.

use crate::annotate::{Annotator, BoxAnnotator};
use chrono::NaiveDateTime;
use image::RgbImage;
use rollcall_core::{BoundingBox, FaceExtractor, Matcher};
use rollcall_store::{AttendanceLedger, EnrollmentStore, LedgerError, RecordOutcome};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("attendance ledger: {0}")]
    Ledger(#[from] LedgerError),
}

/// What happened to one detected face.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaceStatus {
    Marked,
    AlreadyMarked,
    Unknown,
}

/// Per-face outcome of a recognition call.
#[derive(Debug, Clone)]
pub struct FaceResult {
    pub bbox: BoundingBox,
    /// Matched name, or "Unknown".
    pub label: String,
    pub status: FaceStatus,
    /// Human-readable status line.
    pub message: String,
}

/// Result of recognizing one image or frame.
#[derive(Debug, Clone)]
pub struct Recognition {
    /// Copy of the input with every detection annotated.
    pub annotated: RgbImage,
    pub faces: Vec<FaceResult>,
    /// Number of faces detected, whatever their match outcome.
    pub face_count: usize,
}

impl Recognition {
    /// Result for input that held no decodable image.
    pub fn empty() -> Self {
        Self {
            annotated: RgbImage::new(0, 0),
            faces: Vec::new(),
            face_count: 0,
        }
    }

    pub fn messages(&self) -> impl Iterator<Item = &str> {
        self.faces.iter().map(|f| f.message.as_str())
    }

    pub fn marked(&self) -> usize {
        self.faces
            .iter()
            .filter(|f| f.status == FaceStatus::Marked)
            .count()
    }
}

/// Matches detected faces against the enrollment store and records
/// attendance for the ones it recognizes.
pub struct AttendancePipeline {
    store: Arc<EnrollmentStore>,
    ledger: Arc<AttendanceLedger>,
    matcher: Box<dyn Matcher>,
    threshold: f32,
    annotator: Box<dyn Annotator>,
}

impl AttendancePipeline {
    pub fn new(
        store: Arc<EnrollmentStore>,
        ledger: Arc<AttendanceLedger>,
        matcher: Box<dyn Matcher>,
        threshold: f32,
    ) -> Self {
        Self {
            store,
            ledger,
            matcher,
            threshold,
            annotator: Box::new(BoxAnnotator::default()),
        }
    }

    pub fn with_annotator(mut self, annotator: Box<dyn Annotator>) -> Self {
        self.annotator = annotator;
        self
    }

    pub fn store(&self) -> &Arc<EnrollmentStore> {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<AttendanceLedger> {
        &self.ledger
    }

    /// Recognize faces in an RGB image, stamping attendance with local time.
    pub fn recognize(
        &self,
        extractor: &mut dyn FaceExtractor,
        image: &RgbImage,
    ) -> Result<Recognition, PipelineError> {
        self.recognize_at(extractor, image, chrono::Local::now().naive_local())
    }

    /// Decode an encoded image (PNG, JPEG, ...) and recognize faces in it,
    /// stamping attendance with local time.
    pub fn recognize_encoded(
        &self,
        extractor: &mut dyn FaceExtractor,
        bytes: &[u8],
    ) -> Result<Recognition, PipelineError> {
        self.recognize_encoded_at(extractor, bytes, chrono::Local::now().naive_local())
    }

    /// Like [`recognize_encoded`](Self::recognize_encoded) with an explicit
    /// timestamp. Bytes that do not decode count as an image with no faces.
    pub fn recognize_encoded_at(
        &self,
        extractor: &mut dyn FaceExtractor,
        bytes: &[u8],
        when: NaiveDateTime,
    ) -> Result<Recognition, PipelineError> {
        match image::load_from_memory(bytes) {
            Ok(decoded) => self.recognize_at(extractor, &decoded.to_rgb8(), when),
            Err(e) => {
                tracing::warn!(error = %e, len = bytes.len(), "input is not a decodable image");
                Ok(Recognition::empty())
            }
        }
    }

    /// Recognize faces in an RGB image, stamping attendance with `when`.
    ///
    /// Extraction failures are treated as an image without faces. A ledger
    /// storage failure aborts the call; records already written for earlier
    /// faces in the image are kept.
    pub fn recognize_at(
        &self,
        extractor: &mut dyn FaceExtractor,
        image: &RgbImage,
        when: NaiveDateTime,
    ) -> Result<Recognition, PipelineError> {
        let detections = extractor.extract(image).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "face extraction failed; treating image as empty");
            Vec::new()
        });

        let registry = self.store.snapshot();
        let mut annotated = image.clone();
        let mut faces = Vec::with_capacity(detections.len());

        for detection in detections {
            let result = self
                .matcher
                .compare(&detection.vector, &registry, self.threshold);

            let (status, message) = match result.identity.as_deref() {
                Some(name) => match self.ledger.record(name, when)? {
                    RecordOutcome::Marked => (FaceStatus::Marked, format!("{name} - Attendance Marked")),
                    RecordOutcome::AlreadyMarked => {
                        (FaceStatus::AlreadyMarked, format!("{name} - Already Marked Today"))
                    }
                },
                None => (FaceStatus::Unknown, "Unknown Person".to_string()),
            };

            tracing::debug!(
                label = result.label(),
                distance = result.distance,
                ?status,
                "face processed"
            );

            self.annotator
                .annotate(&mut annotated, &detection.bbox, result.label());
            faces.push(FaceResult {
                bbox: detection.bbox,
                label: result.label().to_string(),
                status,
                message,
            });
        }

        Ok(Recognition {
            annotated,
            face_count: faces.len(),
            faces,
        })
    }
}
