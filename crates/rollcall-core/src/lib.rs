//! rollcall-core — Face matching primitives and the ONNX feature extractor.
//!
//! Matching works on opaque feature vectors; where those vectors come from
//! is behind the [`FaceExtractor`] trait. The bundled [`OnnxExtractor`] uses
//! SCRFD for detection and ArcFace for recognition on RGB input.

pub mod alignment;
pub mod detector;
pub mod extractor;
pub mod matcher;
pub mod naming;
pub mod recognizer;
pub mod types;

pub use extractor::{ExtractError, FaceExtractor, OnnxExtractor};
pub use matcher::{FirstMatchMatcher, MatchPolicy, Matcher, NearestMatcher, DEFAULT_MATCH_THRESHOLD};
pub use types::{
    BoundingBox, FaceDetection, FeatureVector, Identity, MatchResult, Registry, UNKNOWN_LABEL,
};
