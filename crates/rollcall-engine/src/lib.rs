//! rollcall-engine — Attendance recognition on top of the store.
//!
//! [`AttendancePipeline`] turns one image into per-face outcomes and ledger
//! records. [`run_live`] drives it over a frame stream, and
//! [`spawn_engine`] hosts both on a dedicated thread behind an async handle.

pub mod annotate;
pub mod config;
pub mod engine;
pub mod live;
pub mod pipeline;

pub use annotate::{Annotator, BoxAnnotator};
pub use config::{Config, ConfigError};
pub use engine::{spawn_engine, EngineError, EngineHandle, FrameReport, SourceFactory};
pub use live::{run_live, DirectorySource, FrameSource, LiveSummary, SourceError, StopReason};
pub use pipeline::{AttendancePipeline, FaceResult, FaceStatus, PipelineError, Recognition};
