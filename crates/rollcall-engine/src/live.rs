//! Continuous recognition over a stream of frames.

use crate::pipeline::{AttendancePipeline, PipelineError, Recognition};
use image::RgbImage;
use rollcall_core::FaceExtractor;
use rollcall_hw::{CameraError, CaptureStream};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("camera: {0}")]
    Camera(#[from] CameraError),
    #[error("frame directory unavailable at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A source of RGB frames. `Ok(None)` marks the end of the stream.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Option<RgbImage>, SourceError>;
}

impl FrameSource for CaptureStream {
    fn next_frame(&mut self) -> Result<Option<RgbImage>, SourceError> {
        let frame = CaptureStream::next_frame(self)?;
        let sequence = frame.sequence;
        match frame.into_image() {
            Some(image) => Ok(Some(image)),
            None => Err(CameraError::CaptureFailed(format!("short frame buffer (sequence {sequence})")).into()),
        }
    }
}

/// Replays the image files of a directory in file-name order.
///
/// Files that fail to decode are skipped with a warning.
pub struct DirectorySource {
    pending: VecDeque<PathBuf>,
}

impl DirectorySource {
    pub fn open(dir: &Path) -> Result<Self, SourceError> {
        let storage = |e: std::io::Error| SourceError::Storage {
            path: dir.to_path_buf(),
            source: e,
        };
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(storage)? {
            let path = entry.map_err(storage)?.path();
            if path.is_file() && is_frame_file(&path) {
                paths.push(path);
            }
        }
        paths.sort();
        tracing::info!(dir = %dir.display(), frames = paths.len(), "frame directory opened");
        Ok(Self {
            pending: paths.into(),
        })
    }

    pub fn remaining(&self) -> usize {
        self.pending.len()
    }
}

impl FrameSource for DirectorySource {
    fn next_frame(&mut self) -> Result<Option<RgbImage>, SourceError> {
        while let Some(path) = self.pending.pop_front() {
            match image::open(&path) {
                Ok(img) => return Ok(Some(img.to_rgb8())),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable frame"),
            }
        }
        Ok(None)
    }
}

fn is_frame_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| matches!(e.to_ascii_lowercase().as_str(), "png" | "jpg" | "jpeg" | "bmp"))
        .unwrap_or(false)
}

/// Why a live session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    EndOfStream,
    SourceFailed(String),
}

/// Totals for one live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveSummary {
    pub frames: u64,
    pub faces: u64,
    pub marked: u64,
    pub stop: StopReason,
}

/// Run recognition on every frame of `source` until cancelled or the
/// stream ends.
///
/// Cancellation is checked between frames, so a frame that has started is
/// always processed to completion. A source failure ends the session and is
/// reported in [`LiveSummary::stop`]; a ledger failure is returned as an error.
pub fn run_live(
    source: &mut dyn FrameSource,
    pipeline: &AttendancePipeline,
    extractor: &mut dyn FaceExtractor,
    cancel: &CancellationToken,
    mut on_frame: impl FnMut(u64, &Recognition),
) -> Result<LiveSummary, PipelineError> {
    let mut summary = LiveSummary {
        frames: 0,
        faces: 0,
        marked: 0,
        stop: StopReason::EndOfStream,
    };

    tracing::info!("live session started");
    loop {
        if cancel.is_cancelled() {
            summary.stop = StopReason::Cancelled;
            break;
        }

        let frame = match source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "frame source failed; ending session");
                summary.stop = StopReason::SourceFailed(e.to_string());
                break;
            }
        };

        let recognition = pipeline.recognize(extractor, &frame)?;
        summary.frames += 1;
        summary.faces += recognition.face_count as u64;
        summary.marked += recognition.marked() as u64;
        on_frame(summary.frames, &recognition);
    }

    tracing::info!(
        frames = summary.frames,
        faces = summary.faces,
        marked = summary.marked,
        stop = ?summary.stop,
        "live session ended"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tests::{frame, pipeline, png, PixelFaces};
    use rollcall_store::EnrollImage;

    struct Frames(VecDeque<Result<RgbImage, String>>);

    impl FrameSource for Frames {
        fn next_frame(&mut self) -> Result<Option<RgbImage>, SourceError> {
            match self.0.pop_front() {
                Some(Ok(image)) => Ok(Some(image)),
                Some(Err(msg)) => Err(CameraError::CaptureFailed(msg).into()),
                None => Ok(None),
            }
        }
    }

    fn frames(items: Vec<Result<RgbImage, String>>) -> Frames {
        Frames(items.into())
    }

    #[test]
    fn test_same_person_across_frames_marked_once() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path());
        pipeline
            .store()
            .enroll("Dana", &[EnrollImage::new("dana.png", png(&[[40, 40, 0]]))], &mut PixelFaces)
            .unwrap();

        let face = frame(&[[40, 41, 0]]);
        let mut source = frames(vec![Ok(face.clone()), Ok(face.clone()), Ok(face)]);
        let mut seen = Vec::new();
        let summary = run_live(
            &mut source,
            &pipeline,
            &mut PixelFaces,
            &CancellationToken::new(),
            |n, r| seen.push((n, r.messages().map(str::to_string).collect::<Vec<_>>())),
        )
        .unwrap();

        assert_eq!(summary.frames, 3);
        assert_eq!(summary.faces, 3);
        assert_eq!(summary.marked, 1);
        assert_eq!(summary.stop, StopReason::EndOfStream);
        assert_eq!(seen[0], (1, vec!["Dana - Attendance Marked".to_string()]));
        assert_eq!(seen[2], (3, vec!["Dana - Already Marked Today".to_string()]));
        assert_eq!(pipeline.ledger().len(), 1);
    }

    #[test]
    fn test_cancel_before_start_processes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut source = frames(vec![Ok(frame(&[[1, 1, 1]]))]);
        let summary = run_live(&mut source, &pipeline, &mut PixelFaces, &cancel, |_, _| {}).unwrap();
        assert_eq!(summary.frames, 0);
        assert_eq!(summary.stop, StopReason::Cancelled);
    }

    #[test]
    fn test_cancel_between_frames() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path());
        let cancel = CancellationToken::new();

        let mut source = frames(vec![Ok(frame(&[])), Ok(frame(&[])), Ok(frame(&[]))]);
        let summary = run_live(&mut source, &pipeline, &mut PixelFaces, &cancel, |n, _| {
            if n == 2 {
                cancel.cancel();
            }
        })
        .unwrap();
        assert_eq!(summary.frames, 2);
        assert_eq!(summary.stop, StopReason::Cancelled);
    }

    #[test]
    fn test_source_failure_ends_session() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path());

        let mut source = frames(vec![Ok(frame(&[])), Err("unplugged".into()), Ok(frame(&[]))]);
        let summary = run_live(
            &mut source,
            &pipeline,
            &mut PixelFaces,
            &CancellationToken::new(),
            |_, _| {},
        )
        .unwrap();
        assert_eq!(summary.frames, 1);
        assert!(matches!(summary.stop, StopReason::SourceFailed(ref m) if m.contains("unplugged")));
    }

    #[test]
    fn test_directory_source_sorted_and_skips_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.png"), png(&[[2, 0, 0]])).unwrap();
        std::fs::write(dir.path().join("a.png"), png(&[[1, 0, 0]])).unwrap();
        std::fs::write(dir.path().join("c.png"), b"not an image").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let mut source = DirectorySource::open(dir.path()).unwrap();
        assert_eq!(source.remaining(), 3);

        let first = source.next_frame().unwrap().unwrap();
        let second = source.next_frame().unwrap().unwrap();
        assert_eq!(first.get_pixel(0, 0).0, [1, 0, 0]);
        assert_eq!(second.get_pixel(0, 0).0, [2, 0, 0]);
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_directory_source_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let err = DirectorySource::open(&dir.path().join("missing")).err().unwrap();
        assert!(matches!(err, SourceError::Storage { .. }));
    }
}
