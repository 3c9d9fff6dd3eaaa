use crate::live::{self, FrameSource, LiveSummary, SourceError};
use crate::pipeline::{AttendancePipeline, FaceResult, PipelineError, Recognition};
use image::RgbImage;
use rollcall_core::FaceExtractor;
use rollcall_store::{EnrollImage, EnrollmentOutcome, ReloadReport, StoreError};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("enrollment store: {0}")]
    Store(#[from] StoreError),
    #[error("{0}")]
    Pipeline(#[from] PipelineError),
    #[error("frame source: {0}")]
    Source(#[from] SourceError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Opens a frame source on the engine thread.
///
/// Camera handles are created where they are used, so the source itself
/// never has to cross threads.
pub type SourceFactory = Box<dyn FnOnce() -> Result<Box<dyn FrameSource>, SourceError> + Send>;

/// Per-frame progress of a watch session.
#[derive(Debug, Clone)]
pub struct FrameReport {
    pub frame: u64,
    pub faces: Vec<FaceResult>,
}

/// Messages sent from async callers to the engine thread.
enum EngineRequest {
    Enroll {
        name: String,
        images: Vec<EnrollImage>,
        reply: oneshot::Sender<Result<EnrollmentOutcome, EngineError>>,
    },
    Reload {
        reply: oneshot::Sender<Result<ReloadReport, EngineError>>,
    },
    Recognize {
        image: RgbImage,
        reply: oneshot::Sender<Result<Recognition, EngineError>>,
    },
    RecognizeEncoded {
        bytes: Vec<u8>,
        reply: oneshot::Sender<Result<Recognition, EngineError>>,
    },
    Watch {
        open: SourceFactory,
        cancel: CancellationToken,
        reports: Option<mpsc::UnboundedSender<FrameReport>>,
        reply: oneshot::Sender<Result<LiveSummary, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, EngineError>>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Enroll reference images under `name`.
    pub async fn enroll(
        &self,
        name: impl Into<String>,
        images: Vec<EnrollImage>,
    ) -> Result<EnrollmentOutcome, EngineError> {
        let name = name.into();
        self.call(|reply| EngineRequest::Enroll { name, images, reply })
            .await
    }

    /// Rebuild the registry from the reference directory.
    pub async fn reload(&self) -> Result<ReloadReport, EngineError> {
        self.call(|reply| EngineRequest::Reload { reply }).await
    }

    /// Recognize faces in one image and record attendance.
    pub async fn recognize(&self, image: RgbImage) -> Result<Recognition, EngineError> {
        self.call(|reply| EngineRequest::Recognize { image, reply })
            .await
    }

    /// Decode and recognize an encoded image file's contents. Undecodable
    /// data yields a recognition with no faces.
    pub async fn recognize_encoded(&self, bytes: Vec<u8>) -> Result<Recognition, EngineError> {
        self.call(|reply| EngineRequest::RecognizeEncoded { bytes, reply })
            .await
    }

    /// Run a live session until `cancel` fires or the source ends.
    ///
    /// The engine is busy for the whole session; other requests queue
    /// behind it.
    pub async fn watch(
        &self,
        open: SourceFactory,
        cancel: CancellationToken,
        reports: Option<mpsc::UnboundedSender<FrameReport>>,
    ) -> Result<LiveSummary, EngineError> {
        self.call(|reply| EngineRequest::Watch {
            open,
            cancel,
            reports,
            reply,
        })
        .await
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread owns `extractor` and handles one request at a time, so
/// frames never overlap. It exits once every [`EngineHandle`] is dropped.
pub fn spawn_engine(
    mut extractor: Box<dyn FaceExtractor + Send>,
    pipeline: AttendancePipeline,
) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                handle_request(req, &pipeline, extractor.as_mut());
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

fn handle_request(
    req: EngineRequest,
    pipeline: &AttendancePipeline,
    extractor: &mut dyn FaceExtractor,
) {
    match req {
        EngineRequest::Enroll {
            name,
            images,
            reply,
        } => {
            let result = pipeline
                .store()
                .enroll(&name, &images, extractor)
                .map_err(EngineError::from);
            let _ = reply.send(result);
        }
        EngineRequest::Reload { reply } => {
            let result = pipeline.store().reload(extractor).map_err(EngineError::from);
            let _ = reply.send(result);
        }
        EngineRequest::Recognize { image, reply } => {
            let result = pipeline
                .recognize(extractor, &image)
                .map_err(EngineError::from);
            let _ = reply.send(result);
        }
        EngineRequest::RecognizeEncoded { bytes, reply } => {
            let result = pipeline
                .recognize_encoded(extractor, &bytes)
                .map_err(EngineError::from);
            let _ = reply.send(result);
        }
        EngineRequest::Watch {
            open,
            cancel,
            reports,
            reply,
        } => {
            let _ = reply.send(run_watch(open, &cancel, reports, pipeline, extractor));
        }
    }
}

fn run_watch(
    open: SourceFactory,
    cancel: &CancellationToken,
    reports: Option<mpsc::UnboundedSender<FrameReport>>,
    pipeline: &AttendancePipeline,
    extractor: &mut dyn FaceExtractor,
) -> Result<LiveSummary, EngineError> {
    let mut source = open()?;
    let summary = live::run_live(source.as_mut(), pipeline, extractor, cancel, |frame, r| {
        if let Some(tx) = &reports {
            // A caller that stopped listening still gets the summary.
            let _ = tx.send(FrameReport {
                frame,
                faces: r.faces.clone(),
            });
        }
    })?;
    Ok(summary)
}
