//! Enrollment store: reference images on disk, registry in memory.
//!
//! Each accepted reference image is written to the store directory as
//! `<Storage_Key>.<content tag>.<ext>`. The in-memory [`Registry`] is
//! replaced wholesale on every change, so readers holding a snapshot never
//! observe a partially built registry.

use image::{ImageFormat, RgbImage};
use rollcall_core::naming::{self, CONTENT_TAG_LEN};
use rollcall_core::{FaceExtractor, FeatureVector, Registry};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;

/// Extensions considered reference images on reload.
const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid identity name: {0:?}")]
    InvalidName(String),
    #[error("reference store unavailable at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    fn storage(path: &Path, source: std::io::Error) -> Self {
        StoreError::Storage {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Why a single image did not contribute a reference vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    UnreadableImage(String),
    NoFaceDetected,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::UnreadableImage(detail) => write!(f, "unreadable image: {detail}"),
            FailureReason::NoFaceDetected => f.write_str("no face found"),
        }
    }
}

/// A per-image failure, reported alongside successes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFailure {
    /// Source file name or label of the image.
    pub source: String,
    pub reason: FailureReason,
}

/// An image submitted for enrollment.
#[derive(Debug, Clone)]
pub struct EnrollImage {
    /// Label used in reports, usually the uploaded file name.
    pub source: String,
    pub bytes: Vec<u8>,
}

impl EnrollImage {
    pub fn new(source: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            source: source.into(),
            bytes,
        }
    }

    /// Read an image file from disk.
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        Ok(Self {
            source: path.display().to_string(),
            bytes: fs::read(path)?,
        })
    }

    /// Read every file in `paths`. Files that cannot be read are returned
    /// as failures instead of aborting the batch.
    pub fn read_all<P: AsRef<Path>>(paths: &[P]) -> (Vec<EnrollImage>, Vec<ImageFailure>) {
        let mut images = Vec::with_capacity(paths.len());
        let mut failures = Vec::new();
        for path in paths {
            let path = path.as_ref();
            match Self::from_path(path) {
                Ok(image) => images.push(image),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "cannot read enrollment image");
                    failures.push(ImageFailure {
                        source: path.display().to_string(),
                        reason: FailureReason::UnreadableImage(e.to_string()),
                    });
                }
            }
        }
        (images, failures)
    }
}

/// Result of an [`EnrollmentStore::enroll`] call.
#[derive(Debug, Clone)]
pub struct EnrollmentOutcome {
    /// Normalized display name the images were enrolled under.
    pub name: String,
    /// Reference files backing the accepted images.
    pub stored: Vec<PathBuf>,
    pub failures: Vec<ImageFailure>,
}

impl EnrollmentOutcome {
    /// True when at least one image contributed a reference vector.
    pub fn is_success(&self) -> bool {
        !self.stored.is_empty()
    }
}

/// Result of an [`EnrollmentStore::reload`] call.
#[derive(Debug, Clone, Default)]
pub struct ReloadReport {
    pub identities: usize,
    pub references: usize,
    pub skipped: Vec<ImageFailure>,
}

/// Registry of known identities backed by a directory of reference images.
pub struct EnrollmentStore {
    dir: PathBuf,
    current: RwLock<Arc<Registry>>,
    /// Serializes enroll and reload so neither can drop the other's update.
    writer: Mutex<()>,
}

impl EnrollmentStore {
    /// Open (creating if needed) the reference directory. The registry starts
    /// empty; call [`reload`](Self::reload) to populate it.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StoreError::storage(&dir, e))?;
        Ok(Self {
            dir,
            current: RwLock::new(Arc::new(Registry::new())),
            writer: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The current complete registry.
    pub fn snapshot(&self) -> Arc<Registry> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn replace(&self, registry: Registry) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(registry);
    }

    /// Enroll `images` under `name`.
    ///
    /// Only the first face of each image is used. Images that cannot be
    /// decoded or contain no face are reported in the outcome and skipped.
    /// If writing a reference file fails, files written by this call are
    /// removed and the registry is left untouched.
    pub fn enroll(
        &self,
        name: &str,
        images: &[EnrollImage],
        extractor: &mut dyn FaceExtractor,
    ) -> Result<EnrollmentOutcome, StoreError> {
        let display = naming::display_name(name)
            .ok_or_else(|| StoreError::InvalidName(name.to_string()))?;
        let key = naming::storage_key(&display);

        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let snapshot = self.snapshot();

        let mut outcome = EnrollmentOutcome {
            name: display.clone(),
            stored: Vec::new(),
            failures: Vec::new(),
        };
        let mut written: Vec<PathBuf> = Vec::new();
        let mut additions: Vec<FeatureVector> = Vec::new();

        for image in images {
            let (vector, decoded, format) = match first_face(&image.bytes, extractor) {
                Ok(found) => found,
                Err(reason) => {
                    tracing::warn!(source = %image.source, %reason, "enrollment image rejected");
                    outcome.failures.push(ImageFailure {
                        source: image.source.clone(),
                        reason,
                    });
                    continue;
                }
            };

            let persisted = reference_payload(format, &image.bytes, &decoded).and_then(|(ext, payload)| {
                let path = self
                    .dir
                    .join(format!("{key}.{}.{ext}", content_tag(&payload)));
                if path.exists() {
                    tracing::debug!(path = %path.display(), "reference image already stored");
                } else {
                    write_atomic(&path, &payload)?;
                    written.push(path.clone());
                }
                Ok(path)
            });
            let path = match persisted {
                Ok(path) => path,
                Err(e) => {
                    for done in &written {
                        let _ = fs::remove_file(done);
                    }
                    return Err(StoreError::storage(&self.dir, e));
                }
            };

            let known = snapshot
                .get(&display)
                .is_some_and(|identity| identity.references.contains(&vector));
            if !known && !additions.contains(&vector) {
                additions.push(vector);
            }
            outcome.stored.push(path);
        }

        if !additions.is_empty() {
            let mut next = (*snapshot).clone();
            for vector in additions {
                next.add_reference(&display, vector);
            }
            self.replace(next);
        }

        let display_name = &display;
        tracing::info!(
            name = %display_name,
            stored = outcome.stored.len(),
            failed = outcome.failures.len(),
            "enrollment finished"
        );
        Ok(outcome)
    }

    /// Rebuild the registry from the reference directory.
    ///
    /// Files are visited in file-name order. Unreadable or faceless files
    /// are skipped with a warning; only a missing or unreadable directory
    /// fails the reload, in which case the previous registry stays active.
    pub fn reload(&self, extractor: &mut dyn FaceExtractor) -> Result<ReloadReport, StoreError> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        let mut files: Vec<PathBuf> = fs::read_dir(&self.dir)
            .map_err(|e| StoreError::storage(&self.dir, e))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && has_image_extension(path))
            .collect();
        files.sort();

        let mut registry = Registry::new();
        let mut report = ReloadReport::default();

        for path in files {
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            let loaded = naming::name_from_file(&file_name)
                .ok_or_else(|| FailureReason::UnreadableImage("file name is not a valid identity".into()))
                .and_then(|name| {
                    let bytes = fs::read(&path)
                        .map_err(|e| FailureReason::UnreadableImage(e.to_string()))?;
                    let (vector, _, _) = first_face(&bytes, &mut *extractor)?;
                    Ok((name, vector))
                });

            match loaded {
                Ok((name, vector)) => registry.add_reference(&name, vector),
                Err(reason) => {
                    tracing::warn!(file = %file_name, %reason, "skipping reference image");
                    report.skipped.push(ImageFailure {
                        source: file_name,
                        reason,
                    });
                }
            }
        }

        report.identities = registry.len();
        report.references = registry.reference_count();
        self.replace(registry);

        tracing::info!(
            dir = %self.dir.display(),
            identities = report.identities,
            references = report.references,
            skipped = report.skipped.len(),
            "registry reloaded"
        );
        Ok(report)
    }
}

/// Decode `bytes` and return the first face's vector.
fn first_face(
    bytes: &[u8],
    extractor: &mut dyn FaceExtractor,
) -> Result<(FeatureVector, RgbImage, ImageFormat), FailureReason> {
    let format =
        image::guess_format(bytes).map_err(|e| FailureReason::UnreadableImage(e.to_string()))?;
    let decoded = image::load_from_memory_with_format(bytes, format)
        .map_err(|e| FailureReason::UnreadableImage(e.to_string()))?
        .to_rgb8();

    let detections = extractor.extract(&decoded).map_err(|e| {
        tracing::warn!(error = %e, "feature extraction failed");
        FailureReason::NoFaceDetected
    })?;
    let first = detections
        .into_iter()
        .next()
        .ok_or(FailureReason::NoFaceDetected)?;

    Ok((first.vector, decoded, format))
}

/// Bytes to store for an accepted image, with their extension. PNG and JPEG
/// are kept verbatim; anything else is re-encoded as PNG.
fn reference_payload(
    format: ImageFormat,
    original: &[u8],
    decoded: &RgbImage,
) -> std::io::Result<(&'static str, Vec<u8>)> {
    match format {
        ImageFormat::Png => Ok(("png", original.to_vec())),
        ImageFormat::Jpeg => Ok(("jpg", original.to_vec())),
        _ => Ok(("png", encode_png(decoded)?)),
    }
}

fn content_tag(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..CONTENT_TAG_LEN].to_string()
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| IMAGE_EXTENSIONS.iter().any(|known| e.eq_ignore_ascii_case(known)))
}

fn encode_png(image: &RgbImage) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .map_err(std::io::Error::other)?;
    Ok(buf)
}

/// Write via a hidden temp file and rename, so a crash never leaves a
/// truncated reference image behind.
fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        e
    })
}
