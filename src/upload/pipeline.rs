//! The upload pipeline.
//!
//! Each upload walks one linear path:
//!
//! `Received → Normalized → Registered → Submitted → Completed`
//!
//! and can drop to `Failed` while decoding, registering or waiting on the
//! service. The image is registered before the network call so the original
//! is visible right away; a failed call leaves it in the library without a
//! result. Nothing is retried or rolled back here.

use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::normalize::{self, strip_preview_header, to_preview, MAX_DIMENSION};
use super::remover::BackgroundRemover;
use crate::error::{LibraryError, PreviewError, UploadError};
use crate::state::data::Image;
use crate::state::library::Library;

/// Capacity of the progress channel. Slow receivers miss old events.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Where an upload currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStage {
    Received,
    Normalized,
    Registered,
    Submitted,
    Completed,
    Failed,
}

impl UploadStage {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_advance_to(self, next: UploadStage) -> bool {
        use UploadStage::*;
        matches!(
            (self, next),
            (Received, Normalized)
                | (Normalized, Registered)
                | (Registered, Submitted)
                | (Submitted, Completed)
                | (Received | Normalized | Submitted, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, UploadStage::Completed | UploadStage::Failed)
    }
}

impl fmt::Display for UploadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            UploadStage::Received => "received",
            UploadStage::Normalized => "normalized",
            UploadStage::Registered => "registered",
            UploadStage::Submitted => "submitted",
            UploadStage::Completed => "completed",
            UploadStage::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Progress notification, sent on every stage change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadEvent {
    /// Per-pipeline counter identifying the upload
    pub upload_id: u64,
    pub file_name: String,
    /// Set once the image is registered
    pub image_id: Option<String>,
    pub stage: UploadStage,
}

/// Tracks one upload's stage and publishes every change.
struct UploadTracker<'a> {
    upload_id: u64,
    file_name: String,
    image_id: Option<String>,
    stage: UploadStage,
    events: &'a broadcast::Sender<UploadEvent>,
}

impl<'a> UploadTracker<'a> {
    fn start(
        upload_id: u64,
        name: &str,
        image_id: Option<String>,
        stage: UploadStage,
        events: &'a broadcast::Sender<UploadEvent>,
    ) -> Self {
        let tracker = Self {
            upload_id,
            file_name: name.to_string(),
            image_id,
            stage,
            events,
        };
        tracker.publish();
        tracker
    }

    fn advance(&mut self, next: UploadStage) {
        debug_assert!(
            self.stage.can_advance_to(next),
            "illegal upload transition {} -> {}",
            self.stage,
            next
        );
        self.stage = next;
        debug!(upload_id = self.upload_id, file_name = %self.file_name, stage = %next, "Upload advanced");
        self.publish();
    }

    fn registered(&mut self, image_id: &str) {
        self.image_id = Some(image_id.to_string());
        self.advance(UploadStage::Registered);
    }

    fn fail(&mut self, error: &UploadError) {
        warn!(
            upload_id = self.upload_id,
            file_name = %self.file_name,
            image_id = ?self.image_id,
            stage = %self.stage,
            error = %error,
            "Upload failed"
        );
        self.advance(UploadStage::Failed);
    }

    fn publish(&self) {
        // No receivers is fine: progress is optional.
        let _ = self.events.send(UploadEvent {
            upload_id: self.upload_id,
            file_name: self.file_name.clone(),
            image_id: self.image_id.clone(),
            stage: self.stage,
        });
    }
}

/// Turns raw image files into library images with a processed result.
pub struct UploadPipeline {
    library: Arc<Library>,
    remover: Arc<dyn BackgroundRemover>,
    max_dimension: u32,
    events: broadcast::Sender<UploadEvent>,
    next_upload_id: AtomicU64,
}

impl UploadPipeline {
    pub fn new(library: Arc<Library>, remover: Arc<dyn BackgroundRemover>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            library,
            remover,
            max_dimension: MAX_DIMENSION,
            events,
            next_upload_id: AtomicU64::new(1),
        }
    }

    /// Override the bounding box images are shrunk to.
    pub fn with_max_dimension(mut self, max_dimension: u32) -> Self {
        self.max_dimension = max_dimension;
        self
    }

    pub fn library(&self) -> &Arc<Library> {
        &self.library
    }

    /// Receive an [`UploadEvent`] for every stage change of every upload.
    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.events.subscribe()
    }

    /// Upload an in-memory image file into `folder_id`.
    ///
    /// On success the returned image carries its result. On
    /// [`UploadError::Remote`] the image stays in the library without one.
    pub async fn upload(
        &self,
        folder_id: &str,
        name: &str,
        bytes: Vec<u8>,
    ) -> Result<Image, UploadError> {
        let mut tracker = self.track(name, None, UploadStage::Received);
        info!(upload_id = tracker.upload_id, name, folder_id, bytes = bytes.len(), "Upload received");

        let normalized = match normalize::normalize(name, bytes, self.max_dimension).await {
            Ok(normalized) => normalized,
            Err(e) => {
                tracker.fail(&e);
                return Err(e);
            }
        };
        tracker.advance(UploadStage::Normalized);

        let image = match self
            .library
            .add_image(folder_id, name, &normalized.preview())
        {
            Ok(image) => image,
            Err(e) => {
                let e = UploadError::from(e);
                tracker.fail(&e);
                return Err(e);
            }
        };
        tracker.registered(&image.id);

        self.submit(&mut tracker, image, &normalized.payload()).await
    }

    /// Read `path` and upload it, named after the file.
    pub async fn upload_file(
        &self,
        folder_id: &str,
        path: impl AsRef<Path>,
    ) -> Result<Image, UploadError> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());

        match tokio::fs::read(path).await {
            Ok(bytes) => self.upload(folder_id, &name, bytes).await,
            Err(source) => {
                let e = UploadError::Read {
                    path: path.to_path_buf(),
                    source,
                };
                self.track(&name, None, UploadStage::Received).fail(&e);
                Err(e)
            }
        }
    }

    /// Send an already registered image for processing again and replace
    /// its result. The caller decides when to retry; nothing here does.
    pub async fn reprocess(&self, image_id: &str) -> Result<Image, UploadError> {
        let image = self
            .library
            .image(image_id)
            .ok_or_else(|| LibraryError::ImageNotFound(image_id.to_string()))?;

        if !image.base64_original.starts_with("data:") {
            return Err(UploadError::Preview {
                image_id: image.id.clone(),
                source: PreviewError::NotDataUrl,
            });
        }
        let payload = strip_preview_header(&image.base64_original).to_string();

        let mut tracker = self.track(&image.name, Some(image.id.clone()), UploadStage::Registered);
        info!(upload_id = tracker.upload_id, image_id, "Reprocessing image");
        self.submit(&mut tracker, image, &payload).await
    }

    async fn submit(
        &self,
        tracker: &mut UploadTracker<'_>,
        image: Image,
        payload: &str,
    ) -> Result<Image, UploadError> {
        tracker.advance(UploadStage::Submitted);

        let result = match self.remover.remove_background(payload).await {
            Ok(result) => result,
            Err(source) => {
                let e = UploadError::Remote {
                    image: Box::new(image),
                    source,
                };
                tracker.fail(&e);
                return Err(e);
            }
        };

        match self
            .library
            .add_result_to_image(&image.id, &to_preview(strip_preview_header(&result)))
        {
            Ok(image) => {
                tracker.advance(UploadStage::Completed);
                info!(upload_id = tracker.upload_id, image_id = %image.id, "Upload completed");
                Ok(image)
            }
            Err(e) => {
                let e = UploadError::from(e);
                tracker.fail(&e);
                Err(e)
            }
        }
    }

    fn track(&self, name: &str, image_id: Option<String>, stage: UploadStage) -> UploadTracker<'_> {
        let upload_id = self.next_upload_id.fetch_add(1, Ordering::Relaxed);
        UploadTracker::start(upload_id, name, image_id, stage, &self.events)
    }
}

impl fmt::Debug for UploadPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadPipeline")
            .field("library", &self.library)
            .field("max_dimension", &self.max_dimension)
            .finish_non_exhaustive()
    }
}
