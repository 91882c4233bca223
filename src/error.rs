//! Error types for the image library.
//!
//! Each layer gets its own enum so callers can match on what actually went
//! wrong: storage, lookups, the remote service, or a whole upload.

use std::path::PathBuf;
use thiserror::Error;

use crate::state::data::Image;

/// Failures writing to (or opening) the persistent store.
///
/// Reads never produce this: a missing or unreadable payload falls back to
/// the caller's default.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Failed to serialize value for key '{key}': {source}")]
    Serialize {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("IO error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failures from the library mutation API.
#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("No image with id {0}")]
    ImageNotFound(String),

    #[error("No folder with id {0}")]
    FolderNotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LibraryError {
    /// True for the lookup failures (image or folder id absent).
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            LibraryError::ImageNotFound(_) | LibraryError::FolderNotFound(_)
        )
    }
}

/// Failures talking to the background removal service.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("Request to {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Bad response from server: HTTP {status}")]
    Status { status: u16 },

    #[error("Unexpected response body: {0}")]
    UnexpectedBody(String),
}

/// A preview string that is not a base64 data URL we can decode.
#[derive(Debug, Error)]
pub enum PreviewError {
    #[error("Preview is not a base64 data URL")]
    NotDataUrl,

    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Failures of a single upload, reported to whoever started it.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to decode image '{name}': {message}")]
    Decode { name: String, message: String },

    #[error(transparent)]
    Library(#[from] LibraryError),

    /// The image is registered and visible, but has no result attached.
    #[error("Background removal failed for image {}: {source}", .image.id)]
    Remote {
        image: Box<Image>,
        #[source]
        source: RemoteError,
    },

    #[error("Stored original of image {image_id} is unusable: {source}")]
    Preview {
        image_id: String,
        #[source]
        source: PreviewError,
    },
}

impl UploadError {
    /// The image left in the library by a failed upload, if one was registered.
    pub fn registered_image(&self) -> Option<&Image> {
        match self {
            UploadError::Remote { image, .. } => Some(image),
            _ => None,
        }
    }
}

/// Missing or malformed configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing configuration value {0}")]
    Missing(&'static str),

    #[error("Invalid value for {name}: {message}")]
    Invalid { name: &'static str, message: String },
}
