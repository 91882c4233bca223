//! Shared data structures for the library state.
//!
//! These structs represent the data model that flows between the store,
//! the library manager and whatever presents it. Field names are persisted
//! in camelCase.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Id of the folder that exists before the user creates any.
pub const UNTITLED_FOLDER_ID: &str = "untitled-folder";

/// Display name of the bootstrap folder.
pub const UNTITLED_FOLDER_NAME: &str = "Untitled Folder";

/// Represents a single image in the library
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    /// Unique id, generated at creation
    pub id: String,
    /// Display name (usually the uploaded file name)
    pub name: String,
    /// Encoded preview of the normalized source image
    pub base64_original: String,
    /// Encoded preview of the processed image, once the remote call succeeded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base64_result: Option<String>,
    /// Owning folder
    pub folder_id: String,
}

impl Image {
    /// Build a new image record with a fresh id and no result.
    pub fn new(folder_id: &str, name: &str, base64_original: &str) -> Self {
        Self {
            id: new_id(),
            name: name.to_string(),
            base64_original: base64_original.to_string(),
            base64_result: None,
            folder_id: folder_id.to_string(),
        }
    }

    pub fn has_result(&self) -> bool {
        self.base64_result.is_some()
    }
}

/// Persisted folder descriptor. The image list is never stored.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FolderRecord {
    pub id: String,
    pub name: String,
}

impl FolderRecord {
    pub fn new(name: &str) -> Self {
        Self {
            id: new_id(),
            name: name.to_string(),
        }
    }

    /// The bootstrap folder
    pub fn untitled() -> Self {
        Self {
            id: UNTITLED_FOLDER_ID.to_string(),
            name: UNTITLED_FOLDER_NAME.to_string(),
        }
    }
}

/// A folder together with its images, as presented to readers.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Folder {
    pub id: String,
    pub name: String,
    /// Images whose `folder_id` matches, in creation order
    pub images: Vec<Image>,
}

/// Folders collection used when nothing has been persisted yet.
pub fn default_folders() -> Vec<FolderRecord> {
    vec![FolderRecord::untitled()]
}

/// Compute the folder view from the two base collections.
///
/// This is a pure projection: it is recomputed from scratch on every call
/// and never cached alongside the collections. Images referencing an unknown
/// folder appear in no folder.
pub fn derive_folders(records: &[FolderRecord], images: &[Image]) -> Vec<Folder> {
    records
        .iter()
        .map(|record| Folder {
            id: record.id.clone(),
            name: record.name.clone(),
            images: images
                .iter()
                .filter(|image| image.folder_id == record.id)
                .cloned()
                .collect(),
        })
        .collect()
}

pub(crate) fn new_id() -> String {
    Uuid::new_v4().to_string()
}
