//! Cutout: an image library with folders and remote background removal.
//!
//! The [`Library`] owns folders and images on top of a durable [`Store`];
//! the [`UploadPipeline`] turns raw image files into library images and
//! attaches the processed result returned by a [`BackgroundRemover`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use cutout::{HttpRemover, Library, RemoverConfig, Store, UploadPipeline};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let store = Store::open("library.db")?;
//! let library = Arc::new(Library::new(store));
//! let remover = HttpRemover::new(&RemoverConfig::from_env()?)?;
//! let pipeline = UploadPipeline::new(Arc::clone(&library), Arc::new(remover));
//!
//! let folder = library.add_folder("Pets")?;
//! let image = pipeline.upload_file(&folder.id, "cat.png").await?;
//! assert!(image.has_result());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod state;
pub mod upload;

pub use config::RemoverConfig;
pub use error::{ConfigError, LibraryError, PreviewError, RemoteError, StoreError, UploadError};
pub use state::data::{Folder, FolderRecord, Image, UNTITLED_FOLDER_ID};
pub use state::library::{Library, LibraryView};
pub use state::store::{Store, Subscription};
pub use upload::pipeline::{UploadEvent, UploadPipeline, UploadStage};
pub use upload::remover::{BackgroundRemover, HttpRemover};
