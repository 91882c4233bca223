//! The library manager: the only code that mutates folders and images.
//!
//! Every mutation is a read-modify-write of a whole collection, run inside a
//! single store transaction so that concurrent callers (for example two
//! uploads finishing at the same time) can't overwrite each other's changes.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

use super::data::{default_folders, derive_folders, new_id, Folder, FolderRecord, Image};
use super::store::{Store, StoreTransaction, Subscription};
use crate::error::LibraryError;

/// Store key of the images collection
pub const IMAGES_KEY: &str = "images";
/// Store key of the folder descriptors
pub const FOLDERS_KEY: &str = "folders";

/// Snapshot of both base collections.
///
/// Folder contents are not part of the snapshot; [`LibraryView::folders`]
/// derives them on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryView {
    folders: Vec<FolderRecord>,
    images: Vec<Image>,
}

impl LibraryView {
    pub fn folders(&self) -> Vec<Folder> {
        derive_folders(&self.folders, &self.images)
    }

    pub fn folder_records(&self) -> &[FolderRecord] {
        &self.folders
    }

    pub fn images(&self) -> &[Image] {
        &self.images
    }

    pub fn image(&self, image_id: &str) -> Option<&Image> {
        self.images.iter().find(|image| image.id == image_id)
    }
}

/// The Library manages folders and images on top of a [`Store`].
pub struct Library {
    store: Store,
    view: Arc<watch::Sender<LibraryView>>,
    _subscriptions: [Subscription; 2],
}

impl Library {
    /// Create a library over `store`, loading whatever it already holds.
    pub fn new(store: Store) -> Self {
        let (sender, _) = watch::channel(LibraryView {
            folders: default_folders(),
            images: Vec::new(),
        });
        let view = Arc::new(sender);

        // Both subscriptions load their current value themselves, ordered
        // against writes that race with construction.
        let folders_view = Arc::clone(&view);
        let folders_subscription =
            store.subscribe_current(FOLDERS_KEY, default_folders(), move |folders| {
                folders_view.send_modify(|view| view.folders = folders);
            });

        let images_view = Arc::clone(&view);
        let images_subscription =
            store.subscribe_current(IMAGES_KEY, Vec::<Image>::new(), move |images| {
                images_view.send_modify(|view| view.images = images);
            });

        {
            let loaded = view.borrow();
            info!(
                folders = loaded.folders.len(),
                images = loaded.images.len(),
                "Library loaded"
            );
        }

        Self {
            store,
            view,
            _subscriptions: [folders_subscription, images_subscription],
        }
    }

    /// Pick up changes another process committed to the same database and
    /// refresh the view. Returns `true` if anything changed.
    pub fn poll_external_changes(&self) -> Result<bool, LibraryError> {
        Ok(self.store.poll_external_changes()?)
    }

    /// Create a folder and return its descriptor.
    pub fn add_folder(&self, name: &str) -> Result<FolderRecord, LibraryError> {
        let folder = self.store.transaction(|tx| -> Result<_, LibraryError> {
            let mut folders = read_folders(tx);
            let mut folder = FolderRecord::new(name);
            while folders.iter().any(|f| f.id == folder.id) {
                folder.id = new_id();
            }
            folders.push(folder.clone());
            tx.write(FOLDERS_KEY, &folders)?;
            Ok(folder)
        })?;

        info!(folder_id = %folder.id, name = %folder.name, "Folder created");
        Ok(folder)
    }

    /// Register a new image (without result) in `folder_id`.
    ///
    /// Fails with [`LibraryError::FolderNotFound`] if the folder doesn't exist.
    pub fn add_image(
        &self,
        folder_id: &str,
        name: &str,
        base64_original: &str,
    ) -> Result<Image, LibraryError> {
        let image = self.store.transaction(|tx| -> Result<_, LibraryError> {
            ensure_folder(tx, folder_id)?;

            let mut images = read_images(tx);
            let mut image = Image::new(folder_id, name, base64_original);
            while images.iter().any(|i| i.id == image.id) {
                image.id = new_id();
            }
            images.push(image.clone());
            tx.write(IMAGES_KEY, &images)?;
            Ok(image)
        })?;

        info!(image_id = %image.id, folder_id, name, "Image added");
        Ok(image)
    }

    /// Attach (or replace) the processed result of an image.
    pub fn add_result_to_image(
        &self,
        image_id: &str,
        base64_result: &str,
    ) -> Result<Image, LibraryError> {
        let image = self.update_image(image_id, |image| {
            image.base64_result = Some(base64_result.to_string());
        })?;

        info!(image_id, "Result attached");
        Ok(image)
    }

    /// Move an image to another folder.
    ///
    /// Fails with [`LibraryError::FolderNotFound`] if the target folder
    /// doesn't exist, so an image can never end up outside every folder.
    pub fn move_image_to_folder(
        &self,
        image_id: &str,
        folder_id: &str,
    ) -> Result<Image, LibraryError> {
        let image = self.store.transaction(|tx| -> Result<_, LibraryError> {
            ensure_folder(tx, folder_id)?;
            update_image_in(tx, image_id, |image| {
                image.folder_id = folder_id.to_string();
            })
        })?;

        info!(image_id, folder_id, "Image moved");
        Ok(image)
    }

    fn update_image(
        &self,
        image_id: &str,
        change: impl FnOnce(&mut Image),
    ) -> Result<Image, LibraryError> {
        self.store
            .transaction(|tx| update_image_in(tx, image_id, change))
    }

    /// All folders with their images, recomputed from the store.
    pub fn folders(&self) -> Vec<Folder> {
        let folders: Vec<FolderRecord> = self.store.read(FOLDERS_KEY, default_folders());
        let images: Vec<Image> = self.store.read(IMAGES_KEY, Vec::new());
        derive_folders(&folders, &images)
    }

    pub fn folder(&self, folder_id: &str) -> Option<Folder> {
        self.folders().into_iter().find(|f| f.id == folder_id)
    }

    /// All images in creation order.
    pub fn images(&self) -> Vec<Image> {
        self.store.read(IMAGES_KEY, Vec::new())
    }

    pub fn image(&self, image_id: &str) -> Option<Image> {
        self.images().into_iter().find(|i| i.id == image_id)
    }

    /// The latest snapshot seen through store notifications.
    pub fn view(&self) -> LibraryView {
        self.view.borrow().clone()
    }

    /// Observe the library. The receiver is marked changed after every
    /// write to either collection.
    pub fn watch(&self) -> watch::Receiver<LibraryView> {
        self.view.subscribe()
    }
}

impl std::fmt::Debug for Library {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Library")
            .field("store", &self.store)
            .finish()
    }
}

fn read_folders(tx: &StoreTransaction<'_>) -> Vec<FolderRecord> {
    tx.read(FOLDERS_KEY, default_folders())
}

fn read_images(tx: &StoreTransaction<'_>) -> Vec<Image> {
    tx.read(IMAGES_KEY, Vec::new())
}

fn ensure_folder(tx: &StoreTransaction<'_>, folder_id: &str) -> Result<(), LibraryError> {
    if read_folders(tx).iter().any(|f| f.id == folder_id) {
        Ok(())
    } else {
        debug!(folder_id, "Rejected unknown folder");
        Err(LibraryError::FolderNotFound(folder_id.to_string()))
    }
}

/// Replace one image record in place, keeping its position.
fn update_image_in(
    tx: &mut StoreTransaction<'_>,
    image_id: &str,
    change: impl FnOnce(&mut Image),
) -> Result<Image, LibraryError> {
    let mut images = read_images(tx);
    let image = images
        .iter_mut()
        .find(|i| i.id == image_id)
        .ok_or_else(|| LibraryError::ImageNotFound(image_id.to_string()))?;

    change(image);
    let updated = image.clone();

    tx.write(IMAGES_KEY, &images)?;
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::data::UNTITLED_FOLDER_ID;
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn library() -> Library {
        Library::new(Store::open_in_memory().unwrap())
    }

    #[test]
    fn test_fresh_library_has_untitled_folder() {
        let library = library();
        let folders = library.folders();
        assert_eq!(folders.len(), 1);
        assert_eq!(folders[0].id, UNTITLED_FOLDER_ID);
        assert!(folders[0].images.is_empty());
        assert!(library.images().is_empty());
    }

    #[test]
    fn test_full_scenario() {
        let library = library();

        let image = library
            .add_image(UNTITLED_FOLDER_ID, "cat.png", "orig")
            .unwrap();
        assert_eq!(image.base64_result, None);
        assert_eq!(image.folder_id, UNTITLED_FOLDER_ID);

        library.add_result_to_image(&image.id, "res").unwrap();
        let stored = library.image(&image.id).unwrap();
        assert_eq!(stored.base64_result.as_deref(), Some("res"));
        assert_eq!(stored.base64_original, "orig");

        let pets = library.add_folder("Pets").unwrap();
        library.move_image_to_folder(&image.id, &pets.id).unwrap();

        let untitled = library.folder(UNTITLED_FOLDER_ID).unwrap();
        let pets_folder = library.folder(&pets.id).unwrap();
        assert!(untitled.images.is_empty());
        assert_eq!(pets_folder.images.len(), 1);
        assert_eq!(pets_folder.images[0].id, image.id);
        assert_eq!(pets_folder.name, "Pets");
    }

    #[test]
    fn test_add_folder_keeps_default_folder() {
        let library = library();
        library.add_folder("Pets").unwrap();
        library.add_folder("Cars").unwrap();

        let names: Vec<String> = library.folders().into_iter().map(|f| f.name).collect();
        assert_eq!(names, vec!["Untitled Folder", "Pets", "Cars"]);
    }

    #[test]
    fn test_add_image_to_unknown_folder_is_rejected() {
        let library = library();
        let err = library.add_image("nope", "a.png", "orig").unwrap_err();
        assert!(matches!(err, LibraryError::FolderNotFound(ref id) if id == "nope"));
        assert!(library.images().is_empty());
    }

    #[test]
    fn test_every_image_references_an_existing_folder() {
        let library = library();
        let mut folder_ids = vec![UNTITLED_FOLDER_ID.to_string()];
        for i in 0..5 {
            let folder = library.add_folder(&format!("f{}", i)).unwrap();
            folder_ids.push(folder.id);
            for target in &folder_ids {
                library.add_image(target, "img.png", "orig").unwrap();
            }
        }

        let known: HashSet<String> = library.folders().into_iter().map(|f| f.id).collect();
        let images = library.images();
        assert_eq!(images.len(), 20);
        assert!(images.iter().all(|i| known.contains(&i.folder_id)));

        let ids: HashSet<&str> = images.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids.len(), images.len());

        let listed: usize = library.folders().iter().map(|f| f.images.len()).sum();
        assert_eq!(listed, images.len());
    }

    #[test]
    fn test_result_overwrite_is_last_write_wins() {
        let library = library();
        let image = library.add_image(UNTITLED_FOLDER_ID, "a.png", "orig").unwrap();

        library.add_result_to_image(&image.id, "first").unwrap();
        let updated = library.add_result_to_image(&image.id, "second").unwrap();

        assert_eq!(updated.base64_result.as_deref(), Some("second"));
        assert_eq!(updated.name, image.name);
        assert_eq!(updated.folder_id, image.folder_id);
        assert_eq!(library.image(&image.id).unwrap(), updated);
    }

    #[test]
    fn test_move_changes_exactly_one_field_of_one_image() {
        let library = library();
        let first = library.add_image(UNTITLED_FOLDER_ID, "a.png", "a").unwrap();
        let second = library.add_image(UNTITLED_FOLDER_ID, "b.png", "b").unwrap();
        library.add_result_to_image(&first.id, "res").unwrap();
        let folder = library.add_folder("Other").unwrap();

        let before = library.images();
        library.move_image_to_folder(&first.id, &folder.id).unwrap();
        let after = library.images();

        let mut expected = before[0].clone();
        expected.folder_id = folder.id.clone();
        assert_eq!(after[0], expected);
        assert_eq!(after[1], before[1]);
        assert_eq!(after[1].id, second.id);
    }

    #[test]
    fn test_missing_image_is_not_found_and_changes_nothing() {
        let library = library();
        library.add_image(UNTITLED_FOLDER_ID, "a.png", "a").unwrap();
        let before = library.images();

        let err = library.add_result_to_image("missing", "res").unwrap_err();
        assert!(matches!(err, LibraryError::ImageNotFound(ref id) if id == "missing"));
        assert!(err.is_not_found());

        let err = library
            .move_image_to_folder("missing", UNTITLED_FOLDER_ID)
            .unwrap_err();
        assert!(matches!(err, LibraryError::ImageNotFound(_)));

        assert_eq!(library.images(), before);
    }

    #[test]
    fn test_move_to_unknown_folder_is_rejected() {
        let library = library();
        let image = library.add_image(UNTITLED_FOLDER_ID, "a.png", "a").unwrap();

        let err = library.move_image_to_folder(&image.id, "gone").unwrap_err();
        assert!(matches!(err, LibraryError::FolderNotFound(_)));
        assert_eq!(library.image(&image.id).unwrap().folder_id, UNTITLED_FOLDER_ID);
    }

    #[test]
    fn test_watch_follows_mutations() {
        let library = library();
        let mut rx = library.watch();
        assert!(!rx.has_changed().unwrap());

        let image = library.add_image(UNTITLED_FOLDER_ID, "a.png", "a").unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().images(), &[image.clone()]);

        let folder = library.add_folder("New").unwrap();
        library.move_image_to_folder(&image.id, &folder.id).unwrap();

        let view = library.view();
        let folders = view.folders();
        assert!(folders[0].images.is_empty());
        assert_eq!(folders[1].images[0].id, image.id);
        assert_eq!(view.image(&image.id).unwrap().folder_id, folder.id);
    }

    #[test]
    fn test_restart_reconstructs_collections() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("library.db");

        let (images, folders) = {
            let library = Library::new(Store::open(&path).unwrap());
            let folder = library.add_folder("Pets").unwrap();
            let a = library.add_image(&folder.id, "a.png", "a").unwrap();
            library.add_image(UNTITLED_FOLDER_ID, "b.png", "b").unwrap();
            library.add_result_to_image(&a.id, "res").unwrap();
            (library.images(), library.folders())
        };

        let reloaded = Library::new(Store::open(&path).unwrap());
        assert_eq!(reloaded.images(), images);
        assert_eq!(reloaded.folders(), folders);
        assert_eq!(reloaded.view().folders(), folders);
    }

    #[test]
    fn test_concurrent_mutations_do_not_lose_updates() {
        let library = Arc::new(library());
        let ids: Vec<String> = (0..8)
            .map(|i| {
                library
                    .add_image(UNTITLED_FOLDER_ID, &format!("{}.png", i), "orig")
                    .unwrap()
                    .id
            })
            .collect();

        let handles: Vec<_> = ids
            .iter()
            .cloned()
            .map(|id| {
                let library = Arc::clone(&library);
                std::thread::spawn(move || {
                    library.add_result_to_image(&id, &format!("res-{}", id)).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for id in ids {
            let image = library.image(&id).unwrap();
            assert_eq!(image.base64_result, Some(format!("res-{}", id)));
        }
    }

    #[test]
    fn test_view_matches_store_after_concurrent_mutations() {
        for _ in 0..50 {
            let library = Arc::new(library());
            let ids: Vec<String> = (0..8)
                .map(|i| {
                    library
                        .add_image(UNTITLED_FOLDER_ID, &format!("{}.png", i), "orig")
                        .unwrap()
                        .id
                })
                .collect();

            let handles: Vec<_> = ids
                .into_iter()
                .map(|id| {
                    let library = Arc::clone(&library);
                    std::thread::spawn(move || {
                        library.add_result_to_image(&id, "res").unwrap();
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }

            let images = library.images();
            assert!(images.iter().all(|i| i.has_result()));
            assert_eq!(library.view().images(), images.as_slice());
        }
    }

    #[test]
    fn test_new_library_sees_writes_racing_construction() {
        let store = Store::open_in_memory().unwrap();
        let writer = store.clone();
        let handle = std::thread::spawn(move || {
            for i in 0..20 {
                let image = Image::new(UNTITLED_FOLDER_ID, &format!("{}.png", i), "o");
                writer.write(IMAGES_KEY, &vec![image]).unwrap();
            }
        });

        let library = Library::new(store);
        handle.join().unwrap();

        assert_eq!(library.view().images(), library.images().as_slice());
    }

    #[test]
    fn test_two_instances_share_writes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("library.db");
        let first = Library::new(Store::open(&path).unwrap());
        let second = Library::new(Store::open(&path).unwrap());

        let a = first.add_image(UNTITLED_FOLDER_ID, "a.png", "a").unwrap();
        let b = second.add_image(UNTITLED_FOLDER_ID, "b.png", "b").unwrap();

        let ids: Vec<String> = first.images().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![a.id, b.id]);

        assert!(first.poll_external_changes().unwrap());
        assert_eq!(first.view().images().len(), 2);
    }
}
