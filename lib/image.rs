//! Ordered composition of a layer chain into a single overlay view.
//!
//! An image is in-memory only: the top layer, the owning repository, and the
//! mount handle once composed. The chain itself is recovered on demand by
//! walking parent pointers from the top layer to the root.

use std::{
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
};

use crate::{
    layer::Layer, mount::Mount, repository::Repository, utils, OvermountError, OvermountResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A set of sequential layers composed into a single merged view.
#[derive(Debug)]
pub struct Image {
    repository: Repository,
    layer: Arc<Layer>,
    mount: Mutex<Option<Arc<Mount>>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Image {
    pub(crate) fn new(repository: Repository, layer: Arc<Layer>) -> Self {
        Self {
            repository,
            layer,
            mount: Mutex::new(None),
        }
    }

    /// The image's top layer.
    pub fn layer(&self) -> &Arc<Layer> {
        &self.layer
    }

    /// The layer chain from top to root.
    pub fn layers(&self) -> Vec<Arc<Layer>> {
        let mut chain = vec![Arc::clone(&self.layer)];
        let mut current = self.layer.parent();

        while let Some(layer) = current {
            current = layer.parent();
            chain.push(layer);
        }

        chain
    }

    /// Stacks the chain into an overlay mount and returns the merged target
    /// path.
    ///
    /// The lower chain runs from the immediate parent down to the root, so
    /// the deepest layer ends up last. A single-layer image fails with
    /// [`OvermountError::MountCannotProceed`]: its own directory already is
    /// the view.
    pub fn mount(&self) -> OvermountResult<PathBuf> {
        if self.repository.is_virtual() {
            return Err(OvermountError::MountCannotProceed(
                "virtual repositories store layers as tarballs and cannot be mounted".into(),
            ));
        }

        let upper = self.layer.path();
        let target = self.layer.mount_path();

        let mut lowers = Vec::new();
        let mut current = self.layer.parent();
        while let Some(layer) = current {
            let path = layer.path();
            utils::ensure_dir(self.repository.base_dir(), &path)?;
            lowers.push(path.to_string_lossy().into_owned());
            current = layer.parent();
        }

        for path in [&target, &upper] {
            utils::ensure_dir(self.repository.base_dir(), path)?;
        }

        let mount = self
            .repository
            .new_mount(&target, lowers.join(":"), &upper)?;

        if let Err(error) = mount.open() {
            if let Err(cleanup) = mount.close() {
                tracing::warn!("failed to clean up after aborted mount: {}", cleanup);
            }
            let _ = self.repository.remove_mount(&mount);
            return Err(error);
        }

        *self.lock_mount() = Some(mount);

        Ok(target)
    }

    /// Tears down the union view recorded by [`Image::mount`]. Parent layer
    /// content is left untouched.
    pub fn unmount(&self) -> OvermountResult<()> {
        let mut guard = self.lock_mount();

        let Some(mount) = guard.as_ref() else {
            return Err(OvermountError::MountCannotProceed(
                "image is not mounted".into(),
            ));
        };

        mount.close()?;
        self.repository.remove_mount(mount)?;
        *guard = None;

        Ok(())
    }

    /// Persists the parent link of every layer in the chain. The first
    /// failure aborts the walk.
    pub fn commit(&self) -> OvermountResult<()> {
        for layer in self.layers() {
            layer.save_parent()?;
        }

        Ok(())
    }

    fn lock_mount(&self) -> std::sync::MutexGuard<'_, Option<Arc<Mount>>> {
        self.mount.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
