//! The repository: root of truth for layers, mounts, and tags.
//!
//! A repository is a directory tree rooted at `base_dir` plus an in-memory
//! registry of the layers and mounts opened through it. Registry and tag
//! mutations are serialized behind an in-process mutex and the advisory file
//! lock at `{base_dir}/repository.lock`, so cooperating processes sharing a
//! base directory cannot race on the tag or parent files.

use std::{
    collections::HashMap,
    fs,
    io::Read,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use file_lock::{FileLock, FileOptions};

use crate::{
    asset::{Asset, AssetKind, Digester},
    codec::{Exporter, Importer, PipeReader},
    image::Image,
    layer::{validate_id, Layer},
    mount::Mount,
    utils::{
        self, LAYERS_SUBDIR, LAYER_TAR_FILENAME, MOUNT_SUBDIR, REPOSITORY_LOCK_FILENAME,
        ROOTFS_SUBDIR, TAGS_SUBDIR, TMP_SUBDIR,
    },
    OvermountError, OvermountResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A collection of layers and live mounts rooted at an on-disk base
/// directory. Cloning yields another handle onto the same store.
#[derive(Clone, Debug)]
pub struct Repository {
    shared: Arc<RepositoryShared>,
}

/// Shared repository state. Layers hold a weak reference back to this so the
/// store is not kept alive through leaked chains.
#[derive(Debug)]
pub(crate) struct RepositoryShared {
    base_dir: PathBuf,
    is_virtual: bool,
    registry: Mutex<Registry>,
}

#[derive(Debug, Default)]
struct Registry {
    layers: HashMap<String, Arc<Layer>>,
    mounts: Vec<Arc<Mount>>,
}

/// Holds both the in-process registry lock and the cross-process file lock.
/// Dropping the guard releases both.
struct RegistryGuard<'a> {
    registry: MutexGuard<'a, Registry>,
    _file_lock: FileLock,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RepositoryShared {
    pub(crate) fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub(crate) fn is_virtual(&self) -> bool {
        self.is_virtual
    }
}

impl Repository {
    /// Opens (or creates) a repository rooted at `base_dir`.
    ///
    /// In virtual mode layers are stored as cached tarballs rather than
    /// unpacked trees; such a repository cannot compose overlay mounts.
    pub fn new(base_dir: impl AsRef<Path>, is_virtual: bool) -> OvermountResult<Self> {
        let base_dir = std::path::absolute(base_dir.as_ref())?;
        utils::check_dir(&base_dir, OvermountError::InvalidAsset)?;

        Ok(Self {
            shared: Arc::new(RepositoryShared {
                base_dir,
                is_virtual,
                registry: Mutex::new(Registry::default()),
            }),
        })
    }

    pub(crate) fn from_shared(shared: Arc<RepositoryShared>) -> Self {
        Self { shared }
    }

    /// The repository's absolute base directory.
    pub fn base_dir(&self) -> &Path {
        &self.shared.base_dir
    }

    /// True when layers are stored as cached tarballs instead of unpacked
    /// trees.
    pub fn is_virtual(&self) -> bool {
        self.shared.is_virtual
    }

    /// Allocates a fresh scratch directory under `{base_dir}/tmp`.
    pub fn temp_dir(&self) -> OvermountResult<PathBuf> {
        let base = self.shared.base_dir.join(TMP_SUBDIR);
        utils::ensure_dir(&self.shared.base_dir, &base)?;

        Ok(tempfile::Builder::new().tempdir_in(&base)?.into_path())
    }

    /// The layer store path for a given id.
    pub fn layer_path(&self, id: &str) -> PathBuf {
        self.shared.base_dir.join(LAYERS_SUBDIR).join(id)
    }

    /// The overlay target path for a given id.
    pub fn mount_path(&self, id: &str) -> PathBuf {
        self.shared.base_dir.join(MOUNT_SUBDIR).join(id)
    }

    /// Registers a new layer whose on-disk directory must already exist.
    /// A duplicate id fails with [`OvermountError::LayerExists`].
    pub fn create_layer(
        &self,
        id: &str,
        parent: Option<Arc<Layer>>,
    ) -> OvermountResult<Arc<Layer>> {
        if !self.layer_path(id).is_dir() {
            return Err(OvermountError::InvalidLayer(format!(
                "layer directory {} does not exist",
                self.layer_path(id).display()
            )));
        }

        self.new_layer(id, parent)
    }

    /// Registers a new layer without requiring its on-disk directory, for
    /// opening a pre-existing id before later writes.
    pub fn new_layer(&self, id: &str, parent: Option<Arc<Layer>>) -> OvermountResult<Arc<Layer>> {
        let layer = Layer::new(id, &self.shared, parent)?;
        self.add_layer(&layer, false)?;

        Ok(layer)
    }

    /// Returns the registered layer for `id`, when present.
    pub fn get_layer(&self, id: &str) -> Option<Arc<Layer>> {
        self.shared
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .layers
            .get(id)
            .cloned()
    }

    /// Returns the registered layer for `id`, or registers a handle for a
    /// layer that exists on disk.
    pub fn open_layer(&self, id: &str) -> OvermountResult<Arc<Layer>> {
        if let Some(layer) = self.get_layer(id) {
            return Ok(layer);
        }

        if !self.layer_path(id).is_dir() {
            return Err(OvermountError::InvalidLayer(format!(
                "layer {} does not exist on disk",
                id
            )));
        }

        match self.create_layer(id, None) {
            Result::Ok(layer) => Ok(layer),
            Err(OvermountError::LayerExists(_)) => self.get_layer(id).ok_or_else(|| {
                OvermountError::InvalidLayer(format!("layer {} disappeared from the registry", id))
            }),
            Err(error) => Err(error),
        }
    }

    /// Unpacks the tar in `reader` first, derives the layer id from the
    /// resulting diff-ID hex, then registers the layer.
    pub fn create_layer_from_asset<R: Read>(
        &self,
        reader: R,
        parent: Option<Arc<Layer>>,
    ) -> OvermountResult<Arc<Layer>> {
        let staging_dir = self.temp_dir()?;
        scopeguard::defer! {
            let _ = fs::remove_dir_all(&staging_dir);
        }

        let (staging, staged_name) = if self.is_virtual() {
            (
                Asset::new(
                    staging_dir.join(LAYER_TAR_FILENAME),
                    AssetKind::Blob,
                    Digester::sha256(),
                )?,
                LAYER_TAR_FILENAME,
            )
        } else {
            (
                Asset::new(
                    staging_dir.join(ROOTFS_SUBDIR),
                    AssetKind::Tree,
                    Digester::sha256(),
                )?,
                ROOTFS_SUBDIR,
            )
        };

        let digest = staging.unpack(reader)?;
        let id = utils::digest_hex(&digest).to_string();

        let layer_dir = self.layer_path(&id);
        utils::ensure_dir(self.base_dir(), &layer_dir)?;

        let final_path = layer_dir.join(staged_name);
        if final_path.exists() {
            tracing::debug!("content for layer {} already present, keeping it", id);
        } else {
            fs::rename(staging_dir.join(staged_name), &final_path)?;
        }

        let layer = match self.create_layer(&id, parent.clone()) {
            Result::Ok(layer) => layer,
            Err(OvermountError::LayerExists(_)) => {
                let layer = self.open_layer(&id)?;
                if parent.is_some() {
                    layer.set_parent(parent);
                }
                layer
            }
            Err(error) => return Err(error),
        };

        // carry the stream digest over so the layer reports it
        layer.asset().set_digester(staging.digester_snapshot());

        Ok(layer)
    }

    /// Registers `layer`, failing with [`OvermountError::LayerExists`] for a
    /// duplicate id unless `overwrite` is set.
    pub fn add_layer(&self, layer: &Arc<Layer>, overwrite: bool) -> OvermountResult<()> {
        let mut guard = self.lock()?;

        if !overwrite && guard.registry.layers.contains_key(layer.id()) {
            return Err(OvermountError::LayerExists(layer.id().to_string()));
        }

        guard
            .registry
            .layers
            .insert(layer.id().to_string(), Arc::clone(layer));

        Ok(())
    }

    /// Unregisters `layer` in memory only; on-disk removal belongs to
    /// [`Layer::remove`].
    pub fn remove_layer(&self, layer: &Arc<Layer>) -> OvermountResult<()> {
        self.unregister_layer(layer.id())
    }

    pub(crate) fn unregister_layer(&self, id: &str) -> OvermountResult<()> {
        let mut guard = self.lock()?;
        guard.registry.layers.remove(id);

        Ok(())
    }

    /// Allocates a scratch workdir and registers a new overlay mount.
    pub fn new_mount(
        &self,
        target: impl Into<PathBuf>,
        lower: impl Into<String>,
        upper: impl Into<PathBuf>,
    ) -> OvermountResult<Arc<Mount>> {
        let work = self
            .temp_dir()
            .map_err(|error| OvermountError::MountCannotProceed(error.to_string()))?;

        let mount = Arc::new(Mount::new(target, lower, upper, work));
        self.add_mount(Arc::clone(&mount))?;

        Ok(mount)
    }

    /// Registers a mount.
    pub fn add_mount(&self, mount: Arc<Mount>) -> OvermountResult<()> {
        let mut guard = self.lock()?;
        guard.registry.mounts.push(mount);

        Ok(())
    }

    /// Unregisters a mount.
    pub fn remove_mount(&self, mount: &Arc<Mount>) -> OvermountResult<()> {
        let mut guard = self.lock()?;
        guard
            .registry
            .mounts
            .retain(|registered| !Arc::ptr_eq(registered, mount));

        Ok(())
    }

    /// The number of live mounts registered with the repository.
    pub fn mount_count(&self) -> usize {
        self.shared
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .mounts
            .len()
    }

    /// The number of layers registered with the repository.
    pub fn layer_count(&self) -> usize {
        self.shared
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .layers
            .len()
    }

    /// Composes `top_layer` and its parent chain into an image.
    pub fn new_image(&self, top_layer: Arc<Layer>) -> Image {
        Image::new(self.clone(), top_layer)
    }

    /// Records `tag` as pointing at `layer`'s id.
    pub fn add_tag(&self, tag: &str, layer: &Arc<Layer>) -> OvermountResult<()> {
        validate_id(tag)?;

        let _guard = self.lock()?;
        utils::ensure_dir(self.base_dir(), self.shared.base_dir.join(TAGS_SUBDIR))?;
        fs::write(self.tag_path(tag), layer.id())?;

        Ok(())
    }

    /// Resolves `tag` to a layer. The tag keeps resolving to the recorded id
    /// even when that layer was since removed from the store.
    pub fn get_tag(&self, tag: &str) -> OvermountResult<Arc<Layer>> {
        validate_id(tag)?;

        let id = {
            let _guard = self.lock()?;
            match fs::read_to_string(self.tag_path(tag)) {
                Result::Ok(contents) => contents.trim().to_string(),
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                    return Err(OvermountError::TagDoesNotExist(tag.to_string()))
                }
                Err(error) => return Err(error.into()),
            }
        };

        if let Some(layer) = self.get_layer(&id) {
            return Ok(layer);
        }

        match self.new_layer(&id, None) {
            Result::Ok(layer) => Ok(layer),
            Err(OvermountError::LayerExists(_)) => self.get_layer(&id).ok_or_else(|| {
                OvermountError::InvalidLayer(format!("layer {} disappeared from the registry", id))
            }),
            Err(error) => Err(error),
        }
    }

    /// Removes `tag` from the index. Tags of removed layers are not cleaned
    /// up automatically; this is the only way to drop one.
    pub fn remove_tag(&self, tag: &str) -> OvermountResult<()> {
        validate_id(tag)?;

        let _guard = self.lock()?;
        match fs::remove_file(self.tag_path(tag)) {
            Result::Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                Err(OvermountError::TagDoesNotExist(tag.to_string()))
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Imports an archive through `importer`, returning the top layer of each
    /// contained image.
    pub fn import<I: Importer>(
        &self,
        importer: &I,
        reader: impl Read + Send + 'static,
    ) -> OvermountResult<Vec<Arc<Layer>>> {
        importer.import(self, Box::new(reader))
    }

    /// Exports `layer` and its chain through `exporter` as a streaming
    /// reader.
    pub fn export<E: Exporter>(
        &self,
        exporter: &E,
        layer: &Arc<Layer>,
        refs: &[String],
    ) -> OvermountResult<PipeReader> {
        exporter.export(self, layer, refs)
    }

    fn tag_path(&self, tag: &str) -> PathBuf {
        self.shared.base_dir.join(TAGS_SUBDIR).join(tag)
    }

    fn lock(&self) -> OvermountResult<RegistryGuard<'_>> {
        let registry = self
            .shared
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let lock_path = self.shared.base_dir.join(REPOSITORY_LOCK_FILENAME);
        let options = FileOptions::new().write(true).create(true).append(true);
        let file_lock = FileLock::lock(lock_path.to_string_lossy().as_ref(), true, options)?;

        Ok(RegistryGuard {
            registry,
            _file_lock: file_lock,
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_repository_temp_dir_stays_inside_tmp() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let repository = Repository::new(temp.path(), false)?;

        let scratch = repository.temp_dir()?;
        let relative = scratch.strip_prefix(repository.base_dir())?;

        assert_eq!(
            relative.components().next().and_then(|c| c.as_os_str().to_str()),
            Some(TMP_SUBDIR)
        );
        assert!(!relative.to_string_lossy().contains(".."));

        Ok(())
    }

    #[test]
    fn test_repository_rejects_unusable_base() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let file = temp.path().join("file");
        fs::write(&file, "not a directory")?;

        assert!(Repository::new(&file, false).is_err());

        Ok(())
    }

    #[test]
    fn test_repository_create_layer_requires_directory() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let repository = Repository::new(temp.path(), false)?;

        assert!(matches!(
            repository.create_layer("missing", None),
            Err(OvermountError::InvalidLayer(_))
        ));

        fs::create_dir_all(repository.layer_path("present"))?;
        repository.create_layer("present", None)?;

        Ok(())
    }

    #[test]
    fn test_repository_duplicate_layer_id() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let repository = Repository::new(temp.path(), false)?;

        fs::create_dir_all(repository.layer_path("test"))?;
        let layer = repository.create_layer("test", None)?;

        assert!(matches!(
            repository.create_layer("test", None),
            Err(OvermountError::LayerExists(_))
        ));
        assert!(matches!(
            repository.add_layer(&layer, false),
            Err(OvermountError::LayerExists(_))
        ));

        // overwrite registration is allowed
        repository.add_layer(&layer, true)?;
        assert_eq!(repository.layer_count(), 1);

        repository.remove_layer(&layer)?;
        assert_eq!(repository.layer_count(), 0);

        Ok(())
    }

    #[test]
    fn test_repository_create_layer_from_asset_derives_id() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let repository = Repository::new(temp.path(), false)?;

        let tarball = helper::tarball_of_one_file("some-file", b"some content")?;
        let layer = repository.create_layer_from_asset(tarball.as_slice(), None)?;

        assert_eq!(
            layer.id(),
            utils::digest_hex(&layer.digest()),
            "id should be the diff-ID hex"
        );
        assert!(layer.path().join("some-file").exists());

        // importing the same content again reuses the layer
        let again = repository.create_layer_from_asset(tarball.as_slice(), None)?;
        assert_eq!(again.id(), layer.id());

        Ok(())
    }

    #[test]
    fn test_repository_create_layer_from_asset_virtual_mode() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let repository = Repository::new(temp.path(), true)?;

        let tarball = helper::tarball_of_one_file("some-file", b"some content")?;
        let layer = repository.create_layer_from_asset(tarball.as_slice(), None)?;

        assert!(layer.path().is_file());
        assert_eq!(fs::read(layer.path())?, tarball);

        Ok(())
    }

    #[test]
    fn test_repository_tags() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let repository = Repository::new(temp.path(), false)?;

        assert!(matches!(
            repository.get_tag("test"),
            Err(OvermountError::TagDoesNotExist(_))
        ));
        assert!(matches!(
            repository.remove_tag("test"),
            Err(OvermountError::TagDoesNotExist(_))
        ));

        fs::create_dir_all(repository.layer_path("parent"))?;
        fs::create_dir_all(repository.layer_path("child"))?;
        let parent = repository.create_layer("parent", None)?;
        let child = repository.create_layer("child", Some(parent))?;
        child.save_parent()?;

        repository.add_tag("test", &child)?;
        let resolved = repository.get_tag("test")?;
        assert_eq!(resolved.id(), "child");
        resolved.restore_parent()?;
        assert_eq!(resolved.parent().map(|p| p.id().to_string()), Some("parent".into()));

        repository.remove_tag("test")?;
        assert!(matches!(
            repository.get_tag("test"),
            Err(OvermountError::TagDoesNotExist(_))
        ));

        Ok(())
    }

    #[test]
    fn test_repository_tags_survive_layer_removal() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let repository = Repository::new(temp.path(), false)?;

        fs::create_dir_all(repository.layer_path("parent"))?;
        fs::create_dir_all(repository.layer_path("child"))?;
        let parent = repository.create_layer("parent", None)?;
        let child = repository.create_layer("child", Some(parent))?;

        repository.add_tag("myimg", &child)?;
        child.remove()?;

        // tags are not cascade-removed with their layer
        let resolved = repository.get_tag("myimg")?;
        assert_eq!(resolved.id(), "child");

        Ok(())
    }

    #[test]
    fn test_repository_mount_registry() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let repository = Repository::new(temp.path(), false)?;

        let mount = repository.new_mount(
            repository.mount_path("top"),
            "lower",
            repository.layer_path("top"),
        )?;
        assert_eq!(repository.mount_count(), 1);

        repository.remove_mount(&mount)?;
        assert_eq!(repository.mount_count(), 0);

        repository.add_mount(Arc::clone(&mount))?;
        assert_eq!(repository.mount_count(), 1);
        repository.remove_mount(&mount)?;

        Ok(())
    }

    mod helper {
        pub(super) fn tarball_of_one_file(name: &str, contents: &[u8]) -> anyhow::Result<Vec<u8>> {
            let mut builder = tar::Builder::new(Vec::new());
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_mode(0o644);
            header.set_size(contents.len() as u64);
            builder.append_data(&mut header, name, contents)?;
            Ok(builder.into_inner()?)
        }
    }
}
