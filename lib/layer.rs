//! A persistent layer node.
//!
//! Layers are created through the repository and form parent chains: each
//! layer may point at one parent in memory, and the durable form of that link
//! is the `parents.json` file inside the layer directory. The chain is
//! re-established after a process restart with [`Layer::restore_parent`].

use std::{
    fs, io,
    io::{Read, Write},
    path::PathBuf,
    sync::{Arc, PoisonError, RwLock, Weak},
};

use oci_spec::image::ImageConfiguration;

use crate::{
    asset::{Asset, AssetKind, Digester},
    repository::{Repository, RepositoryShared},
    utils::{
        self, CONFIG_FILENAME, LAYERS_SUBDIR, LAYER_TAR_FILENAME, MOUNT_SUBDIR, PARENTS_FILENAME,
        ROOTFS_SUBDIR,
    },
    OvermountError, OvermountResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The maximum parent chain length honored during restoration. Chains longer
/// than this are treated as on-disk cycles.
pub const MAX_PARENT_DEPTH: usize = 256;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A filesystem layer: an id, an optional parent link, and the asset holding
/// its content.
#[derive(Debug)]
pub struct Layer {
    id: String,
    asset: Asset,
    parent: RwLock<Option<Arc<Layer>>>,
    shared: Weak<RepositoryShared>,
    base_dir: PathBuf,
    is_virtual: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Layer {
    pub(crate) fn new(
        id: impl Into<String>,
        shared: &Arc<RepositoryShared>,
        parent: Option<Arc<Layer>>,
    ) -> OvermountResult<Arc<Self>> {
        let id = id.into();
        validate_id(&id)?;

        let layer_dir = shared.base_dir().join(LAYERS_SUBDIR).join(&id);
        let asset = if shared.is_virtual() {
            Asset::new(
                layer_dir.join(LAYER_TAR_FILENAME),
                AssetKind::Blob,
                Digester::sha256(),
            )?
        } else {
            Asset::new(
                layer_dir.join(ROOTFS_SUBDIR),
                AssetKind::Tree,
                Digester::sha256(),
            )?
        };

        Ok(Arc::new(Self {
            id,
            asset,
            parent: RwLock::new(parent),
            shared: Arc::downgrade(shared),
            base_dir: shared.base_dir().to_path_buf(),
            is_virtual: shared.is_virtual(),
        }))
    }

    /// The layer's id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The asset bound to the layer's content.
    pub fn asset(&self) -> &Asset {
        &self.asset
    }

    /// The in-memory parent link, if any.
    pub fn parent(&self) -> Option<Arc<Layer>> {
        self.parent
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replaces the in-memory parent link.
    pub fn set_parent(&self, parent: Option<Arc<Layer>>) {
        *self.parent.write().unwrap_or_else(PoisonError::into_inner) = parent;
    }

    /// The layer's content location: the `rootfs` directory in materialized
    /// mode, the cached `layer.tar` in virtual mode.
    pub fn path(&self) -> PathBuf {
        if self.is_virtual {
            self.layer_dir().join(LAYER_TAR_FILENAME)
        } else {
            self.layer_dir().join(ROOTFS_SUBDIR)
        }
    }

    /// The per-layer overlay target.
    pub fn mount_path(&self) -> PathBuf {
        self.base_dir.join(MOUNT_SUBDIR).join(&self.id)
    }

    /// The layer's on-disk directory.
    pub fn layer_dir(&self) -> PathBuf {
        self.base_dir.join(LAYERS_SUBDIR).join(&self.id)
    }

    /// True if the layer's directory is present on disk.
    pub fn exists(&self) -> bool {
        self.layer_dir().is_dir()
    }

    /// The digest of the most recent pack or unpack.
    pub fn digest(&self) -> String {
        self.asset.digest()
    }

    /// Re-derives the digest from the on-disk content.
    pub fn load_digest(&self) -> OvermountResult<String> {
        self.asset.load_digest()
    }

    /// Extracts the layer tar in `reader` into this layer and returns its
    /// diff-ID.
    pub fn unpack<R: Read>(&self, reader: R) -> OvermountResult<String> {
        tracing::debug!("unpacking into layer {}", self.id);
        self.asset.unpack(reader)
    }

    /// Produces the layer's tar on `writer` and returns its diff-ID.
    pub fn pack<W: Write>(&self, writer: W) -> OvermountResult<String> {
        tracing::debug!("packing layer {}", self.id);
        self.asset.pack(writer)
    }

    /// Persists the parent link into `parents.json`.
    ///
    /// Idempotent: an existing regular file is left untouched. Fails with
    /// [`OvermountError::InvalidLayer`] when something else occupies the
    /// parent file's path.
    pub fn save_parent(&self) -> OvermountResult<()> {
        let Some(parent) = self.parent() else {
            return Ok(());
        };

        let path = self.parents_path();
        match fs::symlink_metadata(&path) {
            Result::Ok(metadata) if metadata.is_file() => Ok(()),
            Result::Ok(_) => Err(OvermountError::InvalidLayer(format!(
                "{} is not a regular file",
                path.display()
            ))),
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                utils::ensure_dir(&self.base_dir, self.layer_dir())?;
                fs::write(&path, parent.id())?;
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Unconditionally rewrites `parents.json`; a missing parent removes it.
    pub fn overwrite_parent(&self) -> OvermountResult<()> {
        let path = self.parents_path();

        match self.parent() {
            Some(parent) => {
                utils::ensure_dir(&self.base_dir, self.layer_dir())?;
                fs::write(&path, parent.id())?;
            }
            None => match fs::remove_file(&path) {
                Result::Ok(()) => {}
                Err(error) if error.kind() == io::ErrorKind::NotFound => {}
                Err(error) => return Err(error.into()),
            },
        }

        Ok(())
    }

    /// Reads `parents.json` (when present) and replaces the in-memory parent
    /// pointer by opening the identified layer, which must exist on disk.
    pub fn load_parent(&self) -> OvermountResult<Option<Arc<Layer>>> {
        let path = self.parents_path();
        let contents = match fs::read_to_string(&path) {
            Result::Ok(contents) => contents,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => {
                return Err(OvermountError::InvalidLayer(format!(
                    "unreadable parent file {}: {}",
                    path.display(),
                    error
                )))
            }
        };

        let parent_id = contents.trim();
        if parent_id.is_empty() {
            return Err(OvermountError::InvalidLayer(format!(
                "empty parent reference in {}",
                path.display()
            )));
        }

        let parent = self.repository()?.open_layer(parent_id)?;
        self.set_parent(Some(Arc::clone(&parent)));

        Ok(Some(parent))
    }

    /// Recursively loads parents up the chain until a layer has no persisted
    /// parent. Bounded by [`MAX_PARENT_DEPTH`] to catch on-disk cycles.
    pub fn restore_parent(&self) -> OvermountResult<()> {
        let mut current = match self.load_parent()? {
            Some(parent) => parent,
            None => return Ok(()),
        };

        for _ in 1..MAX_PARENT_DEPTH {
            match current.load_parent()? {
                Some(parent) => current = parent,
                None => return Ok(()),
            }
        }

        Err(OvermountError::InvalidLayer(format!(
            "parent chain of layer {} exceeds {} entries",
            self.id, MAX_PARENT_DEPTH
        )))
    }

    /// Persists an image configuration blob next to the layer content.
    pub fn save_config(&self, config: &ImageConfiguration) -> OvermountResult<()> {
        utils::ensure_dir(&self.base_dir, self.layer_dir())?;
        fs::write(self.config_path(), serde_json::to_vec(config)?)?;
        Ok(())
    }

    /// Loads the persisted image configuration. A missing configuration is an
    /// error so that exports can require one up front.
    pub fn config(&self) -> OvermountResult<ImageConfiguration> {
        let contents = match fs::read(self.config_path()) {
            Result::Ok(contents) => contents,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                return Err(OvermountError::InvalidLayer(format!(
                    "missing image configuration for layer {}",
                    self.id
                )))
            }
            Err(error) => return Err(error.into()),
        };

        Ok(serde_json::from_slice(&contents)?)
    }

    /// Unregisters the layer and deletes its on-disk directory recursively.
    pub fn remove(&self) -> OvermountResult<()> {
        if let Some(shared) = self.shared.upgrade() {
            Repository::from_shared(shared).unregister_layer(&self.id)?;
        }

        match fs::remove_dir_all(self.layer_dir()) {
            Result::Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    fn parents_path(&self) -> PathBuf {
        self.layer_dir().join(PARENTS_FILENAME)
    }

    fn config_path(&self) -> PathBuf {
        self.layer_dir().join(CONFIG_FILENAME)
    }

    fn repository(&self) -> OvermountResult<Repository> {
        self.shared
            .upgrade()
            .map(Repository::from_shared)
            .ok_or_else(|| {
                OvermountError::InvalidLayer(format!(
                    "repository of layer {} was dropped",
                    self.id
                ))
            })
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

pub(crate) fn validate_id(id: &str) -> OvermountResult<()> {
    if id.is_empty()
        || id == "."
        || id == ".."
        || id.contains(['/', '\\'])
        || id.contains('\0')
    {
        return Err(OvermountError::InvalidLayer(format!(
            "invalid layer id: {:?}",
            id
        )));
    }

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use crate::Repository;

    use super::*;

    #[test]
    fn test_layer_paths() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let repository = Repository::new(temp.path(), false)?;
        let layer = repository.new_layer("test", None)?;

        assert_eq!(
            layer.path(),
            repository.base_dir().join("layers/test/rootfs")
        );
        assert_eq!(layer.mount_path(), repository.base_dir().join("mount/test"));
        assert!(!layer.exists());

        Ok(())
    }

    #[test]
    fn test_layer_virtual_path_is_tarball() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let repository = Repository::new(temp.path(), true)?;
        let layer = repository.new_layer("test", None)?;

        assert_eq!(
            layer.path(),
            repository.base_dir().join("layers/test/layer.tar")
        );

        Ok(())
    }

    #[test]
    fn test_layer_rejects_traversal_ids() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let repository = Repository::new(temp.path(), false)?;

        for id in ["", ".", "..", "a/b", "a\\b"] {
            assert!(
                matches!(
                    repository.new_layer(id, None),
                    Err(OvermountError::InvalidLayer(_))
                ),
                "id {:?} should be rejected",
                id
            );
        }

        Ok(())
    }

    #[test]
    fn test_layer_save_parent_is_idempotent() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let repository = Repository::new(temp.path(), false)?;
        let parent = repository.new_layer("parent", None)?;
        let child = repository.new_layer("child", Some(Arc::clone(&parent)))?;

        child.save_parent()?;
        let parents_file = child.layer_dir().join(PARENTS_FILENAME);
        assert_eq!(fs::read_to_string(&parents_file)?, "parent");

        // a second save leaves the file untouched
        fs::write(&parents_file, "scribbled")?;
        child.save_parent()?;
        assert_eq!(fs::read_to_string(&parents_file)?, "scribbled");

        // overwrite restores the real link
        child.overwrite_parent()?;
        assert_eq!(fs::read_to_string(&parents_file)?, "parent");

        Ok(())
    }

    #[test]
    fn test_layer_save_parent_rejects_non_regular_file() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let repository = Repository::new(temp.path(), false)?;
        let parent = repository.new_layer("parent", None)?;
        let child = repository.new_layer("child", Some(parent))?;

        fs::create_dir_all(child.layer_dir().join(PARENTS_FILENAME))?;
        assert!(matches!(
            child.save_parent(),
            Err(OvermountError::InvalidLayer(_))
        ));

        Ok(())
    }

    #[test]
    fn test_layer_restore_parent_rebuilds_chain() -> anyhow::Result<()> {
        let temp = tempdir()?;

        {
            let repository = Repository::new(temp.path(), false)?;
            let mut parent = None;
            for id in ["root", "middle", "top"] {
                fs::create_dir_all(repository.layer_path(id))?;
                let layer = repository.create_layer(id, parent.take())?;
                layer.save_parent()?;
                parent = Some(layer);
            }
        }

        // a fresh repository only knows what is on disk
        let repository = Repository::new(temp.path(), false)?;
        let top = repository.new_layer("top", None)?;
        top.restore_parent()?;

        let middle = top.parent().expect("top should have a parent");
        assert_eq!(middle.id(), "middle");
        let root = middle.parent().expect("middle should have a parent");
        assert_eq!(root.id(), "root");
        assert!(root.parent().is_none());

        Ok(())
    }

    #[test]
    fn test_layer_restore_parent_detects_cycles() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let repository = Repository::new(temp.path(), false)?;

        for (id, parent) in [("a", "b"), ("b", "a")] {
            fs::create_dir_all(repository.layer_path(id))?;
            fs::write(repository.layer_path(id).join(PARENTS_FILENAME), parent)?;
        }

        let layer = repository.new_layer("a", None)?;
        assert!(matches!(
            layer.restore_parent(),
            Err(OvermountError::InvalidLayer(_))
        ));

        Ok(())
    }

    #[test]
    fn test_layer_config_round_trip() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let repository = Repository::new(temp.path(), false)?;
        let layer = repository.new_layer("test", None)?;

        assert!(matches!(
            layer.config(),
            Err(OvermountError::InvalidLayer(_))
        ));

        let config: ImageConfiguration = serde_json::from_value(serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "config": { "WorkingDir": "/srv" },
            "rootfs": { "type": "layers", "diff_ids": [] },
            "history": []
        }))?;
        layer.save_config(&config)?;

        let loaded = layer.config()?;
        assert_eq!(
            loaded
                .config()
                .as_ref()
                .and_then(|c| c.working_dir().as_deref()),
            Some("/srv")
        );

        Ok(())
    }

    #[test]
    fn test_layer_remove_deletes_directory() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let repository = Repository::new(temp.path(), false)?;

        fs::create_dir_all(repository.layer_path("test"))?;
        let layer = repository.create_layer("test", None)?;
        assert!(layer.exists());

        layer.remove()?;
        assert!(!layer.exists());

        // the id can be registered again
        fs::create_dir_all(repository.layer_path("test"))?;
        repository.create_layer("test", None)?;

        Ok(())
    }
}
