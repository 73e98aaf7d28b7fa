//! Repository layout constants and the path guard.
//!
//! Every path the store derives from caller-supplied input (layer ids, tag
//! names, parent files) is funneled through [`check_relative`] before it is
//! created, so nothing under the repository can escape `base_dir` through
//! relative traversal.

use std::{
    fs,
    path::{Component, Path},
};

use crate::{OvermountError, OvermountResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The directory under the repository root where layers are stored
///
/// Example: <BASE_DIR>/<LAYERS_SUBDIR>/<LAYER_ID>
pub const LAYERS_SUBDIR: &str = "layers";

/// The directory under the repository root where overlay targets live
///
/// Example: <BASE_DIR>/<MOUNT_SUBDIR>/<LAYER_ID>
pub const MOUNT_SUBDIR: &str = "mount";

/// The directory under the repository root for overlay workdirs and scratch
/// tempfiles
///
/// Example: <BASE_DIR>/<TMP_SUBDIR>/<RANDOM>
pub const TMP_SUBDIR: &str = "tmp";

/// The directory under the repository root holding the tag index, one file
/// per tag whose contents is a layer id
///
/// Example: <BASE_DIR>/<TAGS_SUBDIR>/<TAG>
pub const TAGS_SUBDIR: &str = "tags";

/// The directory inside a layer holding the unpacked root filesystem
/// (materialized mode)
pub const ROOTFS_SUBDIR: &str = "rootfs";

/// The filename of the cached layer tarball (virtual mode)
pub const LAYER_TAR_FILENAME: &str = "layer.tar";

/// The filename inside a layer directory holding the parent layer id
pub const PARENTS_FILENAME: &str = "parents.json";

/// The filename inside a layer directory holding the image configuration
pub const CONFIG_FILENAME: &str = "config.json";

/// The advisory lock file coordinating processes that share a base directory
pub const REPOSITORY_LOCK_FILENAME: &str = "repository.lock";

/// The mode repository directories are created with
pub const REPOSITORY_DIR_MODE: u32 = 0o700;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Computes the base-relative form of `path` and fails with
/// [`OvermountError::MountCannotProceed`] if that form begins with a
/// parent-traversal component.
pub fn check_relative(base: impl AsRef<Path>, path: impl AsRef<Path>) -> OvermountResult<()> {
    let base = base.as_ref();
    let path = path.as_ref();

    let relative = path.strip_prefix(base).map_err(|_| {
        OvermountError::MountCannotProceed(format!(
            "path {} fell below repository root {}",
            path.display(),
            base.display()
        ))
    })?;

    if relative
        .components()
        .next()
        .is_some_and(|component| matches!(component, Component::ParentDir))
    {
        return Err(OvermountError::MountCannotProceed(format!(
            "path {} fell below repository root {}",
            path.display(),
            base.display()
        )));
    }

    Ok(())
}

/// Runs [`check_relative`], then creates the directory with mode `0700` if it
/// is missing.
pub fn ensure_dir(base: impl AsRef<Path>, path: impl AsRef<Path>) -> OvermountResult<()> {
    let path = path.as_ref();
    check_relative(base, path)?;

    if !path.exists() {
        tracing::debug!("creating repository directory {}", path.display());
        create_dir_restricted(path)?;
    }

    Ok(())
}

/// Validates that `path` is a directory that is not a symlink, creating it
/// with mode `0700` when missing. Existing non-directories and symlinks fail
/// with the error produced by `err`.
pub fn check_dir(
    path: impl AsRef<Path>,
    err: impl Fn(String) -> OvermountError,
) -> OvermountResult<()> {
    let path = path.as_ref();

    let metadata = match fs::symlink_metadata(path) {
        Result::Ok(metadata) => metadata,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            create_dir_restricted(path)?;
            return Ok(());
        }
        Err(error) => return Err(error.into()),
    };

    if metadata.file_type().is_symlink() {
        // a whole class of escape bugs lives here
        return Err(err(format!(
            "cannot operate on a symlink: {}",
            path.display()
        )));
    }

    if !metadata.is_dir() {
        return Err(err(format!("not a directory: {}", path.display())));
    }

    Ok(())
}

/// Creates `path` and any missing ancestors with mode `0700`.
fn create_dir_restricted(path: &Path) -> OvermountResult<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new()
            .recursive(true)
            .mode(REPOSITORY_DIR_MODE)
            .create(path)?;
    }

    #[cfg(not(unix))]
    fs::create_dir_all(path)?;

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
