//! A single overlay union mount.
//!
//! Mounts are constructed exclusively through the repository, which allocates
//! the kernel scratch directory. `close` tears the union down and always
//! removes the scratch directory, even when the kernel reports the target as
//! already unmounted.

use std::{
    fs, io,
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
};

use getset::Getters;

use crate::{OvermountError, OvermountResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A single overlay mount: one writable upper directory stacked over a
/// descending chain of lower directories, merged at `target`.
#[derive(Debug, Getters)]
#[getset(get = "pub")]
pub struct Mount {
    /// Where the merged view appears.
    target: PathBuf,

    /// The writable top layer.
    upper: PathBuf,

    /// Colon-separated descending chain of lower directories.
    lower: String,

    /// Kernel-internal scratch directory.
    work: PathBuf,

    #[getset(skip)]
    mounted: AtomicBool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Mount {
    pub(crate) fn new(
        target: impl Into<PathBuf>,
        lower: impl Into<String>,
        upper: impl Into<PathBuf>,
        work: impl Into<PathBuf>,
    ) -> Self {
        Self {
            target: target.into(),
            upper: upper.into(),
            lower: lower.into(),
            work: work.into(),
            mounted: AtomicBool::new(false),
        }
    }

    /// Returns true if the union is currently mounted.
    pub fn mounted(&self) -> bool {
        self.mounted.load(Ordering::SeqCst)
    }

    /// Issues the kernel union mount.
    ///
    /// Fails with [`OvermountError::MountCannotProceed`] when no lower
    /// directory was supplied, because a lone layer cannot be overlay-mounted
    /// meaningfully.
    pub fn open(&self) -> OvermountResult<()> {
        if self.lower.is_empty() {
            return Err(OvermountError::MountCannotProceed(
                "no lower dir specified - single layer?".into(),
            ));
        }

        self.mount_syscall()?;
        self.mounted.store(true, Ordering::SeqCst);

        tracing::info!(
            "mounted overlay at {} (upper {})",
            self.target.display(),
            self.upper.display()
        );

        Ok(())
    }

    /// Unmounts `target`, then removes `work` recursively.
    ///
    /// Workdir cleanup runs even when the unmount syscall fails; a kernel
    /// report of "not mounted" counts as success so `close` can be retried.
    pub fn close(&self) -> OvermountResult<()> {
        let unmount_result = self.unmount_syscall();

        match fs::remove_dir_all(&self.work) {
            Result::Ok(()) => {}
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => {
                tracing::warn!(
                    "failed to remove overlay workdir {}: {}",
                    self.work.display(),
                    error
                );
                unmount_result?;
                return Err(error.into());
            }
        }

        unmount_result?;
        self.mounted.store(false, Ordering::SeqCst);

        Ok(())
    }

    fn mount_options(&self) -> String {
        format!(
            "upperdir={},lowerdir={},workdir={}",
            self.upper.display(),
            self.lower,
            self.work.display()
        )
    }

    #[cfg(target_os = "linux")]
    fn mount_syscall(&self) -> OvermountResult<()> {
        nix::mount::mount(
            Some("overlay"),
            &self.target,
            Some("overlay"),
            nix::mount::MsFlags::empty(),
            Some(self.mount_options().as_str()),
        )
        .map_err(|errno| OvermountError::MountFailed(errno.to_string()))
    }

    #[cfg(not(target_os = "linux"))]
    fn mount_syscall(&self) -> OvermountResult<()> {
        let _ = self.mount_options();
        Err(OvermountError::MountCannotProceed(
            "overlay mounts require linux".into(),
        ))
    }

    #[cfg(target_os = "linux")]
    fn unmount_syscall(&self) -> OvermountResult<()> {
        use nix::errno::Errno;

        match nix::mount::umount(&self.target) {
            Result::Ok(()) => Ok(()),
            Err(Errno::EINVAL) | Err(Errno::ENOENT) => {
                // the kernel says the target is not mounted
                tracing::debug!("target {} was not mounted", self.target.display());
                Ok(())
            }
            Err(errno) => Err(OvermountError::UnmountFailed(errno.to_string())),
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn unmount_syscall(&self) -> OvermountResult<()> {
        Ok(())
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
    fn test_mount_open_requires_lower() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let mount = Mount::new(
            temp.path().join("target"),
            "",
            temp.path().join("upper"),
            temp.path().join("work"),
        );

        assert!(matches!(
            mount.open(),
            Err(OvermountError::MountCannotProceed(_))
        ));
        assert!(!mount.mounted());

        Ok(())
    }

    #[test]
    fn test_mount_options_order() -> anyhow::Result<()> {
        let mount = Mount::new("/r/mount/top", "/r/layers/mid:/r/layers/root", "/r/layers/top", "/r/tmp/w");

        assert_eq!(
            mount.mount_options(),
            "upperdir=/r/layers/top,lowerdir=/r/layers/mid:/r/layers/root,workdir=/r/tmp/w"
        );

        Ok(())
    }

    #[test]
    fn test_mount_close_removes_work_without_kernel_mount() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let work = temp.path().join("work");
        fs::create_dir(&work)?;

        let mount = Mount::new(
            temp.path().join("target"),
            "lower",
            temp.path().join("upper"),
            &work,
        );

        // the target was never mounted; close still clears the workdir
        mount.close()?;
        assert!(!work.exists());

        // close is idempotent in effect
        mount.close()?;

        Ok(())
    }
}
