//! OverlayFS layout and mounting.
//!
//! Layout under the container's state directory:
//!
//! ```text
//! rootfs/
//!   lower/   -> symlink to the image root (read-only)
//!   upper/
//!   work/
//!   merged/
//! ```

use std::ffi::CString;
use std::path::{Path, PathBuf};

use minidock_common::{MinidockError, MinidockResult};

/// OverlayFS configuration for one container.
#[derive(Debug, Clone)]
pub struct OverlayFs {
    /// Symlink pointing at the image root.
    pub lower: PathBuf,
    /// Writable layer.
    pub upper: PathBuf,
    /// Overlay work directory.
    pub work: PathBuf,
    /// Merged mount point.
    pub merged: PathBuf,
    /// The image root the lower link points at.
    pub image_root: PathBuf,
}

impl OverlayFs {
    /// Overlay paths for a container's rootfs base directory.
    #[must_use]
    pub fn for_container(rootfs_base: &Path, image_root: &Path) -> Self {
        Self {
            lower: rootfs_base.join("lower"),
            upper: rootfs_base.join("upper"),
            work: rootfs_base.join("work"),
            merged: rootfs_base.join("merged"),
            image_root: image_root.to_path_buf(),
        }
    }

    /// Create the directories and the lower symlink.
    pub fn prepare(&self) -> MinidockResult<()> {
        for dir in [&self.upper, &self.work, &self.merged] {
            std::fs::create_dir_all(dir)?;
        }
        match self.lower.symlink_metadata() {
            Ok(_) => {}
            Err(_) => {
                if let Some(parent) = self.lower.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::os::unix::fs::symlink(&self.image_root, &self.lower)?;
            }
        }
        Ok(())
    }

    /// The overlay mount options string.
    #[must_use]
    pub fn mount_options(&self) -> String {
        format!(
            "lowerdir={},upperdir={},workdir={}",
            self.lower.display(),
            self.upper.display(),
            self.work.display()
        )
    }

    /// Mount the overlay on `merged`.
    pub fn mount(&self) -> MinidockResult<()> {
        use rustix::mount::{mount, MountFlags};

        self.prepare()?;

        let options = self.mount_options();
        tracing::debug!(merged = %self.merged.display(), options = %options, "Mounting overlayfs");

        let fstype = CString::new("overlay").expect("static");
        let options_c = CString::new(options).expect("paths carry no NUL");

        mount(
            "overlay",
            &self.merged,
            fstype.as_c_str(),
            MountFlags::empty(),
            options_c.as_c_str(),
        )
        .map_err(|e| MinidockError::kernel("mount", &e.into()))?;

        tracing::info!(merged = %self.merged.display(), "OverlayFS mounted");
        Ok(())
    }

    /// Lazy-unmount the merged view.
    pub fn unmount(&self) -> MinidockResult<()> {
        super::unmount_detach(&self.merged)
    }

    /// Remove upper/work/merged and the lower link. Invoked by `rm`.
    pub fn remove_dirs(&self) -> MinidockResult<()> {
        let _ = self.unmount();
        for dir in [&self.merged, &self.work, &self.upper] {
            if dir.exists() {
                std::fs::remove_dir_all(dir)?;
            }
        }
        if self.lower.symlink_metadata().is_ok() {
            std::fs::remove_file(&self.lower)?;
        }
        Ok(())
    }
}

/// Whether a mount failure means "fall back to bind mode" rather than a
/// hard error: the kernel lacks overlayfs, refuses it here, or refuses it
/// to this caller.
#[must_use]
pub fn errno_suggests_fallback(err: &MinidockError) -> bool {
    matches!(
        err,
        MinidockError::Kernel {
            errno: "EPERM" | "EINVAL" | "EOPNOTSUPP" | "ENODEV",
            ..
        }
    )
}
