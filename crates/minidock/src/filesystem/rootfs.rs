//! Root filesystem assembly: overlay, bind fallback, chroot-only fallback.

use std::path::{Path, PathBuf};

use minidock_common::{MinidockError, MinidockResult, StorePaths};

use super::overlay::{errno_suggests_fallback, OverlayFs};
use super::{apply_volumes, mount, mount_special, seed_etc, MountOptions};
use crate::state::{ContainerConfig, RootfsMode};

/// The assembled root, ready to pivot into.
#[derive(Debug)]
pub struct PreparedRootfs {
    /// Directory that becomes `/`.
    pub root: PathBuf,
    /// Mode actually used (overlay may have fallen back to bind).
    pub mode: RootfsMode,
    /// Whether /proc and /sys were mounted; chroot-only mode leaves them
    /// out and consumers must tolerate their absence.
    pub special_mounted: bool,
}

/// Build the container root. Runs in the child, inside the new mount
/// namespace, before pivot.
pub fn setup_rootfs(
    config: &ContainerConfig,
    paths: &StorePaths,
    can_mount: bool,
) -> MinidockResult<PreparedRootfs> {
    // The fresh mount namespace inherits the host's propagation settings;
    // on a shared tree our mounts would leak back out.
    if let Err(e) = super::make_rprivate(Path::new("/")) {
        if can_mount {
            return Err(e);
        }
        tracing::debug!(error = %e, "Could not make mount tree private");
    }

    let rootfs_base = paths.container_rootfs(&config.id);
    let overlay = OverlayFs::for_container(&rootfs_base, &config.image_root);

    let mut mode = config.rootfs_mode;
    let merged = overlay.merged.clone();
    std::fs::create_dir_all(&merged)?;

    if mode == RootfsMode::Overlay {
        match overlay.mount() {
            Ok(()) => {}
            Err(e) if errno_suggests_fallback(&e) => {
                tracing::warn!(error = %e, "Overlay mount failed, falling back to bind mode");
                mode = RootfsMode::Bind;
            }
            Err(e) => return Err(e),
        }
    }

    if mode == RootfsMode::Bind {
        match super::mounts::bind_mount_recursive(&config.image_root, &merged) {
            Ok(()) => {}
            Err(MinidockError::Kernel { errno: "EPERM", .. }) if !can_mount => {
                // No mount privileges at all: chroot-only layout.
                return setup_chroot_only(config, &merged);
            }
            Err(e) => return Err(e),
        }
    }

    apply_volumes(&config.mounts, &merged)?;
    mount_special(&merged)?;
    if let Err(e) = seed_etc(&merged, &config.hostname) {
        tracing::debug!(error = %e, "Could not seed /etc");
    }

    if mode == RootfsMode::Bind {
        // The lower goes read-only last, once every target below it exists;
        // tmpfs keeps the conventional scratch directories writable.
        finish_bind_root(&merged);
    }

    Ok(PreparedRootfs {
        root: merged,
        mode,
        special_mounted: true,
    })
}

/// Bind-mode finish: remount the bound image read-only and put tmpfs over
/// the conventionally writable directories so the image stays pristine.
fn finish_bind_root(merged: &Path) {
    if let Err(e) = super::remount_readonly(merged) {
        tracing::debug!(error = %e, "Read-only remount of bind root failed");
    }

    for writable in ["tmp", "run", "var/tmp"] {
        let dir = merged.join(writable);
        if dir.is_dir() {
            if let Err(e) = mount(
                "tmpfs",
                &dir,
                "tmpfs",
                MountOptions::dev_tmpfs(),
                Some("mode=1777"),
            ) {
                tracing::debug!(dir = %dir.display(), error = %e, "tmpfs over writable dir failed");
            }
        }
    }
}

/// Chroot-only unprivileged variant: hard-link the image into merged when
/// possible, else chroot the image directly. No /proc or /sys.
fn setup_chroot_only(
    config: &ContainerConfig,
    merged: &Path,
) -> MinidockResult<PreparedRootfs> {
    tracing::warn!("No mount privileges; using chroot-only layout without /proc and /sys");

    if !config.mounts.is_empty() {
        // Volumes cannot be bound without mount privileges.
        return Err(MinidockError::BindMissing {
            path: config.mounts[0].host_path.clone(),
        });
    }

    let root = match hardlink_tree(&config.image_root, merged) {
        Ok(()) => merged.to_path_buf(),
        Err(e) => {
            tracing::debug!(error = %e, "Hard-link copy failed, chrooting the image directly");
            config.image_root.clone()
        }
    };

    if let Err(e) = seed_etc(&root, &config.hostname) {
        tracing::debug!(error = %e, "Could not seed /etc");
    }

    Ok(PreparedRootfs {
        root,
        mode: RootfsMode::Bind,
        special_mounted: false,
    })
}

/// Copy-on-write-style tree copy via hard links; directories and symlinks
/// are recreated, regular files linked.
fn hardlink_tree(src: &Path, dst: &Path) -> MinidockResult<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let target = dst.join(entry.file_name());

        if file_type.is_dir() {
            hardlink_tree(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            if target.symlink_metadata().is_err() {
                std::os::unix::fs::symlink(std::fs::read_link(entry.path())?, &target)?;
            }
        } else if !target.exists() {
            std::fs::hard_link(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardlink_tree_links_files() {
        let temp = tempfile::tempdir().unwrap();
        let src = temp.path().join("src");
        std::fs::create_dir_all(src.join("bin")).unwrap();
        std::fs::write(src.join("bin/sh"), b"binary").unwrap();
        std::os::unix::fs::symlink("bin/sh", src.join("sh")).unwrap();

        let dst = temp.path().join("dst");
        hardlink_tree(&src, &dst).unwrap();

        assert!(dst.join("bin/sh").is_file());
        assert_eq!(
            std::fs::read_link(dst.join("sh")).unwrap(),
            PathBuf::from("bin/sh")
        );

        // Hard link, not a copy.
        use std::os::unix::fs::MetadataExt;
        assert_eq!(
            std::fs::metadata(src.join("bin/sh")).unwrap().ino(),
            std::fs::metadata(dst.join("bin/sh")).unwrap().ino()
        );
    }
}
