//! pivot_root into the prepared container root.

use std::path::Path;

use minidock_common::MinidockResult;

use crate::sys;

/// Name of the temporary old-root directory inside the new root.
const OLD_ROOT: &str = ".oldroot";

/// Swap the mount namespace's root for `new_root`.
///
/// Sequence: bind the new root onto itself so it is a mount point, chdir
/// in, `pivot_root(".", ".oldroot")`, detach-unmount and remove the old
/// root. Falls back to `chroot` when pivot_root is refused (e.g.
/// chroot-only unprivileged mode). The mount tree is already private
/// (rootfs setup made it so), so the detach does not reach the host.
pub fn enter_root(new_root: &Path) -> MinidockResult<()> {
    tracing::debug!(new_root = %new_root.display(), "Pivoting root");

    // pivot_root requires new_root to be a mount point.
    if super::bind_mount(new_root, new_root, false).is_err() {
        // Already a mount point (the overlay), or we lack privileges and
        // will chroot below.
    }

    std::env::set_current_dir(new_root)?;

    let put_old = new_root.join(OLD_ROOT);
    std::fs::create_dir_all(&put_old)?;

    match sys::pivot_root(Path::new("."), Path::new(OLD_ROOT)) {
        Ok(()) => {
            std::env::set_current_dir("/")?;
            let old = Path::new("/").join(OLD_ROOT);
            if let Err(e) = sys::umount2(&old, libc::MNT_DETACH) {
                tracing::warn!(error = %e, "Failed to unmount old root");
            }
            let _ = std::fs::remove_dir(&old);
            tracing::debug!("pivot_root complete");
            Ok(())
        }
        Err(e) => {
            tracing::debug!(error = %e, "pivot_root refused, falling back to chroot");
            let _ = std::fs::remove_dir(&put_old);
            sys::chroot(Path::new("."))?;
            std::env::set_current_dir("/")?;
            Ok(())
        }
    }
}
