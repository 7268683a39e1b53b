//! Mount primitives.

use std::ffi::CString;
use std::path::Path;

use minidock_common::{MinidockError, MinidockResult};

use crate::sys;

/// Options for a filesystem mount.
#[derive(Debug, Clone, Copy, Default)]
pub struct MountOptions {
    /// Read-only.
    pub readonly: bool,
    /// No exec.
    pub noexec: bool,
    /// No suid.
    pub nosuid: bool,
    /// No device files.
    pub nodev: bool,
}

impl MountOptions {
    /// Options for the /proc mount.
    #[must_use]
    pub fn proc() -> Self {
        Self {
            readonly: false,
            noexec: true,
            nosuid: true,
            nodev: true,
        }
    }

    /// Options for the /sys mount.
    #[must_use]
    pub fn sysfs() -> Self {
        Self {
            readonly: true,
            noexec: true,
            nosuid: true,
            nodev: true,
        }
    }

    /// Options for the /dev tmpfs.
    #[must_use]
    pub fn dev_tmpfs() -> Self {
        Self {
            readonly: false,
            noexec: false,
            nosuid: true,
            nodev: false,
        }
    }
}

/// Mount a filesystem.
pub fn mount(
    source: &str,
    target: &Path,
    fstype: &str,
    options: MountOptions,
    data: Option<&str>,
) -> MinidockResult<()> {
    use rustix::mount::{mount as rustix_mount, MountFlags};

    tracing::debug!(
        source,
        target = %target.display(),
        fstype,
        "Mounting filesystem"
    );

    let mut flags = MountFlags::empty();
    if options.readonly {
        flags |= MountFlags::RDONLY;
    }
    if options.noexec {
        flags |= MountFlags::NOEXEC;
    }
    if options.nosuid {
        flags |= MountFlags::NOSUID;
    }
    if options.nodev {
        flags |= MountFlags::NODEV;
    }

    let fstype_c = CString::new(fstype).expect("no NUL in fstype");
    let data_c = CString::new(data.unwrap_or("")).expect("no NUL in mount data");

    rustix_mount(source, target, fstype_c.as_c_str(), flags, data_c.as_c_str())
        .map_err(|e| MinidockError::kernel("mount", &e.into()))
}

/// Bind a path onto a target, optionally remounting read-only.
pub fn bind_mount(source: &Path, target: &Path, readonly: bool) -> MinidockResult<()> {
    use rustix::mount::{mount_bind, mount_remount, MountFlags};

    tracing::debug!(
        source = %source.display(),
        target = %target.display(),
        readonly,
        "Creating bind mount"
    );

    mount_bind(source, target).map_err(|e| MinidockError::kernel("mount", &e.into()))?;

    if readonly {
        let empty = CString::new("").expect("static");
        mount_remount(
            target,
            MountFlags::BIND | MountFlags::RDONLY,
            empty.as_c_str(),
        )
        .map_err(|e| MinidockError::kernel("mount", &e.into()))?;
    }
    Ok(())
}

/// Recursively bind a tree onto a target.
pub fn bind_mount_recursive(source: &Path, target: &Path) -> MinidockResult<()> {
    use rustix::mount::mount_recursive_bind;

    mount_recursive_bind(source, target).map_err(|e| MinidockError::kernel("mount", &e.into()))
}

/// Remount an existing mount read-only in place.
pub fn remount_readonly(target: &Path) -> MinidockResult<()> {
    use rustix::mount::{mount_remount, MountFlags};

    let empty = CString::new("").expect("static");
    mount_remount(
        target,
        MountFlags::BIND | MountFlags::RDONLY,
        empty.as_c_str(),
    )
    .map_err(|e| MinidockError::kernel("mount", &e.into()))
}

/// Mark the whole tree below `target` private so mount events stop
/// propagating to the host. Required before pivot_root.
pub fn make_rprivate(target: &Path) -> MinidockResult<()> {
    sys::mount_raw(
        None,
        target,
        None,
        libc::MS_REC | libc::MS_PRIVATE,
        None,
    )
}

/// Lazy-detach unmount.
pub fn unmount_detach(target: &Path) -> MinidockResult<()> {
    use rustix::mount::{unmount, UnmountFlags};

    unmount(target, UnmountFlags::DETACH).map_err(|e| MinidockError::kernel("umount2", &e.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn special_mount_options() {
        let proc = MountOptions::proc();
        assert!(proc.noexec && proc.nosuid && proc.nodev && !proc.readonly);

        let sysfs = MountOptions::sysfs();
        assert!(sysfs.readonly);

        let dev = MountOptions::dev_tmpfs();
        assert!(!dev.nodev && dev.nosuid);
    }

    #[test]
    fn mount_without_privilege_reports_kernel_error() {
        // SAFETY: geteuid has no failure modes.
        if unsafe { libc::geteuid() } == 0 {
            return; // only meaningful unprivileged
        }
        let temp = tempfile::tempdir().unwrap();
        let err = mount("proc", temp.path(), "proc", MountOptions::proc(), None).unwrap_err();
        assert!(matches!(err, MinidockError::Kernel { op: "mount", .. }));
    }
}
