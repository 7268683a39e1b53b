//! Special filesystems and the minimal device set.

use std::path::Path;

use minidock_common::MinidockResult;

use super::{bind_mount, mount, MountOptions};
use crate::sys;

/// Devices created in /dev: (name, major, minor, mode).
const DEVICE_NODES: &[(&str, u32, u32, u32)] = &[
    ("null", 1, 3, 0o666),
    ("zero", 1, 5, 0o666),
    ("full", 1, 7, 0o666),
    ("random", 1, 8, 0o666),
    ("urandom", 1, 9, 0o666),
    ("tty", 5, 0, 0o666),
    ("console", 5, 1, 0o620),
];

/// Symlinks created in /dev.
const DEV_SYMLINKS: &[(&str, &str)] = &[
    ("fd", "/proc/self/fd"),
    ("stdin", "/proc/self/fd/0"),
    ("stdout", "/proc/self/fd/1"),
    ("stderr", "/proc/self/fd/2"),
];

/// Mount /proc, /sys, and a /dev tmpfs with a minimal device set under the
/// prepared root. Runs inside the new mount namespace before pivot.
pub fn mount_special(root: &Path) -> MinidockResult<()> {
    let proc = root.join("proc");
    std::fs::create_dir_all(&proc)?;
    mount("proc", &proc, "proc", MountOptions::proc(), None)?;

    let sys_dir = root.join("sys");
    std::fs::create_dir_all(&sys_dir)?;
    if let Err(e) = mount("sysfs", &sys_dir, "sysfs", MountOptions::sysfs(), None) {
        // sysfs refuses to mount in a netns we merely joined; bind the
        // host view instead.
        tracing::debug!(error = %e, "sysfs mount failed, bind-mounting host /sys");
        let _ = super::mounts::bind_mount_recursive(Path::new("/sys"), &sys_dir);
    }

    let dev = root.join("dev");
    std::fs::create_dir_all(&dev)?;
    mount(
        "tmpfs",
        &dev,
        "tmpfs",
        MountOptions::dev_tmpfs(),
        Some("mode=755,size=65536k"),
    )?;
    populate_dev(&dev)?;

    let pts = dev.join("pts");
    std::fs::create_dir_all(&pts)?;
    if let Err(e) = mount("devpts", &pts, "devpts", MountOptions::default(), Some("newinstance,ptmxmode=0666")) {
        tracing::debug!(error = %e, "devpts mount failed");
    }

    let shm = dev.join("shm");
    std::fs::create_dir_all(&shm)?;
    if let Err(e) = mount("tmpfs", &shm, "tmpfs", MountOptions::dev_tmpfs(), Some("mode=1777")) {
        tracing::debug!(error = %e, "shm mount failed");
    }

    Ok(())
}

/// Create the device nodes and symlinks in a freshly mounted /dev tmpfs.
///
/// mknod requires CAP_MKNOD in the initial user namespace; when it is
/// refused the host nodes are bind-mounted instead.
fn populate_dev(dev: &Path) -> MinidockResult<()> {
    for (name, major, minor, mode) in DEVICE_NODES {
        let path = dev.join(name);
        if path.exists() {
            continue;
        }
        if let Err(e) = sys::mknod_char(&path, *major, *minor, *mode) {
            let host = Path::new("/dev").join(name);
            if host.exists() {
                std::fs::write(&path, b"")?;
                if let Err(bind_err) = bind_mount(&host, &path, false) {
                    tracing::warn!(device = %name, error = %bind_err, "Could not provide device node");
                }
            } else {
                tracing::debug!(device = %name, error = %e, "Skipping device node");
            }
        }
    }

    for (name, target) in DEV_SYMLINKS {
        let path = dev.join(name);
        if path.symlink_metadata().is_err() {
            let _ = std::os::unix::fs::symlink(target, &path);
        }
    }

    let ptmx = dev.join("ptmx");
    if ptmx.symlink_metadata().is_err() {
        let _ = std::os::unix::fs::symlink("pts/ptmx", &ptmx);
    }

    Ok(())
}

/// Seed /etc inside the writable root when absent.
pub fn seed_etc(root: &Path, hostname: &str) -> MinidockResult<()> {
    let etc = root.join("etc");
    std::fs::create_dir_all(&etc)?;

    let resolv = etc.join("resolv.conf");
    if !resolv.exists() {
        std::fs::write(&resolv, "nameserver 8.8.8.8\n")?;
    }

    let hostname_file = etc.join("hostname");
    std::fs::write(&hostname_file, format!("{hostname}\n"))?;

    let hosts = etc.join("hosts");
    if !hosts.exists() {
        std::fs::write(
            &hosts,
            format!("127.0.0.1\tlocalhost\n127.0.1.1\t{hostname}\n"),
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_etc_writes_files() {
        let temp = tempfile::tempdir().unwrap();
        seed_etc(temp.path(), "webserver").unwrap();

        let hostname = std::fs::read_to_string(temp.path().join("etc/hostname")).unwrap();
        assert_eq!(hostname, "webserver\n");
        assert!(temp.path().join("etc/resolv.conf").exists());
        let hosts = std::fs::read_to_string(temp.path().join("etc/hosts")).unwrap();
        assert!(hosts.contains("webserver"));
    }

    #[test]
    fn seed_etc_keeps_existing_resolv() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(temp.path().join("etc")).unwrap();
        std::fs::write(temp.path().join("etc/resolv.conf"), "nameserver 1.1.1.1\n").unwrap();

        seed_etc(temp.path(), "h").unwrap();
        let resolv = std::fs::read_to_string(temp.path().join("etc/resolv.conf")).unwrap();
        assert_eq!(resolv, "nameserver 1.1.1.1\n");
    }
}
